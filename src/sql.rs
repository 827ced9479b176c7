use chrono::NaiveDate;
use chrono_tz::Tz;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::calendar;
use crate::engine::{Action, NewBooking, StationPatch};
use crate::model::*;

/// Parsed command from SQL input.
///
/// Every write is an `INSERT`; status changes are rows in `booking_actions`.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertStation {
        station: Station,
    },
    UpdateStation {
        id: Ulid,
        patch: StationPatch,
    },
    DeleteStation {
        id: Ulid,
    },
    InsertWindow {
        station_id: Ulid,
        window: WeeklyWindow,
    },
    DeleteWindow {
        id: Ulid,
    },
    InsertBooking {
        booking: NewBooking,
    },
    BookingAction {
        booking_id: Ulid,
        caller: Caller,
        action: Action,
    },
    ReportIssue {
        booking_id: Ulid,
        caller: Caller,
        kind: String,
        description: String,
    },
    LeaveFeedback {
        booking_id: Ulid,
        caller: Caller,
        rating: u8,
        comment: Option<String>,
    },
    SelectStations {
        id: Option<Ulid>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectFreeSlots {
        station_id: Ulid,
        day: NaiveDate,
    },
    SelectLiveStatus {
        station_id: Ulid,
    },
    SelectQueue {
        station_id: Ulid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Station(Ulid),
    Id(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arg = |i: usize| values.get(i);

    match table.as_str() {
        "stations" => {
            require(&values, "stations", 2)?;
            let station = Station {
                id: parse_ulid(&values[0])?,
                owner_id: parse_ulid(&values[1])?,
                price: arg(2).map(parse_i64_or_null).transpose()?.flatten().unwrap_or(0),
                accept_mode: arg(3)
                    .map(parse_accept_mode_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or(AcceptMode::Auto),
                always_open: arg(4).map(parse_bool_or_null).transpose()?.flatten().unwrap_or(true),
                timezone: arg(5).map(parse_tz_or_null).transpose()?.flatten().unwrap_or(Tz::UTC),
                windows: Vec::new(),
            };
            Ok(Command::InsertStation { station })
        }
        "station_updates" => {
            require(&values, "station_updates", 2)?;
            let patch = StationPatch {
                price: parse_i64_or_null(&values[1])?,
                accept_mode: arg(2).map(parse_accept_mode_or_null).transpose()?.flatten(),
                always_open: arg(3).map(parse_bool_or_null).transpose()?.flatten(),
                timezone: arg(4).map(parse_tz_or_null).transpose()?.flatten(),
            };
            Ok(Command::UpdateStation {
                id: parse_ulid(&values[0])?,
                patch,
            })
        }
        "station_windows" => {
            require(&values, "station_windows", 5)?;
            let day = calendar::parse_weekday(&parse_string(&values[2])?).map_err(SqlError::Parse)?;
            Ok(Command::InsertWindow {
                station_id: parse_ulid(&values[1])?,
                window: WeeklyWindow {
                    id: parse_ulid(&values[0])?,
                    day,
                    start: parse_clock(&values[3])?,
                    end: parse_clock(&values[4])?,
                },
            })
        }
        "bookings" => {
            require(&values, "bookings", 5)?;
            let booking = NewBooking {
                id: parse_ulid(&values[0])?,
                station_id: parse_ulid(&values[1])?,
                user_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
                end: parse_i64(&values[4])?,
                amount: arg(5).map(parse_i64_or_null).transpose()?.flatten(),
                payment_ref: arg(6).map(parse_string_or_null).transpose()?.flatten(),
                immediate: arg(7).map(parse_bool_or_null).transpose()?.flatten().unwrap_or(false),
            };
            Ok(Command::InsertBooking { booking })
        }
        "booking_actions" => {
            require(&values, "booking_actions", 4)?;
            let action = parse_string(&values[3])?
                .parse::<Action>()
                .map_err(SqlError::Parse)?;
            Ok(Command::BookingAction {
                booking_id: parse_ulid(&values[0])?,
                caller: parse_caller(&values[1], &values[2])?,
                action,
            })
        }
        "booking_issues" => {
            require(&values, "booking_issues", 5)?;
            Ok(Command::ReportIssue {
                booking_id: parse_ulid(&values[0])?,
                caller: parse_caller(&values[1], &values[2])?,
                kind: parse_string(&values[3])?,
                description: parse_string(&values[4])?,
            })
        }
        "booking_feedback" => {
            require(&values, "booking_feedback", 4)?;
            let rating = parse_i64(&values[3])?;
            let rating = u8::try_from(rating)
                .map_err(|_| SqlError::Parse(format!("{rating} out of rating range")))?;
            Ok(Command::LeaveFeedback {
                booking_id: parse_ulid(&values[0])?,
                caller: parse_caller(&values[1], &values[2])?,
                rating,
                comment: arg(4).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "stations" => Ok(Command::DeleteStation { id }),
        "station_windows" => Ok(Command::DeleteWindow { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);
    let station_id = || -> Result<Ulid, SqlError> {
        parse_ulid(filter("station_id").ok_or(SqlError::MissingFilter("station_id"))?)
    };

    match table.as_str() {
        "stations" => Ok(Command::SelectStations {
            id: filter("id").map(parse_ulid).transpose()?,
        }),
        "bookings" => {
            let by = match filter("id") {
                Some(id) => BookingFilter::Id(parse_ulid(id)?),
                None => BookingFilter::Station(station_id()?),
            };
            Ok(Command::SelectBookings { filter: by })
        }
        "free_slots" => {
            let day = parse_string(filter("day").ok_or(SqlError::MissingFilter("day"))?)?;
            let day = day
                .parse::<NaiveDate>()
                .map_err(|e| SqlError::Parse(format!("bad date {day}: {e}")))?;
            Ok(Command::SelectFreeSlots {
                station_id: station_id()?,
                day,
            })
        }
        "live_status" => Ok(Command::SelectLiveStatus {
            station_id: station_id()?,
        }),
        "station_queue" => Ok(Command::SelectQueue {
            station_id: station_id()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` pairs joined by `AND`. Other predicates are rejected.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn require(values: &[Expr], table: &'static str, min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// First row of the `VALUES` list. Values are positional; the column list is
/// documentation only.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_bool_or_null(expr: &Expr) -> Result<Option<bool>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::Boolean(b)) => Ok(Some(*b)),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(Some(true)),
            "false" | "f" | "0" => Ok(Some(false)),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(Some(n != "0")),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_accept_mode_or_null(expr: &Expr) -> Result<Option<AcceptMode>, SqlError> {
    parse_string_or_null(expr)?
        .map(|s| s.parse().map_err(SqlError::Parse))
        .transpose()
}

fn parse_tz_or_null(expr: &Expr) -> Result<Option<Tz>, SqlError> {
    parse_string_or_null(expr)?
        .map(|s| {
            s.parse::<Tz>()
                .map_err(|_| SqlError::Parse(format!("unknown timezone: {s}")))
        })
        .transpose()
}

fn parse_clock(expr: &Expr) -> Result<ClockTime, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_caller(id: &Expr, role: &Expr) -> Result<Caller, SqlError> {
    let role = parse_string(role)?.parse::<Role>().map_err(SqlError::Parse)?;
    Ok(Caller::new(parse_ulid(id)?, role))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
