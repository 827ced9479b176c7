use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use serde_json::json;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::ChargeSlotAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command, SqlError};
use crate::tenant::TenantManager;

pub struct ChargeSlotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ChargeSlotQueryParser>,
}

impl ChargeSlotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ChargeSlotQueryParser),
        }
    }

    /// The connection's database name selects the marketplace.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// Parse, execute and record one statement.
    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!("{label} failed: {e}");
        }
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertStation { station } => {
                engine.register_station(station).await.map_err(engine_err)?;
                Ok(insert_tag())
            }
            Command::UpdateStation { id, patch } => {
                engine.update_station(id, patch).await.map_err(engine_err)?;
                Ok(insert_tag())
            }
            Command::DeleteStation { id } => {
                engine.remove_station(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertWindow { station_id, window } => {
                engine.add_window(station_id, window).await.map_err(engine_err)?;
                Ok(insert_tag())
            }
            Command::DeleteWindow { id } => {
                engine.remove_window(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking { booking } => {
                engine.create_booking(booking).await.map_err(engine_err)?;
                Ok(insert_tag())
            }
            Command::BookingAction {
                booking_id,
                caller,
                action,
            } => {
                engine
                    .transition(booking_id, &caller, action)
                    .await
                    .map_err(engine_err)?;
                Ok(insert_tag())
            }
            Command::ReportIssue {
                booking_id,
                caller,
                kind,
                description,
            } => {
                engine
                    .report_issue(booking_id, &caller, kind, description)
                    .await
                    .map_err(engine_err)?;
                Ok(insert_tag())
            }
            Command::LeaveFeedback {
                booking_id,
                caller,
                rating,
                comment,
            } => {
                engine
                    .leave_feedback(booking_id, &caller, rating, comment)
                    .await
                    .map_err(engine_err)?;
                Ok(insert_tag())
            }
            Command::SelectStations { id } => {
                let stations = match id {
                    Some(id) => match engine.get_station(id).await {
                        Ok(station) => vec![station],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine.list_stations().await,
                };
                let schema = Arc::new(stations_schema());
                let rows: Vec<PgWireResult<_>> = stations
                    .iter()
                    .map(|st| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&st.id.to_string())?;
                        encoder.encode_field(&st.owner_id.to_string())?;
                        encoder.encode_field(&st.price)?;
                        encoder.encode_field(&st.accept_mode.as_str())?;
                        encoder.encode_field(&st.always_open)?;
                        encoder.encode_field(&st.timezone.name())?;
                        encoder.encode_field(&windows_json(&st.windows))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Station(station_id) => {
                        engine.list_bookings(station_id).await.map_err(engine_err)?
                    }
                    BookingFilter::Id(id) => match engine.get_booking(id).await {
                        Ok(booking) => vec![booking],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                };
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.station_id.to_string())?;
                        encoder.encode_field(&b.user_id.to_string())?;
                        encoder.encode_field(&b.slot.start)?;
                        encoder.encode_field(&b.slot.end)?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&b.immediate)?;
                        encoder.encode_field(&b.actual_start)?;
                        encoder.encode_field(&b.actual_end)?;
                        encoder.encode_field(&b.session_minutes)?;
                        encoder.encode_field(&b.amount)?;
                        encoder.encode_field(&b.payment_ref)?;
                        encoder.encode_field(&b.refund_due)?;
                        encoder.encode_field(&b.created_at)?;
                        encoder.encode_field(&issues_json(&b.issues))?;
                        encoder.encode_field(&b.feedback.as_ref().map(|f| i32::from(f.rating)))?;
                        encoder.encode_field(&b.feedback.as_ref().and_then(|f| f.comment.clone()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectFreeSlots { station_id, day } => {
                let slots = engine
                    .free_slots(station_id, day)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(free_slots_schema());
                let sid = station_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&sid)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        encoder.encode_field(&slot.duration_minutes)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectLiveStatus { station_id } => {
                let live = engine.live_status(station_id).await.map_err(engine_err)?;
                let schema = Arc::new(live_status_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&live.station_id.to_string())?;
                encoder.encode_field(&live.available_now)?;
                encoder.encode_field(&live.ongoing.as_ref().map(|b| b.id.to_string()))?;
                encoder.encode_field(&(live.imminent.len() as i64))?;
                encoder.encode_field(&(live.queue.len() as i64))?;
                encoder.encode_field(&live.estimated_wait_minutes)?;
                encoder.encode_field(&live.next_available_at)?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectQueue { station_id } => {
                let live = engine.live_status(station_id).await.map_err(engine_err)?;
                let schema = Arc::new(queue_schema());
                let rows: Vec<PgWireResult<_>> = live
                    .queue
                    .iter()
                    .map(|entry| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&entry.booking_id.to_string())?;
                        encoder.encode_field(&entry.user_id.to_string())?;
                        encoder.encode_field(&entry.slot.start)?;
                        encoder.encode_field(&entry.slot.end)?;
                        encoder.encode_field(&i64::from(entry.position))?;
                        encoder.encode_field(&entry.estimated_wait_minutes)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn insert_tag() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn windows_json(windows: &[WeeklyWindow]) -> String {
    let items: Vec<_> = windows
        .iter()
        .map(|w| {
            json!({
                "id": w.id.to_string(),
                "day": w.day.to_string(),
                "start": w.start.to_string(),
                "end": w.end.to_string(),
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

fn issues_json(issues: &[Issue]) -> String {
    let items: Vec<_> = issues
        .iter()
        .map(|i| {
            json!({
                "kind": i.kind,
                "description": i.description,
                "reported_by": i.reported_by.to_string(),
                "reported_at": i.reported_at,
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn stations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("price", Type::INT8),
        field("accept_mode", Type::VARCHAR),
        field("always_open", Type::BOOL),
        field("timezone", Type::VARCHAR),
        field("windows", Type::TEXT),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("station_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("immediate", Type::BOOL),
        field("actual_start", Type::INT8),
        field("actual_end", Type::INT8),
        field("session_minutes", Type::INT8),
        field("amount", Type::INT8),
        field("payment_ref", Type::VARCHAR),
        field("refund_due", Type::BOOL),
        field("created_at", Type::INT8),
        field("issues", Type::TEXT),
        field("rating", Type::INT4),
        field("comment", Type::TEXT),
    ]
}

fn free_slots_schema() -> Vec<FieldInfo> {
    vec![
        field("station_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("duration_minutes", Type::INT8),
    ]
}

fn live_status_schema() -> Vec<FieldInfo> {
    vec![
        field("station_id", Type::VARCHAR),
        field("available_now", Type::BOOL),
        field("ongoing_booking_id", Type::VARCHAR),
        field("imminent_count", Type::INT8),
        field("queue_length", Type::INT8),
        field("estimated_wait_minutes", Type::INT8),
        field("next_available_at", Type::INT8),
    ]
}

fn queue_schema() -> Vec<FieldInfo> {
    vec![
        field("booking_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("position", Type::INT8),
        field("estimated_wait_minutes", Type::INT8),
    ]
}

/// Row shape of a statement, judged from the table after `FROM`. Statements
/// other than `SELECT` return no rows.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let mut tokens = upper.split_whitespace();
    if tokens.next() != Some("SELECT") {
        return Vec::new();
    }
    let table = tokens
        .skip_while(|t| *t != "FROM")
        .nth(1)
        .map(|t| t.trim_end_matches(';').trim_matches('"').to_string());
    match table.as_deref() {
        Some("STATIONS") => stations_schema(),
        Some("BOOKINGS") => bookings_schema(),
        Some("FREE_SLOTS") => free_slots_schema(),
        Some("LIVE_STATUS") => live_status_schema(),
        Some("STATION_QUEUE") => queue_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for ChargeSlotHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChargeSlotQueryParser;

#[async_trait]
impl QueryParser for ChargeSlotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ChargeSlotHandler {
    type Statement = String;
    type QueryParser = ChargeSlotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&engine, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ChargeSlotFactory {
    handler: Arc<ChargeSlotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ChargeSlotAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ChargeSlotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ChargeSlotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ChargeSlotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChargeSlotFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ChargeSlotFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::Unauthorized { .. } => "42501",
        EngineError::InvalidState { .. } => "55000",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasActiveBookings(_) => "2BP01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
