use std::fmt;
use std::str::FromStr;

use chrono::Weekday;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Whole minutes, rounded to nearest.
    pub fn duration_minutes(&self) -> i64 {
        round_minutes(self.duration_ms())
    }

    /// Touching boundaries do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

pub(crate) fn round_minutes(ms: Ms) -> i64 {
    (ms + MINUTE_MS / 2).div_euclid(MINUTE_MS)
}

// ── Stations ─────────────────────────────────────────────────────

/// How a station treats new reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptMode {
    /// Reservations are confirmed on creation.
    Auto,
    /// Reservations wait for the owner's approval.
    Request,
}

impl AcceptMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceptMode::Auto => "auto",
            AcceptMode::Request => "request",
        }
    }
}

impl FromStr for AcceptMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AcceptMode::Auto),
            "request" | "manual" => Ok(AcceptMode::Request),
            other => Err(format!("unknown accept mode: {other}")),
        }
    }
}

/// Wall-clock time of day in minutes. `24:00` is representable so a window can
/// run to the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClockTime(u16);

impl ClockTime {
    pub const MIDNIGHT: ClockTime = ClockTime(0);
    pub const END_OF_DAY: ClockTime = ClockTime(24 * 60);

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        let total = hour.checked_mul(60)?.checked_add(minute)?;
        (minute < 60 && total <= 24 * 60).then_some(ClockTime(total))
    }

    pub fn minutes(&self) -> u16 {
        self.0
    }
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("bad clock time (expected HH:MM): {s}"))?;
        let hour: u16 = h.parse().map_err(|_| format!("bad hour: {s}"))?;
        let minute: u16 = m.parse().map_err(|_| format!("bad minute: {s}"))?;
        ClockTime::from_hm(hour, minute).ok_or_else(|| format!("clock time out of range: {s}"))
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// A recurring weekly opening window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyWindow {
    pub id: Ulid,
    pub day: Weekday,
    pub start: ClockTime,
    pub end: ClockTime,
}

impl WeeklyWindow {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: Ulid,
    pub owner_id: Ulid,
    /// Minor currency units per hour.
    pub price: i64,
    pub accept_mode: AcceptMode,
    pub always_open: bool,
    pub timezone: Tz,
    /// Only consulted when `always_open` is false.
    pub windows: Vec<WeeklyWindow>,
}

impl Station {
    /// Price of a slot, pro rata per minute, rounded to the nearest unit.
    pub fn quote(&self, slot: &Span) -> i64 {
        let minutes = slot.duration_ms() / MINUTE_MS;
        self.price.saturating_mul(minutes).saturating_add(30) / 60
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Ongoing,
    Completed,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    /// Non-terminal statuses hold their slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Ongoing
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Position along the lifecycle. Transitions never decrease it.
    pub fn rank(&self) -> u8 {
        match self {
            BookingStatus::Pending => 0,
            BookingStatus::Confirmed => 1,
            BookingStatus::Ongoing => 2,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Rejected => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Ongoing => "ongoing",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role asserted by the authentication layer in front of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Owner,
    Admin,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: Ulid,
    pub role: Role,
}

impl Caller {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn user(id: Ulid) -> Self {
        Self::new(id, Role::User)
    }

    pub fn owner(id: Ulid) -> Self {
        Self::new(id, Role::Owner)
    }

    pub fn admin(id: Ulid) -> Self {
        Self::new(id, Role::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: String,
    pub description: String,
    pub reported_by: Ulid,
    pub reported_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// 1 to 5.
    pub rating: u8,
    pub comment: Option<String>,
    pub left_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub station_id: Ulid,
    pub user_id: Ulid,
    /// The reserved window.
    pub slot: Span,
    pub status: BookingStatus,
    pub immediate: bool,
    /// When charging really began.
    pub actual_start: Option<Ms>,
    /// When charging really ended.
    pub actual_end: Option<Ms>,
    pub session_minutes: Option<i64>,
    pub amount: i64,
    pub payment_ref: Option<String>,
    /// Set when a paid booking is rejected or cancelled. Refunds are executed elsewhere.
    pub refund_due: bool,
    pub created_at: Ms,
    pub issues: Vec<Issue>,
    pub feedback: Option<Feedback>,
}

/// A status change. Every write to `Booking::status` goes through one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    Approve,
    Reject,
    Cancel,
    /// Into `ongoing`, charging began at `at`.
    Start { at: Ms },
    /// `ongoing` into `completed`, charging ended at `at`.
    End { at: Ms },
    /// `confirmed` straight to `completed` for a session that never began.
    Expire { at: Ms },
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::Approve => "approve",
            Transition::Reject => "reject",
            Transition::Cancel => "cancel",
            Transition::Start { .. } => "start",
            Transition::End { .. } => "end",
            Transition::Expire { .. } => "expire",
        }
    }
}

/// Per-station state: configuration plus every booking, sorted by `slot.start`.
#[derive(Debug, Clone)]
pub struct StationState {
    pub station: Station,
    pub bookings: Vec<Booking>,
}

impl StationState {
    pub fn new(station: Station) -> Self {
        Self {
            station,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by slot start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.slot.start <= booking.slot.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings of any status whose slot overlaps the query window.
    /// Everything at index >= the partition point starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.slot.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.slot.end > query.start)
    }

    pub fn active_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.status.is_active())
    }
}

/// WAL record. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StationRegistered {
        station: Station,
    },
    StationUpdated {
        id: Ulid,
        price: i64,
        accept_mode: AcceptMode,
        always_open: bool,
        timezone: Tz,
    },
    StationRemoved {
        id: Ulid,
    },
    WindowAdded {
        station_id: Ulid,
        window: WeeklyWindow,
    },
    WindowRemoved {
        id: Ulid,
        station_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingTransitioned {
        id: Ulid,
        station_id: Ulid,
        transition: Transition,
    },
    IssueReported {
        booking_id: Ulid,
        station_id: Ulid,
        issue: Issue,
    },
    FeedbackLeft {
        booking_id: Ulid,
        station_id: Ulid,
        feedback: Feedback,
    },
}

// ── Views ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSlot {
    pub start: Ms,
    pub end: Ms,
    pub duration_minutes: i64,
}

impl FreeSlot {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self {
            start,
            end,
            duration_minutes: (end - start) / MINUTE_MS,
        }
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub slot: Span,
    /// 1-based.
    pub position: u32,
    pub estimated_wait_minutes: i64,
}

/// What a walk-up driver sees for a station right now. Recomputed on every read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStatus {
    pub station_id: Ulid,
    pub available_now: bool,
    pub ongoing: Option<Booking>,
    /// Confirmed bookings starting within the imminent horizon, nearest first.
    pub imminent: Vec<Booking>,
    /// Same-day pending bookings in arrival order.
    pub queue: Vec<QueueEntry>,
    pub estimated_wait_minutes: i64,
    pub next_available_at: Option<Ms>,
}
