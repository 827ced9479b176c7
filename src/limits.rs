use crate::model::{HOUR_MS, Ms};

// ── Catalog ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
pub const MAX_STATIONS_PER_TENANT: usize = 100_000;
pub const MAX_WINDOWS_PER_STATION: usize = 64;

// ── Bookings ─────────────────────────────────────────────────────

/// Non-terminal bookings a station may hold at once. Finished bookings do
/// not count.
pub const MAX_ACTIVE_BOOKINGS_PER_STATION: usize = 50_000;
pub const MAX_PAYMENT_REF_LEN: usize = 256;
pub const MAX_ISSUE_KIND_LEN: usize = 64;
pub const MAX_ISSUE_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_ISSUES_PER_BOOKING: usize = 32;
pub const MAX_FEEDBACK_COMMENT_LEN: usize = 2_048;

/// A single reservation may not span more than a day.
pub const MAX_SLOT_DURATION_MS: Ms = 24 * HOUR_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
