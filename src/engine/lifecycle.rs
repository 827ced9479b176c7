//! Booking status machine.
//!
//! ```text
//! pending ─approve─▶ confirmed ─start─▶ ongoing ─end─▶ completed
//!    │                   └──────────────expire───────────────▲
//!    └─reject─▶ rejected
//! any non-terminal ─cancel─▶ cancelled
//! ```
//!
//! Explicit actions come from callers. Time-driven moves (auto-complete,
//! expire, auto-start) are computed by [`reconcile`] from the clock alone.

use std::str::FromStr;

use ulid::Ulid;

use crate::model::*;

/// Caller-invoked lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Approve,
    Reject,
    Cancel,
    Start,
    End,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Cancel => "cancel",
            Action::Start => "start",
            Action::End => "end",
        }
    }

    pub fn transition_at(&self, now: Ms) -> Transition {
        match self {
            Action::Approve => Transition::Approve,
            Action::Reject => Transition::Reject,
            Action::Cancel => Transition::Cancel,
            Action::Start => Transition::Start { at: now },
            Action::End => Transition::End { at: now },
        }
    }

    /// Status the booking holds after the action succeeds.
    pub fn target(&self) -> BookingStatus {
        match self {
            Action::Approve => BookingStatus::Confirmed,
            Action::Reject => BookingStatus::Rejected,
            Action::Cancel => BookingStatus::Cancelled,
            Action::Start => BookingStatus::Ongoing,
            Action::End => BookingStatus::Completed,
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Action::Approve),
            "reject" => Ok(Action::Reject),
            "cancel" => Ok(Action::Cancel),
            "start" => Ok(Action::Start),
            "end" => Ok(Action::End),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Whether `caller` may perform `action` on `booking` at `station`.
///
/// Approval and rejection belong to the station owner. Everything else is open
/// to the booking's user, the station owner, and admins.
pub fn authorize(action: Action, caller: &Caller, booking: &Booking, station: &Station) -> bool {
    let is_owner = caller.id == station.owner_id;
    match action {
        Action::Approve | Action::Reject => is_owner,
        Action::Cancel | Action::Start | Action::End => {
            is_owner || caller.id == booking.user_id || caller.role == Role::Admin
        }
    }
}

/// Who may attach an issue report: the same parties that may cancel.
pub fn may_report(caller: &Caller, booking: &Booking, station: &Station) -> bool {
    authorize(Action::Cancel, caller, booking, station)
}

/// The transition table. `None` means the move is illegal from `from`.
pub fn next_status(from: BookingStatus, transition: &Transition) -> Option<BookingStatus> {
    use BookingStatus::*;
    match transition {
        Transition::Approve => (from == Pending).then_some(Confirmed),
        Transition::Reject => (from == Pending).then_some(Rejected),
        Transition::Cancel => from.is_active().then_some(Cancelled),
        Transition::Start { .. } => (from == Confirmed).then_some(Ongoing),
        Transition::End { .. } => (from == Ongoing).then_some(Completed),
        Transition::Expire { .. } => (from == Confirmed).then_some(Completed),
    }
}

/// Apply `transition` to `booking`, filling the timestamps it owns.
///
/// On an illegal move the booking is untouched and its current status is
/// returned as the error.
pub fn apply_transition(
    booking: &mut Booking,
    transition: &Transition,
) -> Result<BookingStatus, BookingStatus> {
    let from = booking.status;
    let to = next_status(from, transition).ok_or(from)?;
    if matches!(transition, Transition::Expire { .. }) && booking.actual_start.is_some() {
        return Err(from);
    }

    match *transition {
        Transition::Start { at } => booking.actual_start = Some(at),
        Transition::End { at } | Transition::Expire { at } => {
            booking.actual_end = Some(at);
            if let Some(started) = booking.actual_start {
                booking.session_minutes = Some(round_minutes(at - started).max(0));
            }
        }
        Transition::Reject | Transition::Cancel => {
            if booking.payment_ref.is_some() {
                booking.refund_due = true;
            }
        }
        Transition::Approve => {}
    }
    booking.status = to;
    Ok(to)
}

/// A time-driven transition due for one booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub booking_id: Ulid,
    pub transition: Transition,
}

impl Reconciled {
    pub fn label(&self) -> &'static str {
        match self.transition {
            Transition::End { .. } => "auto_complete",
            Transition::Expire { .. } => "expire",
            Transition::Start { .. } => "auto_start",
            _ => "other",
        }
    }
}

/// Time-driven transitions due at `now`, in application order:
/// auto-complete of overdue sessions, then expiry of confirmed bookings that
/// never started, then auto-start of confirmed bookings inside their slot.
///
/// Completion and expiry stamp `actual_end` with the nominal `slot.end`.
/// Pure: feeding the result back through [`apply_transition`] and calling
/// again yields nothing.
pub fn reconcile<'a>(bookings: impl IntoIterator<Item = &'a Booking>, now: Ms) -> Vec<Reconciled> {
    let mut complete = Vec::new();
    let mut expire = Vec::new();
    let mut start = Vec::new();

    for b in bookings {
        match b.status {
            BookingStatus::Ongoing if b.slot.end <= now => complete.push(Reconciled {
                booking_id: b.id,
                transition: Transition::End { at: b.slot.end },
            }),
            BookingStatus::Confirmed if b.actual_start.is_none() => {
                if b.slot.end <= now {
                    expire.push(Reconciled {
                        booking_id: b.id,
                        transition: Transition::Expire { at: b.slot.end },
                    });
                } else if b.slot.start <= now {
                    start.push(Reconciled {
                        booking_id: b.id,
                        transition: Transition::Start { at: now },
                    });
                }
            }
            _ => {}
        }
    }

    complete.extend(expire);
    complete.extend(start);
    complete
}

/// The bookings as they stand once every due time-driven transition is applied.
pub fn reconciled(bookings: &[Booking], now: Ms) -> Vec<Booking> {
    let mut out = bookings.to_vec();
    for r in reconcile(bookings, now) {
        if let Some(b) = out.iter_mut().find(|b| b.id == r.booking_id) {
            let _ = apply_transition(b, &r.transition);
        }
    }
    out
}
