use ulid::Ulid;

use crate::config::Policy;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// First non-terminal booking on the station whose slot intersects `span`.
/// Terminal bookings never block, and neither does `exclude`.
pub fn find_overlap(state: &StationState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    state
        .overlapping(span)
        .find(|b| b.status.is_active() && Some(b.id) != exclude)
        .map(|b| b.id)
}

pub(crate) fn check_no_overlap(
    state: &StationState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_overlap(state, span, exclude) {
        Some(id) => Err(EngineError::Conflict(id)),
        None => Ok(()),
    }
}

/// Validate a requested reservation window and build its span.
///
/// Slots may not start in the past. Immediate bookings get `immediate_grace_ms`
/// of slack to absorb request latency.
pub(crate) fn validate_slot(
    start: Ms,
    end: Ms,
    now: Ms,
    immediate: bool,
    policy: &Policy,
) -> Result<Span, EngineError> {
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range".into()));
    }
    if end <= start {
        return Err(EngineError::Validation("slot end must be after start".into()));
    }
    if end - start > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    let earliest = if immediate {
        now - policy.immediate_grace_ms
    } else {
        now
    };
    if start < earliest {
        return Err(EngineError::Validation("slot starts in the past".into()));
    }
    Ok(Span::new(start, end))
}
