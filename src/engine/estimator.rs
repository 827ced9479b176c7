use ulid::Ulid;

use crate::config::Policy;
use crate::model::*;

/// Whole minutes from `now` until `t`, rounded up. Zero once `t` has passed.
pub fn minutes_until(t: Ms, now: Ms) -> i64 {
    let ms = (t - now).max(0);
    (ms + MINUTE_MS - 1) / MINUTE_MS
}

/// Live view of a station built from already-reconciled bookings.
///
/// Precedence: an ongoing session, then the nearest confirmed booking inside
/// the imminent window, then the same-day pending queue. With none of those the
/// station is free now. Queue waits assume every queued booking takes
/// `policy.queue_slot_minutes`; it is a deliberate overestimate.
pub fn estimate(
    station_id: Ulid,
    bookings: &[Booking],
    now: Ms,
    today: Option<Span>,
    policy: &Policy,
) -> LiveStatus {
    let ongoing = bookings
        .iter()
        .find(|b| b.status == BookingStatus::Ongoing)
        .cloned();

    let horizon = now + policy.imminent_window_ms;
    let mut imminent: Vec<Booking> = bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Confirmed && b.slot.start <= horizon && b.slot.end > now)
        .cloned()
        .collect();
    imminent.sort_by_key(|b| (b.slot.start, b.id));

    let mut pending: Vec<&Booking> = bookings
        .iter()
        .filter(|b| {
            b.status == BookingStatus::Pending
                && b.slot.end > now
                && today.is_some_and(|day| day.contains_instant(b.slot.start))
        })
        .collect();
    pending.sort_by_key(|b| (b.created_at, b.id));

    let per_slot = policy.queue_slot_minutes;
    let base_wait = pending.len() as i64 * per_slot;
    let queue: Vec<QueueEntry> = pending
        .iter()
        .enumerate()
        .map(|(i, b)| QueueEntry {
            booking_id: b.id,
            user_id: b.user_id,
            slot: b.slot,
            position: i as u32 + 1,
            estimated_wait_minutes: base_wait + i as i64 * per_slot,
        })
        .collect();

    let (available_now, estimated_wait_minutes, next_available_at) = if let Some(b) = &ongoing {
        (false, minutes_until(b.slot.end, now), Some(b.slot.end))
    } else if let Some(b) = imminent.first() {
        let until = if b.actual_start.is_some() || b.slot.start <= now {
            b.slot.end
        } else {
            b.slot.start
        };
        (false, minutes_until(until, now), Some(b.slot.end))
    } else if !queue.is_empty() {
        (false, base_wait, Some(now + base_wait * MINUTE_MS))
    } else {
        (true, 0, Some(now))
    };

    LiveStatus {
        station_id,
        available_now,
        ongoing,
        imminent,
        queue,
        estimated_wait_minutes,
        next_available_at,
    }
}
