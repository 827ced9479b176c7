use crate::model::*;

/// Free gaps inside the day's opening windows.
///
/// `windows` need not be disjoint; each one is walked on its own. `booked` are
/// the spans of non-terminal bookings, sorted by start. A cursor starts at the
/// window start (or `floor`, whichever is later), records the gap before each
/// booking it meets, and jumps past that booking. Gaps shorter than `min_len`
/// are dropped.
pub fn find_gaps(windows: &[Span], booked: &[Span], floor: Option<Ms>, min_len: Ms) -> Vec<FreeSlot> {
    let mut gaps = Vec::new();

    for window in windows {
        let mut cursor = match floor {
            Some(f) => window.start.max(f),
            None => window.start,
        };
        if cursor >= window.end {
            continue;
        }

        for b in booked {
            if b.start >= window.end {
                break;
            }
            if b.end <= cursor {
                continue;
            }
            if b.start > cursor && b.start - cursor >= min_len {
                gaps.push(FreeSlot::new(cursor, b.start));
            }
            cursor = cursor.max(b.end);
            if cursor >= window.end {
                break;
            }
        }

        if cursor < window.end && window.end - cursor >= min_len {
            gaps.push(FreeSlot::new(cursor, window.end));
        }
    }

    gaps
}
