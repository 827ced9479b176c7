use std::collections::HashSet;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_overlap, validate_slot};
use super::lifecycle::{self, Action};
use super::{claim_id, forget_station, Engine, EngineError, WalCommand};

/// A reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub station_id: Ulid,
    pub user_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    /// Defaults to the station's quote for the slot.
    pub amount: Option<i64>,
    pub payment_ref: Option<String>,
    pub immediate: bool,
}

/// Station settings to change; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationPatch {
    pub price: Option<i64>,
    pub accept_mode: Option<AcceptMode>,
    pub always_open: Option<bool>,
    pub timezone: Option<Tz>,
}

fn validate_window(window: &WeeklyWindow) -> Result<(), EngineError> {
    if window.is_empty() {
        return Err(EngineError::Validation(format!(
            "window {} starts at or after its end ({}-{})",
            window.id, window.start, window.end
        )));
    }
    Ok(())
}

fn release_ids(index: &DashMap<Ulid, Ulid>, ids: &[Ulid]) {
    for id in ids {
        index.remove(id);
    }
}

impl Engine {
    pub async fn register_station(&self, station: Station) -> Result<(), EngineError> {
        if station.price < 0 {
            return Err(EngineError::Validation("price must not be negative".into()));
        }
        if station.windows.len() > MAX_WINDOWS_PER_STATION {
            return Err(EngineError::LimitExceeded("too many windows on station"));
        }
        let mut window_ids = HashSet::new();
        for w in &station.windows {
            validate_window(w)?;
            if !window_ids.insert(w.id) {
                return Err(EngineError::AlreadyExists(w.id));
            }
        }

        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_STATIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many stations"));
        }
        if self.state.contains_key(&station.id) {
            return Err(EngineError::AlreadyExists(station.id));
        }

        let mut claimed = Vec::with_capacity(station.windows.len());
        for w in &station.windows {
            if let Err(e) = claim_id(&self.window_to_station, w.id, station.id) {
                release_ids(&self.window_to_station, &claimed);
                return Err(e);
            }
            claimed.push(w.id);
        }
        let event = Event::StationRegistered {
            station: station.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            release_ids(&self.window_to_station, &claimed);
            return Err(e);
        }
        let id = station.id;
        self.state
            .insert(id, Arc::new(RwLock::new(StationState::new(station))));
        info!("station {id} registered");
        Ok(())
    }

    pub async fn update_station(&self, id: Ulid, patch: StationPatch) -> Result<Station, EngineError> {
        if patch.price.is_some_and(|p| p < 0) {
            return Err(EngineError::Validation("price must not be negative".into()));
        }
        let mut guard = self.station_write(id).await?;
        let current = &guard.station;
        let event = Event::StationUpdated {
            id,
            price: patch.price.unwrap_or(current.price),
            accept_mode: patch.accept_mode.unwrap_or(current.accept_mode),
            always_open: patch.always_open.unwrap_or(current.always_open),
            timezone: patch.timezone.unwrap_or(current.timezone),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.station.clone())
    }

    /// Remove a station and its booking history. Refused while any booking
    /// still holds a slot.
    pub async fn remove_station(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut guard = self.station_write(id).await?;
        let now = self.now();
        self.reconcile_locked(&mut guard, now).await?;
        if guard.active_bookings().next().is_some() {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::StationRemoved { id };
        self.wal_append(&event).await?;
        self.state.remove(&id);
        forget_station(&guard, &self.booking_to_station, &self.window_to_station);
        info!("station {id} removed");
        Ok(())
    }

    pub async fn add_window(&self, station_id: Ulid, window: WeeklyWindow) -> Result<(), EngineError> {
        validate_window(&window)?;
        let mut guard = self.station_write(station_id).await?;
        if guard.station.windows.len() >= MAX_WINDOWS_PER_STATION {
            return Err(EngineError::LimitExceeded("too many windows on station"));
        }
        let id = window.id;
        claim_id(&self.window_to_station, id, station_id)?;
        let event = Event::WindowAdded { station_id, window };
        let result = self.persist_and_apply(&mut guard, &event).await;
        if result.is_err() {
            self.window_to_station.remove(&id);
        }
        result
    }

    pub async fn remove_window(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let station_id = self
            .window_to_station
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = self.station_write(station_id).await?;
        if !guard.station.windows.iter().any(|w| w.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::WindowRemoved { id, station_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(station_id)
    }

    /// Reserve a slot. The overlap check and the insert happen under the
    /// station's write lock, so two overlapping requests cannot both succeed.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        if req
            .payment_ref
            .as_ref()
            .is_some_and(|r| r.len() > MAX_PAYMENT_REF_LEN)
        {
            return Err(EngineError::LimitExceeded("payment reference too long"));
        }
        if req.amount.is_some_and(|a| a < 0) {
            return Err(EngineError::Validation("amount must not be negative".into()));
        }
        let now = self.now();
        let slot = validate_slot(req.start, req.end, now, req.immediate, &self.policy)?;
        let mut guard = self.station_write(req.station_id).await?;
        self.reconcile_locked(&mut guard, now).await?;
        if guard.active_bookings().count() >= MAX_ACTIVE_BOOKINGS_PER_STATION {
            return Err(EngineError::LimitExceeded("too many active bookings on station"));
        }
        check_no_overlap(&guard, &slot, None)?;
        // Claimed under the station lock; released again if the write fails.
        claim_id(&self.booking_to_station, req.id, req.station_id)?;

        let status = match guard.station.accept_mode {
            AcceptMode::Auto => BookingStatus::Confirmed,
            AcceptMode::Request => BookingStatus::Pending,
        };
        let mut booking = Booking {
            id: req.id,
            station_id: req.station_id,
            user_id: req.user_id,
            slot,
            status,
            immediate: req.immediate,
            actual_start: None,
            actual_end: None,
            session_minutes: None,
            amount: req.amount.unwrap_or_else(|| guard.station.quote(&slot)),
            payment_ref: req.payment_ref,
            refund_due: false,
            created_at: now,
            issues: Vec::new(),
            feedback: None,
        };
        if booking.immediate && booking.status == BookingStatus::Confirmed {
            if let Err(status) = lifecycle::apply_transition(&mut booking, &Transition::Start { at: now }) {
                self.booking_to_station.remove(&booking.id);
                return Err(EngineError::InvalidState {
                    booking: booking.id,
                    status,
                    action: "start",
                });
            }
        }

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.booking_to_station.remove(&booking.id);
            return Err(e);
        }
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL, "status" => booking.status.as_str())
            .increment(1);
        info!(
            "booking {} on station {} created as {}",
            booking.id, booking.station_id, booking.status
        );
        Ok(booking)
    }

    /// Run a caller-invoked lifecycle action.
    ///
    /// Due time-driven transitions are applied first. If that alone carried the
    /// booking to where `action` leads (an auto-start before `start`, an
    /// auto-complete before `end`), the call succeeds without a second write.
    pub async fn transition(
        &self,
        booking_id: Ulid,
        caller: &Caller,
        action: Action,
    ) -> Result<Booking, EngineError> {
        let now = self.now();
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let before = {
            let booking = guard
                .booking(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            if !lifecycle::authorize(action, caller, booking, &guard.station) {
                return Err(EngineError::Unauthorized {
                    caller: caller.id,
                    booking: booking_id,
                    action: action.as_str(),
                });
            }
            booking.status
        };

        self.reconcile_locked(&mut guard, now).await?;
        let mut probe = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if probe.status != before && probe.status == action.target() {
            return Ok(probe);
        }

        let transition = action.transition_at(now);
        lifecycle::apply_transition(&mut probe, &transition).map_err(|status| {
            EngineError::InvalidState {
                booking: booking_id,
                status,
                action: action.as_str(),
            }
        })?;

        let station_id = guard.station.id;
        let event = Event::BookingTransitioned {
            id: booking_id,
            station_id,
            transition,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "kind" => action.as_str())
            .increment(1);
        info!("booking {booking_id}: {before} -> {} by {}", probe.status, caller.id);
        Ok(probe)
    }

    pub async fn approve(&self, booking_id: Ulid, caller: &Caller) -> Result<Booking, EngineError> {
        self.transition(booking_id, caller, Action::Approve).await
    }

    pub async fn reject(&self, booking_id: Ulid, caller: &Caller) -> Result<Booking, EngineError> {
        self.transition(booking_id, caller, Action::Reject).await
    }

    pub async fn cancel(&self, booking_id: Ulid, caller: &Caller) -> Result<Booking, EngineError> {
        self.transition(booking_id, caller, Action::Cancel).await
    }

    pub async fn start(&self, booking_id: Ulid, caller: &Caller) -> Result<Booking, EngineError> {
        self.transition(booking_id, caller, Action::Start).await
    }

    pub async fn end(&self, booking_id: Ulid, caller: &Caller) -> Result<Booking, EngineError> {
        self.transition(booking_id, caller, Action::End).await
    }

    /// Attach an issue report. Allowed in any status; never changes it.
    pub async fn report_issue(
        &self,
        booking_id: Ulid,
        caller: &Caller,
        kind: String,
        description: String,
    ) -> Result<Booking, EngineError> {
        if kind.trim().is_empty() {
            return Err(EngineError::Validation("issue kind must not be empty".into()));
        }
        if kind.len() > MAX_ISSUE_KIND_LEN {
            return Err(EngineError::LimitExceeded("issue kind too long"));
        }
        if description.len() > MAX_ISSUE_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("issue description too long"));
        }

        let now = self.now();
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        {
            let booking = guard
                .booking(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            if !lifecycle::may_report(caller, booking, &guard.station) {
                return Err(EngineError::Unauthorized {
                    caller: caller.id,
                    booking: booking_id,
                    action: "report issue on",
                });
            }
            if booking.issues.len() >= MAX_ISSUES_PER_BOOKING {
                return Err(EngineError::LimitExceeded("too many issues on booking"));
            }
        }
        self.reconcile_locked(&mut guard, now).await?;

        let station_id = guard.station.id;
        let event = Event::IssueReported {
            booking_id,
            station_id,
            issue: Issue {
                kind,
                description,
                reported_by: caller.id,
                reported_at: now,
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("issue reported on booking {booking_id}");
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Rate a completed session. Only the booking's user may, and only once.
    pub async fn leave_feedback(
        &self,
        booking_id: Ulid,
        caller: &Caller,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Booking, EngineError> {
        if !(1..=5).contains(&rating) {
            return Err(EngineError::Validation(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }
        if comment
            .as_ref()
            .is_some_and(|c| c.len() > MAX_FEEDBACK_COMMENT_LEN)
        {
            return Err(EngineError::LimitExceeded("feedback comment too long"));
        }

        let now = self.now();
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        self.reconcile_locked(&mut guard, now).await?;
        {
            let booking = guard
                .booking(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            if caller.id != booking.user_id {
                return Err(EngineError::Unauthorized {
                    caller: caller.id,
                    booking: booking_id,
                    action: "leave feedback on",
                });
            }
            if booking.status != BookingStatus::Completed {
                return Err(EngineError::InvalidState {
                    booking: booking_id,
                    status: booking.status,
                    action: "leave feedback on",
                });
            }
            if booking.feedback.is_some() {
                return Err(EngineError::AlreadyExists(booking_id));
            }
        }

        let station_id = guard.station.id;
        let event = Event::FeedbackLeft {
            booking_id,
            station_id,
            feedback: Feedback {
                rating,
                comment,
                left_at: now,
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Rewrite the WAL as one registration per station followed by each of its
    /// bookings in their current form.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();

        // Read locks stay held until the writer has swapped the file, so no
        // mutation can land between the snapshot and the swap.
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(ss) = self.get_station_state(id) {
                guards.push(ss.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for ss in &guards {
            events.push(Event::StationRegistered {
                station: ss.station.clone(),
            });
            events.extend(ss.bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
