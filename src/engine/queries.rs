use chrono::NaiveDate;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::calendar;
use crate::model::*;

use super::availability::find_gaps;
use super::estimator::estimate;
use super::lifecycle;
use super::{Engine, EngineError};

impl Engine {
    /// Persist every time-driven transition due at `now`. The caller holds the
    /// station's write lock.
    ///
    /// Each transition is re-checked against the booking's current status
    /// before it is written; one that no longer applies is skipped, not
    /// reported.
    pub(super) async fn reconcile_locked(
        &self,
        ss: &mut StationState,
        now: Ms,
    ) -> Result<usize, EngineError> {
        let due = lifecycle::reconcile(&ss.bookings, now);
        let mut applied = 0;
        for r in due {
            let Some(current) = ss.booking(&r.booking_id) else {
                continue;
            };
            if lifecycle::next_status(current.status, &r.transition).is_none() {
                debug!("reconcile skip {}: already {}", r.booking_id, current.status);
                continue;
            }
            let event = Event::BookingTransitioned {
                id: r.booking_id,
                station_id: ss.station.id,
                transition: r.transition,
            };
            self.persist_and_apply(ss, &event).await?;
            metrics::counter!(crate::observability::RECONCILED_TOTAL, "kind" => r.label())
                .increment(1);
            debug!("reconciled booking {}: {}", r.booking_id, r.label());
            applied += 1;
        }
        Ok(applied)
    }

    pub async fn reconcile_station(&self, station_id: Ulid) -> Result<usize, EngineError> {
        let now = self.now();
        let mut guard = self.station_write(station_id).await?;
        self.reconcile_locked(&mut guard, now).await
    }

    /// Reconcile every station. Returns the number of transitions written.
    pub async fn reconcile_all(&self) -> usize {
        let mut total = 0;
        for id in self.station_ids() {
            match self.reconcile_station(id).await {
                Ok(n) => total += n,
                Err(EngineError::NotFound(_)) => {}
                Err(e) => warn!("reconcile of station {id} failed: {e}"),
            }
        }
        total
    }

    pub fn station_ids(&self) -> Vec<Ulid> {
        self.state.iter().map(|e| *e.key()).collect()
    }

    /// Bookable gaps on `date` in the station's timezone.
    ///
    /// Nothing earlier than `now + today_lead` is offered, which trims today
    /// and leaves past dates empty.
    pub async fn free_slots(
        &self,
        station_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<FreeSlot>, EngineError> {
        let now = self.now();
        let mut guard = self.station_write(station_id).await?;
        self.reconcile_locked(&mut guard, now).await?;

        let Some(day) = calendar::day_bounds(guard.station.timezone, date) else {
            return Err(EngineError::Validation(format!("date out of range: {date}")));
        };
        let windows = calendar::windows_for(&guard.station, date);
        let booked: Vec<Span> = guard
            .overlapping(&day)
            .filter(|b| b.status.is_active())
            .map(|b| b.slot)
            .collect();

        let floor = now + self.policy.today_lead_ms;
        Ok(find_gaps(&windows, &booked, Some(floor), self.policy.min_slot_ms))
    }

    pub async fn live_status(&self, station_id: Ulid) -> Result<LiveStatus, EngineError> {
        let now = self.now();
        let mut guard = self.station_write(station_id).await?;
        self.reconcile_locked(&mut guard, now).await?;

        let tz = guard.station.timezone;
        let today = calendar::local_date(tz, now).and_then(|d| calendar::day_bounds(tz, d));
        Ok(estimate(station_id, &guard.bookings, now, today, &self.policy))
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let now = self.now();
        let mut guard = self.resolve_booking_write(&id).await?;
        self.reconcile_locked(&mut guard, now).await?;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// All bookings of a station, terminal ones included, ordered by slot start.
    pub async fn list_bookings(&self, station_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let now = self.now();
        let mut guard = self.station_write(station_id).await?;
        self.reconcile_locked(&mut guard, now).await?;
        Ok(guard.bookings.clone())
    }

    pub async fn get_station(&self, id: Ulid) -> Result<Station, EngineError> {
        let ss = self.get_station_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ss.read().await;
        Ok(guard.station.clone())
    }

    pub async fn list_stations(&self) -> Vec<Station> {
        let mut ids = self.station_ids();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ss) = self.get_station_state(&id) {
                out.push(ss.read().await.station.clone());
            }
        }
        out
    }
}
