mod availability;
mod conflict;
mod error;
mod estimator;
pub mod lifecycle;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::find_gaps;
pub use conflict::find_overlap;
pub use error::EngineError;
pub use estimator::{estimate, minutes_until};
pub use lifecycle::{Action, Reconciled};
pub use mutations::{NewBooking, StationPatch};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::Policy;
use crate::model::*;
use crate::wal::Wal;

pub type SharedStationState = Arc<RwLock<StationState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes never reach the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed: {e}");
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// One marketplace: its stations, their bookings, and the WAL behind them.
pub struct Engine {
    pub state: DashMap<Ulid, SharedStationState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookups: booking / window id → station id.
    pub(super) booking_to_station: DashMap<Ulid, Ulid>,
    pub(super) window_to_station: DashMap<Ulid, Ulid>,
    /// Serializes station registration and removal against compaction snapshots.
    pub(super) catalog: Mutex<()>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: Policy,
}

/// Apply an event to a station's state. The caller holds the write lock.
/// Registration and removal are handled at the map level, not here.
fn apply_to_station(
    ss: &mut StationState,
    event: &Event,
    bookings: &DashMap<Ulid, Ulid>,
    windows: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::StationUpdated {
            price,
            accept_mode,
            always_open,
            timezone,
            ..
        } => {
            ss.station.price = *price;
            ss.station.accept_mode = *accept_mode;
            ss.station.always_open = *always_open;
            ss.station.timezone = *timezone;
        }
        Event::WindowAdded { station_id, window } => {
            ss.station.windows.push(window.clone());
            windows.insert(window.id, *station_id);
        }
        Event::WindowRemoved { id, .. } => {
            ss.station.windows.retain(|w| w.id != *id);
            windows.remove(id);
        }
        Event::BookingCreated { booking } => {
            bookings.insert(booking.id, booking.station_id);
            ss.insert_booking(booking.clone());
        }
        Event::BookingTransitioned { id, transition, .. } => {
            if let Some(b) = ss.booking_mut(id) {
                // Logged transitions were legal when written.
                let _ = lifecycle::apply_transition(b, transition);
            }
        }
        Event::IssueReported {
            booking_id, issue, ..
        } => {
            if let Some(b) = ss.booking_mut(booking_id) {
                b.issues.push(issue.clone());
            }
        }
        Event::FeedbackLeft {
            booking_id,
            feedback,
            ..
        } => {
            if let Some(b) = ss.booking_mut(booking_id) {
                b.feedback = Some(feedback.clone());
            }
        }
        Event::StationRegistered { .. } | Event::StationRemoved { .. } => {}
    }
}

/// Station an event belongs to, for everything but registration and removal.
fn event_station_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::StationUpdated { id, .. } => Some(*id),
        Event::WindowAdded { station_id, .. }
        | Event::WindowRemoved { station_id, .. }
        | Event::BookingTransitioned { station_id, .. }
        | Event::IssueReported { station_id, .. }
        | Event::FeedbackLeft { station_id, .. } => Some(*station_id),
        Event::BookingCreated { booking } => Some(booking.station_id),
        Event::StationRegistered { .. } | Event::StationRemoved { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>, policy: Policy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_to_station = DashMap::new();
        let window_to_station = DashMap::new();

        // Rebuild into plain maps first; nothing else can see these stations yet.
        let mut stations: HashMap<Ulid, StationState> = HashMap::new();
        for event in &events {
            match event {
                Event::StationRegistered { station } => {
                    for w in &station.windows {
                        window_to_station.insert(w.id, station.id);
                    }
                    stations.insert(station.id, StationState::new(station.clone()));
                }
                Event::StationRemoved { id } => {
                    if let Some(ss) = stations.remove(id) {
                        forget_station(&ss, &booking_to_station, &window_to_station);
                    }
                }
                other => {
                    if let Some(ss) = event_station_id(other).and_then(|id| stations.get_mut(&id)) {
                        apply_to_station(ss, other, &booking_to_station, &window_to_station);
                    }
                }
            }
        }

        let state = DashMap::new();
        for (id, ss) in stations {
            state.insert(id, Arc::new(RwLock::new(ss)));
        }
        tracing::debug!(
            "replayed {} events into {} stations from {}",
            events.len(),
            state.len(),
            wal_path.display()
        );

        Ok(Self {
            state,
            wal_tx,
            booking_to_station,
            window_to_station,
            catalog: Mutex::new(()),
            clock,
            policy,
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_station_state(&self, id: &Ulid) -> Option<SharedStationState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn station_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_station.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append, then apply under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut StationState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_station(ss, event, &self.booking_to_station, &self.window_to_station);
        Ok(())
    }

    pub(super) async fn station_write(
        &self,
        station_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<StationState>, EngineError> {
        let ss = self
            .get_station_state(&station_id)
            .ok_or(EngineError::NotFound(station_id))?;
        let guard = ss.write_owned().await;
        // Removed while we waited for the lock.
        if !self.state.contains_key(&station_id) {
            return Err(EngineError::NotFound(station_id));
        }
        Ok(guard)
    }

    /// Lookup booking → station, acquire the station's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<StationState>, EngineError> {
        let station_id = self
            .station_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = self.station_write(station_id).await?;
        // Removed between lookup and lock.
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok(guard)
    }
}

fn forget_station(ss: &StationState, bookings: &DashMap<Ulid, Ulid>, windows: &DashMap<Ulid, Ulid>) {
    for b in &ss.bookings {
        bookings.remove(&b.id);
    }
    for w in &ss.station.windows {
        windows.remove(&w.id);
    }
}

/// Reserve `id` in an id → station index. Ids are unique per tenant, so a
/// taken id fails even when it belongs to another station.
fn claim_id(index: &DashMap<Ulid, Ulid>, id: Ulid, station_id: Ulid) -> Result<(), EngineError> {
    match index.entry(id) {
        Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
        Entry::Vacant(slot) => {
            slot.insert(station_id);
            Ok(())
        }
    }
}
