mod availability;
mod booking;
mod capacity;
mod error;
mod ledger;
mod store;

pub use error::EngineError;
pub use store::{CourierKey, DeliveryIdClaim, SharedCourier, SharedTimeslot, Store};

use std::io;
use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::collab::Collaborators;
use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use store::{event_courier_key, event_timeslot_id};

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

/// Owns the WAL. Appends that arrive while a flush is pending are buffered
/// together and share one fsync; every sender hears the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
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
            handle_control(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let mark = wal.mark();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    let flushed = wal.flush_sync();
    let result = result.and(flushed);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!(error = %e, events = batch.len(), "WAL flush failed");
        // Callers are told the batch failed; it must not replay either.
        if let Err(e) = wal.rollback(mark) {
            tracing::error!(error = %e, "WAL rollback failed");
        }
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed as control command")));
        }
    }
}

/// The booking service. Constructed once and shared behind an `Arc`.
pub struct Engine {
    pub(super) store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    pub(super) collab: Collaborators,
    /// Row operations hold this shared; schedule reloads hold it exclusively
    /// so no booking straddles a reload.
    pub(super) schedule_gate: RwLock<()>,
    /// Serialises user registration so the email check and insert agree.
    pub(super) registration: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, collab: Collaborators) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?.events;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            collab,
            schedule_gate: RwLock::new(()),
            registration: Mutex::new(()),
        };
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            timeslots = engine.store.timeslot_count(),
            "engine state restored"
        );
        Ok(engine)
    }

    /// Apply one logged event during start-up. Nothing else holds the row
    /// locks yet, so `try_write` never waits.
    fn replay_event(&self, event: &Event) {
        let Some(timeslot_id) = event_timeslot_id(event) else {
            self.store.apply_structural(event);
            return;
        };
        let Some(ts) = self.store.get_timeslot(&timeslot_id) else {
            tracing::warn!(%timeslot_id, "replay: event for unknown timeslot skipped");
            return;
        };
        let Ok(mut ts_guard) = ts.try_write() else {
            tracing::error!(%timeslot_id, "replay: timeslot row locked");
            return;
        };
        let courier = event_courier_key(event).and_then(|(id, date)| self.store.get_courier(id, date));
        let mut courier_guard = match &courier {
            Some(c) => match c.try_write() {
                Ok(g) => Some(g),
                Err(_) => {
                    tracing::error!(%timeslot_id, "replay: courier row locked");
                    return;
                }
            },
            None => None,
        };
        if let Err(e) = self
            .store
            .apply_row_event(&mut ts_guard, courier_guard.as_deref_mut(), event)
        {
            tracing::error!(error = %e, ?event, "replay: event rejected");
        }
    }

    /// Write an event through the group-commit writer and wait until it is durable.
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

    /// Queue every event before waiting on any, so they share group commits.
    async fn wal_append_all(&self, events: &[Event]) -> Result<(), EngineError> {
        let mut pending = Vec::with_capacity(events.len());
        for event in events {
            let (tx, rx) = oneshot::channel();
            self.wal_tx
                .send(WalCommand::Append { event: event.clone(), response: tx })
                .await
                .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
            pending.push(rx);
        }
        for rx in pending {
            rx.await
                .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
                .map_err(|e| EngineError::WalError(e.to_string()))?;
        }
        Ok(())
    }

    /// Log a record-level event, then apply it.
    pub(super) async fn persist_structural(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_structural(event);
        Ok(())
    }

    /// Log a capacity event, then apply it to the rows the caller has locked.
    /// The caller validated the event on staged copies first, so applying
    /// cannot fail unless the records were already inconsistent.
    pub(super) async fn persist_and_apply(
        &self,
        ts: &mut Timeslot,
        courier: Option<&mut CourierCapacity>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_row_event(ts, courier, event).inspect_err(|e| {
            tracing::error!(error = %e, ?event, "logged event failed to apply");
        })
    }

    /// Rewrite the WAL with the minimal event list that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.schedule_gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    /// Events in replay order: capacity records, timeslots, users, bookings,
    /// and holiday marks last so replayed bookings still find room.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = vec![Event::ScheduleCleared];

        let mut courier_keys = self.store.courier_keys();
        courier_keys.sort();
        for (courier_id, date) in courier_keys {
            if let Some(c) = self.store.get_courier(courier_id, date) {
                let c = c.read().await;
                events.push(Event::CourierDayAdded {
                    courier_id,
                    date,
                    country_code: c.country_code.clone(),
                });
            }
        }

        let mut holidays = Vec::new();
        let mut timeslot_ids = self.store.timeslot_ids();
        timeslot_ids.sort();
        for id in timeslot_ids {
            if let Some(ts) = self.store.get_timeslot(&id) {
                let ts = ts.read().await;
                events.push(Event::TimeslotAdded {
                    id,
                    courier_id: ts.courier_id,
                    start: ts.start,
                    end: ts.end,
                    supported_addresses: ts.supported_addresses.iter().cloned().collect(),
                });
                if ts.holiday {
                    holidays.push(Event::TimeslotHolidayMarked { id });
                }
            }
        }

        let mut user_ids = self.store.user_ids();
        user_ids.sort();
        let mut resolved = Vec::new();
        for id in user_ids {
            if let Some(user) = self.store.get_user(&id) {
                events.push(Event::UserRegistered {
                    id,
                    name: user.name,
                    email: user.email,
                    address: user.address,
                    country_code: user.country_code,
                });
                if let Some(address) = user.resolved {
                    resolved.push(Event::AddressResolved { user_id: id, address });
                }
            }
        }
        events.extend(resolved);

        let mut deliveries = self.store.deliveries_where(|_| true);
        deliveries.sort_by_key(|d| d.id);
        let mut completed = Vec::new();
        for d in deliveries {
            events.push(Event::DeliveryBooked {
                id: d.id,
                timeslot_id: d.timeslot_id,
                courier_id: d.courier_id,
                user_id: d.user_id,
                date: d.date,
            });
            if d.status == DeliveryStatus::Completed {
                completed.push(Event::DeliveryCompleted { id: d.id, timeslot_id: d.timeslot_id });
            }
        }
        events.extend(completed);
        events.extend(holidays);
        events
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
