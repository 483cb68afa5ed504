mod booking;
mod calendar;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
mod store;
mod tx;

pub use booking::{BookingOutcome, CancelOutcome, Promotion};
pub use calendar::{ClassInput, SessionInput, SessionUpdate};
pub use conflict::{ConflictCheck, ConflictDetail};
pub use error::{EngineError, Entity, ErrorKind};
pub use ledger::{RefundOutcome, available_credits, select_pass, select_refund_target};
pub use store::{InMemoryStore, SharedLedger, SharedOccurrence, SharedResource};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use crate::config::PolicyConfig;
use crate::model::*;
use crate::outbox::Outbox;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
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

type Pending = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch: Vec<Pending> = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} records: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One studio's scheduling state: calendars, classes, ledgers, and the log
/// that makes them durable.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) outbox: Outbox,
    pub(super) policy: PolicyConfig,
    /// Units of work hold it shared; compaction holds it exclusively.
    pub(super) commit_gate: Arc<RwLock<()>>,
    /// Serializes creation of rooms, staff and clients.
    pub(super) registry_lock: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, outbox: Outbox, policy: PolicyConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            outbox,
            policy,
            commit_gate: Arc::new(RwLock::new(())),
            registry_lock: Mutex::new(()),
        };
        engine.replay(&events);
        tracing::info!(
            "replayed {} events from {}: {} resources, {} clients",
            events.len(),
            wal_path.display(),
            engine.store.resource_count(),
            engine.store.client_count()
        );
        Ok(engine)
    }

    /// Rebuild state from logged events. We are the sole owner of every row
    /// here, so `try_write_owned` never contends. Side effects are not re-sent.
    fn replay(&self, events: &[Event]) {
        for event in events {
            let keys = tx::row_keys(event);
            let mut rows = tx::Rows::default();
            for id in keys.resources {
                if let Some(row) = self.store.get_resource(&id)
                    && let Ok(guard) = row.try_write_owned()
                {
                    rows.resources.insert(id, guard);
                }
            }
            if let Some(id) = keys.occurrence
                && let Some(row) = self.store.get_occurrence(&id)
                && let Ok(guard) = row.try_write_owned()
            {
                rows.occurrence = Some(guard);
            }
            for id in keys.ledgers {
                if let Some(row) = self.store.get_ledger(&id)
                    && let Ok(guard) = row.try_write_owned()
                {
                    rows.ledgers.insert(id, guard);
                }
            }
            self.store.apply_event(&mut rows, event);
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Send one unit of work's events to the group-commit writer as a single record.
    pub(super) async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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

    /// Rewrite the WAL as the minimal event set that rebuilds current state.
    /// Holds the commit gate exclusively, so no unit of work is mid-flight.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
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
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut resource_ids = self.store.resource_ids();
        resource_ids.sort();
        for id in &resource_ids {
            if let Some(row) = self.store.get_resource(id) {
                let rs = row.read().await;
                events.push(Event::ResourceCreated {
                    id: rs.id,
                    kind: rs.kind,
                    name: rs.name.clone(),
                });
            }
        }

        let mut client_ids = self.store.client_ids();
        client_ids.sort();
        for id in &client_ids {
            if let Some(row) = self.store.get_ledger(id) {
                let ledger = row.read().await;
                events.push(Event::ClientCreated {
                    id: ledger.id,
                    name: ledger.name.clone(),
                });
                for pass in &ledger.passes {
                    events.push(Event::PassWritten { pass: pass.clone() });
                }
                if ledger.unpaid_balance_cents != 0 {
                    events.push(Event::UnpaidBalanceSet {
                        client_id: ledger.id,
                        balance_cents: ledger.unpaid_balance_cents,
                    });
                }
            }
        }

        for session in self.store.sessions() {
            events.push(Event::SessionWritten {
                session,
                previous_room: None,
                previous_staff: None,
            });
        }

        for id in self.store.occurrence_ids() {
            if let Some(row) = self.store.get_occurrence(&id) {
                let state = row.read().await;
                events.push(Event::ClassWritten {
                    occurrence: state.occurrence.clone(),
                });
                for registration in &state.registrations {
                    events.push(Event::RegistrationWritten {
                        registration: registration.clone(),
                    });
                }
                for entry in &state.audit {
                    events.push(Event::AuditRecorded { entry: entry.clone() });
                }
            }
        }

        events
    }
}
