//! Unit of work: lock rows in a fixed order, validate against a staged copy,
//! then log and apply every event in one step.
//!
//! Lock order is rooms (by id) → staff (by id) → class occurrence → client
//! ledgers (by id). Each `lock_*` call may be made at most once, in that order.
//! A unit of work dropped without `commit` releases its locks having changed
//! nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::outbox::OutboxItem;

use super::conflict::now_ms;
use super::{Engine, EngineError, Entity};

#[derive(Default)]
pub(crate) struct Rows {
    pub resources: BTreeMap<Ulid, OwnedRwLockWriteGuard<ResourceState>>,
    pub occurrence: Option<OwnedRwLockWriteGuard<OccurrenceState>>,
    pub ledgers: BTreeMap<Ulid, OwnedRwLockWriteGuard<ClientLedger>>,
}

/// Rows an event writes to (rows it creates are not listed).
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RowKeys {
    pub resources: Vec<Ulid>,
    pub occurrence: Option<Ulid>,
    pub ledgers: Vec<Ulid>,
}

pub(crate) fn row_keys(event: &Event) -> RowKeys {
    match event {
        Event::ResourceCreated { .. } | Event::ClientCreated { .. } => RowKeys::default(),
        Event::PassWritten { pass } => RowKeys {
            ledgers: vec![pass.client_id],
            ..Default::default()
        },
        Event::UnpaidBalanceSet { client_id, .. } => RowKeys {
            ledgers: vec![*client_id],
            ..Default::default()
        },
        Event::SessionWritten {
            session,
            previous_room,
            previous_staff,
        } => {
            let mut resources = vec![session.room_id, session.staff_id];
            resources.extend(previous_room.iter().chain(previous_staff.iter()).copied());
            resources.sort();
            resources.dedup();
            RowKeys {
                resources,
                ..Default::default()
            }
        }
        Event::ClassWritten { occurrence } => RowKeys {
            resources: vec![occurrence.room_id, occurrence.trainer_id],
            occurrence: Some(occurrence.id),
            ..Default::default()
        },
        Event::RegistrationWritten { registration } => RowKeys {
            occurrence: Some(registration.occurrence_id),
            ..Default::default()
        },
        Event::AuditRecorded { entry } => RowKeys {
            occurrence: Some(entry.occurrence_id),
            ..Default::default()
        },
    }
}

async fn write_row<T>(
    row: Arc<RwLock<T>>,
    timeout: Duration,
    what: &'static str,
) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
    tokio::time::timeout(timeout, row.write_owned())
        .await
        .map_err(|_| {
            metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL, "row" => what).increment(1);
            EngineError::LockTimeout(what)
        })
}

pub(crate) struct UnitOfWork<'e> {
    engine: &'e Engine,
    // Held for the whole unit so WAL compaction never interleaves with it.
    _gate: OwnedRwLockReadGuard<()>,
    rows: Rows,
    staged_occurrence: Option<OccurrenceState>,
    staged_ledgers: BTreeMap<Ulid, ClientLedger>,
    events: Vec<Event>,
    effects: Vec<OutboxItem>,
    pub now: Ms,
}

impl<'e> UnitOfWork<'e> {
    pub async fn begin(engine: &'e Engine) -> Result<Self, EngineError> {
        let gate = tokio::time::timeout(
            engine.policy.lock_timeout,
            engine.commit_gate.clone().read_owned(),
        )
        .await
        .map_err(|_| EngineError::LockTimeout("commit gate"))?;
        Ok(Self {
            engine,
            _gate: gate,
            rows: Rows::default(),
            staged_occurrence: None,
            staged_ledgers: BTreeMap::new(),
            events: Vec::new(),
            effects: Vec::new(),
            now: now_ms(),
        })
    }

    // ── Locking ──────────────────────────────────────────────

    /// Lock room rows then staff rows, each group in id order.
    pub async fn lock_resources(&mut self, rooms: &[Ulid], staff: &[Ulid]) -> Result<(), EngineError> {
        debug_assert!(self.rows.resources.is_empty());
        debug_assert!(self.rows.occurrence.is_none() && self.rows.ledgers.is_empty());
        for (ids, kind) in [(rooms, ResourceKind::Room), (staff, ResourceKind::Staff)] {
            let mut ids = ids.to_vec();
            ids.sort();
            ids.dedup();
            for id in ids {
                let row = self
                    .engine
                    .store
                    .get_resource(&id)
                    .ok_or(EngineError::NotFound(Entity::Resource(kind), id))?;
                let guard = write_row(row, self.engine.policy.lock_timeout, kind.as_str()).await?;
                if guard.kind != kind {
                    return Err(EngineError::NotFound(Entity::Resource(kind), id));
                }
                self.rows.resources.insert(id, guard);
            }
        }
        Ok(())
    }

    pub async fn lock_occurrence(&mut self, id: Ulid) -> Result<(), EngineError> {
        debug_assert!(self.rows.occurrence.is_none() && self.rows.ledgers.is_empty());
        let row = self
            .engine
            .store
            .get_occurrence(&id)
            .ok_or(EngineError::NotFound(Entity::Class, id))?;
        let guard = write_row(row, self.engine.policy.lock_timeout, "class").await?;
        self.staged_occurrence = Some(guard.clone());
        self.rows.occurrence = Some(guard);
        Ok(())
    }

    pub async fn lock_ledgers(&mut self, clients: &[Ulid]) -> Result<(), EngineError> {
        debug_assert!(self.rows.ledgers.is_empty());
        let mut ids = clients.to_vec();
        ids.sort();
        ids.dedup();
        for id in ids {
            let row = self
                .engine
                .store
                .get_ledger(&id)
                .ok_or(EngineError::NotFound(Entity::Client, id))?;
            let guard = write_row(row, self.engine.policy.lock_timeout, "client").await?;
            self.staged_ledgers.insert(id, guard.clone());
            self.rows.ledgers.insert(id, guard);
        }
        Ok(())
    }

    // ── Reads (staged view) ──────────────────────────────────

    pub fn resource(&self, id: Ulid) -> Result<&ResourceState, EngineError> {
        self.rows
            .resources
            .get(&id)
            .map(|g| &**g)
            .ok_or(EngineError::LockTimeout("unlocked resource"))
    }

    pub fn occurrence(&self) -> Result<&OccurrenceState, EngineError> {
        self.staged_occurrence
            .as_ref()
            .ok_or(EngineError::LockTimeout("unlocked class"))
    }

    pub fn ledger(&self, client_id: Ulid) -> Result<&ClientLedger, EngineError> {
        self.staged_ledgers
            .get(&client_id)
            .ok_or(EngineError::NotFound(Entity::Client, client_id))
    }

    pub fn ledger_mut(&mut self, client_id: Ulid) -> Result<&mut ClientLedger, EngineError> {
        self.staged_ledgers
            .get_mut(&client_id)
            .ok_or(EngineError::NotFound(Entity::Client, client_id))
    }

    // ── Writes ───────────────────────────────────────────────

    pub fn record(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn write_registration(&mut self, registration: ClassRegistration) {
        if let Some(state) = self.staged_occurrence.as_mut() {
            state.put_registration(registration.clone());
        }
        self.events.push(Event::RegistrationWritten { registration });
    }

    pub fn write_audit(&mut self, entry: AuditEntry) {
        if let Some(state) = self.staged_occurrence.as_mut() {
            state.audit.push(entry.clone());
        }
        self.events.push(Event::AuditRecorded { entry });
    }

    pub fn write_class(&mut self, occurrence: ClassOccurrence) {
        if let Some(state) = self.staged_occurrence.as_mut() {
            state.occurrence = occurrence.clone();
        }
        self.events.push(Event::ClassWritten { occurrence });
    }

    /// Log the staged image of each named pass.
    pub fn write_passes(&mut self, client_id: Ulid, pass_ids: &[Ulid]) -> Result<(), EngineError> {
        let mut ids = pass_ids.to_vec();
        ids.sort();
        ids.dedup();
        let ledger = self.ledger(client_id)?;
        let images: Vec<Pass> = ids.iter().filter_map(|id| ledger.pass(*id).cloned()).collect();
        for pass in images {
            self.events.push(Event::PassWritten { pass });
        }
        Ok(())
    }

    pub fn write_unpaid_balance(&mut self, client_id: Ulid, balance_cents: i64) -> Result<(), EngineError> {
        self.ledger_mut(client_id)?.unpaid_balance_cents = balance_cents;
        self.events.push(Event::UnpaidBalanceSet {
            client_id,
            balance_cents,
        });
        Ok(())
    }

    /// Queue a side effect for delivery after commit.
    pub fn queue(&mut self, item: OutboxItem) {
        self.effects.push(item);
    }

    /// Log all events as one WAL entry, apply them to the locked rows, then
    /// hand side effects to the outbox. Locks are released on return.
    pub async fn commit(mut self) -> Result<(), EngineError> {
        if self.events.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut self.events);
        self.engine.wal_append(&events).await?;
        for event in &events {
            self.engine.store.apply_event(&mut self.rows, event);
        }
        metrics::counter!(crate::observability::TRANSACTIONS_TOTAL).increment(1);
        metrics::histogram!(crate::observability::TRANSACTION_EVENTS).record(events.len() as f64);
        let effects = std::mem::take(&mut self.effects);
        drop(self.rows);
        self.engine.outbox.enqueue(effects);
        Ok(())
    }
}
