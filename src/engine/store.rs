use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::tx::Rows;

pub type SharedResource = Arc<RwLock<ResourceState>>;
pub type SharedOccurrence = Arc<RwLock<OccurrenceState>>;
pub type SharedLedger = Arc<RwLock<ClientLedger>>;

/// The tables. Each lockable row is an `Arc<RwLock<_>>`; the maps themselves
/// only index rows. Sessions are plain values, written only while their room
/// and staff rows are write-locked.
pub struct InMemoryStore {
    resources: DashMap<Ulid, SharedResource>,
    occurrences: DashMap<Ulid, SharedOccurrence>,
    ledgers: DashMap<Ulid, SharedLedger>,
    sessions: DashMap<Ulid, IndividualSession>,
    /// Reverse lookup: pass id → client id
    pass_owner: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            occurrences: DashMap::new(),
            ledgers: DashMap::new(),
            sessions: DashMap::new(),
            pass_owner: DashMap::new(),
        }
    }

    // ── Rooms and staff ──────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResource> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn resource_ids(&self) -> Vec<Ulid> {
        self.resources.iter().map(|e| *e.key()).collect()
    }

    // ── Class occurrences ────────────────────────────────────

    pub fn contains_occurrence(&self, id: &Ulid) -> bool {
        self.occurrences.contains_key(id)
    }

    pub fn get_occurrence(&self, id: &Ulid) -> Option<SharedOccurrence> {
        self.occurrences.get(id).map(|e| e.value().clone())
    }

    pub fn occurrence_ids(&self) -> Vec<Ulid> {
        self.occurrences.iter().map(|e| *e.key()).collect()
    }

    // ── Client ledgers ───────────────────────────────────────

    pub fn client_count(&self) -> usize {
        self.ledgers.len()
    }

    pub fn contains_client(&self, id: &Ulid) -> bool {
        self.ledgers.contains_key(id)
    }

    pub fn get_ledger(&self, id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(id).map(|e| e.value().clone())
    }

    pub fn client_ids(&self) -> Vec<Ulid> {
        self.ledgers.iter().map(|e| *e.key()).collect()
    }

    pub fn pass_owner(&self, pass_id: &Ulid) -> Option<Ulid> {
        self.pass_owner.get(pass_id).map(|e| *e.value())
    }

    // ── Sessions ─────────────────────────────────────────────

    pub fn contains_session(&self, id: &Ulid) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get_session(&self, id: &Ulid) -> Option<IndividualSession> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn sessions(&self) -> Vec<IndividualSession> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply one event. The caller holds write guards for every row the event
    /// touches (see `tx::row_keys`); rows the event creates are inserted here.
    pub(crate) fn apply_event(&self, rows: &mut Rows, event: &Event) {
        match event {
            Event::ResourceCreated { id, kind, name } => {
                let rs = ResourceState::new(*id, *kind, name.clone());
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::ClientCreated { id, name } => {
                let ledger = ClientLedger::new(*id, name.clone());
                self.ledgers.insert(*id, Arc::new(RwLock::new(ledger)));
            }
            Event::PassWritten { pass } => {
                self.pass_owner.insert(pass.id, pass.client_id);
                match rows.ledgers.get_mut(&pass.client_id) {
                    Some(ledger) => ledger.put_pass(pass.clone()),
                    None => tracing::error!("apply: ledger {} not locked", pass.client_id),
                }
            }
            Event::UnpaidBalanceSet {
                client_id,
                balance_cents,
            } => match rows.ledgers.get_mut(client_id) {
                Some(ledger) => ledger.unpaid_balance_cents = *balance_cents,
                None => tracing::error!("apply: ledger {client_id} not locked"),
            },
            Event::SessionWritten {
                session,
                previous_room,
                previous_staff,
            } => {
                for prev in [previous_room, previous_staff].into_iter().flatten() {
                    if let Some(rs) = rows.resources.get_mut(prev) {
                        rs.remove_entry(session.id);
                    }
                }
                let entry = session.entry();
                for rid in [session.room_id, session.staff_id] {
                    match rows.resources.get_mut(&rid) {
                        Some(rs) => rs.put_entry(entry.clone()),
                        None => tracing::error!("apply: resource {rid} not locked"),
                    }
                }
                self.sessions.insert(session.id, session.clone());
            }
            Event::ClassWritten { occurrence } => {
                let entry = occurrence.entry();
                for rid in [occurrence.room_id, occurrence.trainer_id] {
                    match rows.resources.get_mut(&rid) {
                        Some(rs) => rs.put_entry(entry.clone()),
                        None => tracing::error!("apply: resource {rid} not locked"),
                    }
                }
                match rows.occurrence.as_mut() {
                    Some(state) if state.occurrence.id == occurrence.id => {
                        state.occurrence = occurrence.clone();
                    }
                    _ => {
                        let state = OccurrenceState::new(occurrence.clone());
                        self.occurrences
                            .insert(occurrence.id, Arc::new(RwLock::new(state)));
                    }
                }
            }
            Event::RegistrationWritten { registration } => match rows.occurrence.as_mut() {
                Some(state) if state.occurrence.id == registration.occurrence_id => {
                    state.put_registration(registration.clone());
                }
                _ => tracing::error!("apply: class {} not locked", registration.occurrence_id),
            },
            Event::AuditRecorded { entry } => match rows.occurrence.as_mut() {
                Some(state) if state.occurrence.id == entry.occurrence_id => {
                    state.audit.push(entry.clone());
                }
                _ => tracing::error!("apply: class {} not locked", entry.occurrence_id),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_default() {
        let store = InMemoryStore::default();
        assert_eq!(store.resource_count(), 0);
        assert_eq!(store.client_count(), 0);
    }

    #[test]
    fn creation_events_insert_rows() {
        let store = InMemoryStore::new();
        let mut rows = Rows::default();
        let room = Ulid::new();
        let client = Ulid::new();
        store.apply_event(
            &mut rows,
            &Event::ResourceCreated {
                id: room,
                kind: ResourceKind::Room,
                name: Some("Studio A".into()),
            },
        );
        store.apply_event(&mut rows, &Event::ClientCreated { id: client, name: None });
        assert!(store.contains_resource(&room));
        assert!(store.contains_client(&client));
        assert!(!store.contains_resource(&client));
    }
}
