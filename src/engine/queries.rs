use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::conflict::{ConflictCheck, find_conflict, now_ms};
use super::ledger::{available_credits, select_pass};
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Would `span` collide with anything on the resource's calendar?
    /// `exclude` skips one entry, for checking a reschedule against itself.
    pub async fn check_conflict(
        &self,
        kind: ResourceKind,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<ConflictCheck, EngineError> {
        if span.start >= span.end {
            return Err(EngineError::InvalidSpan(span));
        }
        let rs = self.read_resource(kind, resource_id).await?;
        Ok(find_conflict(&rs, &span, exclude).into())
    }

    async fn read_resource(
        &self,
        kind: ResourceKind,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let row = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::NotFound(Entity::Resource(kind), id))?;
        let guard = row.read_owned().await;
        if guard.kind != kind {
            return Err(EngineError::NotFound(Entity::Resource(kind), id));
        }
        Ok(guard)
    }

    /// Calendar entries on a resource overlapping `window`, cancelled ones included.
    pub async fn calendar(
        &self,
        kind: ResourceKind,
        resource_id: Ulid,
        window: Span,
    ) -> Result<Vec<CalendarEntry>, EngineError> {
        if window.start >= window.end {
            return Err(EngineError::InvalidSpan(window));
        }
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self.read_resource(kind, resource_id).await?;
        Ok(rs.overlapping(&window).cloned().collect())
    }

    /// Whether `id` names a room or a staff member.
    pub async fn resource_kind(&self, id: Ulid) -> Option<ResourceKind> {
        let row = self.store.get_resource(&id)?;
        let kind = row.read().await.kind;
        Some(kind)
    }

    pub async fn list_resources(&self, kind: Option<ResourceKind>) -> Vec<ResourceInfo> {
        let mut out = Vec::new();
        for id in self.store.resource_ids() {
            if let Some(row) = self.store.get_resource(&id) {
                let rs = row.read().await;
                if kind.is_none_or(|k| k == rs.kind) {
                    out.push(ResourceInfo {
                        id: rs.id,
                        kind: rs.kind,
                        name: rs.name.clone(),
                    });
                }
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub fn get_session(&self, id: Ulid) -> Result<IndividualSession, EngineError> {
        self.store
            .get_session(&id)
            .ok_or(EngineError::NotFound(Entity::Session, id))
    }

    pub async fn get_class(&self, id: Ulid) -> Result<ClassOccurrence, EngineError> {
        let row = self
            .store
            .get_occurrence(&id)
            .ok_or(EngineError::NotFound(Entity::Class, id))?;
        let state = row.read().await;
        Ok(state.occurrence.clone())
    }

    /// Registrations for a class in booking order.
    pub async fn list_registrations(&self, occurrence_id: Ulid) -> Result<Vec<ClassRegistration>, EngineError> {
        let row = self
            .store
            .get_occurrence(&occurrence_id)
            .ok_or(EngineError::NotFound(Entity::Class, occurrence_id))?;
        let state = row.read().await;
        let mut regs = state.registrations.clone();
        regs.sort_by_key(|r| (r.booked_at, r.id));
        Ok(regs)
    }

    pub async fn audit_log(&self, occurrence_id: Ulid) -> Result<Vec<AuditEntry>, EngineError> {
        let row = self
            .store
            .get_occurrence(&occurrence_id)
            .ok_or(EngineError::NotFound(Entity::Class, occurrence_id))?;
        let state = row.read().await;
        Ok(state.audit.clone())
    }

    // ── Ledger reads ─────────────────────────────────────────

    async fn read_ledger(&self, client_id: Ulid) -> Result<tokio::sync::OwnedRwLockReadGuard<ClientLedger>, EngineError> {
        let row = self
            .store
            .get_ledger(&client_id)
            .ok_or(EngineError::NotFound(Entity::Client, client_id))?;
        Ok(row.read_owned().await)
    }

    pub async fn has_available_credits(&self, client_id: Ulid) -> Result<bool, EngineError> {
        let ledger = self.read_ledger(client_id).await?;
        Ok(select_pass(&ledger.passes, now_ms()).is_some())
    }

    /// The pass the next deduction would come from.
    pub async fn get_available_pass(&self, client_id: Ulid) -> Result<Option<Pass>, EngineError> {
        let ledger = self.read_ledger(client_id).await?;
        Ok(select_pass(&ledger.passes, now_ms()).cloned())
    }

    pub async fn total_available_credits(&self, client_id: Ulid) -> Result<u32, EngineError> {
        let ledger = self.read_ledger(client_id).await?;
        Ok(available_credits(&ledger.passes, now_ms()))
    }

    pub async fn unpaid_balance(&self, client_id: Ulid) -> Result<i64, EngineError> {
        Ok(self.read_ledger(client_id).await?.unpaid_balance_cents)
    }

    /// All passes for a client, soonest expiry first.
    pub async fn list_passes(&self, client_id: Ulid) -> Result<Vec<Pass>, EngineError> {
        let ledger = self.read_ledger(client_id).await?;
        let mut passes = ledger.passes.clone();
        passes.sort_by_key(|p| (p.valid_until, p.created_at, p.id));
        Ok(passes)
    }

    pub async fn client_info(&self, client_id: Ulid) -> Result<ClientInfo, EngineError> {
        let ledger = self.read_ledger(client_id).await?;
        Ok(ClientInfo {
            id: ledger.id,
            name: ledger.name.clone(),
            unpaid_balance_cents: ledger.unpaid_balance_cents,
            available_credits: available_credits(&ledger.passes, now_ms()),
        })
    }
}
