use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_name;
use super::ledger::{self, RefundOutcome};
use super::tx::UnitOfWork;
use super::{Engine, EngineError, Entity};

impl Engine {
    // ── Registry ─────────────────────────────────────────────

    pub async fn create_resource(&self, id: Ulid, kind: ResourceKind, name: Option<String>) -> Result<(), EngineError> {
        validate_name(&name)?;
        let _registry = self.registry_lock.lock().await;
        if self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.store.contains_resource(&id) || self.store.contains_client(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut uow = UnitOfWork::begin(self).await?;
        uow.record(Event::ResourceCreated { id, kind, name });
        uow.commit().await?;
        info!("{} {id} created", kind.as_str());
        Ok(())
    }

    pub async fn create_room(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        self.create_resource(id, ResourceKind::Room, name).await
    }

    pub async fn create_staff(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        self.create_resource(id, ResourceKind::Staff, name).await
    }

    pub async fn create_client(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        validate_name(&name)?;
        let _registry = self.registry_lock.lock().await;
        if self.store.client_count() >= MAX_CLIENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many clients"));
        }
        if self.store.contains_client(&id) || self.store.contains_resource(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut uow = UnitOfWork::begin(self).await?;
        uow.record(Event::ClientCreated { id, name });
        uow.commit().await?;
        info!("client {id} created");
        Ok(())
    }

    // ── Passes and credits ───────────────────────────────────

    pub async fn create_pass(
        &self,
        id: Ulid,
        client_id: Ulid,
        total_credits: u32,
        valid_from: Ms,
        valid_until: Ms,
    ) -> Result<Pass, EngineError> {
        if total_credits == 0 || total_credits > MAX_PASS_CREDITS {
            return Err(EngineError::InvalidInput("total_credits must be between 1 and 10000"));
        }
        if valid_from > valid_until {
            return Err(EngineError::InvalidSpan(Span { start: valid_from, end: valid_until }));
        }
        if self.store.pass_owner(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_ledgers(&[client_id]).await?;
        let now = uow.now;
        let ledger = uow.ledger(client_id)?;
        if ledger.passes.len() >= MAX_PASSES_PER_CLIENT {
            return Err(EngineError::LimitExceeded("too many passes for client"));
        }
        if self.store.pass_owner(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut pass = Pass {
            id,
            client_id,
            total_credits,
            credits_left: total_credits,
            valid_from,
            valid_until,
            status: PassStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        pass.status = pass.window_status(now);
        uow.ledger_mut(client_id)?.put_pass(pass.clone());
        uow.write_passes(client_id, &[id])?;
        uow.commit().await?;
        info!("pass {id} issued to client {client_id}: {total_credits} credits");
        Ok(pass)
    }

    /// Take one credit from the client's best pass.
    pub async fn deduct_credit(&self, client_id: Ulid, reason: &str) -> Result<Pass, EngineError> {
        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_ledgers(&[client_id]).await?;
        let now = uow.now;
        let debits = ledger::deduct_credits(uow.ledger_mut(client_id)?, 1, now)?;
        uow.write_passes(client_id, &debits)?;
        let pass = debits
            .first()
            .and_then(|id| uow.ledger(client_id).ok()?.pass(*id).cloned())
            .ok_or(EngineError::NoCreditsAvailable(client_id))?;
        uow.commit().await?;
        metrics::counter!(crate::observability::CREDITS_DEDUCTED_TOTAL).increment(1);
        info!("deducted 1 credit from pass {} (client {client_id}): {reason}", pass.id);
        Ok(pass)
    }

    /// Add `count` credits back, to `pass_id` if given, else to the most
    /// recently updated pass with room. A refund with no target is reported
    /// as `Unapplied` and logged.
    pub async fn refund_credit(
        &self,
        client_id: Ulid,
        count: u32,
        reason: &str,
        pass_id: Option<Ulid>,
    ) -> Result<RefundOutcome, EngineError> {
        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_ledgers(&[client_id]).await?;
        let now = uow.now;
        let outcome = ledger::refund_credits(uow.ledger_mut(client_id)?, count, pass_id, now)?;
        match &outcome {
            RefundOutcome::Refunded { pass, applied } => {
                uow.write_passes(client_id, &[pass.id])?;
                uow.commit().await?;
                metrics::counter!(crate::observability::CREDITS_REFUNDED_TOTAL).increment(*applied as u64);
                info!("refunded {applied} credits to pass {} (client {client_id}): {reason}", pass.id);
            }
            RefundOutcome::Unapplied { count } => {
                warn!("refund of {count} credits for client {client_id} not applied, no pass has room: {reason}");
            }
        }
        Ok(outcome)
    }

    /// Record a payment against the unpaid balance. Returns the new balance.
    pub async fn settle_unpaid(&self, client_id: Ulid, amount_cents: i64) -> Result<i64, EngineError> {
        if amount_cents <= 0 {
            return Err(EngineError::InvalidInput("settlement amount must be positive"));
        }
        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_ledgers(&[client_id]).await?;
        let balance = (uow.ledger(client_id)?.unpaid_balance_cents - amount_cents).max(0);
        uow.write_unpaid_balance(client_id, balance)?;
        uow.commit().await?;
        info!("client {client_id} settled {amount_cents} cents, balance now {balance}");
        Ok(balance)
    }

    /// Mark Active passes whose validity window has closed as Expired.
    /// Returns how many passes changed.
    /// Expire passes whose window has closed and activate pending passes
    /// whose window has opened. Returns the number expired.
    pub async fn expire_passes(&self, now: Ms) -> Result<usize, EngineError> {
        let stale = |p: &Pass| {
            matches!(p.status, PassStatus::Active | PassStatus::Pending) && p.window_status(now) != p.status
        };
        let mut due = Vec::new();
        for client_id in self.store.client_ids() {
            if let Some(row) = self.store.get_ledger(&client_id) {
                let ledger = row.read().await;
                if ledger.passes.iter().any(stale) {
                    due.push(client_id);
                }
            }
        }

        let mut expired = 0;
        let mut activated = 0;
        for client_id in due {
            let mut uow = UnitOfWork::begin(self).await?;
            uow.lock_ledgers(&[client_id]).await?;
            let mut changed = Vec::new();
            for pass in uow.ledger_mut(client_id)?.passes.iter_mut() {
                if pass.settle(now) {
                    match pass.status {
                        PassStatus::Expired => expired += 1,
                        _ => activated += 1,
                    }
                    changed.push(pass.id);
                }
            }
            uow.write_passes(client_id, &changed)?;
            uow.commit().await?;
        }
        if expired > 0 {
            metrics::counter!(crate::observability::PASSES_EXPIRED_TOTAL).increment(expired as u64);
            info!("expired {expired} passes");
        }
        if activated > 0 {
            info!("activated {activated} passes");
        }
        Ok(expired)
    }

    pub(super) fn require_client(&self, client_id: Ulid) -> Result<(), EngineError> {
        if !self.store.contains_client(&client_id) {
            return Err(EngineError::NotFound(Entity::Client, client_id));
        }
        Ok(())
    }
}
