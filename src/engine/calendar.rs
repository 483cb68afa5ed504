use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::outbox::OutboxItem;
use crate::sync::{SyncEntity, SyncRequest};

use super::conflict::{check_no_conflict, validate_name, validate_span};
use super::tx::UnitOfWork;
use super::{Engine, EngineError, Entity};

#[derive(Debug, Clone)]
pub struct SessionInput {
    pub id: Ulid,
    pub room_id: Ulid,
    pub staff_id: Ulid,
    pub client_id: Option<Ulid>,
    pub span: Span,
}

/// Partial update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub room_id: Option<Ulid>,
    pub staff_id: Option<Ulid>,
    pub client_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

#[derive(Debug, Clone)]
pub struct ClassInput {
    pub id: Ulid,
    pub room_id: Ulid,
    pub trainer_id: Ulid,
    pub name: Option<String>,
    pub span: Span,
    pub capacity: u32,
    pub price_cents: i64,
    /// Falls back to the policy default.
    pub credits_required: Option<u32>,
}

/// Attempts at locking a session's rows before giving up on a session that
/// keeps moving between calendars.
const SESSION_LOCK_ATTEMPTS: usize = 3;

fn check_room_then_staff(
    uow: &UnitOfWork<'_>,
    room_id: Ulid,
    staff_id: Ulid,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    check_no_conflict(uow.resource(room_id)?, span, exclude)?;
    check_no_conflict(uow.resource(staff_id)?, span, exclude)
}

fn check_calendar_room(uow: &UnitOfWork<'_>, ids: [Ulid; 2]) -> Result<(), EngineError> {
    for id in ids {
        if uow.resource(id)?.entries.len() >= MAX_ENTRIES_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many calendar entries on resource"));
        }
    }
    Ok(())
}

fn transition(session: &IndividualSession, action: &'static str) -> Result<(), EngineError> {
    if session.status != SessionStatus::Scheduled {
        return Err(EngineError::InvalidTransition {
            id: session.id,
            from: session.status.as_str(),
            action,
        });
    }
    Ok(())
}

impl Engine {
    // ── Individual sessions ──────────────────────────────────

    pub async fn create_session(&self, input: SessionInput) -> Result<IndividualSession, EngineError> {
        validate_span(&input.span)?;
        if self.store.contains_session(&input.id) || self.store.contains_occurrence(&input.id) {
            return Err(EngineError::AlreadyExists(input.id));
        }
        if let Some(client_id) = input.client_id
            && !self.store.contains_client(&client_id)
        {
            return Err(EngineError::NotFound(Entity::Client, client_id));
        }

        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_resources(&[input.room_id], &[input.staff_id]).await?;
        if self.store.contains_session(&input.id) || self.store.contains_occurrence(&input.id) {
            return Err(EngineError::AlreadyExists(input.id));
        }
        check_calendar_room(&uow, [input.room_id, input.staff_id])?;
        check_room_then_staff(&uow, input.room_id, input.staff_id, &input.span, None)?;

        let session = IndividualSession {
            id: input.id,
            room_id: input.room_id,
            staff_id: input.staff_id,
            client_id: input.client_id,
            span: input.span,
            status: SessionStatus::Scheduled,
            attended: false,
            external_ref: None,
        };
        uow.record(Event::SessionWritten {
            session: session.clone(),
            previous_room: None,
            previous_staff: None,
        });
        uow.queue(OutboxItem::Sync(SyncRequest::upsert(SyncEntity::Session, session.id)));
        uow.commit().await?;
        info!(
            "session {} scheduled in room {} with staff {} [{}, {})",
            session.id, session.room_id, session.staff_id, session.span.start, session.span.end
        );
        Ok(session)
    }

    /// Lock the rows a session currently sits on, plus any extra rows, and
    /// return the session as it is under those locks. Retries if the session
    /// moved between reading it and locking.
    async fn lock_session(
        &self,
        id: Ulid,
        extra_room: Option<Ulid>,
        extra_staff: Option<Ulid>,
    ) -> Result<(UnitOfWork<'_>, IndividualSession), EngineError> {
        for _ in 0..SESSION_LOCK_ATTEMPTS {
            let seen = self
                .store
                .get_session(&id)
                .ok_or(EngineError::NotFound(Entity::Session, id))?;
            let rooms: Vec<Ulid> = [Some(seen.room_id), extra_room].into_iter().flatten().collect();
            let staff: Vec<Ulid> = [Some(seen.staff_id), extra_staff].into_iter().flatten().collect();
            let mut uow = UnitOfWork::begin(self).await?;
            uow.lock_resources(&rooms, &staff).await?;
            let current = self
                .store
                .get_session(&id)
                .ok_or(EngineError::NotFound(Entity::Session, id))?;
            if current.room_id == seen.room_id && current.staff_id == seen.staff_id {
                return Ok((uow, current));
            }
            tracing::debug!("session {id} moved while locking, retrying");
        }
        Err(EngineError::LockTimeout("session"))
    }

    pub async fn update_session(&self, id: Ulid, update: SessionUpdate) -> Result<IndividualSession, EngineError> {
        if let Some(client_id) = update.client_id
            && !self.store.contains_client(&client_id)
        {
            return Err(EngineError::NotFound(Entity::Client, client_id));
        }
        let (mut uow, current) = self.lock_session(id, update.room_id, update.staff_id).await?;
        transition(&current, "update")?;

        let mut next = current.clone();
        next.room_id = update.room_id.unwrap_or(current.room_id);
        next.staff_id = update.staff_id.unwrap_or(current.staff_id);
        next.client_id = update.client_id.or(current.client_id);
        next.span = Span {
            start: update.start.unwrap_or(current.span.start),
            end: update.end.unwrap_or(current.span.end),
        };
        validate_span(&next.span)?;
        if next == current {
            return Ok(current);
        }
        if next.room_id != current.room_id || next.staff_id != current.staff_id {
            check_calendar_room(&uow, [next.room_id, next.staff_id])?;
        }
        check_room_then_staff(&uow, next.room_id, next.staff_id, &next.span, Some(id))?;

        uow.record(Event::SessionWritten {
            session: next.clone(),
            previous_room: (next.room_id != current.room_id).then_some(current.room_id),
            previous_staff: (next.staff_id != current.staff_id).then_some(current.staff_id),
        });
        uow.queue(OutboxItem::Sync(SyncRequest::upsert(SyncEntity::Session, id)));
        uow.commit().await?;
        info!("session {id} updated");
        Ok(next)
    }

    async fn set_session_status(
        &self,
        id: Ulid,
        status: SessionStatus,
        attended: bool,
        action: &'static str,
    ) -> Result<IndividualSession, EngineError> {
        let (mut uow, current) = self.lock_session(id, None, None).await?;
        transition(&current, action)?;
        let mut next = current;
        next.status = status;
        next.attended = attended;
        uow.record(Event::SessionWritten {
            session: next.clone(),
            previous_room: None,
            previous_staff: None,
        });
        let sync = match status {
            SessionStatus::Cancelled => SyncRequest::delete(SyncEntity::Session, id),
            _ => SyncRequest::upsert(SyncEntity::Session, id),
        };
        uow.queue(OutboxItem::Sync(sync));
        uow.commit().await?;
        info!("session {id} {}", status.as_str());
        Ok(next)
    }

    /// Frees the slot. The session stays on record.
    pub async fn cancel_session(&self, id: Ulid) -> Result<IndividualSession, EngineError> {
        self.set_session_status(id, SessionStatus::Cancelled, false, "cancel").await
    }

    pub async fn complete_session(&self, id: Ulid, attended: bool) -> Result<IndividualSession, EngineError> {
        self.set_session_status(id, SessionStatus::Completed, attended, "complete").await
    }

    pub async fn mark_session_no_show(&self, id: Ulid) -> Result<IndividualSession, EngineError> {
        self.set_session_status(id, SessionStatus::NoShow, false, "mark no-show").await
    }

    /// Store the external calendar's id for a session. No sync is queued.
    pub async fn record_external_ref(&self, id: Ulid, external_ref: String) -> Result<(), EngineError> {
        if external_ref.len() > MAX_EXTERNAL_REF_LEN {
            return Err(EngineError::LimitExceeded("external ref too long"));
        }
        let (mut uow, current) = self.lock_session(id, None, None).await?;
        if current.external_ref.as_deref() == Some(external_ref.as_str()) {
            return Ok(());
        }
        let mut next = current;
        next.external_ref = Some(external_ref);
        uow.record(Event::SessionWritten {
            session: next,
            previous_room: None,
            previous_staff: None,
        });
        uow.commit().await
    }

    // ── Class occurrences ────────────────────────────────────

    pub async fn create_class(&self, input: ClassInput) -> Result<ClassOccurrence, EngineError> {
        validate_span(&input.span)?;
        validate_name(&input.name)?;
        let credits_required = input
            .credits_required
            .unwrap_or(self.policy.default_credits_per_class);
        if input.capacity == 0 || input.capacity > MAX_CLASS_CAPACITY {
            return Err(EngineError::InvalidInput("capacity must be between 1 and 1000"));
        }
        if credits_required == 0 || credits_required > MAX_CREDITS_PER_CLASS {
            return Err(EngineError::InvalidInput("credits_required must be between 1 and 100"));
        }
        if input.price_cents < 0 || input.price_cents > MAX_PRICE_CENTS {
            return Err(EngineError::InvalidInput("price out of range"));
        }
        if self.store.contains_occurrence(&input.id) || self.store.contains_session(&input.id) {
            return Err(EngineError::AlreadyExists(input.id));
        }

        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_resources(&[input.room_id], &[input.trainer_id]).await?;
        if self.store.contains_occurrence(&input.id) || self.store.contains_session(&input.id) {
            return Err(EngineError::AlreadyExists(input.id));
        }
        check_calendar_room(&uow, [input.room_id, input.trainer_id])?;
        check_room_then_staff(&uow, input.room_id, input.trainer_id, &input.span, None)?;

        let occurrence = ClassOccurrence {
            id: input.id,
            room_id: input.room_id,
            trainer_id: input.trainer_id,
            name: input.name,
            span: input.span,
            capacity: input.capacity,
            price_cents: input.price_cents,
            credits_required,
            status: ClassStatus::Scheduled,
        };
        uow.write_class(occurrence.clone());
        uow.queue(OutboxItem::Sync(SyncRequest::upsert(
            SyncEntity::ClassOccurrence,
            occurrence.id,
        )));
        uow.commit().await?;
        info!(
            "class {} scheduled in room {} with trainer {} [{}, {}), capacity {}",
            occurrence.id,
            occurrence.room_id,
            occurrence.trainer_id,
            occurrence.span.start,
            occurrence.span.end,
            occurrence.capacity
        );
        Ok(occurrence)
    }

    /// Room and trainer never change after creation, so they can be read
    /// before taking the locks that must precede the occurrence lock.
    pub(super) async fn class_resources(&self, id: Ulid) -> Result<(Ulid, Ulid), EngineError> {
        let row = self
            .store
            .get_occurrence(&id)
            .ok_or(EngineError::NotFound(Entity::Class, id))?;
        let state = row.read().await;
        Ok((state.occurrence.room_id, state.occurrence.trainer_id))
    }

    pub async fn complete_class(&self, id: Ulid) -> Result<ClassOccurrence, EngineError> {
        let (room_id, trainer_id) = self.class_resources(id).await?;
        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_resources(&[room_id], &[trainer_id]).await?;
        uow.lock_occurrence(id).await?;
        let mut occurrence = uow.occurrence()?.occurrence.clone();
        if occurrence.status != ClassStatus::Scheduled {
            return Err(EngineError::InvalidTransition {
                id,
                from: occurrence.status.as_str(),
                action: "complete",
            });
        }
        occurrence.status = ClassStatus::Completed;
        uow.write_class(occurrence.clone());
        uow.commit().await?;
        info!("class {id} completed");
        Ok(occurrence)
    }
}
