use async_trait::async_trait;
use serde::Serialize;
use ulid::Ulid;

use crate::outbox::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEntity {
    Session,
    ClassOccurrence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOp {
    Upsert,
    Delete,
}

/// Ask the external calendar to mirror one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRequest {
    pub entity: SyncEntity,
    pub entity_id: Ulid,
    pub op: SyncOp,
}

impl SyncRequest {
    pub fn upsert(entity: SyncEntity, entity_id: Ulid) -> Self {
        Self { entity, entity_id, op: SyncOp::Upsert }
    }

    pub fn delete(entity: SyncEntity, entity_id: Ulid) -> Self {
        Self { entity, entity_id, op: SyncOp::Delete }
    }
}

/// External calendar mirror. An upsert may return the remote event id, which
/// is stored on the session as its `external_ref`.
#[async_trait]
pub trait CalendarSync: Send + Sync {
    async fn schedule_sync(&self, request: &SyncRequest) -> Result<Option<String>, DispatchError>;
}

/// Default mirror: logs the request and stores nothing.
pub struct LogOnlySync;

#[async_trait]
impl CalendarSync for LogOnlySync {
    async fn schedule_sync(&self, request: &SyncRequest) -> Result<Option<String>, DispatchError> {
        tracing::debug!(
            "calendar sync {:?} {:?} {}",
            request.op,
            request.entity,
            request.entity_id
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_only_returns_no_ref() {
        let req = SyncRequest::upsert(SyncEntity::Session, Ulid::new());
        let external_ref = tokio_test::block_on(LogOnlySync.schedule_sync(&req)).unwrap();
        assert_eq!(external_ref, None);
    }
}
