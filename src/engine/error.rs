use ulid::Ulid;

use crate::model::{Ms, ResourceKind, Span};

use super::conflict::ConflictDetail;

/// Error classes callers act on. Transport codes are derived from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Double-booking or duplicate active registration. Pick another slot.
    Conflict,
    /// Business rule said no. Not retryable as-is.
    Policy,
    NotFound,
    /// Lock wait timed out or the log could not be written. Nothing was
    /// mutated; safe to retry.
    TransientStore,
    /// Malformed input or a hard limit.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Resource(ResourceKind),
    Client,
    Pass,
    Session,
    Class,
    Registration,
}

impl Entity {
    fn as_str(&self) -> &'static str {
        match self {
            Entity::Resource(kind) => kind.as_str(),
            Entity::Client => "client",
            Entity::Pass => "pass",
            Entity::Session => "session",
            Entity::Class => "class",
            Entity::Registration => "registration",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Entity, Ulid),
    AlreadyExists(Ulid),
    /// A room or staff member is already busy.
    ResourceConflict(ConflictDetail),
    AlreadyRegistered {
        registration_id: Ulid,
        occurrence_id: Ulid,
        client_id: Ulid,
        span: Span,
    },
    ClassNotBookable {
        occurrence_id: Ulid,
        reason: &'static str,
    },
    CancellationLocked {
        occurrence_id: Ulid,
        starts_in_ms: Ms,
        window_hours: u32,
    },
    NoCreditsAvailable(Ulid),
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        action: &'static str,
    },
    InvalidSpan(Span),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    LockTimeout(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ResourceConflict(_)
            | EngineError::AlreadyRegistered { .. }
            | EngineError::AlreadyExists(_) => ErrorKind::Conflict,
            EngineError::ClassNotBookable { .. }
            | EngineError::CancellationLocked { .. }
            | EngineError::NoCreditsAvailable(_)
            | EngineError::InvalidTransition { .. } => ErrorKind::Policy,
            EngineError::NotFound(..) => ErrorKind::NotFound,
            EngineError::LockTimeout(_) | EngineError::WalError(_) => ErrorKind::TransientStore,
            EngineError::InvalidSpan(_)
            | EngineError::InvalidInput(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Invalid,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientStore
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{} not found: {id}", entity.as_str()),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::ResourceConflict(d) => write!(
                f,
                "{} {} is busy: {} {} [{}, {})",
                d.conflict_type.as_str(),
                d.resource_id,
                d.entity_kind.as_str(),
                d.entity_id,
                d.start,
                d.end
            ),
            EngineError::AlreadyRegistered {
                registration_id,
                occurrence_id,
                client_id,
                span,
            } => write!(
                f,
                "client {client_id} already registered for class {occurrence_id} [{}, {}) as {registration_id}",
                span.start, span.end
            ),
            EngineError::ClassNotBookable { occurrence_id, reason } => {
                write!(f, "class {occurrence_id} cannot be booked: {reason}")
            }
            EngineError::CancellationLocked {
                occurrence_id,
                starts_in_ms,
                window_hours,
            } => write!(
                f,
                "cancellation locked: class {occurrence_id} starts in {}min, free cancellation closes {window_hours}h before start",
                starts_in_ms / 60_000
            ),
            EngineError::NoCreditsAvailable(client_id) => {
                write!(f, "no credits available for client {client_id}")
            }
            EngineError::InvalidTransition { id, from, action } => {
                write!(f, "cannot {action} {id}: status is {from}")
            }
            EngineError::InvalidSpan(span) => {
                write!(f, "invalid interval [{}, {})", span.start, span.end)
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::LockTimeout(row) => write!(f, "lock wait timeout on {row} row"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
