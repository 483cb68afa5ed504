use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidSpan(*span));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > crate::limits::MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// The entry that blocks a candidate interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDetail {
    pub conflict_type: ResourceKind,
    pub resource_id: Ulid,
    pub entity_id: Ulid,
    pub entity_kind: EntryKind,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCheck {
    pub conflict: bool,
    pub details: Option<ConflictDetail>,
}

impl From<Option<ConflictDetail>> for ConflictCheck {
    fn from(details: Option<ConflictDetail>) -> Self {
        Self {
            conflict: details.is_some(),
            details,
        }
    }
}

/// First (earliest-starting) entry on the calendar that holds time inside
/// `span`, skipping `exclude`. Sessions and class occurrences live in the same
/// sorted sequence, so one scan covers both.
pub(crate) fn find_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<ConflictDetail> {
    rs.overlapping(span)
        .filter(|e| e.status.holds_time())
        .find(|e| Some(e.id) != exclude)
        .map(|e| ConflictDetail {
            conflict_type: rs.kind,
            resource_id: rs.id,
            entity_id: e.id,
            entity_kind: e.kind,
            start: e.span.start,
            end: e.span.end,
        })
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, exclude) {
        Some(detail) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL, "resource" => rs.kind.as_str())
                .increment(1);
            Err(EngineError::ResourceConflict(detail))
        }
        None => Ok(()),
    }
}
