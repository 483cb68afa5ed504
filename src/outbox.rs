//! Post-commit side effects. Units of work queue items; a dispatcher task
//! delivers them once the commit is durable. Delivery failures are logged and
//! counted, never propagated back to the operation that caused them.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::warn;

use crate::engine::Engine;
use crate::notify::{NotificationDispatcher, Notification, NotifyHub};
use crate::observability::{OUTBOX_DELIVERED_TOTAL, OUTBOX_FAILED_TOTAL};
use crate::sync::{CalendarSync, LogOnlySync, SyncEntity, SyncOp, SyncRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxItem {
    Notify(Notification),
    Sync(SyncRequest),
}

impl OutboxItem {
    fn label(&self) -> &'static str {
        match self {
            OutboxItem::Notify(_) => "notify",
            OutboxItem::Sync(_) => "sync",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchError(pub String);

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dispatch failed: {}", self.0)
    }
}

impl std::error::Error for DispatchError {}

pub type OutboxReceiver = mpsc::UnboundedReceiver<OutboxItem>;

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboxItem>,
}

impl Outbox {
    pub fn channel() -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn enqueue(&self, items: Vec<OutboxItem>) {
        for item in items {
            let label = item.label();
            if self.tx.send(item).is_err() {
                warn!("outbox closed, dropping {label} item");
                metrics::counter!(OUTBOX_FAILED_TOTAL, "kind" => label).increment(1);
            }
        }
    }
}

/// The external collaborators side effects are delivered to.
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub sync: Arc<dyn CalendarSync>,
}

impl Collaborators {
    pub fn new(notifier: Arc<dyn NotificationDispatcher>, sync: Arc<dyn CalendarSync>) -> Self {
        Self { notifier, sync }
    }

    /// In-process hub for notifications, logging for calendar sync.
    pub fn local(hub: Arc<NotifyHub>) -> Self {
        Self {
            notifier: hub,
            sync: Arc::new(LogOnlySync),
        }
    }
}

/// Drain the outbox until every sender is gone. Holds only a weak engine
/// handle so it never keeps a tenant alive.
pub async fn run_dispatcher(mut rx: OutboxReceiver, engine: Weak<Engine>, collaborators: Collaborators) {
    while let Some(item) = rx.recv().await {
        deliver(&item, &engine, &collaborators).await;
    }
}

async fn deliver(item: &OutboxItem, engine: &Weak<Engine>, collaborators: &Collaborators) {
    let label = item.label();
    let result = match item {
        OutboxItem::Notify(n) => collaborators.notifier.dispatch(n).await,
        OutboxItem::Sync(req) => match collaborators.sync.schedule_sync(req).await {
            Ok(Some(external_ref)) => {
                record_ref(req, external_ref, engine).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        },
    };
    match result {
        Ok(()) => metrics::counter!(OUTBOX_DELIVERED_TOTAL, "kind" => label).increment(1),
        Err(e) => {
            match item {
                // Dropped notifications are logged whole so they can be resent by hand.
                OutboxItem::Notify(n) => warn!(payload = %n.payload(), "{label} delivery failed: {e}"),
                OutboxItem::Sync(_) => warn!("{label} delivery failed: {e}"),
            }
            metrics::counter!(OUTBOX_FAILED_TOTAL, "kind" => label).increment(1);
        }
    }
}

async fn record_ref(req: &SyncRequest, external_ref: String, engine: &Weak<Engine>) {
    if req.op != SyncOp::Upsert || req.entity != SyncEntity::Session {
        return;
    }
    let Some(engine) = engine.upgrade() else { return };
    if let Err(e) = engine.record_external_ref(req.entity_id, external_ref).await {
        warn!("storing external ref for session {}: {e}", req.entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    struct Failing(AtomicUsize);

    #[async_trait]
    impl NotificationDispatcher for Failing {
        async fn dispatch(&self, _: &Notification) -> Result<(), DispatchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_delivery_continues() {
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let collaborators = Collaborators::new(failing.clone(), Arc::new(LogOnlySync));
        let (outbox, rx) = Outbox::channel();
        let n = Notification::Waitlisted {
            occurrence_id: Ulid::new(),
            client_id: Ulid::new(),
            registration_id: Ulid::new(),
        };
        outbox.enqueue(vec![
            OutboxItem::Notify(n.clone()),
            OutboxItem::Sync(SyncRequest::delete(SyncEntity::Session, Ulid::new())),
            OutboxItem::Notify(n),
        ]);
        drop(outbox);
        run_dispatcher(rx, Weak::new(), collaborators).await;
        assert_eq!(failing.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn enqueue_after_close_does_not_panic() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        outbox.enqueue(vec![OutboxItem::Sync(SyncRequest::upsert(
            SyncEntity::ClassOccurrence,
            Ulid::new(),
        ))]);
    }
}
