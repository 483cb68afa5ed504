use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::PaymentStatus;
use crate::outbox::DispatchError;

const CHANNEL_CAPACITY: usize = 256;

/// Client-facing messages produced by booking transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BookingConfirmed {
        occurrence_id: Ulid,
        client_id: Ulid,
        registration_id: Ulid,
        payment_status: PaymentStatus,
    },
    Waitlisted {
        occurrence_id: Ulid,
        client_id: Ulid,
        registration_id: Ulid,
    },
    BookingCancelled {
        occurrence_id: Ulid,
        client_id: Ulid,
        registration_id: Ulid,
        refunded_credits: u32,
    },
    WaitlistPromoted {
        occurrence_id: Ulid,
        client_id: Ulid,
        registration_id: Ulid,
        payment_status: PaymentStatus,
    },
    ClassCancelled {
        occurrence_id: Ulid,
        client_id: Ulid,
        registration_id: Ulid,
        refunded_credits: u32,
    },
}

impl Notification {
    pub fn client_id(&self) -> Ulid {
        match self {
            Notification::BookingConfirmed { client_id, .. }
            | Notification::Waitlisted { client_id, .. }
            | Notification::BookingCancelled { client_id, .. }
            | Notification::WaitlistPromoted { client_id, .. }
            | Notification::ClassCancelled { client_id, .. } => *client_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::BookingConfirmed { .. } => "booking_confirmed",
            Notification::Waitlisted { .. } => "waitlisted",
            Notification::BookingCancelled { .. } => "booking_cancelled",
            Notification::WaitlistPromoted { .. } => "waitlist_promoted",
            Notification::ClassCancelled { .. } => "class_cancelled",
        }
    }

    /// JSON form, used when a failed delivery is logged.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Delivers notifications somewhere. Called after commit, never under a row lock.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> Result<(), DispatchError>;
}

/// In-process broadcast per client, plus a firehose of everything.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one client's notifications. Creates the channel if needed
    /// and drops channels whose listeners have all gone.
    pub fn subscribe(&self, client_id: Ulid) -> broadcast::Receiver<Notification> {
        if !self.channels.contains_key(&client_id) {
            self.prune();
        }
        let sender = self
            .channels
            .entry(client_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening. A client channel found without
    /// receivers is dropped.
    pub fn send(&self, notification: &Notification) {
        let client_id = notification.client_id();
        let orphaned = self
            .channels
            .get(&client_id)
            .is_some_and(|sender| sender.send(notification.clone()).is_err());
        if orphaned {
            self.channels
                .remove_if(&client_id, |_, sender| sender.receiver_count() == 0);
        }
        let _ = self.all.send(notification.clone());
    }

    /// Drop every client channel with no receivers left.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl NotificationDispatcher for NotifyHub {
    async fn dispatch(&self, notification: &Notification) -> Result<(), DispatchError> {
        self.send(notification);
        Ok(())
    }
}
