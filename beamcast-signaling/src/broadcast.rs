//! Fan-out of session-wide notifications.
//!
//! A single `tokio::sync::broadcast` channel carries every notification.
//! Each connection owns one receiver and a forwarding task that pushes what
//! it receives onto that connection's socket. Delivery is best-effort: a
//! receiver that falls behind loses the oldest notifications and the client
//! repairs its view with `list-publishers`.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::MediaKind;
use crate::ids::{ConnectionId, PublisherId, SubscriberId};
use crate::session::registry::RemovedResources;

// ─── Notifications ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherAvailable {
    pub publisher_id: PublisherId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesRemoved {
    pub connection_id: ConnectionId,
    pub removed_publisher_ids: Vec<PublisherId>,
    pub removed_subscriber_ids: Vec<SubscriberId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Notification {
    PublisherAvailable(PublisherAvailable),
    ResourcesRemoved(ResourcesRemoved),
}

impl Notification {
    /// Socket.IO event name the notification is pushed under.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::PublisherAvailable(_) => "publisher-available",
            Self::ResourcesRemoved(_) => "resources-removed",
        }
    }
}

// ─── Coordinator ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BroadcastCoordinator {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastCoordinator {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Sent to every connection, the publisher's own included; clients
    /// ignore their own publisher ids.
    pub fn announce_publisher(&self, publisher_id: &PublisherId, kind: MediaKind) -> usize {
        self.publish(Notification::PublisherAvailable(PublisherAvailable {
            publisher_id: publisher_id.clone(),
            kind,
        }))
    }

    pub fn announce_removal(&self, removed: &RemovedResources) -> usize {
        self.publish(Notification::ResourcesRemoved(ResourcesRemoved {
            connection_id: removed.connection_id.clone(),
            removed_publisher_ids: removed.publishers.clone(),
            removed_subscriber_ids: removed.all_subscribers(),
        }))
    }

    /// Returns the number of receivers reached. Zero listeners is not an error.
    fn publish(&self, notification: Notification) -> usize {
        let event = notification.event_name();
        let n = self.tx.send(notification).unwrap_or(0);
        debug!(event, receivers = n, "notification broadcast");
        n
    }
}

/// Forward notifications from `rx` to `deliver` until `cancel` fires or the
/// coordinator is dropped.
pub fn spawn_forwarder<F>(
    mut rx: broadcast::Receiver<Notification>,
    cancel: CancellationToken,
    connection_id: ConnectionId,
    deliver: F,
) -> JoinHandle<()>
where
    F: Fn(&Notification) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(notification) => deliver(&notification),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(connection_id = %connection_id, skipped = n, "notification receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!(connection_id = %connection_id, "notification forwarder stopped");
    })
}
