//! In-memory source of truth for connections and the engine resources they own.
//!
//! One ownership-indexed structure behind one lock: each connection record
//! holds the ids it owns, and a secondary index keyed by (kind, id) gives
//! global lookup. The publisher directory is that index filtered to
//! publishers, so it cannot drift from the connection records.
//!
//! The lock is only ever held for map updates. Callers must never hold it
//! (or anything derived from a guard) across an engine call.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::engine::{Direction, MediaKind, RtpParameters};
use crate::error::SignalError;
use crate::ids::{ConnectionId, PublisherId, ResourceKind, SubscriberId, TransportId};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRecord {
    pub id: TransportId,
    pub direction: Direction,
    /// Receive transports are created for one remote publisher.
    pub for_publisher: Option<PublisherId>,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherRecord {
    pub id: PublisherId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    /// Directory position, assigned on insert.
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberRecord {
    pub id: SubscriberId,
    pub transport_id: TransportId,
    pub publisher_id: PublisherId,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Transport(TransportRecord),
    Publisher(PublisherRecord),
    Subscriber(SubscriberRecord),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Transport(_) => ResourceKind::Transport,
            Self::Publisher(_) => ResourceKind::Publisher,
            Self::Subscriber(_) => ResourceKind::Subscriber,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Transport(t) => t.id.as_str(),
            Self::Publisher(p) => p.id.as_str(),
            Self::Subscriber(s) => s.id.as_str(),
        }
    }
}

/// A resource together with the connection that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub owner: ConnectionId,
    pub resource: Resource,
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub created_at: DateTime<Utc>,
    pub publishers: BTreeSet<PublisherId>,
    pub subscribers: BTreeSet<SubscriberId>,
    pub send_transports: BTreeSet<TransportId>,
    pub receive_transports: BTreeSet<TransportId>,
}

impl ConnectionRecord {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            publishers: BTreeSet::new(),
            subscribers: BTreeSet::new(),
            send_transports: BTreeSet::new(),
            receive_transports: BTreeSet::new(),
        }
    }
}

/// Snapshot of everything `remove_connection` took out of the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedResources {
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub transports: Vec<TransportId>,
    pub publishers: Vec<PublisherId>,
    pub subscribers: Vec<SubscriberId>,
    /// Subscribers owned by other connections that were bound to one of the
    /// removed publishers.
    pub orphaned_subscribers: Vec<(ConnectionId, SubscriberId)>,
}

impl RemovedResources {
    /// Own subscribers followed by orphaned ones.
    pub fn all_subscribers(&self) -> Vec<SubscriberId> {
        self.subscribers
            .iter()
            .cloned()
            .chain(self.orphaned_subscribers.iter().map(|(_, id)| id.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type ResourceKey = (ResourceKind, String);

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    resources: HashMap<ResourceKey, Entry>,
    next_seq: u64,
}

impl Inner {
    fn connection(&self, id: &ConnectionId) -> Result<&ConnectionRecord, SignalError> {
        self.connections
            .get(id)
            .ok_or_else(|| SignalError::UnknownConnection(id.clone()))
    }

    fn owned(
        &self,
        owner: &ConnectionId,
        kind: ResourceKind,
        id: &str,
    ) -> Result<&Resource, SignalError> {
        self.connection(owner)?;
        match self.resources.get(&(kind, id.to_string())) {
            Some(entry) if &entry.owner == owner => Ok(&entry.resource),
            _ => Err(SignalError::not_found(kind, id)),
        }
    }

    fn owned_mut(
        &mut self,
        owner: &ConnectionId,
        kind: ResourceKind,
        id: &str,
    ) -> Result<&mut Resource, SignalError> {
        self.connection(owner)?;
        match self.resources.get_mut(&(kind, id.to_string())) {
            Some(entry) if &entry.owner == owner => Ok(&mut entry.resource),
            _ => Err(SignalError::not_found(kind, id)),
        }
    }

    fn check_can_publish(
        &self,
        owner: &ConnectionId,
        transport_id: &TransportId,
        kind: MediaKind,
    ) -> Result<(), SignalError> {
        match self.owned(owner, ResourceKind::Transport, transport_id.as_str())? {
            Resource::Transport(t) if t.direction == Direction::Send => {}
            _ => {
                return Err(SignalError::invalid(format!(
                    "transport '{transport_id}' is not a send transport"
                )))
            }
        }

        let conn = self.connection(owner)?;
        let taken = conn.publishers.iter().any(|pid| {
            matches!(
                self.resources.get(&(ResourceKind::Publisher, pid.to_string())),
                Some(Entry { resource: Resource::Publisher(p), .. })
                    if &p.transport_id == transport_id && p.kind == kind
            )
        });
        if taken {
            return Err(SignalError::AlreadyPublishing {
                transport_id: transport_id.clone(),
                kind,
            });
        }
        Ok(())
    }

    fn remove_entry(&mut self, kind: ResourceKind, id: &str) -> Option<Entry> {
        self.resources.remove(&(kind, id.to_string()))
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &ConnectionId) -> Result<(), SignalError> {
        let mut inner = self.inner.write();
        if inner.connections.contains_key(id) {
            return Err(SignalError::DuplicateConnection(id.clone()));
        }
        inner
            .connections
            .insert(id.clone(), ConnectionRecord::new(id.clone()));
        Ok(())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().connections.contains_key(id)
    }

    pub fn connection(&self, id: &ConnectionId) -> Result<ConnectionRecord, SignalError> {
        self.inner.read().connection(id).cloned()
    }

    /// Attach a resource to a live connection.
    ///
    /// Publishers are checked against their transport (owned, send, no
    /// publisher of the same kind yet). Subscribers must still reference a
    /// published publisher.
    pub fn add_resource(&self, owner: &ConnectionId, resource: Resource) -> Result<(), SignalError> {
        let mut inner = self.inner.write();
        inner.connection(owner)?;

        let key = (resource.kind(), resource.id().to_string());
        if inner.resources.contains_key(&key) {
            return Err(SignalError::invalid(format!(
                "{} '{}' is already registered",
                key.0, key.1
            )));
        }

        let resource = match resource {
            Resource::Transport(t) => {
                let Some(conn) = inner.connections.get_mut(owner) else {
                    return Err(SignalError::UnknownConnection(owner.clone()));
                };
                match t.direction {
                    Direction::Send => conn.send_transports.insert(t.id.clone()),
                    Direction::Receive => conn.receive_transports.insert(t.id.clone()),
                };
                Resource::Transport(t)
            }
            Resource::Publisher(mut p) => {
                inner.check_can_publish(owner, &p.transport_id, p.kind)?;
                p.seq = inner.next_seq;
                inner.next_seq += 1;
                if let Some(conn) = inner.connections.get_mut(owner) {
                    conn.publishers.insert(p.id.clone());
                }
                Resource::Publisher(p)
            }
            Resource::Subscriber(s) => {
                if !inner
                    .resources
                    .contains_key(&(ResourceKind::Publisher, s.publisher_id.to_string()))
                {
                    return Err(SignalError::not_found(ResourceKind::Publisher, &s.publisher_id));
                }
                inner.owned(owner, ResourceKind::Transport, s.transport_id.as_str())?;
                if let Some(conn) = inner.connections.get_mut(owner) {
                    conn.subscribers.insert(s.id.clone());
                }
                Resource::Subscriber(s)
            }
        };

        inner.resources.insert(
            key,
            Entry {
                owner: owner.clone(),
                resource,
            },
        );
        Ok(())
    }

    /// Global lookup across all connections.
    pub fn lookup(&self, kind: ResourceKind, id: &str) -> Result<Entry, SignalError> {
        self.inner
            .read()
            .resources
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| SignalError::not_found(kind, id))
    }

    /// Run `f` while the resource is held registered. `None` if it is gone.
    pub fn with_resource<T>(
        &self,
        kind: ResourceKind,
        id: &str,
        f: impl FnOnce(&Entry) -> T,
    ) -> Option<T> {
        let inner = self.inner.read();
        inner.resources.get(&(kind, id.to_string())).map(f)
    }

    /// Lookup restricted to resources `owner` holds. Foreign ids look missing.
    pub fn lookup_owned(
        &self,
        owner: &ConnectionId,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Resource, SignalError> {
        self.inner.read().owned(owner, kind, id).cloned()
    }

    /// Pre-flight for `publish`, so a doomed request never reaches the engine.
    /// `add_resource` repeats the check atomically.
    pub fn check_can_publish(
        &self,
        owner: &ConnectionId,
        transport_id: &TransportId,
        kind: MediaKind,
    ) -> Result<(), SignalError> {
        self.inner.read().check_can_publish(owner, transport_id, kind)
    }

    /// Test-and-set of the transport's connected flag.
    pub fn mark_transport_connected(
        &self,
        owner: &ConnectionId,
        transport_id: &TransportId,
    ) -> Result<TransportRecord, SignalError> {
        let mut inner = self.inner.write();
        match inner.owned_mut(owner, ResourceKind::Transport, transport_id.as_str())? {
            Resource::Transport(t) if t.connected => {
                Err(SignalError::AlreadyConnected(transport_id.clone()))
            }
            Resource::Transport(t) => {
                t.connected = true;
                Ok(t.clone())
            }
            _ => Err(SignalError::not_found(ResourceKind::Transport, transport_id)),
        }
    }

    pub fn revert_transport_connected(&self, owner: &ConnectionId, transport_id: &TransportId) {
        let mut inner = self.inner.write();
        if let Ok(Resource::Transport(t)) =
            inner.owned_mut(owner, ResourceKind::Transport, transport_id.as_str())
        {
            t.connected = false;
        }
    }

    pub fn set_subscriber_paused(
        &self,
        owner: &ConnectionId,
        subscriber_id: &SubscriberId,
        paused: bool,
    ) -> Result<(), SignalError> {
        let mut inner = self.inner.write();
        match inner.owned_mut(owner, ResourceKind::Subscriber, subscriber_id.as_str())? {
            Resource::Subscriber(s) => {
                s.paused = paused;
                Ok(())
            }
            _ => Err(SignalError::not_found(ResourceKind::Subscriber, subscriber_id)),
        }
    }

    /// Publisher directory snapshot, oldest first.
    pub fn list_publishers(&self) -> Vec<PublisherRecord> {
        let inner = self.inner.read();
        let mut publishers: Vec<_> = inner
            .resources
            .values()
            .filter_map(|e| match &e.resource {
                Resource::Publisher(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        publishers.sort_by_key(|p| p.seq);
        publishers
    }

    /// Remove a connection and everything it owns, plus foreign subscribers
    /// bound to its publishers, in one step.
    pub fn remove_connection(&self, id: &ConnectionId) -> Result<RemovedResources, SignalError> {
        let mut inner = self.inner.write();
        let conn = inner
            .connections
            .remove(id)
            .ok_or_else(|| SignalError::UnknownConnection(id.clone()))?;

        for sid in &conn.subscribers {
            inner.remove_entry(ResourceKind::Subscriber, sid.as_str());
        }
        for pid in &conn.publishers {
            inner.remove_entry(ResourceKind::Publisher, pid.as_str());
        }
        for tid in conn.send_transports.iter().chain(&conn.receive_transports) {
            inner.remove_entry(ResourceKind::Transport, tid.as_str());
        }

        let orphaned: Vec<(ConnectionId, SubscriberId)> = inner
            .resources
            .values()
            .filter_map(|e| match &e.resource {
                Resource::Subscriber(s) if conn.publishers.contains(&s.publisher_id) => {
                    Some((e.owner.clone(), s.id.clone()))
                }
                _ => None,
            })
            .collect();
        for (owner, sid) in &orphaned {
            inner.remove_entry(ResourceKind::Subscriber, sid.as_str());
            if let Some(other) = inner.connections.get_mut(owner) {
                other.subscribers.remove(sid);
            }
        }

        Ok(RemovedResources {
            connection_id: conn.id,
            connected_at: conn.created_at,
            transports: conn
                .send_transports
                .into_iter()
                .chain(conn.receive_transports)
                .collect(),
            publishers: conn.publishers.into_iter().collect(),
            subscribers: conn.subscribers.into_iter().collect(),
            orphaned_subscribers: orphaned,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn publisher_count(&self) -> usize {
        self.inner
            .read()
            .resources
            .keys()
            .filter(|(kind, _)| *kind == ResourceKind::Publisher)
            .count()
    }
}
