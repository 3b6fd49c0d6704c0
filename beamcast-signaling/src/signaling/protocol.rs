//! The per-connection negotiation steps.
//!
//! Each step validates against the registry, calls the engine, then records
//! the outcome in the registry. The registry lock is never held across an
//! engine call, so the connection can be removed while a step is suspended.
//! When that happens the registry refuses the insert and whatever the engine
//! already created is released before the step fails.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::messages::{
    ConnectTransportRequest, ConsumeRequest, Consumed, CreateTransportRequest, PublishRequest,
    Published, PublisherSummary, Request, Response, ResumeSubscriberRequest, Resumed,
    TransportConnected, TransportCreated,
};
use crate::broadcast::BroadcastCoordinator;
use crate::engine::{Direction, MediaEngine};
use crate::error::SignalError;
use crate::ids::{ConnectionId, PublisherId, ResourceKind};
use crate::session::registry::{
    PublisherRecord, Resource, SessionRegistry, SubscriberRecord, TransportRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// Capabilities exchanged.
    Ready,
    /// At least one publisher created.
    Publishing,
}

/// Negotiation state of one connection. Owned by its command loop.
#[derive(Debug, Clone, Default)]
pub struct ProtocolState {
    pub phase: Phase,
    /// Publishers this connection has consumed.
    pub subscriptions: BTreeSet<PublisherId>,
}

#[derive(Clone)]
pub struct Signaling {
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn MediaEngine>,
    broadcast: BroadcastCoordinator,
}

impl Signaling {
    pub fn new(
        registry: Arc<SessionRegistry>,
        engine: Arc<dyn MediaEngine>,
        broadcast: BroadcastCoordinator,
    ) -> Self {
        Self {
            registry,
            engine,
            broadcast,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    pub fn broadcast(&self) -> &BroadcastCoordinator {
        &self.broadcast
    }

    pub async fn handle(
        &self,
        conn: &ConnectionId,
        state: &mut ProtocolState,
        request: Request,
    ) -> Result<Response, SignalError> {
        match request {
            Request::GetCapabilities => self.get_capabilities(conn, state).await,
            Request::ListPublishers => self.list_publishers(conn),
            Request::CreateTransport(req) => self.create_transport(conn, state, req).await,
            Request::ConnectTransport(req) => self.connect_transport(conn, req).await,
            Request::Publish(req) => self.publish(conn, state, req).await,
            Request::Consume(req) => self.consume(conn, state, req).await,
            Request::ResumeSubscriber(req) => self.resume_subscriber(conn, req).await,
        }
    }

    fn ensure_live(&self, conn: &ConnectionId) -> Result<(), SignalError> {
        if self.registry.contains(conn) {
            Ok(())
        } else {
            Err(SignalError::UnknownConnection(conn.clone()))
        }
    }

    /// Record an engine-created resource, or release it if the registry
    /// refuses it.
    async fn adopt(&self, conn: &ConnectionId, resource: Resource) -> Result<(), SignalError> {
        let kind = resource.kind();
        let id = resource.id().to_string();

        if let Err(err) = self.registry.add_resource(conn, resource) {
            debug!(connection_id = %conn, %kind, id = %id, error = %err, "releasing unadopted engine resource");
            if let Err(e) = self.engine.release(kind, &id).await {
                warn!(connection_id = %conn, %kind, id = %id, error = %e, "failed to release engine resource");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn get_capabilities(
        &self,
        conn: &ConnectionId,
        state: &mut ProtocolState,
    ) -> Result<Response, SignalError> {
        self.ensure_live(conn)?;
        let capabilities = self.engine.capabilities().await;
        if state.phase == Phase::Idle {
            state.phase = Phase::Ready;
        }
        Ok(Response::Capabilities(capabilities))
    }

    fn list_publishers(&self, conn: &ConnectionId) -> Result<Response, SignalError> {
        self.ensure_live(conn)?;
        let publishers = self
            .registry
            .list_publishers()
            .into_iter()
            .map(|p| PublisherSummary {
                publisher_id: p.id,
                kind: p.kind,
            })
            .collect();
        Ok(Response::Publishers(publishers))
    }

    async fn create_transport(
        &self,
        conn: &ConnectionId,
        state: &ProtocolState,
        req: CreateTransportRequest,
    ) -> Result<Response, SignalError> {
        if state.phase == Phase::Idle {
            return Err(SignalError::invalid(
                "get-capabilities must complete before create-transport",
            ));
        }
        self.ensure_live(conn)?;

        let for_publisher = match req.direction {
            Direction::Send => None,
            Direction::Receive => {
                let publisher_id = req.for_publisher_id.ok_or_else(|| {
                    SignalError::invalid("receive transports require forPublisherId")
                })?;
                self.registry
                    .lookup(ResourceKind::Publisher, publisher_id.as_str())?;
                Some(publisher_id)
            }
        };

        let params = self
            .engine
            .create_transport(req.direction)
            .await
            .map_err(|e| SignalError::EngineUnavailable(e.to_string()))?;

        self.adopt(
            conn,
            Resource::Transport(TransportRecord {
                id: params.id.clone(),
                direction: req.direction,
                for_publisher,
                connected: false,
            }),
        )
        .await?;

        debug!(connection_id = %conn, transport_id = %params.id, direction = %req.direction, "transport created");
        Ok(Response::TransportCreated(TransportCreated {
            transport_id: params.id.clone(),
            connection_params: params,
        }))
    }

    async fn connect_transport(
        &self,
        conn: &ConnectionId,
        req: ConnectTransportRequest,
    ) -> Result<Response, SignalError> {
        self.registry
            .mark_transport_connected(conn, &req.transport_id)?;

        if let Err(e) = self
            .engine
            .connect_transport(&req.transport_id, &req.handshake_params)
            .await
        {
            self.registry
                .revert_transport_connected(conn, &req.transport_id);
            return Err(e.into());
        }

        debug!(connection_id = %conn, transport_id = %req.transport_id, "transport connected");
        Ok(Response::TransportConnected(TransportConnected { connected: true }))
    }

    async fn publish(
        &self,
        conn: &ConnectionId,
        state: &mut ProtocolState,
        req: PublishRequest,
    ) -> Result<Response, SignalError> {
        self.registry
            .check_can_publish(conn, &req.transport_id, req.kind)?;

        let publisher_id = self
            .engine
            .create_publisher(&req.transport_id, req.kind, &req.media_params)
            .await?;

        self.adopt(
            conn,
            Resource::Publisher(PublisherRecord {
                id: publisher_id.clone(),
                transport_id: req.transport_id.clone(),
                kind: req.kind,
                rtp_parameters: req.media_params,
                seq: 0,
            }),
        )
        .await?;

        state.phase = Phase::Publishing;

        // Announce under the registry read lock so a concurrent cleanup's
        // `resources-removed` can only follow this announcement.
        let announced = self
            .registry
            .with_resource(ResourceKind::Publisher, publisher_id.as_str(), |_| {
                self.broadcast.announce_publisher(&publisher_id, req.kind)
            });
        if announced.is_none() {
            debug!(connection_id = %conn, publisher_id = %publisher_id, "publisher removed before it was announced");
        }

        info!(connection_id = %conn, publisher_id = %publisher_id, kind = %req.kind, "publisher created");
        Ok(Response::Published(Published { publisher_id }))
    }

    async fn consume(
        &self,
        conn: &ConnectionId,
        state: &mut ProtocolState,
        req: ConsumeRequest,
    ) -> Result<Response, SignalError> {
        match self
            .registry
            .lookup_owned(conn, ResourceKind::Transport, req.transport_id.as_str())?
        {
            Resource::Transport(t)
                if t.direction == Direction::Receive
                    && t.for_publisher.as_ref() == Some(&req.publisher_id) => {}
            _ => {
                return Err(SignalError::invalid(format!(
                    "transport '{}' is not a receive transport for publisher '{}'",
                    req.transport_id, req.publisher_id
                )))
            }
        }

        self.registry
            .lookup(ResourceKind::Publisher, req.publisher_id.as_str())?;

        if !self
            .engine
            .can_consume(&req.publisher_id, &req.capabilities)
            .await
        {
            // the publisher may have left while the engine was deciding
            self.registry
                .lookup(ResourceKind::Publisher, req.publisher_id.as_str())?;
            return Err(SignalError::IncompatibleCapabilities(
                req.publisher_id.to_string(),
            ));
        }

        let params = self
            .engine
            .create_subscriber(&req.transport_id, &req.publisher_id, &req.capabilities)
            .await?;

        self.adopt(
            conn,
            Resource::Subscriber(SubscriberRecord {
                id: params.id.clone(),
                transport_id: req.transport_id.clone(),
                publisher_id: req.publisher_id.clone(),
                kind: params.kind,
                paused: true,
            }),
        )
        .await?;

        state.subscriptions.insert(req.publisher_id.clone());

        debug!(connection_id = %conn, subscriber_id = %params.id, publisher_id = %req.publisher_id, "subscriber created paused");
        Ok(Response::Consumed(Consumed {
            subscriber_id: params.id,
            publisher_id: params.publisher_id,
            kind: params.kind,
            media_params: params.rtp_parameters,
        }))
    }

    async fn resume_subscriber(
        &self,
        conn: &ConnectionId,
        req: ResumeSubscriberRequest,
    ) -> Result<Response, SignalError> {
        self.registry
            .lookup_owned(conn, ResourceKind::Subscriber, req.subscriber_id.as_str())?;

        self.engine.resume_subscriber(&req.subscriber_id).await?;
        self.registry
            .set_subscriber_paused(conn, &req.subscriber_id, false)?;

        debug!(connection_id = %conn, subscriber_id = %req.subscriber_id, "subscriber resumed");
        Ok(Response::Resumed(Resumed { resumed: true }))
    }
}
