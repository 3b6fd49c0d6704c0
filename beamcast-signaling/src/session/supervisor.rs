//! Connection lifecycle: accept, per-connection command loop, cleanup.
//!
//! Every connection gets one command loop task fed by an unbounded queue.
//! Socket events are enqueued synchronously in arrival order, so steps of
//! the same connection never interleave while different connections run
//! concurrently. Disconnect cancels the loop; a step already running is
//! allowed to finish and queued commands are dropped unanswered.

use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastCoordinator, Notification};
use crate::error::SignalError;
use crate::ids::{ConnectionId, ResourceKind};
use crate::signaling::{ProtocolState, Request, Response, Signaling};

pub type Reply = Result<Response, SignalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Disconnected,
}

struct Command {
    request: Request,
    reply: oneshot::Sender<Reply>,
}

/// Cheap handle on one accepted connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    broadcast: BroadcastCoordinator,
    state: Arc<Mutex<ConnectionState>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Enqueue a request. Never blocks; call order is processing order.
    ///
    /// The receiver errors if the connection is torn down before the
    /// request is processed.
    pub fn submit(&self, request: Request) -> oneshot::Receiver<Reply> {
        let (reply, rx) = oneshot::channel();
        // a closed queue drops `reply`, which the caller observes on `rx`
        let _ = self.commands.send(Command { request, reply });
        rx
    }

    pub async fn request(&self, request: Request) -> Reply {
        self.submit(request)
            .await
            .unwrap_or_else(|_| Err(SignalError::UnknownConnection(self.id.clone())))
    }

    /// Fresh receiver on the notification bus.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.broadcast.subscribe()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    signaling: Signaling,
}

impl ConnectionSupervisor {
    pub fn new(signaling: Signaling) -> Self {
        Self { signaling }
    }

    pub fn signaling(&self) -> &Signaling {
        &self.signaling
    }

    /// Register the connection and start its command loop.
    pub fn accept(&self, id: ConnectionId) -> Result<ConnectionHandle, SignalError> {
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        self.signaling.registry().register(&id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_commands(
            self.signaling.clone(),
            id.clone(),
            rx,
            cancel.clone(),
        ));

        *state.lock() = ConnectionState::Active;
        gauge!("signaling_connections_active")
            .set(self.signaling.registry().connection_count() as f64);
        info!(connection_id = %id, "connection accepted");

        Ok(ConnectionHandle {
            id,
            commands: tx,
            cancel,
            broadcast: self.signaling.broadcast().clone(),
            state,
        })
    }

    /// Tear the connection down. Safe to call more than once and at any
    /// point of the negotiation.
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        {
            let mut state = handle.state.lock();
            if *state == ConnectionState::Disconnected {
                debug!(connection_id = %handle.id, "already disconnected");
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        handle.cancel.cancel();
        self.cleanup(&handle.id).await;
    }

    async fn cleanup(&self, id: &ConnectionId) {
        let removed = match self.signaling.registry().remove_connection(id) {
            Ok(removed) => removed,
            Err(e) => {
                debug!(connection_id = %id, error = %e, "nothing to clean up");
                return;
            }
        };

        // subscribers first, then what they hang off
        let releases = removed
            .all_subscribers()
            .into_iter()
            .map(|s| (ResourceKind::Subscriber, s.to_string()))
            .chain(
                removed
                    .publishers
                    .iter()
                    .map(|p| (ResourceKind::Publisher, p.to_string())),
            )
            .chain(
                removed
                    .transports
                    .iter()
                    .map(|t| (ResourceKind::Transport, t.to_string())),
            );

        for (kind, resource_id) in releases {
            if let Err(e) = self.signaling.engine().release(kind, &resource_id).await {
                warn!(connection_id = %id, %kind, id = %resource_id, error = %e, "engine release failed");
            }
        }

        self.signaling.broadcast().announce_removal(&removed);

        let registry = self.signaling.registry();
        gauge!("signaling_connections_active").set(registry.connection_count() as f64);
        gauge!("signaling_publishers_active").set(registry.publisher_count() as f64);

        info!(
            connection_id = %id,
            publishers = removed.publishers.len(),
            subscribers = removed.subscribers.len(),
            orphaned = removed.orphaned_subscribers.len(),
            transports = removed.transports.len(),
            session_secs = (chrono::Utc::now() - removed.connected_at).num_seconds(),
            "connection cleaned up"
        );
    }
}

async fn run_commands(
    signaling: Signaling,
    id: ConnectionId,
    mut rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let mut state = ProtocolState::default();

    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let event = command.request.event_name();
        let result = signaling.handle(&id, &mut state, command.request).await;

        match &result {
            Ok(_) => {
                counter!("signaling_requests_total", "event" => event, "outcome" => "ok")
                    .increment(1);
            }
            Err(e) => {
                counter!("signaling_requests_total", "event" => event, "outcome" => e.label())
                    .increment(1);
                if matches!(e, SignalError::UnknownConnection(_)) {
                    debug!(connection_id = %id, event, "request outlived its connection");
                } else {
                    warn!(connection_id = %id, event, code = e.code().code(), error = %e, "request failed");
                }
            }
        }
        if event == "publish" {
            gauge!("signaling_publishers_active")
                .set(signaling.registry().publisher_count() as f64);
        }

        // the requester may be gone already
        let _ = command.reply.send(result);
    }

    debug!(
        connection_id = %id,
        phase = ?state.phase,
        subscriptions = state.subscriptions.len(),
        "command loop stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use crate::engine::{
        Direction, DtlsParameters, EngineError, EngineSettings, LocalEngine, MediaEngine,
        MediaKind, RtpCapabilities, RtpParameters, SubscriberParams, TransportParams,
    };
    use crate::ids::{PublisherId, SubscriberId, TransportId};
    use crate::session::registry::{Resource, SessionRegistry};
    use crate::signaling::messages::{
        ConnectTransportRequest, ConsumeRequest, CreateTransportRequest, PublishRequest,
        ResumeSubscriberRequest,
    };

    fn supervisor_with(engine: Arc<dyn MediaEngine>) -> ConnectionSupervisor {
        ConnectionSupervisor::new(Signaling::new(
            Arc::new(SessionRegistry::new()),
            engine,
            BroadcastCoordinator::new(64),
        ))
    }

    fn setup() -> (ConnectionSupervisor, Arc<LocalEngine>) {
        let engine = Arc::new(LocalEngine::new(EngineSettings::default()));
        (supervisor_with(engine.clone()), engine)
    }

    fn vp8() -> RtpParameters {
        serde_json::from_value(json!({
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }]
        }))
        .unwrap()
    }

    fn caps(mime: &str) -> RtpCapabilities {
        serde_json::from_value(json!({
            "codecs": [{ "kind": "video", "mimeType": mime, "clockRate": 90000 }]
        }))
        .unwrap()
    }

    async fn ready(h: &ConnectionHandle) {
        assert!(matches!(
            h.request(Request::GetCapabilities).await,
            Ok(Response::Capabilities(_))
        ));
    }

    async fn create_transport(
        h: &ConnectionHandle,
        direction: Direction,
        for_publisher_id: Option<PublisherId>,
    ) -> Result<TransportParams, SignalError> {
        let req = Request::CreateTransport(CreateTransportRequest {
            direction,
            for_publisher_id,
        });
        match h.request(req).await? {
            Response::TransportCreated(t) => Ok(t.connection_params),
            other => panic!("unexpected response {other:?}"),
        }
    }

    async fn connect(h: &ConnectionHandle, params: &TransportParams) -> Reply {
        h.request(Request::ConnectTransport(ConnectTransportRequest {
            transport_id: params.id.clone(),
            handshake_params: params.dtls_parameters.clone(),
        }))
        .await
    }

    async fn publish(h: &ConnectionHandle, transport_id: &TransportId) -> Result<PublisherId, SignalError> {
        let req = Request::Publish(PublishRequest {
            transport_id: transport_id.clone(),
            kind: MediaKind::Video,
            media_params: vp8(),
        });
        match h.request(req).await? {
            Response::Published(p) => Ok(p.publisher_id),
            other => panic!("unexpected response {other:?}"),
        }
    }

    /// Capabilities, connected send transport, one VP8 publisher.
    async fn start_publishing(h: &ConnectionHandle) -> (TransportId, PublisherId) {
        ready(h).await;
        let t = create_transport(h, Direction::Send, None).await.unwrap();
        connect(h, &t).await.unwrap();
        let p = publish(h, &t.id).await.unwrap();
        (t.id, p)
    }

    async fn consume(
        h: &ConnectionHandle,
        transport_id: &TransportId,
        publisher_id: &PublisherId,
        mime: &str,
    ) -> Result<SubscriberId, SignalError> {
        let req = Request::Consume(ConsumeRequest {
            transport_id: transport_id.clone(),
            publisher_id: publisher_id.clone(),
            capabilities: caps(mime),
        });
        match h.request(req).await? {
            Response::Consumed(c) => Ok(c.subscriber_id),
            other => panic!("unexpected response {other:?}"),
        }
    }

    async fn resume(h: &ConnectionHandle, subscriber_id: &SubscriberId) -> Reply {
        h.request(Request::ResumeSubscriber(ResumeSubscriberRequest {
            subscriber_id: subscriber_id.clone(),
        }))
        .await
    }

    async fn list(h: &ConnectionHandle) -> Vec<PublisherId> {
        match h.request(Request::ListPublishers).await.unwrap() {
            Response::Publishers(list) => list.into_iter().map(|p| p.publisher_id).collect(),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_consume_disconnect_scenario() {
        let (supervisor, engine) = setup();
        let a = supervisor.accept(ConnectionId::new("A")).unwrap();
        let b = supervisor.accept(ConnectionId::new("B")).unwrap();
        let mut b_events = b.notifications();

        let (ta, p1) = start_publishing(&a).await;

        match b_events.recv().await.unwrap() {
            Notification::PublisherAvailable(n) => {
                assert_eq!(n.publisher_id, p1);
                assert_eq!(n.kind, MediaKind::Video);
            }
            other => panic!("unexpected notification {other:?}"),
        }

        ready(&b).await;
        let recv = create_transport(&b, Direction::Receive, Some(p1.clone()))
            .await
            .unwrap();
        connect(&b, &recv).await.unwrap();
        let s1 = consume(&b, &recv.id, &p1, "video/VP8").await.unwrap();
        resume(&b, &s1).await.unwrap();
        assert_eq!(engine.is_paused(&s1), Some(false));

        supervisor.disconnect(&a).await;

        match b_events.recv().await.unwrap() {
            Notification::ResourcesRemoved(n) => {
                assert_eq!(n.connection_id, ConnectionId::new("A"));
                assert_eq!(n.removed_publisher_ids, vec![p1.clone()]);
                assert_eq!(n.removed_subscriber_ids, vec![s1.clone()]);
            }
            other => panic!("unexpected notification {other:?}"),
        }

        assert!(list(&b).await.is_empty());
        let registry = supervisor.signaling().registry();
        assert!(registry.lookup(ResourceKind::Publisher, p1.as_str()).is_err());
        assert!(registry.lookup(ResourceKind::Transport, ta.as_str()).is_err());
        assert!(registry.lookup(ResourceKind::Subscriber, s1.as_str()).is_err());
        assert!(!registry.contains(a.id()));
        assert_eq!(a.state(), ConnectionState::Disconnected);
        // only B's receive transport survives in the engine
        assert_eq!(engine.resource_counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let (supervisor, _) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        ready(&a).await;
        let t = create_transport(&a, Direction::Send, None).await.unwrap();

        connect(&a, &t).await.unwrap();
        assert_eq!(
            connect(&a, &t).await,
            Err(SignalError::AlreadyConnected(t.id.clone()))
        );
    }

    #[tokio::test]
    async fn rejected_handshake_can_be_retried() {
        let (supervisor, _) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        ready(&a).await;
        let t = create_transport(&a, Direction::Send, None).await.unwrap();

        let bad = a
            .request(Request::ConnectTransport(ConnectTransportRequest {
                transport_id: t.id.clone(),
                handshake_params: DtlsParameters {
                    role: None,
                    fingerprints: vec![],
                },
            }))
            .await;
        assert!(matches!(bad, Err(SignalError::InvalidRequest(_))));
        assert!(connect(&a, &t).await.is_ok());
    }

    #[tokio::test]
    async fn consuming_a_departed_publisher_is_not_found() {
        let (supervisor, _) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let b = supervisor.accept(ConnectionId::new("b")).unwrap();

        let (_, p1) = start_publishing(&a).await;
        ready(&b).await;
        let recv = create_transport(&b, Direction::Receive, Some(p1.clone()))
            .await
            .unwrap();

        supervisor.disconnect(&a).await;

        assert_eq!(
            consume(&b, &recv.id, &p1, "video/VP8").await,
            Err(SignalError::not_found(ResourceKind::Publisher, &p1))
        );
        assert!(matches!(
            create_transport(&b, Direction::Receive, Some(p1)).await,
            Err(SignalError::ResourceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_transports_stay_with_their_connection() {
        let (supervisor, _) = setup();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let handle = supervisor.accept(ConnectionId::new(format!("c{i}"))).unwrap();
            tasks.push(tokio::spawn(async move {
                ready(&handle).await;
                let t = create_transport(&handle, Direction::Send, None).await.unwrap();
                (handle.id().clone(), t.id)
            }));
        }

        let mut ids = HashSet::new();
        for task in tasks {
            let (conn, transport_id) = task.await.unwrap();
            let entry = supervisor
                .signaling()
                .registry()
                .lookup(ResourceKind::Transport, transport_id.as_str())
                .unwrap();
            assert_eq!(entry.owner, conn);
            assert!(ids.insert(transport_id));
        }
        assert_eq!(ids.len(), 16);
    }

    #[tokio::test]
    async fn subscriber_is_paused_until_resumed() {
        let (supervisor, engine) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let b = supervisor.accept(ConnectionId::new("b")).unwrap();

        let (_, p1) = start_publishing(&a).await;
        ready(&b).await;
        let recv = create_transport(&b, Direction::Receive, Some(p1.clone()))
            .await
            .unwrap();
        let s1 = consume(&b, &recv.id, &p1, "video/vp8").await.unwrap();

        let registry: &SessionRegistry = supervisor.signaling().registry();
        let paused = |registry: &SessionRegistry| match registry
            .lookup(ResourceKind::Subscriber, s1.as_str())
            .unwrap()
            .resource
        {
            Resource::Subscriber(s) => s.paused,
            other => panic!("unexpected resource {other:?}"),
        };

        assert_eq!(engine.is_paused(&s1), Some(true));
        assert!(paused(registry));

        assert!(matches!(
            resume(&b, &s1).await,
            Ok(Response::Resumed(r)) if r.resumed
        ));
        assert_eq!(engine.is_paused(&s1), Some(false));
        assert!(!paused(registry));
    }

    #[tokio::test]
    async fn foreign_subscriber_cannot_be_resumed() {
        let (supervisor, _) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let b = supervisor.accept(ConnectionId::new("b")).unwrap();

        let (_, p1) = start_publishing(&a).await;
        ready(&b).await;
        let recv = create_transport(&b, Direction::Receive, Some(p1.clone()))
            .await
            .unwrap();
        let s1 = consume(&b, &recv.id, &p1, "video/VP8").await.unwrap();

        assert!(matches!(
            resume(&a, &s1).await,
            Err(SignalError::ResourceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_publishers_tracks_live_owners() {
        let (supervisor, _) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let b = supervisor.accept(ConnectionId::new("b")).unwrap();
        let c = supervisor.accept(ConnectionId::new("c")).unwrap();

        let (_, pa) = start_publishing(&a).await;
        let (_, pb) = start_publishing(&b).await;
        assert_eq!(list(&c).await, vec![pa, pb.clone()]);

        supervisor.disconnect(&a).await;
        assert_eq!(list(&c).await, vec![pb]);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (supervisor, _) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let mut events = supervisor
            .accept(ConnectionId::new("watcher"))
            .unwrap()
            .notifications();
        start_publishing(&a).await;
        // drain publisher-available
        events.recv().await.unwrap();

        supervisor.disconnect(&a).await;
        supervisor.disconnect(&a).await;
        supervisor.cleanup(a.id()).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            Notification::ResourcesRemoved(_)
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(
            a.request(Request::ListPublishers).await,
            Err(SignalError::UnknownConnection(a.id().clone()))
        );
    }

    #[tokio::test]
    async fn second_publisher_of_same_kind_is_rejected() {
        let (supervisor, engine) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let (t, _) = start_publishing(&a).await;

        assert_eq!(
            publish(&a, &t).await,
            Err(SignalError::AlreadyPublishing {
                transport_id: t.clone(),
                kind: MediaKind::Video
            })
        );
        assert_eq!(engine.resource_counts(), (1, 1, 0));
    }

    #[tokio::test]
    async fn transport_before_capabilities_is_invalid() {
        let (supervisor, _) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        assert!(matches!(
            create_transport(&a, Direction::Send, None).await,
            Err(SignalError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn receive_transport_is_bound_to_one_publisher() {
        let (supervisor, _) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let b = supervisor.accept(ConnectionId::new("b")).unwrap();
        let c = supervisor.accept(ConnectionId::new("c")).unwrap();
        let (_, pa) = start_publishing(&a).await;
        let (_, pb) = start_publishing(&b).await;

        ready(&c).await;
        assert!(matches!(
            create_transport(&c, Direction::Receive, None).await,
            Err(SignalError::InvalidRequest(_))
        ));
        let recv = create_transport(&c, Direction::Receive, Some(pa))
            .await
            .unwrap();
        assert!(matches!(
            consume(&c, &recv.id, &pb, "video/VP8").await,
            Err(SignalError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn incompatible_capabilities_get_an_explicit_error() {
        let (supervisor, engine) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let b = supervisor.accept(ConnectionId::new("b")).unwrap();
        let (_, p1) = start_publishing(&a).await;

        ready(&b).await;
        let recv = create_transport(&b, Direction::Receive, Some(p1.clone()))
            .await
            .unwrap();
        let err = consume(&b, &recv.id, &p1, "video/H264").await.unwrap_err();
        assert!(matches!(err, SignalError::IncompatibleCapabilities(_)));
        assert_eq!(err.payload().code, "E3006");
        assert_eq!(engine.resource_counts().2, 0);
    }

    #[tokio::test]
    async fn orphaned_subscriber_is_removed_with_its_publisher() {
        let (supervisor, engine) = setup();
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let b = supervisor.accept(ConnectionId::new("b")).unwrap();
        let (_, p1) = start_publishing(&a).await;

        ready(&b).await;
        let recv = create_transport(&b, Direction::Receive, Some(p1.clone()))
            .await
            .unwrap();
        let s1 = consume(&b, &recv.id, &p1, "video/VP8").await.unwrap();

        supervisor.disconnect(&a).await;

        assert_eq!(engine.is_paused(&s1), None);
        assert_eq!(
            resume(&b, &s1).await,
            Err(SignalError::not_found(ResourceKind::Subscriber, &s1))
        );
        let record = supervisor.signaling().registry().connection(b.id()).unwrap();
        assert!(record.subscribers.is_empty());
        assert_eq!(record.receive_transports.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_accept_is_rejected() {
        let (supervisor, _) = setup();
        let _a = supervisor.accept(ConnectionId::new("a")).unwrap();
        assert!(matches!(
            supervisor.accept(ConnectionId::new("a")),
            Err(SignalError::DuplicateConnection(_))
        ));
    }

    // ─── Engines with scripted behaviour ────────────────────────────────────

    struct FailingEngine;

    #[async_trait]
    impl MediaEngine for FailingEngine {
        async fn capabilities(&self) -> RtpCapabilities {
            RtpCapabilities::default()
        }

        async fn create_transport(&self, _: Direction) -> Result<TransportParams, EngineError> {
            Err(EngineError::Unavailable("worker exited".into()))
        }

        async fn connect_transport(&self, id: &TransportId, _: &DtlsParameters) -> Result<(), EngineError> {
            Err(EngineError::unknown(ResourceKind::Transport, id))
        }

        async fn create_publisher(
            &self,
            _: &TransportId,
            _: MediaKind,
            _: &RtpParameters,
        ) -> Result<PublisherId, EngineError> {
            Err(EngineError::Unavailable("worker exited".into()))
        }

        async fn can_consume(&self, _: &PublisherId, _: &RtpCapabilities) -> bool {
            false
        }

        async fn create_subscriber(
            &self,
            _: &TransportId,
            _: &PublisherId,
            _: &RtpCapabilities,
        ) -> Result<SubscriberParams, EngineError> {
            Err(EngineError::Unavailable("worker exited".into()))
        }

        async fn resume_subscriber(&self, _: &SubscriberId) -> Result<(), EngineError> {
            Err(EngineError::Unavailable("worker exited".into()))
        }

        async fn release(&self, kind: ResourceKind, id: &str) -> Result<(), EngineError> {
            Err(EngineError::unknown(kind, id))
        }
    }

    #[tokio::test]
    async fn engine_failure_is_reported_as_unavailable() {
        let supervisor = supervisor_with(Arc::new(FailingEngine));
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        ready(&a).await;

        let err = create_transport(&a, Direction::Send, None).await.unwrap_err();
        assert!(matches!(err, SignalError::EngineUnavailable(_)));
        assert!(supervisor.signaling().registry().connection(a.id()).unwrap().send_transports.is_empty());

        // cleanup still completes when every release fails
        supervisor.disconnect(&a).await;
        assert_eq!(supervisor.signaling().registry().connection_count(), 0);
    }

    #[derive(PartialEq)]
    enum Gated {
        CreateTransport,
        CanConsume,
    }

    /// Parks one engine call until the test opens the gate.
    struct GatedEngine {
        inner: LocalEngine,
        gated: Gated,
        entered: Notify,
        gate: Notify,
    }

    impl GatedEngine {
        fn new(gated: Gated) -> Self {
            Self {
                inner: LocalEngine::new(EngineSettings::default()),
                gated,
                entered: Notify::new(),
                gate: Notify::new(),
            }
        }

        async fn pass(&self, step: Gated) {
            if step == self.gated {
                self.entered.notify_one();
                self.gate.notified().await;
            }
        }
    }

    #[async_trait]
    impl MediaEngine for GatedEngine {
        async fn capabilities(&self) -> RtpCapabilities {
            self.inner.capabilities().await
        }

        async fn create_transport(&self, direction: Direction) -> Result<TransportParams, EngineError> {
            self.pass(Gated::CreateTransport).await;
            self.inner.create_transport(direction).await
        }

        async fn connect_transport(&self, id: &TransportId, dtls: &DtlsParameters) -> Result<(), EngineError> {
            self.inner.connect_transport(id, dtls).await
        }

        async fn create_publisher(
            &self,
            transport_id: &TransportId,
            kind: MediaKind,
            params: &RtpParameters,
        ) -> Result<PublisherId, EngineError> {
            self.inner.create_publisher(transport_id, kind, params).await
        }

        async fn can_consume(&self, publisher_id: &PublisherId, caps: &RtpCapabilities) -> bool {
            self.pass(Gated::CanConsume).await;
            self.inner.can_consume(publisher_id, caps).await
        }

        async fn create_subscriber(
            &self,
            transport_id: &TransportId,
            publisher_id: &PublisherId,
            caps: &RtpCapabilities,
        ) -> Result<SubscriberParams, EngineError> {
            self.inner.create_subscriber(transport_id, publisher_id, caps).await
        }

        async fn resume_subscriber(&self, id: &SubscriberId) -> Result<(), EngineError> {
            self.inner.resume_subscriber(id).await
        }

        async fn release(&self, kind: ResourceKind, id: &str) -> Result<(), EngineError> {
            self.inner.release(kind, id).await
        }
    }

    #[tokio::test]
    async fn disconnect_mid_step_releases_late_engine_resources() {
        let engine = Arc::new(GatedEngine::new(Gated::CreateTransport));
        let supervisor = supervisor_with(engine.clone());
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        ready(&a).await;

        let pending = a.submit(Request::CreateTransport(CreateTransportRequest {
            direction: Direction::Send,
            for_publisher_id: None,
        }));
        engine.entered.notified().await;

        supervisor.disconnect(&a).await;
        engine.gate.notify_one();

        assert_eq!(
            pending.await.unwrap(),
            Err(SignalError::UnknownConnection(a.id().clone()))
        );
        assert_eq!(engine.inner.resource_counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn publisher_leaving_during_compatibility_check_is_not_found() {
        let engine = Arc::new(GatedEngine::new(Gated::CanConsume));
        let supervisor = supervisor_with(engine.clone());
        let a = supervisor.accept(ConnectionId::new("a")).unwrap();
        let b = supervisor.accept(ConnectionId::new("b")).unwrap();

        let (_, p1) = start_publishing(&a).await;
        ready(&b).await;
        let recv = create_transport(&b, Direction::Receive, Some(p1.clone()))
            .await
            .unwrap();

        let pending = b.submit(Request::Consume(ConsumeRequest {
            transport_id: recv.id.clone(),
            publisher_id: p1.clone(),
            capabilities: caps("video/VP8"),
        }));
        engine.entered.notified().await;

        supervisor.disconnect(&a).await;
        engine.gate.notify_one();

        assert_eq!(
            pending.await.unwrap(),
            Err(SignalError::not_found(ResourceKind::Publisher, &p1))
        );
        assert_eq!(engine.inner.resource_counts().2, 0);
    }
}
