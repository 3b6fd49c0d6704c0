//! In-process engine.
//!
//! Models the engine-side bookkeeping (ids, ICE/DTLS parameters, codec
//! matching, paused subscribers) without moving any media. Used by the
//! service binary when no external SFU worker is attached, and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map};
use sha2::{Digest, Sha256};

use super::{
    Direction, DtlsFingerprint, DtlsParameters, EngineError, IceCandidate, IceParameters,
    MediaEngine, MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpParameters,
    SubscriberParams, TransportParams,
};
use crate::ids::{PublisherId, ResourceKind, SubscriberId, TransportId};

const UDP_PRIORITY: u32 = 1_076_302_079;
const TCP_PRIORITY: u32 = 1_076_276_479;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Address the media sockets would bind to.
    pub listen_ip: String,
    /// Address advertised in ICE candidates; falls back to `listen_ip`.
    pub announced_ip: Option<String>,
    pub min_port: u16,
    pub max_port: u16,
    pub codecs: Vec<RtpCodecCapability>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".into(),
            announced_ip: None,
            min_port: 40000,
            max_port: 49999,
            codecs: default_codecs(),
        }
    }
}

/// Opus for audio, VP8 and constrained-baseline H264 for video.
pub fn default_codecs() -> Vec<RtpCodecCapability> {
    let video_feedback = vec![
        RtcpFeedback::new("nack", ""),
        RtcpFeedback::new("nack", "pli"),
        RtcpFeedback::new("ccm", "fir"),
        RtcpFeedback::new("goog-remb", ""),
    ];

    let mut h264_params = Map::new();
    h264_params.insert("packetization-mode".into(), json!(1));
    h264_params.insert("profile-level-id".into(), json!("42e01f"));
    h264_params.insert("level-asymmetry-allowed".into(), json!(1));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".into(),
            preferred_payload_type: Some(111),
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".into(),
            preferred_payload_type: Some(100),
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: video_feedback.clone(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".into(),
            preferred_payload_type: Some(102),
            clock_rate: 90000,
            channels: None,
            parameters: h264_params,
            rtcp_feedback: video_feedback,
        },
    ]
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

struct LocalTransport {
    direction: Direction,
    connected: bool,
}

struct LocalPublisher {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct LocalSubscriber {
    transport_id: TransportId,
    paused: bool,
}

#[derive(Default)]
struct EngineState {
    transports: HashMap<TransportId, LocalTransport>,
    publishers: HashMap<PublisherId, LocalPublisher>,
    subscribers: HashMap<SubscriberId, LocalSubscriber>,
    /// Never reused, unlike the map size.
    next_mid: u64,
}

pub struct LocalEngine {
    settings: EngineSettings,
    capabilities: RtpCapabilities,
    port_cursor: AtomicU32,
    state: Mutex<EngineState>,
}

impl LocalEngine {
    pub fn new(settings: EngineSettings) -> Self {
        let capabilities = RtpCapabilities {
            codecs: settings.codecs.clone(),
            header_extensions: Vec::new(),
        };
        Self {
            settings,
            capabilities,
            port_cursor: AtomicU32::new(0),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// `Some(paused)` for a live subscriber, `None` once released.
    pub fn is_paused(&self, id: &SubscriberId) -> Option<bool> {
        self.state.lock().subscribers.get(id).map(|s| s.paused)
    }

    pub fn is_connected(&self, id: &TransportId) -> Option<bool> {
        self.state.lock().transports.get(id).map(|t| t.connected)
    }

    /// Live (transports, publishers, subscribers).
    pub fn resource_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (
            state.transports.len(),
            state.publishers.len(),
            state.subscribers.len(),
        )
    }

    fn next_port(&self) -> u16 {
        let min = u32::from(self.settings.min_port);
        let max = u32::from(self.settings.max_port.max(self.settings.min_port));
        let span = max - min + 1;
        let offset = self.port_cursor.fetch_add(1, Ordering::Relaxed) % span;
        // min + offset never exceeds max, which is a u16
        (min + offset) as u16
    }

    fn candidates(&self, port: u16) -> Vec<IceCandidate> {
        let ip = self
            .settings
            .announced_ip
            .clone()
            .unwrap_or_else(|| self.settings.listen_ip.clone());

        vec![
            IceCandidate {
                foundation: "udpcandidate".into(),
                priority: UDP_PRIORITY,
                ip: ip.clone(),
                protocol: "udp".into(),
                port,
                candidate_type: "host".into(),
                tcp_type: None,
            },
            IceCandidate {
                foundation: "tcpcandidate".into(),
                priority: TCP_PRIORITY,
                ip,
                protocol: "tcp".into(),
                port,
                candidate_type: "host".into(),
                tcp_type: Some("passive".into()),
            },
        ]
    }

    fn engine_codec(&self, mime_type: &str) -> Option<&RtpCodecCapability> {
        self.capabilities
            .codecs
            .iter()
            .find(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill(&mut seed);
    Sha256::digest(seed)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

// ---------------------------------------------------------------------------
// MediaEngine impl
// ---------------------------------------------------------------------------

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(&self, direction: Direction) -> Result<TransportParams, EngineError> {
        let id = TransportId::generate();
        let port = self.next_port();

        let params = TransportParams {
            id: id.clone(),
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: self.candidates(port),
            dtls_parameters: DtlsParameters {
                role: Some("auto".into()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".into(),
                    value: random_fingerprint(),
                }],
            },
        };

        self.state.lock().transports.insert(
            id.clone(),
            LocalTransport {
                direction,
                connected: false,
            },
        );

        tracing::debug!(transport_id = %id, %direction, port, "engine transport created");
        Ok(params)
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls: &DtlsParameters,
    ) -> Result<(), EngineError> {
        if dtls.fingerprints.is_empty() {
            return Err(EngineError::InvalidHandshake(
                "at least one DTLS fingerprint is required".into(),
            ));
        }

        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::unknown(ResourceKind::Transport, transport_id))?;
        transport.connected = true;
        Ok(())
    }

    async fn create_publisher(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<PublisherId, EngineError> {
        let supported = rtp_parameters.codecs.iter().any(|c| {
            self.engine_codec(&c.mime_type)
                .map(|cap| cap.kind == kind)
                .unwrap_or(false)
        });
        if !supported {
            return Err(EngineError::UnsupportedCodec(format!(
                "none of the offered {kind} codecs are supported"
            )));
        }

        let mut state = self.state.lock();
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::unknown(ResourceKind::Transport, transport_id))?;
        if transport.direction != Direction::Send {
            return Err(EngineError::WrongDirection(transport_id.clone()));
        }

        let id = PublisherId::generate();
        state.publishers.insert(
            id.clone(),
            LocalPublisher {
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        Ok(id)
    }

    async fn can_consume(&self, publisher_id: &PublisherId, capabilities: &RtpCapabilities) -> bool {
        let state = self.state.lock();
        match state.publishers.get(publisher_id) {
            Some(publisher) => publisher
                .rtp_parameters
                .codecs
                .iter()
                .any(|c| capabilities.supports(&c.mime_type)),
            None => false,
        }
    }

    async fn create_subscriber(
        &self,
        transport_id: &TransportId,
        publisher_id: &PublisherId,
        capabilities: &RtpCapabilities,
    ) -> Result<SubscriberParams, EngineError> {
        let mut state = self.state.lock();

        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::unknown(ResourceKind::Transport, transport_id))?;
        if transport.direction != Direction::Receive {
            return Err(EngineError::WrongDirection(transport_id.clone()));
        }

        let publisher = state
            .publishers
            .get(publisher_id)
            .ok_or_else(|| EngineError::unknown(ResourceKind::Publisher, publisher_id))?;

        let codecs: Vec<_> = publisher
            .rtp_parameters
            .codecs
            .iter()
            .filter(|c| capabilities.supports(&c.mime_type))
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::UnsupportedCodec(format!(
                "subscriber cannot decode publisher '{publisher_id}'"
            )));
        }

        let kind = publisher.kind;
        let mut cname = [0u8; 8];
        rand::thread_rng().fill(&mut cname);
        let ssrc: u32 = rand::thread_rng().gen();

        let mid = state.next_mid;
        state.next_mid += 1;

        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs,
            header_extensions: Vec::new(),
            encodings: vec![json!({ "ssrc": ssrc })],
            rtcp: Some(json!({ "cname": hex::encode(cname), "reducedSize": true })),
        };

        let id = SubscriberId::generate();
        state.subscribers.insert(
            id.clone(),
            LocalSubscriber {
                transport_id: transport_id.clone(),
                paused: true,
            },
        );

        Ok(SubscriberParams {
            id,
            publisher_id: publisher_id.clone(),
            kind,
            rtp_parameters,
        })
    }

    async fn resume_subscriber(&self, subscriber_id: &SubscriberId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let subscriber = state
            .subscribers
            .get_mut(subscriber_id)
            .ok_or_else(|| EngineError::unknown(ResourceKind::Subscriber, subscriber_id))?;
        subscriber.paused = false;
        Ok(())
    }

    async fn release(&self, kind: ResourceKind, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let removed = match kind {
            ResourceKind::Subscriber => state.subscribers.remove(&SubscriberId::from(id)).is_some(),
            ResourceKind::Publisher => state.publishers.remove(&PublisherId::from(id)).is_some(),
            ResourceKind::Transport => {
                let transport_id = TransportId::from(id);
                let removed = state.transports.remove(&transport_id).is_some();
                // closing a transport closes everything riding on it
                state.publishers.retain(|_, p| p.transport_id != transport_id);
                state.subscribers.retain(|_, s| s.transport_id != transport_id);
                removed
            }
        };

        if removed {
            Ok(())
        } else {
            Err(EngineError::unknown(kind, id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RtpCodecParameters;

    fn vp8_params() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".into(),
                payload_type: 101,
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..Default::default()
        }
    }

    fn caps_with(mime: &str) -> RtpCapabilities {
        serde_json::from_value(json!({
            "codecs": [{ "kind": "video", "mimeType": mime, "clockRate": 90000 }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn transport_params_carry_handshake_material() {
        let engine = LocalEngine::new(EngineSettings {
            announced_ip: Some("203.0.113.7".into()),
            min_port: 50000,
            max_port: 50001,
            ..Default::default()
        });

        let a = engine.create_transport(Direction::Send).await.unwrap();
        let b = engine.create_transport(Direction::Send).await.unwrap();
        let c = engine.create_transport(Direction::Send).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.ice_candidates[0].ip, "203.0.113.7");
        assert_eq!(a.ice_candidates[0].port, 50000);
        assert_eq!(b.ice_candidates[0].port, 50001);
        assert_eq!(c.ice_candidates[0].port, 50000);
        assert_eq!(a.ice_parameters.username_fragment.len(), 16);
        assert_eq!(a.dtls_parameters.fingerprints[0].algorithm, "sha-256");
        // 32 bytes as colon separated hex pairs
        assert_eq!(a.dtls_parameters.fingerprints[0].value.len(), 32 * 3 - 1);
    }

    #[tokio::test]
    async fn connect_requires_a_fingerprint() {
        let engine = LocalEngine::new(EngineSettings::default());
        let t = engine.create_transport(Direction::Send).await.unwrap();

        let empty = DtlsParameters { role: None, fingerprints: vec![] };
        assert!(matches!(
            engine.connect_transport(&t.id, &empty).await,
            Err(EngineError::InvalidHandshake(_))
        ));

        engine.connect_transport(&t.id, &t.dtls_parameters).await.unwrap();
        assert_eq!(engine.is_connected(&t.id), Some(true));
    }

    #[tokio::test]
    async fn publisher_needs_send_transport_and_known_codec() {
        let engine = LocalEngine::new(EngineSettings::default());
        let recv = engine.create_transport(Direction::Receive).await.unwrap();
        let send = engine.create_transport(Direction::Send).await.unwrap();

        assert!(matches!(
            engine.create_publisher(&recv.id, MediaKind::Video, &vp8_params()).await,
            Err(EngineError::WrongDirection(_))
        ));
        assert!(matches!(
            engine.create_publisher(&send.id, MediaKind::Audio, &vp8_params()).await,
            Err(EngineError::UnsupportedCodec(_))
        ));
        assert!(engine
            .create_publisher(&send.id, MediaKind::Video, &vp8_params())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn subscriber_starts_paused_and_filters_codecs() {
        let engine = LocalEngine::new(EngineSettings::default());
        let send = engine.create_transport(Direction::Send).await.unwrap();
        let recv = engine.create_transport(Direction::Receive).await.unwrap();
        let publisher = engine
            .create_publisher(&send.id, MediaKind::Video, &vp8_params())
            .await
            .unwrap();

        assert!(engine.can_consume(&publisher, &caps_with("video/vp8")).await);
        assert!(!engine.can_consume(&publisher, &caps_with("video/H264")).await);

        let sub = engine
            .create_subscriber(&recv.id, &publisher, &caps_with("video/VP8"))
            .await
            .unwrap();
        assert_eq!(sub.kind, MediaKind::Video);
        assert_eq!(sub.rtp_parameters.codecs.len(), 1);
        assert_eq!(engine.is_paused(&sub.id), Some(true));

        engine.resume_subscriber(&sub.id).await.unwrap();
        assert_eq!(engine.is_paused(&sub.id), Some(false));
    }

    #[tokio::test]
    async fn releasing_twice_reports_unknown() {
        let engine = LocalEngine::new(EngineSettings::default());
        let t = engine.create_transport(Direction::Send).await.unwrap();

        engine.release(ResourceKind::Transport, t.id.as_str()).await.unwrap();
        assert!(matches!(
            engine.release(ResourceKind::Transport, t.id.as_str()).await,
            Err(EngineError::Unknown { kind: ResourceKind::Transport, .. })
        ));
    }

    #[tokio::test]
    async fn closing_a_transport_drops_its_publishers() {
        let engine = LocalEngine::new(EngineSettings::default());
        let send = engine.create_transport(Direction::Send).await.unwrap();
        engine
            .create_publisher(&send.id, MediaKind::Video, &vp8_params())
            .await
            .unwrap();
        assert_eq!(engine.resource_counts(), (1, 1, 0));

        engine.release(ResourceKind::Transport, send.id.as_str()).await.unwrap();
        assert_eq!(engine.resource_counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn mids_are_not_reused_after_release() {
        let engine = LocalEngine::new(EngineSettings::default());
        let send = engine.create_transport(Direction::Send).await.unwrap();
        let publisher = engine
            .create_publisher(&send.id, MediaKind::Video, &vp8_params())
            .await
            .unwrap();

        let mut subscribers = Vec::new();
        for _ in 0..2 {
            let recv = engine.create_transport(Direction::Receive).await.unwrap();
            subscribers.push(
                engine
                    .create_subscriber(&recv.id, &publisher, &caps_with("video/VP8"))
                    .await
                    .unwrap(),
            );
        }
        engine
            .release(ResourceKind::Subscriber, subscribers[0].id.as_str())
            .await
            .unwrap();

        let recv = engine.create_transport(Direction::Receive).await.unwrap();
        let third = engine
            .create_subscriber(&recv.id, &publisher, &caps_with("video/VP8"))
            .await
            .unwrap();
        assert_ne!(third.rtp_parameters.mid, subscribers[1].rtp_parameters.mid);
        assert_ne!(third.rtp_parameters.mid, subscribers[0].rtp_parameters.mid);
    }
}
