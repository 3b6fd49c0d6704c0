//! Capability boundary over the SFU media engine.
//!
//! The signaling layer never touches media. Everything it needs from the
//! engine (transport endpoints, publishers, subscribers, codec negotiation)
//! goes through [`MediaEngine`]. The wire types below mirror what browser
//! SFU clients send and expect, so they are serialized in camelCase.

mod local;

pub use local::{default_codecs, EngineSettings, LocalEngine};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{PublisherId, ResourceKind, SubscriberId, TransportId};

// ---------------------------------------------------------------------------
// Media kinds and directions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way media flows over a transport, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    #[serde(alias = "recv")]
    Receive,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Receive => f.write_str("receive"),
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities and RTP parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

impl RtcpFeedback {
    pub fn new(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// What an engine (or a receiving client) is able to handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Case-insensitive lookup of a codec by mime type.
    pub fn supports(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Negotiated parameters of one media stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

// ---------------------------------------------------------------------------
// Transport connection parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS half of the handshake; sent by the server on transport creation and
/// by the client on `connect-transport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Everything a client needs to complete its side of a transport handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Engine-side description of a freshly created (paused) subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberParams {
    pub id: SubscriberId,
    pub publisher_id: PublisherId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("unknown {kind} '{id}'")]
    Unknown { kind: ResourceKind, id: String },

    #[error("transport '{0}' has the wrong direction for this operation")]
    WrongDirection(TransportId),

    #[error("no usable codec: {0}")]
    UnsupportedCodec(String),

    #[error("invalid handshake parameters: {0}")]
    InvalidHandshake(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn unknown(kind: ResourceKind, id: impl std::fmt::Display) -> Self {
        Self::Unknown {
            kind,
            id: id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// The capability trait
// ---------------------------------------------------------------------------

/// Calls the signaling layer makes into the media engine.
///
/// Every method is a suspension point for the calling connection only;
/// implementations must be safe to call concurrently from many connections.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Negotiable codecs and header extensions. Must be stable across calls.
    async fn capabilities(&self) -> RtpCapabilities;

    async fn create_transport(&self, direction: Direction) -> Result<TransportParams, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn create_publisher(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<PublisherId, EngineError>;

    async fn can_consume(&self, publisher_id: &PublisherId, capabilities: &RtpCapabilities) -> bool;

    /// Subscribers are always created paused.
    async fn create_subscriber(
        &self,
        transport_id: &TransportId,
        publisher_id: &PublisherId,
        capabilities: &RtpCapabilities,
    ) -> Result<SubscriberParams, EngineError>;

    async fn resume_subscriber(&self, subscriber_id: &SubscriberId) -> Result<(), EngineError>;

    /// Tear down one resource. Releasing something the engine already
    /// discarded returns `EngineError::Unknown`.
    async fn release(&self, kind: ResourceKind, id: &str) -> Result<(), EngineError>;
}
