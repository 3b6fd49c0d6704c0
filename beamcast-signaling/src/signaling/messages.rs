use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{
    Direction, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportParams,
};
use crate::error::SignalError;
use crate::ids::{PublisherId, SubscriberId, TransportId};

// ─── Requests ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub direction: Direction,
    #[serde(default)]
    pub for_publisher_id: Option<PublisherId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: TransportId,
    pub handshake_params: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub media_params: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: TransportId,
    pub publisher_id: PublisherId,
    pub capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSubscriberRequest {
    pub subscriber_id: SubscriberId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetCapabilities,
    ListPublishers,
    CreateTransport(CreateTransportRequest),
    ConnectTransport(ConnectTransportRequest),
    Publish(PublishRequest),
    Consume(ConsumeRequest),
    ResumeSubscriber(ResumeSubscriberRequest),
}

impl Request {
    pub const EVENTS: [&'static str; 7] = [
        "get-capabilities",
        "list-publishers",
        "create-transport",
        "connect-transport",
        "publish",
        "consume",
        "resume-subscriber",
    ];

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::GetCapabilities => "get-capabilities",
            Self::ListPublishers => "list-publishers",
            Self::CreateTransport(_) => "create-transport",
            Self::ConnectTransport(_) => "connect-transport",
            Self::Publish(_) => "publish",
            Self::Consume(_) => "consume",
            Self::ResumeSubscriber(_) => "resume-subscriber",
        }
    }

    /// Decode a socket event into a request. Payloads of events that take no
    /// arguments are ignored.
    pub fn parse(event: &str, payload: Value) -> Result<Self, SignalError> {
        fn body<T: serde::de::DeserializeOwned>(event: &str, payload: Value) -> Result<T, SignalError> {
            serde_json::from_value(payload)
                .map_err(|e| SignalError::invalid(format!("invalid {event} payload: {e}")))
        }

        Ok(match event {
            "get-capabilities" => Self::GetCapabilities,
            "list-publishers" => Self::ListPublishers,
            "create-transport" => Self::CreateTransport(body(event, payload)?),
            "connect-transport" => Self::ConnectTransport(body(event, payload)?),
            "publish" => Self::Publish(body(event, payload)?),
            "consume" => Self::Consume(body(event, payload)?),
            "resume-subscriber" => Self::ResumeSubscriber(body(event, payload)?),
            other => return Err(SignalError::invalid(format!("unknown event '{other}'"))),
        })
    }
}

// ─── Responses ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherSummary {
    pub publisher_id: PublisherId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    pub transport_id: TransportId,
    pub connection_params: TransportParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportConnected {
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Published {
    pub publisher_id: PublisherId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumed {
    pub subscriber_id: SubscriberId,
    pub publisher_id: PublisherId,
    pub kind: MediaKind,
    pub media_params: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resumed {
    pub resumed: bool,
}

/// Successful ack bodies. Serialized without a tag: the client knows which
/// request it is acking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Capabilities(RtpCapabilities),
    Publishers(Vec<PublisherSummary>),
    TransportCreated(TransportCreated),
    TransportConnected(TransportConnected),
    Published(Published),
    Consumed(Consumed),
    Resumed(Resumed),
}
