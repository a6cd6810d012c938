#![forbid(unsafe_code)]

// Signaling protocol - message types exchanged over the WebSocket.
//
// Both directions use the envelope `{ "action": ..., "data": { ... } }`.
// Incoming frames are parsed in two steps so that a missing or unknown action
// and a malformed payload produce distinct errors.

use crate::media::types::{ConsumerInfo, MediaKind, TransportInfo};
use crate::room::PeerRole;
use crate::turn::IceServer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    InvalidJson(String),

    #[error("missing action")]
    MissingAction,

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid {action} data: {reason}")]
    InvalidData { action: &'static str, reason: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default)]
    pub role: Option<PeerRole>,
    #[serde(default)]
    pub room_id: Option<String>,
}

/// Client-to-server messages
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Join(JoinRequest),
    CreateTransport,
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    Consume {
        transport_id: String,
        producer_id: Option<String>,
        rtp_capabilities: Value,
    },
    ResumeConsumer {
        consumer_id: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportData {
    transport_id: String,
    dtls_parameters: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    transport_id: String,
    #[serde(default)]
    producer_id: Option<String>,
    rtp_capabilities: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeConsumerData {
    consumer_id: String,
}

fn data<T: DeserializeOwned>(action: &'static str, data: Value) -> Result<T, ProtocolError> {
    // A missing or null payload reads as an empty object
    let data = if data.is_null() { Value::Object(Default::default()) } else { data };
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidData {
        action,
        reason: e.to_string(),
    })
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let action = envelope.action.ok_or(ProtocolError::MissingAction)?;

        let message = match action.as_str() {
            "join" => ClientMessage::Join(data("join", envelope.data)?),
            "createTransport" => ClientMessage::CreateTransport,
            "connectTransport" => {
                let d: ConnectTransportData = data("connectTransport", envelope.data)?;
                ClientMessage::ConnectTransport {
                    transport_id: d.transport_id,
                    dtls_parameters: d.dtls_parameters,
                }
            }
            "produce" => {
                let d: ProduceData = data("produce", envelope.data)?;
                ClientMessage::Produce {
                    transport_id: d.transport_id,
                    kind: d.kind,
                    rtp_parameters: d.rtp_parameters,
                }
            }
            "consume" => {
                let d: ConsumeData = data("consume", envelope.data)?;
                ClientMessage::Consume {
                    transport_id: d.transport_id,
                    producer_id: d.producer_id,
                    rtp_capabilities: d.rtp_capabilities,
                }
            }
            "resumeConsumer" => {
                let d: ResumeConsumerData = data("resumeConsumer", envelope.data)?;
                ClientMessage::ResumeConsumer {
                    consumer_id: d.consumer_id,
                }
            }
            _ => return Err(ProtocolError::UnknownAction(action)),
        };
        Ok(message)
    }

    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::CreateTransport => "createTransport",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resumeConsumer",
        }
    }
}

/// Server-to-client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Join accepted
    #[serde(rename_all = "camelCase")]
    Joined {
        router_rtp_capabilities: Value,
        ice_servers: Vec<IceServer>,
        /// Live producers in creation order
        producers: Vec<String>,
    },
    TransportCreated(TransportInfo),
    #[serde(rename_all = "camelCase")]
    TransportConnected {
        transport_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Produced {
        producer_id: String,
    },
    /// Another peer in the room started producing
    #[serde(rename_all = "camelCase")]
    ProducerAdded {
        producer_id: String,
    },
    Consumed(ConsumerInfo),
    #[serde(rename_all = "camelCase")]
    ConsumerResumed {
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomClosed {
        room_id: String,
    },
    Error {
        message: String,
    },
}
