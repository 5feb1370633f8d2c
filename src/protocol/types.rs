use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A unique identifier for a GraphQL operation.
/// Chosen by the client with the `start` message and echoed by the
/// server on every message scoped to that operation.
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct OperationId(pub String);

impl OperationId {
    /// Empty ids are omitted on the wire, mirroring the protocol's
    /// `omitempty` treatment of the `id` field.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Messages that the client can send to the server.
///
/// Every inbound frame is a JSON object with a `type` tag and optional
/// `id` and `payload` fields. Unknown types are preserved rather than
/// rejected at decode time: the dispatcher answers them with an `error`
/// message and the connection stays open.
#[derive(Debug)]
pub enum ClientMessage {
    /// Initiates the connection. The payload is opaque to the server
    /// and is retained as the connection header for later operations.
    ConnectionInit { payload: Option<Box<RawValue>> },

    /// Starts executing a GraphQL operation under a client-chosen id.
    Start {
        id: OperationId,
        payload: Option<Box<RawValue>>,
    },

    /// Stops a running operation.
    Stop { id: OperationId },

    /// Ends the session. No further messages are processed.
    ConnectionTerminate,

    /// Keep-alive probe; the server echoes it back.
    KeepAlive,

    /// Any message type outside the protocol vocabulary.
    Unknown {
        message_type: String,
        id: OperationId,
    },
}

impl ClientMessage {
    /// Returns message type
    pub fn message_type(&self) -> &str {
        match self {
            Self::ConnectionInit { .. } => "connection_init",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::ConnectionTerminate => "connection_terminate",
            Self::KeepAlive => "ka",
            Self::Unknown { message_type, .. } => message_type,
        }
    }
}

impl<'de> Deserialize<'de> for ClientMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // A permissive envelope: a frame with no `type` (or no `id`)
        // still decodes, with the missing fields empty. Only malformed
        // JSON is a decode error, which tears the connection down.
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type", default)]
            message_type: String,
            #[serde(default)]
            id: OperationId,
            #[serde(default, deserialize_with = "raw_payload")]
            payload: Option<Box<RawValue>>,
        }

        // An explicit `"payload": null` is a present payload (the raw
        // text `null`), distinct from the field being absent.
        fn raw_payload<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            Box::<RawValue>::deserialize(deserializer).map(Some)
        }

        let envelope = Envelope::deserialize(deserializer)?;
        Ok(match envelope.message_type.as_str() {
            "connection_init" => Self::ConnectionInit {
                payload: envelope.payload,
            },
            "start" => Self::Start {
                id: envelope.id,
                payload: envelope.payload,
            },
            "stop" => Self::Stop { id: envelope.id },
            "connection_terminate" => Self::ConnectionTerminate,
            "ka" => Self::KeepAlive,
            _ => Self::Unknown {
                message_type: envelope.message_type,
                id: envelope.id,
            },
        })
    }
}

/// The payload of the `start` message.
///
/// All fields may be absent or `null`; the execution service receives
/// empty defaults for whatever the client left out.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub operation_name: Option<String>,
    pub query: Option<String>,
    pub variables: Option<HashMap<String, serde_json::Value>>,
}

/// The payload of outbound `error` and `connection_error` messages.
#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl ErrorPayload {
    pub(crate) fn new(error: impl std::fmt::Display) -> Self {
        Self {
            message: error.to_string(),
        }
    }
}

/// Messages that the server can send to the client
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Acknowledges a successful `connection_init`.
    #[serde(rename = "connection_ack")]
    ConnectionAck,

    /// Reports a connection-scoped protocol failure. The connection
    /// stays open.
    #[serde(rename = "connection_error")]
    ConnectionError {
        #[serde(skip_serializing_if = "OperationId::is_empty")]
        id: OperationId,
        payload: ErrorPayload,
    },

    /// Echo of a client keep-alive probe.
    #[serde(rename = "ka")]
    KeepAlive,

    /// One streamed execution result for an operation.
    #[serde(rename = "data")]
    Data {
        #[serde(skip_serializing_if = "OperationId::is_empty")]
        id: OperationId,
        payload: Box<RawValue>,
    },

    /// An operation-scoped failure.
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "OperationId::is_empty")]
        id: OperationId,
        payload: ErrorPayload,
    },

    /// Marks the end of an operation: no more messages will carry its
    /// id.
    #[serde(rename = "complete")]
    Complete {
        #[serde(skip_serializing_if = "OperationId::is_empty")]
        id: OperationId,
    },
}
