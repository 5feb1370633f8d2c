pub mod tasks;
pub mod types;

use axum::{
    extract::ws,
    http::{
        header::{InvalidHeaderValue, ToStrError},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;

use crate::metrics::WebSocketMetrics;
use crate::protocol;
use crate::service::GraphQlService;

pub static SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
static SEC_WEBSOCKET_ID: &str = "Sec-WebSocket-Id";

/// Capacity of the outbound channel. A single slot makes producers
/// rendezvous with the writer pump, so a slow socket backpressures the
/// execution service instead of buffering results.
static WEBSOCKET_CHANNEL_SIZE: usize = 1;

/// GraphQL WebSocket server implementation.
pub struct WebSocketServer<S, M> {
    pub connections: types::Connections<S, M>,
}

impl<S, M> WebSocketServer<S, M> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            connections: types::Connections::new(), // Initialize an empty map of active connections
        }
    }

    /// Shuts down all active WebSocket connections.
    pub async fn shutdown(&self) {
        let mut map = self.connections.0.write().await;
        for (_, connection) in map.drain() {
            // Cancelling the connection scope stops the reader, the
            // writer pump, and every operation worker
            connection.token.cancel();
            connection.drain_operations().await;
        }
    }

    /// Handles the GraphQL WebSocket connection upgrade request.
    /// Validates the WebSocket subprotocol and upgrades the connection if valid.
    pub fn upgrade_and_handle_websocket(
        &self,
        ws_upgrade: ws::WebSocketUpgrade,
        handshake_headers: &HeaderMap,
        context: types::Context<S, M>,
    ) -> Response
    where
        S: GraphQlService,
        M: WebSocketMetrics,
    {
        match self.try_upgrade(ws_upgrade, handshake_headers, context) {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    fn try_upgrade(
        &self,
        ws_upgrade: ws::WebSocketUpgrade,
        handshake_headers: &HeaderMap,
        context: types::Context<S, M>,
    ) -> Result<Response, WebSocketError>
    where
        S: GraphQlService,
        M: WebSocketMetrics,
    {
        // Refuse any session that did not ask for the graphql-ws protocol
        check_protocol_in_headers(handshake_headers)?;

        let websocket_id = types::WebSocketId::new();
        let connections = self.connections.clone();
        let read_limit = context.read_limit;
        // Clone the websocket_id to move it into the closure
        let websocket_id_cloned = websocket_id.clone();
        let mut response = ws_upgrade
            .protocols([protocol::GRAPHQL_WS_PROTOCOL])
            .max_message_size(read_limit)
            .on_upgrade(move |socket| {
                start_websocket_session(socket, websocket_id_cloned, context, connections)
            });
        // Set the WebSocket id response header
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_ID, websocket_id.to_string().parse()?);
        Ok(response)
    }
}

/// Error types for WebSocket connections.
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    /// Error when the Sec-WebSocket-Protocol header is missing
    #[error("Missing {SEC_WEBSOCKET_PROTOCOL} header")]
    MissingProtocolHeader,

    /// Error when the header value cannot be converted to a string
    #[error("{SEC_WEBSOCKET_PROTOCOL} header: {0}")]
    InvalidHeaderValue(#[from] ToStrError),

    /// Error when the GraphQL WebSocket protocol is not included
    #[error("Expecting {} protocol", protocol::GRAPHQL_WS_PROTOCOL)]
    ExpectingGraphqlWsProtocol,

    /// Error when setting the WebSocket ID header value fails in response
    #[error("Unable to set {SEC_WEBSOCKET_ID} header value: {0}")]
    WebSocketIdInvalidHeaderValue(#[from] InvalidHeaderValue),
}

impl IntoResponse for WebSocketError {
    fn into_response(self) -> Response {
        match self {
            Self::MissingProtocolHeader
            | Self::ExpectingGraphqlWsProtocol
            | Self::InvalidHeaderValue(_) => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            Self::WebSocketIdInvalidHeaderValue(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

/// Handles the WebSocket connection by splitting it into sender and receiver.
/// Runs the reader task and the writer pump until either exits, then
/// removes the connection and cancels whatever it still owned.
async fn start_websocket_session<S, M>(
    socket: ws::WebSocket,
    websocket_id: types::WebSocketId,
    context: types::Context<S, M>,
    connections: types::Connections<S, M>,
) where
    S: GraphQlService,
    M: WebSocketMetrics,
{
    // Split the socket into a sender and receiver
    let (websocket_sender, websocket_receiver) = socket.split();

    // Create a channel for communicating with the WebSocket connection
    let (channel_sender, channel_receiver) =
        tokio::sync::mpsc::channel::<protocol::types::ServerMessage>(WEBSOCKET_CHANNEL_SIZE);

    // Create a new WebSocket connection instance
    let connection = connections
        .new_connection(websocket_id, context, channel_sender)
        .await;
    connection.context.metrics.record_connection_init();
    tracing::debug!(websocket_id = %connection.id, "WebSocket session started");

    // Spawn the writer pump and the reader task. Either one cancels the
    // connection scope when it exits, which makes the other exit too.
    let outgoing_task = tokio::spawn(tasks::manage_outgoing_messages(
        connection.clone(),
        websocket_sender,
        channel_receiver,
    ));
    let incoming_task = tokio::spawn(tasks::process_incoming_messages(
        connection.clone(),
        websocket_receiver,
    ));
    let _ = tokio::join!(incoming_task, outgoing_task);

    // Remove the connection from the active connections map and cancel
    // any operations that were still live
    connections.drop(&connection.id).await;
    connection.context.metrics.record_connection_drop();
    tracing::debug!(websocket_id = %connection.id, "WebSocket session ended");
}

/// Validates that the required WebSocket subprotocol is present in the
/// connection headers.
///
/// This function checks that:
/// 1. The Sec-WebSocket-Protocol header exists
/// 2. The header contains the GraphQL WebSocket ("graphql-ws") protocol
pub(crate) fn check_protocol_in_headers(headers: &HeaderMap) -> Result<(), WebSocketError> {
    let protocol_header_values = headers.get_all(SEC_WEBSOCKET_PROTOCOL).iter();
    let mut provided_protocols = Vec::new();
    for protocol in protocol_header_values {
        let protocol_str = protocol.to_str()?;
        provided_protocols.extend_from_slice(&parse_comma_separated_header_values(protocol_str));
    }
    if provided_protocols.is_empty() {
        Err(WebSocketError::MissingProtocolHeader)?;
    } else if !provided_protocols.contains(&protocol::GRAPHQL_WS_PROTOCOL) {
        Err(WebSocketError::ExpectingGraphqlWsProtocol)?;
    }
    Ok(())
}

/// Parses a comma-separated header value into a vector of trimmed strings.
fn parse_comma_separated_header_values(header: &str) -> Vec<&str> {
    header
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
