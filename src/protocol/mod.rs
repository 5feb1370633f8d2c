pub mod init;
pub mod start;
pub mod types;

use crate::metrics::WebSocketMetrics;
use crate::service::GraphQlService;
use crate::websocket::types as ws;
use types::{ClientMessage, ErrorPayload, ServerMessage};

/// Subprotocol token for GraphQL over WebSocket
/// (apollographql subscriptions-transport-ws).
pub static GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

#[derive(Debug, thiserror::Error)]
#[error("unknown operation message of type: {0}")]
struct UnknownMessageType(String);

/// Handles incoming client messages and dispatches them to appropriate handlers.
pub(crate) async fn handle_graphql_ws_message<S, M>(
    connection: &ws::Connection<S, M>,
    message: ClientMessage,
) where
    S: GraphQlService,
    M: WebSocketMetrics,
{
    tracing::debug!(
        websocket_id = %connection.id,
        message_type = message.message_type(),
        "handling client message"
    );
    match message {
        // Handle the ConnectionInit message and capture the header
        ClientMessage::ConnectionInit { payload } => {
            init::handle_connection_init(connection, payload).await;
        }
        // Handle the Start message and launch the operation worker
        ClientMessage::Start { id, payload } => {
            start::handle_start(connection, id, payload).await;
        }
        // Cancel the worker if one is live; `complete` is sent either way
        ClientMessage::Stop { id } => {
            if let Some(handle) = connection.take_operation(&id).await {
                handle.cancel();
                connection.context.metrics.record_operation_stop(&connection.id);
            }
            connection.send(ServerMessage::Complete { id }).await;
        }
        // Echo keep-alive probes
        ClientMessage::KeepAlive => {
            connection.send(ServerMessage::KeepAlive).await;
        }
        // The reader loop exits on connection_terminate before
        // dispatching, so this arm never runs.
        ClientMessage::ConnectionTerminate => {}
        // Anything outside the protocol vocabulary is answered on the
        // open connection
        ClientMessage::Unknown { message_type, id } => {
            connection
                .send(ServerMessage::Error {
                    id,
                    payload: ErrorPayload::new(UnknownMessageType(message_type)),
                })
                .await;
        }
    }
}
