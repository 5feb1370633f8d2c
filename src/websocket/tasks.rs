use axum::extract::ws;
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;

use super::types;
use crate::metrics::WebSocketMetrics;
use crate::protocol;
use crate::service::GraphQlService;

/// Enum to represent whether the loop should continue or break.
#[derive(PartialEq)]
enum BreakLoop {
    /// Indicates the loop should break.
    Break,
    /// Indicates the loop should continue.
    Dont,
}

enum ParsedClientMessage {
    /// The peer sent a close frame.
    Close,
    /// A ping or pong control frame; no protocol meaning.
    Control,
    Protocol(protocol::types::ClientMessage),
}

#[derive(Debug, thiserror::Error)]
enum ParseError {
    #[error("unable to fetch message from WebSocket: {0}")]
    WebSocket(#[from] axum::Error),
    #[error("unable to parse WebSocket message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads and dispatches incoming WebSocket messages from the client.
///
/// One iteration decodes one frame. Close frames, `connection_terminate`,
/// transport errors, and non-JSON input all end the loop; everything
/// else dispatches into the protocol handlers. On exit the connection
/// scope is cancelled, which unblocks the writer pump and every worker.
pub(crate) async fn process_incoming_messages<S, M>(
    connection: types::Connection<S, M>,
    mut websocket_receiver: futures_util::stream::SplitStream<ws::WebSocket>,
) where
    S: GraphQlService,
    M: WebSocketMetrics,
{
    loop {
        let message = tokio::select! {
            biased;
            () = connection.token.cancelled() => break,
            message = websocket_receiver.next() => message,
        };
        // The peer went away without a close frame
        let Some(message) = message else { break };

        let break_loop = match parse_incoming_message(message) {
            Ok(ParsedClientMessage::Close) => {
                tracing::debug!(websocket_id = %connection.id, "received close message from client");
                BreakLoop::Break
            }
            Ok(ParsedClientMessage::Control) => BreakLoop::Dont,
            Ok(ParsedClientMessage::Protocol(
                protocol::types::ClientMessage::ConnectionTerminate,
            )) => {
                tracing::debug!(websocket_id = %connection.id, "client terminated the connection");
                BreakLoop::Break
            }
            Ok(ParsedClientMessage::Protocol(client_message)) => {
                protocol::handle_graphql_ws_message(&connection, client_message).await;
                BreakLoop::Dont
            }
            Err(ParseError::WebSocket(err)) => {
                tracing::debug!(websocket_id = %connection.id, error = %err, "unable to receive message from client");
                BreakLoop::Break
            }
            // Unknown message *types* are tolerated, but input that is
            // not a JSON object tears the connection down.
            Err(ParseError::Json(err)) => {
                tracing::debug!(websocket_id = %connection.id, error = %err, "invalid JSON message received");
                BreakLoop::Break
            }
        };
        if break_loop == BreakLoop::Break {
            break;
        }
    }
    connection.token.cancel();
}

fn parse_incoming_message(
    message: Result<ws::Message, axum::Error>,
) -> Result<ParsedClientMessage, ParseError> {
    let message = message?;
    match message {
        ws::Message::Close(_) => Ok(ParsedClientMessage::Close),
        ws::Message::Ping(_) | ws::Message::Pong(_) => Ok(ParsedClientMessage::Control),
        message => {
            let client_message =
                serde_json::from_slice::<protocol::types::ClientMessage>(&message.into_data())?;
            Ok(ParsedClientMessage::Protocol(client_message))
        }
    }
}

/// The writer pump: the sole conduit from the engine to the transport's
/// write side.
///
/// Dequeues outbound messages and writes each under the configured
/// deadline. Any write failure, missed deadline, or cancellation of the
/// connection scope ends the pump. On exit it cancels the connection
/// scope and closes the socket; no other component touches the
/// transport's write side.
pub(crate) async fn manage_outgoing_messages<S, M>(
    connection: types::Connection<S, M>,
    mut websocket_sender: futures_util::stream::SplitSink<ws::WebSocket, ws::Message>,
    mut channel_receiver: tokio::sync::mpsc::Receiver<protocol::types::ServerMessage>,
) where
    S: GraphQlService,
    M: WebSocketMetrics,
{
    let write_timeout = connection.context.write_timeout;
    loop {
        let message = tokio::select! {
            biased;
            () = connection.token.cancelled() => break,
            message = channel_receiver.recv() => message,
        };
        let Some(message) = message else { break };

        let json_text = match serde_json::to_string(&message) {
            Ok(json_text) => json_text,
            Err(err) => {
                tracing::warn!(websocket_id = %connection.id, error = %err, "unable to serialize message into JSON");
                break;
            }
        };
        match timeout(write_timeout, websocket_sender.send(ws::Message::Text(json_text))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(websocket_id = %connection.id, error = %err, "unable to send message to WebSocket");
                break;
            }
            Err(_elapsed) => {
                tracing::debug!(websocket_id = %connection.id, "write deadline exceeded");
                break;
            }
        }
    }
    // The pump owns transport teardown: cancel the connection scope,
    // then close the socket exactly once. Producers whose sends were
    // still queued observe the dropped receiver and give up.
    connection.token.cancel();
    let _ = websocket_sender.close().await;
}
