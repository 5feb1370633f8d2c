use std::sync::Arc;

use serde_json::value::RawValue;

use super::types::{ErrorPayload, OperationId, ServerMessage};
use crate::metrics::WebSocketMetrics;
use crate::service::GraphQlService;
use crate::websocket::types as ws;

/// Shape check for the init payload. The fields themselves are opaque
/// to the server; the raw bytes flow to operations as the connection
/// header.
type InitPayload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
#[error("invalid payload for type: connection_init")]
struct InvalidInitPayload;

/// Handles the connection initialization message from the client.
///
/// A valid payload is acknowledged with `connection_ack` and retained
/// as the connection header. Re-initialization is allowed: each
/// `connection_init` overwrites the header and is acknowledged again.
pub(crate) async fn handle_connection_init<S, M>(
    connection: &ws::Connection<S, M>,
    payload: Option<Box<RawValue>>,
) where
    S: GraphQlService,
    M: WebSocketMetrics,
{
    match validate(payload) {
        Ok(header) => {
            connection.set_header(header).await;
            connection.send(ServerMessage::ConnectionAck).await;
        }
        Err(err) => {
            connection
                .send(ServerMessage::ConnectionError {
                    id: OperationId::default(),
                    payload: ErrorPayload::new(err),
                })
                .await;
        }
    }
}

/// The payload must be present and be a JSON object (or `null`);
/// anything else is a protocol error reported on the open connection.
fn validate(payload: Option<Box<RawValue>>) -> Result<Arc<RawValue>, InvalidInitPayload> {
    let raw = payload.ok_or(InvalidInitPayload)?;
    serde_json::from_str::<Option<InitPayload>>(raw.get()).map_err(|_| InvalidInitPayload)?;
    Ok(Arc::from(raw))
}
