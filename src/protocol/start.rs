use std::time::Duration;

use futures_util::StreamExt;
use serde_json::value::RawValue;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::types::{ErrorPayload, OperationId, ServerMessage, StartPayload};
use crate::metrics::WebSocketMetrics;
use crate::operation::OperationHandle;
use crate::service::{GraphQlService, OperationContext};
use crate::websocket::types as ws;

#[derive(Debug, thiserror::Error)]
enum StartError {
    #[error("missing ID for start operation")]
    MissingOperationId,
    #[error("duplicate message ID for start operation")]
    DuplicateOperationId,
    #[error("invalid payload for type: start")]
    InvalidPayload,
}

#[derive(Debug, thiserror::Error)]
#[error("server subscription connect timeout after {0:?}")]
struct SetupTimeout(Duration);

/// Handles the start message from the client.
///
/// Rejections (empty id, duplicate id, malformed payload) are reported
/// as `connection_error` without disturbing any running operation. An
/// accepted start registers a cancellation handle under the id and
/// spawns a worker to drive the execution service.
pub(crate) async fn handle_start<S, M>(
    connection: &ws::Connection<S, M>,
    id: OperationId,
    payload: Option<Box<RawValue>>,
) where
    S: GraphQlService,
    M: WebSocketMetrics,
{
    if id.is_empty() {
        return send_start_error(connection, OperationId::default(), StartError::MissingOperationId)
            .await;
    }
    if connection.operation_exists(&id).await {
        return send_start_error(
            connection,
            OperationId::default(),
            StartError::DuplicateOperationId,
        )
        .await;
    }
    // Parse before registering: a failed start never occupies the id.
    let payload = match parse_start_payload(payload) {
        Ok(payload) => payload,
        Err(err) => return send_start_error(connection, id, err).await,
    };

    let token = connection.token.child_token();
    let ctx = OperationContext::new(connection.header().await, token.clone());
    if !connection
        .insert_operation(id.clone(), OperationHandle::new(token.clone()))
        .await
    {
        return send_start_error(
            connection,
            OperationId::default(),
            StartError::DuplicateOperationId,
        )
        .await;
    }
    connection.context.metrics.record_operation_start(&connection.id);
    tracing::debug!(websocket_id = %connection.id, operation_id = %id.0, "operation started");

    let connection = connection.clone();
    tokio::spawn(execute_operation(connection, id, payload, ctx, token));
}

async fn send_start_error<S, M>(
    connection: &ws::Connection<S, M>,
    id: OperationId,
    error: StartError,
) where
    S: GraphQlService,
    M: WebSocketMetrics,
{
    connection
        .send(ServerMessage::ConnectionError {
            id,
            payload: ErrorPayload::new(error),
        })
        .await;
}

fn parse_start_payload(payload: Option<Box<RawValue>>) -> Result<StartPayload, StartError> {
    let raw = payload.ok_or(StartError::InvalidPayload)?;
    let payload = serde_json::from_str::<Option<StartPayload>>(raw.get())
        .map_err(|_| StartError::InvalidPayload)?;
    Ok(payload.unwrap_or_default())
}

/// Drives one operation: establishes the stream against the setup
/// timer, then pumps payloads to the writer until the stream ends or
/// the operation is cancelled.
async fn execute_operation<S, M>(
    connection: ws::Connection<S, M>,
    id: OperationId,
    payload: StartPayload,
    ctx: OperationContext,
    token: CancellationToken,
) where
    S: GraphQlService,
    M: WebSocketMetrics,
{
    // However this task exits, cancel the child scope so the service
    // releases whatever backs the stream.
    let _guard = token.drop_guard();

    let setup_timeout = connection.context.write_timeout;
    let subscribe = connection.context.service.subscribe(
        ctx.clone(),
        payload.query.unwrap_or_default(),
        payload.operation_name.unwrap_or_default(),
        payload.variables.unwrap_or_default(),
    );

    let mut stream = tokio::select! {
        result = subscribe => match result {
            Ok(stream) => stream,
            Err(err) => {
                finish_operation(&connection, &id).await;
                connection
                    .send(ServerMessage::Error {
                        id: id.clone(),
                        payload: ErrorPayload::new(err),
                    })
                    .await;
                connection.send(ServerMessage::Complete { id }).await;
                return;
            }
        },
        () = sleep(setup_timeout) => {
            // The in-flight subscribe call is dropped here; the child
            // scope cancellation tells the service to give up on it.
            finish_operation(&connection, &id).await;
            connection
                .send(ServerMessage::Error {
                    id: id.clone(),
                    payload: ErrorPayload::new(SetupTimeout(setup_timeout)),
                })
                .await;
            connection.send(ServerMessage::Complete { id }).await;
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            // stop, connection_terminate, or connection teardown: exit
            // without emitting further messages for this id.
            () = ctx.cancelled() => return,
            item = stream.next() => match item {
                None => {
                    connection.send(ServerMessage::Complete { id: id.clone() }).await;
                    finish_operation(&connection, &id).await;
                    return;
                }
                Some(payload) => match serde_json::value::to_raw_value(&payload) {
                    // A payload that fails to serialize does not end
                    // the stream.
                    Err(err) => {
                        connection
                            .send(ServerMessage::Error {
                                id: id.clone(),
                                payload: ErrorPayload::new(err),
                            })
                            .await;
                    }
                    Ok(json_payload) => {
                        connection
                            .send(ServerMessage::Data {
                                id: id.clone(),
                                payload: json_payload,
                            })
                            .await;
                    }
                }
            }
        }
    }
}

async fn finish_operation<S, M>(connection: &ws::Connection<S, M>, id: &OperationId)
where
    M: WebSocketMetrics,
{
    if connection.take_operation(id).await.is_some() {
        connection.context.metrics.record_operation_stop(&connection.id);
        tracing::debug!(websocket_id = %connection.id, operation_id = %id.0, "operation finished");
    }
}
