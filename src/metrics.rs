use crate::websocket::types::WebSocketId;

/// Trait defining metrics tracking behavior for WebSocket connections.
pub trait WebSocketMetrics: Clone + Send + Sync + 'static {
    /// Records the start of a WebSocket connection.
    fn record_connection_init(&self);

    /// Records the termination of a WebSocket connection.
    fn record_connection_drop(&self);

    /// Records the start of an operation on a specific WebSocket.
    fn record_operation_start(&self, websocket_id: &WebSocketId);

    /// Records the stop of an operation on a specific WebSocket.
    fn record_operation_stop(&self, websocket_id: &WebSocketId);
}

/// A no-operation implementation of `WebSocketMetrics`
#[derive(Clone)]
pub struct NoOpWebSocketMetrics;

// Does nothing for all metric recording methods.
impl WebSocketMetrics for NoOpWebSocketMetrics {
    fn record_connection_init(&self) {}
    fn record_connection_drop(&self) {}
    fn record_operation_start(&self, _websocket_id: &WebSocketId) {}
    fn record_operation_stop(&self, _websocket_id: &WebSocketId) {}
}
