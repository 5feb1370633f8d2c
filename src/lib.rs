pub(crate) mod metrics;
pub(crate) mod operation;
pub(crate) mod protocol;
pub(crate) mod service;
pub(crate) mod websocket;

pub use metrics::{NoOpWebSocketMetrics, WebSocketMetrics};
pub use operation::OperationHandle;
pub use protocol::types::OperationId;
pub use service::{GraphQlService, OperationContext};
pub use websocket::{
    WebSocketServer,
    types::{Connection, Connections, Context, WebSocketId},
};

// For tests
pub use protocol::{GRAPHQL_WS_PROTOCOL, types::ServerMessage};
pub use websocket::SEC_WEBSOCKET_PROTOCOL;
