use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::value::RawValue;
use smol_str::SmolStr;
use tokio::sync::{mpsc::Sender, RwLock};
use tokio_util::sync::CancellationToken;

use crate::operation::OperationHandle;
use crate::protocol::types as protocol;

/// Default cap on the size of one inbound frame.
pub static DEFAULT_READ_LIMIT: usize = 4096;

/// Default per-write deadline. Also bounds how long the execution
/// service may take to establish a subscription.
pub static DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Context required to handle a WebSocket connection
pub struct Context<S, M> {
    /// Executes the GraphQL operations multiplexed on the connection.
    pub service: Arc<S>,
    pub metrics: M,
    /// Maximum accepted inbound frame size, in bytes.
    pub read_limit: usize,
    /// Deadline for each outbound write, and the subscription setup
    /// timeout.
    pub write_timeout: Duration,
}

impl<S, M> Context<S, M> {
    pub fn new(service: Arc<S>, metrics: M) -> Self {
        Self {
            service,
            metrics,
            read_limit: DEFAULT_READ_LIMIT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_read_limit(mut self, read_limit: usize) -> Self {
        self.read_limit = read_limit;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

// Cheap to clone: the service is behind an `Arc`.
impl<S, M: Clone> Clone for Context<S, M> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            metrics: self.metrics.clone(),
            read_limit: self.read_limit,
            write_timeout: self.write_timeout,
        }
    }
}

/// Represents a WebSocket connection ID.
#[derive(Clone, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub struct WebSocketId(SmolStr);

impl WebSocketId {
    /// Creates a new WebSocket connection ID.
    pub fn new() -> Self {
        Self(SmolStr::new(uuid::Uuid::new_v4().to_string()))
    }
}

impl Default for WebSocketId {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutable and free clone-able collection of WebSocket connections.
pub struct Connections<S, M>(pub Arc<RwLock<HashMap<WebSocketId, Connection<S, M>>>>);

impl<S, M> Connections<S, M> {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(HashMap::new())))
    }

    pub(crate) async fn new_connection(
        &self,
        id: WebSocketId,
        context: Context<S, M>,
        channel: Sender<protocol::ServerMessage>,
    ) -> Connection<S, M>
    where
        M: Clone,
    {
        let new_connection = Connection::new(id, context, channel);
        let mut map = self.0.write().await;
        map.insert(new_connection.id.clone(), new_connection.clone());
        new_connection
    }

    pub(crate) async fn drop(&self, id: &WebSocketId) {
        let mut map = self.0.write().await;
        if let Some(connection) = map.remove(id) {
            // Cancel any operations still live when the connection ends
            connection.drain_operations().await;
        }
    }
}

impl<S, M> Clone for Connections<S, M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<S, M> Default for Connections<S, M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents an internal WebSocket connection.
/// Designed for efficient cloning, as all contained fields are inexpensive to clone.
pub struct Connection<S, M> {
    // Unique WebSocket connection ID
    pub id: WebSocketId,
    // Shared connection context
    pub context: Context<S, M>,
    // Cancellation scope for the whole connection; operations run in
    // child scopes of this token
    pub token: CancellationToken,
    // Raw payload of the most recent connection_init, handed to every
    // operation started afterwards. Written only by the reader task.
    pub header: Arc<RwLock<Option<Arc<RawValue>>>>,
    // Channel for sending messages over the WebSocket
    pub send_channel: Sender<protocol::ServerMessage>,
    // Live operations keyed by their client-chosen id. A connection can
    // have multiple active subscriptions.
    pub operations: Arc<RwLock<HashMap<protocol::OperationId, OperationHandle>>>,
}

impl<S, M> Connection<S, M> {
    fn new(
        id: WebSocketId,
        context: Context<S, M>,
        channel: Sender<protocol::ServerMessage>,
    ) -> Self {
        Self {
            id,
            context,
            token: CancellationToken::new(),
            header: Arc::new(RwLock::new(None)),
            send_channel: channel,
            operations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sends a message over the WebSocket.
    /// If the writer pump has stopped, the message is silently dropped;
    /// producers never block on a dying connection.
    pub async fn send(&self, message: protocol::ServerMessage) {
        let _ = self.send_channel.send(message).await;
    }

    pub(crate) async fn set_header(&self, header: Arc<RawValue>) {
        *self.header.write().await = Some(header);
    }

    pub(crate) async fn header(&self) -> Option<Arc<RawValue>> {
        self.header.read().await.clone()
    }

    /// Checks if an operation exists for the given operation ID.
    pub(crate) async fn operation_exists(&self, key: &protocol::OperationId) -> bool {
        let map = self.operations.read().await;
        map.contains_key(key)
    }

    /// Registers an operation under the given ID. Returns false when
    /// the ID is already taken, leaving the existing operation alone.
    pub(crate) async fn insert_operation(
        &self,
        key: protocol::OperationId,
        handle: OperationHandle,
    ) -> bool {
        let mut map = self.operations.write().await;
        match map.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(handle);
                true
            }
        }
    }

    /// Removes and returns the operation handle for the given ID, if
    /// one is live.
    pub(crate) async fn take_operation(
        &self,
        key: &protocol::OperationId,
    ) -> Option<OperationHandle> {
        let mut map = self.operations.write().await;
        map.remove(key)
    }

    /// Cancels every live operation. The registry is inert afterwards.
    pub(crate) async fn drain_operations(&self) {
        let mut map = self.operations.write().await;
        for (_, handle) in map.drain() {
            handle.cancel();
        }
    }
}

impl<S, M: Clone> Clone for Connection<S, M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            context: self.context.clone(),
            token: self.token.clone(),
            header: self.header.clone(),
            send_channel: self.send_channel.clone(),
            operations: self.operations.clone(),
        }
    }
}
