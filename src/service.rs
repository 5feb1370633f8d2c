use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use serde::Serialize;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;

/// Executes GraphQL operations on behalf of the protocol engine.
///
/// The engine never parses, validates, or executes GraphQL itself; it
/// hands the raw request pieces to this service and pumps whatever the
/// returned stream yields back to the client. Queries and mutations are
/// the degenerate case of a stream that yields a single payload and
/// ends.
pub trait GraphQlService: Send + Sync + 'static {
    /// One streamed execution result, serialized into the `data`
    /// message payload.
    type Payload: Serialize + Send + 'static;

    /// Error returned when an operation cannot be established. Its
    /// display form is sent to the client verbatim.
    type Error: std::fmt::Display + Send;

    /// Starts executing an operation. Cancelling `ctx` must cause the
    /// returned stream to terminate.
    fn subscribe(
        &self,
        ctx: OperationContext,
        query: String,
        operation_name: String,
        variables: HashMap<String, serde_json::Value>,
    ) -> impl Future<Output = Result<BoxStream<'static, Self::Payload>, Self::Error>> + Send;
}

/// Per-operation execution context handed to [`GraphQlService::subscribe`].
///
/// Carries the connection header (the raw payload of the most recent
/// `connection_init`, snapshotted when the operation started) and the
/// operation's cancellation scope.
#[derive(Clone)]
pub struct OperationContext {
    header: Option<Arc<RawValue>>,
    token: CancellationToken,
}

impl OperationContext {
    pub(crate) fn new(header: Option<Arc<RawValue>>, token: CancellationToken) -> Self {
        Self { header, token }
    }

    /// Raw JSON of the connection header, for extracting auth or
    /// session metadata. `None` when no `connection_init` preceded the
    /// operation.
    pub fn header(&self) -> Option<&RawValue> {
        self.header.as_deref()
    }

    /// Completes once the operation is cancelled, by a client `stop`,
    /// by `connection_terminate`, or by connection teardown.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
