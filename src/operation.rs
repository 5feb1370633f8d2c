use tokio_util::sync::CancellationToken;

/// Cancellation handle for a running operation.
///
/// The registry stores one of these per live operation id. The handle
/// is opaque: callers can only fire it, so workers may be backed by
/// tasks, threads, or cooperative state machines without the registry
/// caring.
pub struct OperationHandle {
    token: CancellationToken,
}

impl OperationHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Cancels the operation. The worker observes the cancellation and
    /// exits without emitting further messages.
    pub(crate) fn cancel(self) {
        self.token.cancel();
    }
}
