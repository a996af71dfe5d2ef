/// Faults of the live pipeline itself.
///
/// Grammar and parse failures are not errors at this level: they are
/// classified into a [`crate::ParseResult`] by the parser cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveError {
    /// The worker pool has been shut down and accepts no more work.
    #[error("worker pool is closed")]
    WorkerPoolClosed,

    /// A reaper pass could not take the session map lock in time.
    #[error("session map lock not acquired within {timeout_ms} ms")]
    ReaperBusy { timeout_ms: u64 },

    /// The caller cancelled the request before it produced a result.
    #[error("request cancelled")]
    Cancelled,

    /// Input rejected before any work was done.
    #[error("validation error: {0}")]
    Validation(String),
}

pub type LiveResult<T> = Result<T, LiveError>;
