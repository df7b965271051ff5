use thiserror::Error;

/// Terminal errors surfaced to producers and attached subscribers.
///
/// Everything here is cloneable so one failure can be fanned out to every
/// sink of a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifoldError {
    /// The batched read or an append against the log failed. Affected
    /// subscribers must reopen from an offset of their choosing.
    #[error("append log unavailable: {0}")]
    StoreUnavailable(String),

    /// Attach was called while the engine was tearing down.
    #[error("attach rejected: engine is shutting down")]
    AttachAfterShutdown,

    /// The subscriber's sink buffer overflowed; its stream was cut rather
    /// than dropping records or stalling other sinks.
    #[error("subscriber too slow: sink buffer overflowed")]
    SinkSaturated,

    /// The engine shut down while the stream was open.
    #[error("engine shut down while the stream was open")]
    Shutdown,
}
