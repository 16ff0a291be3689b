use thiserror::Error;

/// Errors raised by the monitoring engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Raw transaction payload could not be normalized.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Address supplied to the control API is not a hex address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Address is not tracked.
    #[error("not found: {0}")]
    NotFound(String),

    /// Subscriber queue is saturated. Never surfaced to subscribers.
    #[error("subscriber {0} overloaded")]
    SubscriberOverloaded(u64),

    /// The dispatcher no longer accepts subscribers.
    #[error("dispatcher closed")]
    DispatcherClosed,

    /// Internal invariant violated; the affected shard must halt.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("feed error: {0}")]
    Feed(#[from] zmq::Error),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
