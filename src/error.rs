//! Error types for the offline worker.

/// Top-level error type for the cache and reminder engines.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Network fetch failed before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// Cache storage read/write/delete failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Generation activation could not complete; the previous generation stays current.
    #[error("activation error: {0}")]
    Activation(String),

    /// Both network and cache failed for a request that must not be faked.
    #[error("offline: {0}")]
    Offline(String),

    /// Malformed or unusable client message.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Alarm spec whose fire time cannot be resolved.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Alarm fire time lies past the scheduling horizon.
    #[error("alarm {id} is {delay_secs}s away, beyond the {horizon_secs}s horizon")]
    BeyondHorizon {
        /// Rejected alarm id.
        id: String,
        /// Computed delay until fire.
        delay_secs: i64,
        /// Configured horizon.
        horizon_secs: i64,
    },

    /// No pending or recently fired alarm with this id.
    #[error("unknown alarm: {0}")]
    UnknownAlarm(String),

    /// Notification surface refused to show or close a notification.
    #[error("notification error: {0}")]
    Notification(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, WorkerError>;
