//! Error handling for the powermeter agent.

/// A specialized `Result` type for powermeter operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// The main error type for the pulse-to-metric pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The light sensor could not be read this tick
    #[error("Sensor read failed: {0}")]
    SensorRead(String),

    /// The wireless link could not be associated
    #[error("Association failed: {0}")]
    Association(String),

    /// A push to the aggregator did not succeed
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryFailure),

    /// A durable write of the meter state failed
    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    /// No valid persisted record could be recovered
    #[error("Storage corrupted: {0}")]
    StorageCorrupt(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The metric payload could not be encoded
    #[error("Exposition error: {0}")]
    Exposition(#[from] prometheus::Error),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons a single delivery attempt can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    /// The aggregator could not be reached
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The request did not complete within its deadline
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// The aggregator answered with a non-2xx status
    #[error("server rejected push with HTTP {status}")]
    ServerRejected { status: u16 },
}

impl AgentError {
    /// Create a new sensor read error
    pub fn sensor_error(msg: impl Into<String>) -> Self {
        Self::SensorRead(msg.into())
    }

    /// Create a new association error
    pub fn association_error(msg: impl Into<String>) -> Self {
        Self::Association(msg.into())
    }

    /// Create a new storage write error
    pub fn storage_error(msg: impl Into<String>) -> Self {
        Self::StorageWrite(msg.into())
    }

    /// Create a new storage corruption error
    pub fn corrupt_error(msg: impl Into<String>) -> Self {
        Self::StorageCorrupt(msg.into())
    }

    /// Create a new configuration error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the operation is worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SensorRead(_) | Self::Association(_) | Self::Delivery(_) | Self::StorageWrite(_)
        )
    }
}
