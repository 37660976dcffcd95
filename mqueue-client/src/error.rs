//! Error types for the MQueue client library

use mqueue::{ConnectionError, ErrorCode, Transient};

/// Main error type for MQueue client operations
#[derive(Debug, thiserror::Error)]
pub enum MqClientError {
    /// Transport or handshake failure on an established connection
    #[error("Connection error: {0}")]
    Connection(ConnectionError),

    /// The TCP connection could not be established
    #[error("Failed to connect to {broker}: {source}")]
    Connect {
        broker: String,
        #[source]
        source: std::io::Error,
    },

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Payload larger than the limit negotiated with the broker
    #[error("Message size {size} exceeds maximum {max_size}")]
    MessageTooLarge { size: usize, max_size: usize },

    /// The broker answered a request with an error packet
    #[error("Broker error ({code:?}): {message}")]
    Broker { code: ErrorCode, message: String },

    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Broker not available
    #[error("No available brokers")]
    NoBrokersAvailable,

    /// A retried operation ran out of attempts
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: Box<MqClientError>,
    },
}

impl MqClientError {
    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Convert an error packet from the broker
    pub fn from_broker(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Broker {
            code,
            message: message.into(),
        }
    }

    /// The broker error code, if the broker reported this error
    pub fn broker_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Broker { code, .. } => Some(*code),
            Self::Exhausted { last_error, .. } => last_error.broker_code(),
            _ => None,
        }
    }

    /// Check if this error is retryable
    ///
    /// Transport failures are; anything the broker rejected on its merits,
    /// and anything the client refused to send, is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_transient(),
            Self::Connect { .. } => true,
            Self::Timeout { .. } => true,
            Self::NoBrokersAvailable => true,
            Self::Broker { code, .. } => *code == ErrorCode::ShuttingDown,
            _ => false,
        }
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Connect { .. } | Self::NoBrokersAvailable
        )
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection(ConnectionError::Timeout { .. })
        )
    }

    /// Permanent refusals of a well-formed request: the payload or the queue
    /// state, not the client, is at fault.
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::MessageTooLarge { .. } => true,
            Self::Broker { code, .. } => matches!(
                code,
                ErrorCode::QueueFull
                    | ErrorCode::MessageTooLarge
                    | ErrorCode::InvalidPriority
                    | ErrorCode::InvalidMessage
                    | ErrorCode::DuplicateMessage
            ),
            _ => false,
        }
    }
}

impl From<ConnectionError> for MqClientError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Oversize { size, max_size } => {
                Self::MessageTooLarge { size, max_size }
            }
            ConnectionError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            other => Self::Connection(other),
        }
    }
}

impl Transient for MqClientError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}
