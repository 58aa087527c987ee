//! # Messaging Error Types
//!
//! Structured errors for queue backends, delivery settlement and backend
//! selection, using thiserror instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Messaging error types shared by every queue backend
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Network timeout: operation {operation} timed out after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Invalid receipt for {provider} backend")]
    InvalidReceipt { provider: String },

    #[error("Queue backend is closed: {provider}")]
    Closed { provider: String },

    #[error("Queue manager has not been initialized")]
    NotInitialized,

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue not found error
    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    /// Create a message serialization error
    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    /// Create a message deserialization error
    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    /// Create an invalid receipt error
    pub fn invalid_receipt(provider: impl Into<String>) -> Self {
        Self::InvalidReceipt {
            provider: provider.into(),
        }
    }

    /// Create a closed backend error
    pub fn closed(provider: impl Into<String>) -> Self {
        Self::Closed {
            provider: provider.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a queue creation error
    pub fn queue_creation(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::queue_operation(queue_name, "create", message)
    }

    /// Create a send error
    pub fn send(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::queue_operation(queue_name, "send", message)
    }

    /// Create a receive error
    pub fn receive(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::queue_operation(queue_name, "receive", message)
    }

    /// Create an ack (commit) error
    pub fn ack(
        queue_name: impl Into<String>,
        position: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::queue_operation(queue_name, format!("ack(position={position})"), message)
    }

    /// Create a nack error
    pub fn nack(
        queue_name: impl Into<String>,
        position: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::queue_operation(queue_name, format!("nack(position={position})"), message)
    }

    /// Create a dead-letter error
    pub fn dead_letter(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::queue_operation(queue_name, "dead_letter", message)
    }

    /// Create a queue stats error
    pub fn queue_stats(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::queue_operation(queue_name, "queue_stats", message)
    }

    /// Create a health check error
    pub fn health_check(message: impl Into<String>) -> Self {
        Self::Internal {
            message: format!("health_check: {}", message.into()),
        }
    }

    /// Whether this error came from an unreachable or failed connection
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() || err.is_data() {
            MessagingError::message_deserialization(err.to_string())
        } else {
            MessagingError::message_serialization(err.to_string())
        }
    }
}

impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        MessagingError::connection(format!("RabbitMQ: {err}"))
    }
}

impl From<redis::RedisError> for MessagingError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            MessagingError::connection(format!("Redis: {err}"))
        } else {
            MessagingError::internal(format!("Redis: {err}"))
        }
    }
}

impl From<String> for MessagingError {
    fn from(message: String) -> Self {
        MessagingError::internal(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_operation_helpers() {
        let err = MessagingError::send("builds", "broker unavailable");
        assert_eq!(
            err.to_string(),
            "Queue operation failed: builds: send: broker unavailable"
        );

        let err = MessagingError::ack("builds:p0", "1700000000000-0", "stream gone");
        assert!(err.to_string().contains("ack(position=1700000000000-0)"));
    }

    #[test]
    fn test_connection_classification() {
        assert!(MessagingError::connection("refused").is_connection_error());
        assert!(MessagingError::timeout("connect", 5).is_connection_error());
        assert!(!MessagingError::queue_not_found("builds").is_connection_error());
    }

    #[test]
    fn test_not_initialized_display() {
        assert_eq!(
            MessagingError::NotInitialized.to_string(),
            "Queue manager has not been initialized"
        );
    }

    #[test]
    fn test_serde_json_syntax_error_is_deserialization() {
        let err: MessagingError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, MessagingError::MessageDeserialization { .. }));
    }

    #[test]
    fn test_from_string_converts_to_internal() {
        let err: MessagingError = "boom".to_string().into();
        assert!(matches!(err, MessagingError::Internal { .. }));
    }
}
