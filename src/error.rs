//! Error types for the dispatch system.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskerError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Messaging error: {0}")]
    MessagingError(String),
    #[error("Orchestration error: {0}")]
    OrchestrationError(String),
    #[error("Scheduling error: {0}")]
    SchedulingError(String),
    #[error("Repository error: {0}")]
    RepositoryError(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TaskerError {
    fn from(error: serde_json::Error) -> Self {
        TaskerError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<MessagingError> for TaskerError {
    fn from(error: MessagingError) -> Self {
        TaskerError::MessagingError(error.to_string())
    }
}

impl From<ConfigurationError> for TaskerError {
    fn from(error: ConfigurationError) -> Self {
        TaskerError::ConfigurationError(error.to_string())
    }
}

impl From<crate::scheduling::cron::CronError> for TaskerError {
    fn from(error: crate::scheduling::cron::CronError) -> Self {
        TaskerError::SchedulingError(error.to_string())
    }
}

pub type TaskerResult<T> = std::result::Result<T, TaskerError>;
