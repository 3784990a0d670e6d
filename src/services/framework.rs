//! Service Framework
//!
//! Provides the core pieces for running background services:
//! - Service trait for implementing custom services
//! - Graceful shutdown via a broadcast channel

use tokio::sync::broadcast;

/// Trait for implementing background services
///
/// Services are long-running background tasks that perform maintenance or
/// other periodic operations.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Start the service
    ///
    /// This method should initialize the service and begin its main loop.
    /// It should respect the shutdown signal for graceful termination.
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Get the service name for logging and identification
    fn name(&self) -> &'static str;

    /// Get the current status of the service
    fn status(&self) -> ServiceStatus;
}

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Service is running normally
    Running,

    /// Service has stopped
    Stopped,

    /// Service failed with an error
    Failed(String),
}

impl ServiceStatus {
    /// Check if the service is in a healthy state
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }

    /// Check if the service has stopped (normally or due to failure)
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

/// Errors that can occur in services
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Service failed during initialization phase
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    /// Service encountered an error during execution
    #[error("Service runtime error: {0}")]
    RuntimeError(String),

    /// Service failed to shut down cleanly
    #[error("Service shutdown error: {0}")]
    ShutdownError(String),
}
