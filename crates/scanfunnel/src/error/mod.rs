use thiserror::Error;

/// Failure conditions of the orchestration core. None of them is fatal to the
/// process; the worst outcome is a skipped stage or cycle.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{tool} requires elevated privileges")]
    PermissionDenied { tool: &'static str },

    #[error("{tool} unavailable: {reason}")]
    AdapterUnavailable { tool: &'static str, reason: String },

    #[error("{tool} protocol error: {reason}")]
    Protocol { tool: &'static str, reason: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl ScanError {
    pub fn unavailable(tool: &'static str, reason: impl Into<String>) -> Self {
        Self::AdapterUnavailable {
            tool,
            reason: reason.into(),
        }
    }

    pub fn protocol(tool: &'static str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            tool,
            reason: reason.into(),
        }
    }

    /// Transient failures that the next scheduled tick is expected to clear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScanError::AdapterUnavailable { .. } | ScanError::Persistence(_)
        )
    }

    /// Failures that keep a stage off until an operator fixes the deployment.
    pub fn disables_stage(&self) -> bool {
        matches!(
            self,
            ScanError::Configuration(_) | ScanError::PermissionDenied { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
