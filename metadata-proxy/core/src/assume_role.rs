use crate::{backoff::Transient, Credentials};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AssumeRoleError {
    #[error("access denied: {0}")]
    Denied(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,
}

/// Exchanges a role for temporary credentials.
#[async_trait::async_trait]
pub trait AssumeRole: Send + Sync {
    async fn assume_role(&self, req: AssumeRoleRequest) -> Result<Credentials, AssumeRoleError>;
}

// === impl AssumeRoleError ===

impl Transient for AssumeRoleError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Transport(_) | Self::Timeout)
    }
}
