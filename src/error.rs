use thiserror::Error;

use crate::approval::ApprovalError;
use crate::audit::AuditError;
use crate::egress::EgressError;
use crate::sandbox::SandboxError;

/// Error taxonomy for the core execution envelope (see spec §7).
///
/// `SecretMiss` is deliberately not a variant here: a missing secret is a
/// warning the orchestrator logs and continues past, never a hard error.
#[derive(Debug, Error)]
pub enum AegisError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("policy denied scope {scope}")]
    PolicyDeny { scope: String },

    #[error("user denied execution")]
    UserDeny,

    #[error("lockdown is active; no skill may start")]
    Lockdown,

    #[error("command {0:?} not found in manifest")]
    CommandNotFound(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("execution timed out")]
    Timeout,

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Egress(#[from] EgressError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, AegisError>;
