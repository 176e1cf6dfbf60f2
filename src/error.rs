use addon_plugin::HostError;
use thiserror::Error;

/// Failures the host records in dumps and logs.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to load addon '{addon}': {reason}")]
    Load { addon: String, reason: String },

    #[error("addon '{addon}' does not satisfy the addon contract: {reason}")]
    ContractMismatch { addon: String, reason: String },

    #[error("addon '{addon}' requires core {required}, running {host}")]
    VersionMismatch {
        addon: String,
        required: String,
        host: String,
    },

    #[error("addon '{addon}' failed to {transition}: {message}")]
    Transition {
        addon: String,
        transition: String,
        message: String,
    },

    #[error("Unable to find target '{target}' requested by addon '{from}'")]
    TargetNotFound { target: String, from: String },

    #[error("{0}")]
    Application(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("Core.exit: cannot close an uninitialized core")]
    NotInitialized,

    #[error("configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// Stable code written into dump records.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Load { .. } => "E_LOAD",
            AgentError::ContractMismatch { .. } => "E_CONTRACT",
            AgentError::VersionMismatch { .. } => "E_VERSION",
            AgentError::Transition { .. } => "E_TRANSITION",
            AgentError::TargetNotFound { .. } => "E_NOT_FOUND",
            AgentError::Application(_) => "E_APPLICATION",
            AgentError::Host(HostError::Timeout { .. }) => "E_TIMEOUT",
            AgentError::Host(_) => "E_WORKER",
            AgentError::NotInitialized => "E_NOT_INITIALIZED",
            AgentError::Config(_) => "E_CONFIG",
        }
    }
}
