use thiserror::Error;

/// Raised while turning a line from the worker channel into a frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope carries no protocol version")]
    MissingVersion,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u64),
}

/// Errors an addon implementation returns from its own code.
#[derive(Debug, Error)]
pub enum AddonError {
    #[error("unknown callback '{0}'")]
    UnknownCallback(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors seen by whoever drives an addon through its handle.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(
        "call '{callback}' on addon '{addon}' timed out after {timeout_ms} ms ({consecutive} in a row)"
    )]
    Timeout {
        addon: String,
        callback: String,
        timeout_ms: u64,
        consecutive: u32,
    },
    #[error("addon '{0}' is not running")]
    NotRunning(String),
    #[error("channel to addon '{0}' closed")]
    ChannelClosed(String),
    #[error("{0}")]
    Callback(String),
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error("invalid addon info: {0}")]
    InvalidInfo(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("failed to spawn worker for '{addon}'")]
    Spawn {
        addon: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<AddonError> for HostError {
    fn from(err: AddonError) -> Self {
        HostError::Callback(err.to_string())
    }
}
