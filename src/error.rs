use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("probe via {egress} timed out after {}ms", timeout.as_millis())]
    ProbeTimeout { egress: String, timeout: Duration },

    #[error("probe via {egress} failed: {reason}")]
    ProbeFailure { egress: String, reason: String },

    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    #[error("unknown proxy profile `{0}`")]
    UnknownProfile(String),

    #[error("unknown probe target `{0}`")]
    UnknownTarget(String),

    #[error("channel `{0}` is already running")]
    AlreadyRunning(String),

    #[error("channel `{0}` is not running")]
    NotRunning(String),

    #[error("channel `{channel}` produced no output within {}ms", timeout.as_millis())]
    StartupTimeout { channel: String, timeout: Duration },

    #[error("channel `{channel}` crashed {crashes} times within the retry window")]
    CrashLoopExceeded { channel: String, crashes: u32 },

    #[error("`{0}` did not exit before the shutdown deadline")]
    ShutdownTimeout(String),

    #[error("failed to spawn worker for `{channel}`: {source}")]
    Spawn {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error("insufficient system memory ({available_kb} KB available)")]
    InsufficientMemory { available_kb: u64 },

    #[error("configuration store error: {0}")]
    Store(#[from] anyhow::Error),
}
