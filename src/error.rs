use thiserror::Error;

#[derive(Debug, Error)]
pub enum BgrunError {
    #[error("Unauthorized job execution attempt: {handler}@{method}")]
    Unauthorized { handler: String, method: String },

    #[error("Malformed parameter: {0}")]
    MalformedParam(#[from] ParamError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Raised by the parameter parser before anything touches the stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("`{0}` is not of the form key=value")]
    MissingSeparator(String),

    #[error("`{0}` has an empty parameter name")]
    EmptyName(String),

    #[error("delay of {0}s is out of range")]
    DelayOutOfRange(u64),
}

/// Failure of a single invocation attempt. Every variant counts as a failed
/// attempt and is eligible for retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("unknown handler `{0}`")]
    UnknownHandler(String),

    #[error("unknown method `{method}` on handler `{handler}`")]
    UnknownMethod { handler: String, method: String },

    #[error("missing parameter `{0}`")]
    MissingParameter(String),

    #[error("parameter `{name}` must be {expected}")]
    InvalidParameter { name: String, expected: &'static str },

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row for job {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("could not resolve the current executable: {0}")]
    CurrentExe(std::io::Error),

    #[error("failed to spawn detached process: {0}")]
    Spawn(std::io::Error),
}
