//! Top-level error types for the orchestrator.

use std::path::PathBuf;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and validation errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error("duplicate project key: {0}")]
    DuplicateProjectKey(String),

    #[error("unsupported fork_mode '{0}' (only 'spark_fork' is supported)")]
    UnsupportedForkMode(String),

    #[error("project '{project}' enables unsupported services: {services:?}")]
    UnsupportedServices {
        project: String,
        services: Vec<String>,
    },
}

/// Durable state store errors. `save` errors are always fatal.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to persist state file {path}: {message}")]
    Persist { path: PathBuf, message: String },
}

/// Matrix chat transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat request to {endpoint} failed with status {status}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("chat transport error calling {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to decode chat response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("whoami did not return the bot's identity")]
    IdentityMismatch,

    #[error("no authentication mode configured (need bot_access_token or bot_password)")]
    NoAuthConfigured,

    #[error("password login response missing {0}")]
    LoginResponseMissingField(&'static str),
}

/// Sandbox CLI subprocess errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}` exited with status {exit_code:?}: {output}")]
    NonZeroExit {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("command `{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },
}
