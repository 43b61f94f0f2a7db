use thiserror::Error;

/// Host callbacks report failures with the userland error type.
pub use anyhow::Error as HostError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Couldn't parse workflow.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Workflow must be an object of nodes, found {0}")]
    Shape(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse configuration.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Configuration field '{0}' must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Interceptor is not installed")]
    NotInstalled,
}
