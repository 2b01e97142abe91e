use std::fmt;

/// Crate-wide error type. Every variant maps to one of the documented
/// failure classifications, and `Display` prefixes the message with it so
/// operators can grep logs by kind while scripts read the exit code.
#[derive(Debug)]
pub enum FlintrockError {
    /// Invalid user input. Reported before any side effect.
    Config(String),
    /// A cloud provider API call failed.
    Provider(String),
    /// SSH connect or reachability probe failed beyond its retry budget.
    Network(String),
    /// A remote command returned non-zero and the caller deemed it fatal.
    RemoteCommand {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },
    /// The cluster came up but a service never reached healthy state.
    HealthCheck(String),
    /// The requested operation does not apply to the cluster's current state.
    WrongState(String),
    /// Provider metadata cannot be reconciled to a legal cluster model.
    InconsistentCluster(String),
    /// An outbound HTTP call failed (health probe, GitHub API, IP discovery).
    Http(reqwest::Error),
}

pub type Result<T> = std::result::Result<T, FlintrockError>;

impl FlintrockError {
    /// Process exit code for this error: 2 for bad input, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            FlintrockError::Config(_) => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for FlintrockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlintrockError::Config(msg) => write!(f, "config-error: {}", msg),
            FlintrockError::Provider(msg) => write!(f, "provider-error: {}", msg),
            FlintrockError::Network(msg) => write!(f, "network-error: {}", msg),
            FlintrockError::RemoteCommand {
                host,
                command,
                exit_code,
                stderr,
            } => write!(
                f,
                "remote-command-error: host={}, exit={}, command={}, stderr={}",
                host,
                exit_code,
                command,
                stderr.trim()
            ),
            FlintrockError::HealthCheck(msg) => write!(f, "health-check-failed: {}", msg),
            FlintrockError::WrongState(msg) => write!(f, "wrong-state: {}", msg),
            FlintrockError::InconsistentCluster(msg) => {
                write!(f, "inconsistent-cluster: {}", msg)
            }
            FlintrockError::Http(e) => write!(f, "network-error: {}", e),
        }
    }
}

impl std::error::Error for FlintrockError {}

impl From<reqwest::Error> for FlintrockError {
    fn from(e: reqwest::Error) -> Self {
        FlintrockError::Http(e)
    }
}
