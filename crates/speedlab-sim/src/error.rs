//! Error taxonomy for topology declaration and live sessions.

use thiserror::Error;

use crate::session::SessionState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ── Declaration errors ──────────────────────────────────────────────

/// A malformed topology or lab configuration. Always raised before any
/// live resource is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("endpoint name must not be empty")]
    EmptyEndpointName,
    #[error("invalid endpoint name {name:?}: only ASCII letters, digits and '_' are allowed")]
    InvalidEndpointName { name: String },
    #[error("endpoint {name} declared more than once")]
    DuplicateEndpoint { name: String },
    #[error("link {link} references undeclared endpoint {endpoint}")]
    UndeclaredEndpoint { link: usize, endpoint: String },
    #[error("link {link} connects endpoint {endpoint} to itself")]
    SelfLink { link: usize, endpoint: String },
    #[error("link {link} has zero bandwidth")]
    ZeroBandwidth { link: usize },
    #[error("interface name {name} exceeds {max} bytes")]
    InterfaceNameTooLong { name: String, max: usize },
    #[error("{count} endpoints declared, at most {max} can be addressed")]
    TooManyEndpoints { count: usize, max: usize },
    #[error("workload {workload} targets undeclared endpoint {endpoint}")]
    UnknownWorkloadEndpoint { workload: String, endpoint: String },
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// ── Session errors ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("interface {interface} not found on endpoint {endpoint}")]
    InterfaceNotFound { endpoint: String, interface: String },

    #[error(
        "command `{command}` on {endpoint} failed ({}): {}",
        describe_status(.status),
        .stderr.trim()
    )]
    CommandExecution {
        endpoint: String,
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("failed to allocate {resource}: {reason}")]
    ResourceAllocation { resource: String, reason: String },

    #[error("failed to spawn {label} on {endpoint}: {reason}")]
    Spawn {
        endpoint: String,
        label: String,
        reason: String,
    },

    #[error("{operation} is not allowed in session state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error came from starting a background process. Those
    /// are reported but never abort a session.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, Error::Spawn { .. })
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}
