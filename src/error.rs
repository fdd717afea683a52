//! Error Types

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Provider request failed: HTTP {code} - {body}")]
    Provider { code: u16, body: String },

    #[error("Resource not provisioned: {0}")]
    ResourceNotProvisioned(String),

    #[error("Timed out waiting for {what} after {}s", .after.as_secs())]
    TimedOut { what: String, after: Duration },

    #[error("Remote execution failed on {host}: {reason}")]
    Execution { host: String, reason: String },

    #[error("Remote command exited with {exit_status} on {host}: {command}")]
    CommandFailed {
        host: String,
        command: String,
        exit_status: u32,
        stderr: String,
    },

    #[error("Failed to trigger job {job}: {reason}")]
    Trigger { job: String, reason: String },

    #[error("Failed to create agent node {node}: {reason}")]
    NodeCreation { node: String, reason: String },

    #[error("Build {job}#{build} finished with status {status}")]
    BuildFailed {
        job: String,
        build: u64,
        status: String,
    },

    #[error("CI server request failed: HTTP {code} - {body}")]
    Ci { code: u16, body: String },

    #[error("DNS request failed: HTTP {code} - {body}")]
    Dns { code: u16, body: String },

    #[error("DNS zone not found: {0}")]
    ZoneNotFound(String),

    #[error("Failed to resolve {domain}: {reason}")]
    Resolve { domain: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Phase {phase} failed: {source}")]
    Phase {
        phase: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn execution(host: &str, reason: impl std::fmt::Display) -> Self {
        Error::Execution {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn in_phase(self, phase: &'static str) -> Self {
        match self {
            already @ Error::Phase { .. } => already,
            other => Error::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping phase wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::Provider { code: 404, .. } | Error::Dns { code: 404, .. } | Error::Ci { code: 404, .. }
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::Serialization(_) => 1,
            Error::Configuration(_) => 2,
            Error::Provider { .. } => 10,
            Error::ResourceNotProvisioned(_) => 11,
            Error::TimedOut { .. } => 20,
            Error::Execution { .. } => 30,
            Error::CommandFailed { .. } => 31,
            Error::Ci { .. } => 40,
            Error::Trigger { .. } => 41,
            Error::NodeCreation { .. } => 42,
            Error::BuildFailed { .. } => 43,
            Error::Dns { .. } => 50,
            Error::ZoneNotFound(_) => 51,
            Error::Resolve { .. } => 52,
            Error::Http(_) => 60,
            Error::Phase { source, .. } => source.exit_code(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::Provider { .. } => "provider_error",
            Error::ResourceNotProvisioned(_) => "resource_not_provisioned",
            Error::TimedOut { .. } => "timed_out",
            Error::Execution { .. } => "execution_error",
            Error::CommandFailed { .. } => "command_failed",
            Error::Trigger { .. } => "trigger_error",
            Error::NodeCreation { .. } => "node_creation_error",
            Error::BuildFailed { .. } => "build_failed",
            Error::Ci { .. } => "ci_error",
            Error::Dns { .. } => "dns_error",
            Error::ZoneNotFound(_) => "zone_not_found",
            Error::Resolve { .. } => "resolve_error",
            Error::Configuration(_) => "configuration_error",
            Error::Http(_) => "http_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Phase { source, .. } => source.kind(),
        }
    }

    pub fn phase(&self) -> Option<&'static str> {
        match self {
            Error::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
