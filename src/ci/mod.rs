//! CI Orchestrator
//!
//! Drives the CI server once it is installed: confirm it answers with the
//! configured credentials, trigger a job, follow it from queued to a terminal
//! result, and register agents as build nodes.

mod jenkins;

pub use jenkins::{JenkinsClient, JenkinsConnector};

use crate::error::{Error, Result};
use crate::readiness::{CondCheckError, PollPolicy, await_condition};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A build node the controller should launch over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentNode {
    pub name: String,
    pub host: String,
    pub credentials_id: String,
    pub label: String,
    pub remote_fs: String,
    pub executors: u32,
}

impl AgentNode {
    pub fn new(name: &str, host: &str, credentials_id: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            credentials_id: credentials_id.to_string(),
            label: label.to_string(),
            remote_fs: "/home/ubuntu".to_string(),
            executors: 2,
        }
    }
}

/// Raw CI server API.
#[async_trait]
pub trait CiServer: Send + Sync {
    fn url(&self) -> &str;

    /// Name of the authenticated user.
    async fn whoami(&self) -> Result<String>;

    async fn trigger_job(&self, job: &str) -> Result<()>;

    /// `None` until the job has ever been scheduled.
    async fn last_build_number(&self, job: &str) -> Result<Option<u64>>;

    /// `None` while the build is still running.
    async fn build_result(&self, job: &str, build: u64) -> Result<Option<String>>;

    async fn create_node(&self, node: &AgentNode) -> Result<()>;
}

/// Produces a `CiServer` for a base URL that is only known once the
/// controller has an address.
pub trait CiConnector: Send + Sync {
    fn server(&self, base_url: &str) -> Result<Arc<dyn CiServer>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failure,
    Other(String),
}

impl BuildStatus {
    pub fn from_result(result: Option<&str>) -> Self {
        match result {
            None => BuildStatus::Running,
            Some("SUCCESS") => BuildStatus::Success,
            Some("FAILURE") => BuildStatus::Failure,
            Some(other) => BuildStatus::Other(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Pending | BuildStatus::Running)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Pending => write!(f, "PENDING"),
            BuildStatus::Running => write!(f, "RUNNING"),
            BuildStatus::Success => write!(f, "SUCCESS"),
            BuildStatus::Failure => write!(f, "FAILURE"),
            BuildStatus::Other(label) => write!(f, "{}", label),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRun {
    pub job: String,
    pub build_number: Option<u64>,
    pub status: BuildStatus,
}

impl BuildRun {
    pub fn pending(job: &str) -> Self {
        Self {
            job: job.to_string(),
            build_number: None,
            status: BuildStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CiPolicy {
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub build_number: PollPolicy,
    pub build_status: PollPolicy,
}

impl Default for CiPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            connect_delay: Duration::from_secs(10),
            build_number: PollPolicy::from_secs(300, 2),
            build_status: PollPolicy::from_secs(300, 2),
        }
    }
}

/// A CI server that answered an authenticated request.
pub struct CiOrchestrator {
    server: Arc<dyn CiServer>,
    policy: CiPolicy,
}

impl CiOrchestrator {
    /// Retry the identity check with a fixed delay; a freshly started
    /// controller refuses connections for a while.
    pub async fn connect(server: Arc<dyn CiServer>, policy: CiPolicy) -> Result<Self> {
        let attempts = policy.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match server.whoami().await {
                Ok(user) => {
                    info!(url = server.url(), %user, attempt, "connected to CI server");
                    return Ok(Self { server, policy });
                }
                Err(e) => {
                    warn!(url = server.url(), attempt, attempts, error = %e, "CI server not reachable");
                    if attempt < attempts {
                        tokio::time::sleep(policy.connect_delay).await;
                    }
                }
            }
        }

        Err(Error::TimedOut {
            what: format!("CI server at {} ({} attempts)", server.url(), attempts),
            after: policy.connect_delay * (attempts - 1),
        })
    }

    pub async fn trigger_job(&self, job: &str) -> Result<BuildRun> {
        self.server.trigger_job(job).await.map_err(|e| Error::Trigger {
            job: job.to_string(),
            reason: e.to_string(),
        })?;
        info!(job, "job triggered");
        Ok(BuildRun::pending(job))
    }

    /// Latest build of `job` before anything is triggered. Failed reads are
    /// retried; a not-found answer means the job has no builds yet.
    pub async fn await_last_build(&self, job: &str) -> Result<Option<u64>> {
        let server = &self.server;
        await_condition(
            &format!("last build of {}", job),
            self.policy.build_number,
            move || async move {
                match server.last_build_number(job).await {
                    Ok(number) => Ok(number),
                    Err(err) if err.is_not_found() => Ok(None),
                    Err(err) => Err(CondCheckError::Transient(err)),
                }
            },
        )
        .await
    }

    /// Wait for the job to report a build number newer than `after`.
    pub async fn await_build_number(&self, job: &str, after: Option<u64>) -> Result<u64> {
        let server = &self.server;
        await_condition(
            &format!("build number of {}", job),
            self.policy.build_number,
            move || async move {
                match server.last_build_number(job).await? {
                    Some(number) if after.is_none_or(|prev| number > prev) => Ok(number),
                    _ => Err(CondCheckError::NotYet),
                }
            },
        )
        .await
    }

    pub async fn await_terminal_status(&self, job: &str, build: u64) -> Result<BuildStatus> {
        let server = &self.server;
        await_condition(
            &format!("{}#{} to finish", job, build),
            self.policy.build_status,
            move || async move {
                let status = BuildStatus::from_result(server.build_result(job, build).await?.as_deref());
                if status.is_terminal() {
                    Ok(status)
                } else {
                    Err(CondCheckError::NotYet)
                }
            },
        )
        .await
    }

    /// Trigger `job`, follow it to completion and fail unless it succeeded.
    pub async fn run_validation_job(&self, job: &str) -> Result<BuildRun> {
        let previous = self.await_last_build(job).await?;
        let mut run = self.trigger_job(job).await?;

        let number = self.await_build_number(job, previous).await?;
        run.build_number = Some(number);
        run.status = BuildStatus::Running;
        info!(job, build = number, "build started");

        run.status = self.await_terminal_status(job, number).await?;
        info!(job, build = number, status = %run.status, "build finished");

        if run.status != BuildStatus::Success {
            return Err(Error::BuildFailed {
                job: job.to_string(),
                build: number,
                status: run.status.to_string(),
            });
        }
        Ok(run)
    }

    pub async fn register_agent(&self, node: &AgentNode) -> Result<()> {
        self.server
            .create_node(node)
            .await
            .map_err(|e| Error::NodeCreation {
                node: node.name.clone(),
                reason: e.to_string(),
            })?;
        info!(node = %node.name, host = %node.host, "agent node registered");
        Ok(())
    }
}
