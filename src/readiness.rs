//! Readiness Gate
//!
//! One bounded polling loop shared by every "wait until" in the pipeline:
//! instance boot, SSH availability, CI availability, DNS propagation. The
//! condition decides whether a failed check is worth retrying.

use crate::error::{Error, Result};
use crate::inventory::{ResourceHandle, STATUS_RUNNING};
use crate::provider::ProviderClient;
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of one condition check that did not succeed.
#[derive(Debug)]
pub enum CondCheckError {
    /// Predicate evaluated to false.
    NotYet,
    /// Check itself failed; logged and retried until the deadline.
    Transient(Error),
    /// Waiting longer cannot help.
    Failed(Error),
}

impl From<Error> for CondCheckError {
    fn from(err: Error) -> Self {
        CondCheckError::Transient(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn from_secs(timeout: u64, interval: u64) -> Self {
        Self::new(Duration::from_secs(timeout), Duration::from_secs(interval))
    }
}

/// Poll `check` until it yields a value, fails permanently, or `policy.timeout`
/// elapses. The first check runs immediately; the final sleep is clipped to the
/// deadline so the call never blocks past `timeout` plus one check.
pub async fn await_condition<T, F, Fut>(what: &str, policy: PollPolicy, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, CondCheckError>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match check().await {
            Ok(value) => {
                debug!(what, attempt, "condition met");
                return Ok(value);
            }
            Err(CondCheckError::NotYet) => {
                debug!(what, attempt, "condition not met yet");
            }
            Err(CondCheckError::Transient(err)) => {
                warn!(what, attempt, error = %err, "check failed, retrying");
            }
            Err(CondCheckError::Failed(err)) => return Err(err),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::TimedOut {
                what: what.to_string(),
                after: policy.timeout,
            });
        }
        tokio::time::sleep(policy.interval.min(deadline - now)).await;
    }
}

/// Succeeds once the provider reports the instance as running. A not-found
/// answer means the instance was deleted behind our back and ends the wait.
pub async fn instance_running(
    provider: &ProviderClient,
    handle: &ResourceHandle,
) -> std::result::Result<(), CondCheckError> {
    match provider.status(handle).await {
        Ok(status) if status == STATUS_RUNNING => Ok(()),
        Ok(status) => {
            debug!(instance = %handle.name, %status, "instance not running");
            Err(CondCheckError::NotYet)
        }
        Err(err @ Error::ResourceNotProvisioned(_)) => Err(CondCheckError::Failed(err)),
        Err(err) if err.is_not_found() => Err(CondCheckError::Failed(err)),
        Err(err) => Err(CondCheckError::Transient(err)),
    }
}

/// TCP reachability probe.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_open(&self, addr: SocketAddr) -> bool;
}

/// Real TCP connect with its own per-attempt timeout, independent of the
/// gate's interval.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_open(&self, addr: SocketAddr) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

pub async fn port_open(
    probe: &dyn PortProbe,
    addr: SocketAddr,
) -> std::result::Result<(), CondCheckError> {
    if probe.is_open(addr).await {
        Ok(())
    } else {
        Err(CondCheckError::NotYet)
    }
}

/// Succeeds when `url` answers with a status `accept` likes. Transport errors
/// are transient.
pub async fn http_status(
    http: &reqwest::Client,
    url: &str,
    accept: impl Fn(reqwest::StatusCode) -> bool,
) -> std::result::Result<reqwest::StatusCode, CondCheckError> {
    let response = http.get(url).send().await.map_err(Error::from)?;
    let status = response.status();
    if accept(status) {
        Ok(status)
    } else {
        debug!(url, %status, "unexpected status");
        Err(CondCheckError::NotYet)
    }
}
