//! Remote Execution Channel
//!
//! Run commands and upload files on a provisioned host. Sessions connect on
//! first use and are kept by a `ChannelPool` so every command against the same
//! host reuses one connection.

mod ssh;

pub use ssh::{SshCredential, SshFactory, SshSession};

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the remote side closed the channel without reporting one.
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

#[async_trait]
pub trait RemoteChannel: Send {
    fn host(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Run one command. Only transport problems are errors; a non-zero exit
    /// status and any stderr output come back in the `CommandOutput`.
    async fn run(&mut self, command: &str) -> Result<CommandOutput>;

    async fn copy_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Safe in any state, any number of times. A later `run` reconnects.
    async fn close(&mut self);
}

/// Builds unconnected channels for a host.
pub trait ChannelFactory: Send + Sync {
    fn open(&self, host: &str) -> Box<dyn RemoteChannel>;

    /// Identity of the credential the factory's channels authenticate with.
    fn credential_id(&self) -> String;
}

/// Run `command` and turn a non-zero exit status into `CommandFailed`.
/// Stderr alone never fails a command.
pub async fn run_checked(channel: &mut dyn RemoteChannel, command: &str) -> Result<CommandOutput> {
    let output = channel.run(command).await?;
    if !output.stderr.trim().is_empty() {
        debug!(host = channel.host(), stderr = %output.stderr.trim(), "remote stderr");
    }
    match output.exit_status {
        Some(0) => Ok(output),
        status => Err(Error::CommandFailed {
            host: channel.host().to_string(),
            command: command.to_string(),
            // a missing status is reported as 255 like OpenSSH does
            exit_status: status.unwrap_or(255),
            stderr: output.stderr,
        }),
    }
}

/// At most one live channel per (host, credential).
pub struct ChannelPool {
    factory: Arc<dyn ChannelFactory>,
    sessions: HashMap<(String, String), Box<dyn RemoteChannel>>,
}

impl ChannelPool {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
        }
    }

    pub fn session(&mut self, host: &str) -> &mut dyn RemoteChannel {
        let key = (host.to_string(), self.factory.credential_id());
        let factory = &self.factory;
        self.sessions
            .entry(key)
            .or_insert_with(|| {
                debug!(host, "new remote channel");
                factory.open(host)
            })
            .as_mut()
    }

    pub fn connected_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.host().to_string())
            .collect();
        hosts.sort();
        hosts
    }

    pub async fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            if session.is_connected() {
                info!(host = session.host(), "closing remote channel");
            }
            session.close().await;
        }
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        let open = self.sessions.values().filter(|s| s.is_connected()).count();
        if open > 0 {
            warn!(open, "channel pool dropped with live sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedChannel {
        host: String,
        connected: bool,
        opened: Arc<Mutex<Vec<String>>>,
        exit_status: Option<u32>,
    }

    #[async_trait]
    impl RemoteChannel for ScriptedChannel {
        fn host(&self) -> &str {
            &self.host
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn run(&mut self, _command: &str) -> Result<CommandOutput> {
            if !self.connected {
                self.opened.lock().unwrap().push(self.host.clone());
                self.connected = true;
            }
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: "WARNING: apt does not have a stable CLI interface".to_string(),
                exit_status: self.exit_status,
            })
        }

        async fn copy_file(&mut self, _local_path: &Path, _remote_path: &str) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) {
            self.connected = false;
        }
    }

    struct ScriptedFactory {
        opened: Arc<Mutex<Vec<String>>>,
        exit_status: Option<u32>,
    }

    impl ChannelFactory for ScriptedFactory {
        fn open(&self, host: &str) -> Box<dyn RemoteChannel> {
            Box::new(ScriptedChannel {
                host: host.to_string(),
                connected: false,
                opened: self.opened.clone(),
                exit_status: self.exit_status,
            })
        }

        fn credential_id(&self) -> String {
            "root@test".to_string()
        }
    }

    fn pool(exit_status: Option<u32>) -> (ChannelPool, Arc<Mutex<Vec<String>>>) {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let factory = ScriptedFactory {
            opened: opened.clone(),
            exit_status,
        };
        (ChannelPool::new(Arc::new(factory)), opened)
    }

    #[tokio::test]
    async fn test_session_reused_per_host() {
        let (mut pool, opened) = pool(Some(0));
        run_checked(pool.session("10.0.0.1"), "true").await.unwrap();
        run_checked(pool.session("10.0.0.1"), "true").await.unwrap();
        run_checked(pool.session("10.0.0.2"), "true").await.unwrap();

        assert_eq!(*opened.lock().unwrap(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(pool.connected_hosts(), vec!["10.0.0.1", "10.0.0.2"]);

        pool.close_all().await;
        assert!(pool.connected_hosts().is_empty());
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_stderr_is_not_failure() {
        let (mut pool, _) = pool(Some(0));
        let output = run_checked(pool.session("h"), "apt-get update").await.unwrap();
        assert!(output.success());
        assert!(!output.stderr.is_empty());
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_exit_status_is_the_signal() {
        let (mut pool, _) = pool(Some(100));
        let err = run_checked(pool.session("h"), "apt-get install nope").await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { exit_status: 100, .. }));

        let (mut pool, _) = self::pool(None);
        let err = run_checked(pool.session("h"), "reboot").await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { exit_status: 255, .. }));
        pool.close_all().await;
    }
}
