//! SSH transport for `RemoteChannel`, built on russh.

use super::{ChannelFactory, CommandOutput, RemoteChannel};
use crate::error::{Error, Result};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Private key plus the user it logs in as.
pub struct SshCredential {
    user: String,
    key: Arc<KeyPair>,
}

impl SshCredential {
    pub fn from_pem(user: &str, pem: &str) -> Result<Self> {
        let key = russh_keys::decode_secret_key(pem, None)
            .map_err(|e| Error::configuration(format!("invalid SSH private key: {}", e)))?;
        Ok(Self {
            user: user.to_string(),
            key: Arc::new(key),
        })
    }
}

impl std::fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredential")
            .field("user", &self.user)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Freshly booted instances have host keys nobody has seen yet, so every key
/// is accepted and logged.
struct TrustOnFirstUse {
    host: String,
}

#[async_trait]
impl client::Handler for TrustOnFirstUse {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "accepting host key"
        );
        Ok(true)
    }
}

pub struct SshSession {
    host: String,
    port: u16,
    credential: Option<Arc<SshCredential>>,
    connect_timeout: Duration,
    handle: Option<Handle<TrustOnFirstUse>>,
}

impl SshSession {
    pub fn new(
        host: &str,
        port: u16,
        credential: Option<Arc<SshCredential>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            credential,
            connect_timeout,
            handle: None,
        }
    }

    async fn connect(&mut self) -> Result<&Handle<TrustOnFirstUse>> {
        if self.handle.is_none() {
            let credential = self.credential.clone().ok_or_else(|| {
                Error::configuration("no SSH private key configured (set H_SSH_PRIVATE_KEY)")
            })?;
            let config = Arc::new(client::Config {
                inactivity_timeout: Some(Duration::from_secs(3600)),
                ..Default::default()
            });
            let handler = TrustOnFirstUse {
                host: self.host.clone(),
            };

            let connecting = client::connect(config, (self.host.as_str(), self.port), handler);
            let mut handle = tokio::time::timeout(self.connect_timeout, connecting)
                .await
                .map_err(|_| Error::execution(&self.host, "connection timed out"))?
                .map_err(|e| Error::execution(&self.host, e))?;

            let accepted = handle
                .authenticate_publickey(credential.user.as_str(), credential.key.clone())
                .await
                .map_err(|e| Error::execution(&self.host, e))?;
            if !accepted {
                return Err(Error::execution(
                    &self.host,
                    format!("public key rejected for user {}", credential.user),
                ));
            }

            info!(host = %self.host, user = %credential.user, "ssh session established");
            self.handle = Some(handle);
        }

        self.handle
            .as_ref()
            .ok_or_else(|| Error::execution(&self.host, "session not established"))
    }

    async fn open_channel(&mut self) -> Result<russh::Channel<client::Msg>> {
        let host = self.host.clone();
        let opened = self.connect().await?.channel_open_session().await;
        match opened {
            Ok(channel) => Ok(channel),
            Err(e) => {
                // connection is unusable; the next call dials again
                self.handle = None;
                Err(Error::execution(&host, e))
            }
        }
    }
}

async fn collect(channel: &mut russh::Channel<client::Msg>) -> CommandOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }

    CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_status,
    }
}

#[async_trait]
impl RemoteChannel for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.host, command, "exec");
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::execution(&self.host, e))?;
        Ok(collect(&mut channel).await)
    }

    async fn copy_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        let contents = tokio::fs::read(local_path).await?;
        let command = format!("cat > {}", shell_words::quote(remote_path));
        debug!(host = %self.host, remote_path, bytes = contents.len(), "upload");

        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command.as_str())
            .await
            .map_err(|e| Error::execution(&self.host, e))?;
        channel
            .data(&contents[..])
            .await
            .map_err(|e| Error::execution(&self.host, e))?;
        channel
            .eof()
            .await
            .map_err(|e| Error::execution(&self.host, e))?;

        let output = collect(&mut channel).await;
        match output.exit_status {
            Some(0) => Ok(()),
            status => Err(Error::CommandFailed {
                host: self.host.clone(),
                command,
                exit_status: status.unwrap_or(255),
                stderr: output.stderr,
            }),
        }
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                debug!(host = %self.host, error = %e, "disconnect failed");
            }
        }
    }
}

/// Opens `SshSession`s for one credential. Without a credential every
/// session fails to connect with a configuration error.
pub struct SshFactory {
    credential: Option<Arc<SshCredential>>,
    port: u16,
    connect_timeout: Duration,
}

impl SshFactory {
    pub fn new(credential: Option<SshCredential>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            credential: credential.map(Arc::new),
            port,
            connect_timeout,
        }
    }
}

impl ChannelFactory for SshFactory {
    fn open(&self, host: &str) -> Box<dyn RemoteChannel> {
        Box::new(SshSession::new(
            host,
            self.port,
            self.credential.clone(),
            self.connect_timeout,
        ))
    }

    fn credential_id(&self) -> String {
        self.credential
            .as_ref()
            .map(|c| c.user.clone())
            .unwrap_or_default()
    }
}
