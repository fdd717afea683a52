use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::ci::CiPolicy;
use crate::coordinator::{RegistrationPolicy, Timing};
use crate::error::{Error, Result};
use crate::readiness::PollPolicy;
use std::time::Duration;

pub const CONFIG_FILE: &str = "provisioner.toml";

/// Settings loaded from `provisioner.toml`, then overridden by environment
/// variables, then by command line flags.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cloud API token (`H_API_TOKEN`).
    pub api_token: Option<String>,
    /// DNS API token (`H_DNS_API_TOKEN`).
    pub dns_api_token: Option<String>,
    pub zone_name: Option<String>,
    pub subdomain: Option<String>,
    /// Full CI domain. Defaults to `<subdomain>.<zone_name>`.
    pub domain: Option<String>,
    pub ci_user: Option<String>,
    pub ci_password: Option<String>,
    /// PEM-encoded private key material (`H_SSH_PRIVATE_KEY`).
    pub ssh_private_key: Option<String>,
    pub ssh_private_key_file: Option<PathBuf>,
    /// Name of the public key registered with the cloud provider.
    pub ssh_key_name: Option<String>,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub job_name: Option<String>,
    pub server_type: Option<String>,
    pub image: String,
    pub location: String,
    pub agent_count: usize,
    pub agent_label: String,
    pub agent_credentials_id: String,
    pub agent_remote_fs: String,
    pub agent_registration: RegistrationPolicy,
    pub ssl_email: Option<String>,
    pub config_repo: Option<String>,
    pub config_branch: Option<String>,
    pub state_dir: PathBuf,
    pub ci_port: u16,
    pub dns_ttl: u32,
    /// Resolvers for propagation checks; public resolvers when empty.
    pub nameservers: Vec<IpAddr>,
    pub teardown_on_failure: bool,
    pub verify_proxy: bool,
    pub timing: TimingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_token: None,
            dns_api_token: None,
            zone_name: None,
            subdomain: None,
            domain: None,
            ci_user: None,
            ci_password: None,
            ssh_private_key: None,
            ssh_private_key_file: None,
            ssh_key_name: None,
            ssh_user: "root".to_string(),
            ssh_port: 22,
            job_name: None,
            server_type: None,
            image: "ubuntu-22.04".to_string(),
            location: "nbg1".to_string(),
            agent_count: 0,
            agent_label: "linux".to_string(),
            agent_credentials_id: "agent-ssh".to_string(),
            agent_remote_fs: "/home/ubuntu".to_string(),
            agent_registration: RegistrationPolicy::AbortAll,
            ssl_email: None,
            config_repo: None,
            config_branch: None,
            state_dir: PathBuf::from(".provisioner"),
            ci_port: 8080,
            dns_ttl: 3600,
            nameservers: Vec::new(),
            teardown_on_failure: true,
            verify_proxy: false,
            timing: TimingSettings::default(),
        }
    }
}

/// Readiness budgets, all in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingSettings {
    pub instance_timeout: u64,
    pub instance_interval: u64,
    pub ssh_timeout: u64,
    pub ssh_interval: u64,
    pub ssh_connect_timeout: u64,
    pub ci_connect_attempts: u32,
    pub ci_connect_delay: u64,
    pub build_number_timeout: u64,
    pub build_number_interval: u64,
    pub build_status_timeout: u64,
    pub build_status_interval: u64,
    pub dns_timeout: u64,
    pub dns_interval: u64,
    pub proxy_timeout: u64,
    pub proxy_interval: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            instance_timeout: 300,
            instance_interval: 10,
            ssh_timeout: 600,
            ssh_interval: 10,
            ssh_connect_timeout: 5,
            ci_connect_attempts: 10,
            ci_connect_delay: 10,
            build_number_timeout: 300,
            build_number_interval: 2,
            build_status_timeout: 300,
            build_status_interval: 2,
            dns_timeout: 600,
            dns_interval: 15,
            proxy_timeout: 300,
            proxy_interval: 10,
        }
    }
}

impl TimingSettings {
    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout)
    }
}

impl Settings {
    /// Search for `provisioner.toml` in the current directory and ancestors.
    pub fn discover() -> Result<Self> {
        match Self::find_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::configuration(format!("invalid config in {}: {e}", path.display())))
    }

    pub fn find_config_path() -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok()?;
        cwd.ancestors()
            .map(|dir| dir.join(CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Overlay values from the environment. Empty variables are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let strings: [(&str, &mut Option<String>); 13] = [
            ("H_API_TOKEN", &mut self.api_token),
            ("H_DNS_API_TOKEN", &mut self.dns_api_token),
            ("ZONE_NAME", &mut self.zone_name),
            ("SUBDOMAIN", &mut self.subdomain),
            ("DOMAIN", &mut self.domain),
            ("JENKINS_USER", &mut self.ci_user),
            ("JENKINS_PASS", &mut self.ci_password),
            ("H_SSH_PRIVATE_KEY", &mut self.ssh_private_key),
            ("SSH_KEY_NAME", &mut self.ssh_key_name),
            ("JOB_NAME", &mut self.job_name),
            ("SERVER_TYPE", &mut self.server_type),
            ("SSL_EMAIL", &mut self.ssl_email),
            ("CONFIG_REPO", &mut self.config_repo),
        ];
        for (key, slot) in strings {
            if let Some(value) = get(key) {
                *slot = Some(value);
            }
        }

        if let Some(path) = get("SSH_PRIVATE_KEY_FILE") {
            self.ssh_private_key_file = Some(PathBuf::from(path));
        }
        if let Some(image) = get("VM_IMAGE") {
            self.image = image;
        }
        if let Some(location) = get("VM_LOCATION") {
            self.location = location;
        }
        if let Some(count) = get("AGENT_COUNT") {
            self.agent_count = count.trim().parse().map_err(|_| {
                Error::configuration(format!("AGENT_COUNT must be a non-negative integer, got {count:?}"))
            })?;
        }
        Ok(())
    }

    pub fn api_token(&self) -> Result<&str> {
        require(&self.api_token, "cloud API token", "H_API_TOKEN")
    }

    pub fn dns_api_token(&self) -> Result<&str> {
        require(&self.dns_api_token, "DNS API token", "H_DNS_API_TOKEN")
    }

    pub fn zone_name(&self) -> Result<&str> {
        require(&self.zone_name, "DNS zone", "ZONE_NAME")
    }

    pub fn ci_user(&self) -> Result<&str> {
        require(&self.ci_user, "CI admin user", "JENKINS_USER")
    }

    pub fn ci_password(&self) -> Result<&str> {
        require(&self.ci_password, "CI admin password", "JENKINS_PASS")
    }

    pub fn ssh_key_name(&self) -> Result<&str> {
        require(&self.ssh_key_name, "provider SSH key name", "SSH_KEY_NAME")
    }

    pub fn server_type(&self) -> Result<&str> {
        require(&self.server_type, "server type", "SERVER_TYPE")
    }

    pub fn ssl_email(&self) -> Result<&str> {
        require(&self.ssl_email, "certificate contact email", "SSL_EMAIL")
    }

    pub fn config_repo(&self) -> Result<&str> {
        require(&self.config_repo, "configuration repository", "CONFIG_REPO or --config-repo")
    }

    /// `domain`, or `<subdomain>.<zone_name>`.
    pub fn domain(&self) -> Result<String> {
        if let Some(domain) = &self.domain {
            return Ok(domain.clone());
        }
        match (&self.subdomain, &self.zone_name) {
            (Some(sub), Some(zone)) => Ok(format!("{}.{}", sub, zone)),
            _ => Err(Error::configuration(
                "missing CI domain (set DOMAIN, or SUBDOMAIN and ZONE_NAME)",
            )),
        }
    }

    /// Key material inline or from `ssh_private_key_file`.
    pub fn ssh_private_key(&self) -> Result<String> {
        if let Some(pem) = &self.ssh_private_key {
            return Ok(pem.replace("\\n", "\n"));
        }
        if let Some(path) = &self.ssh_private_key_file {
            return std::fs::read_to_string(path).map_err(|e| {
                Error::configuration(format!("failed to read SSH key {}: {e}", path.display()))
            });
        }
        Err(Error::configuration(
            "missing SSH private key (set H_SSH_PRIVATE_KEY or SSH_PRIVATE_KEY_FILE)",
        ))
    }

    pub fn timing(&self) -> Timing {
        let t = &self.timing;
        Timing {
            instance: PollPolicy::from_secs(t.instance_timeout, t.instance_interval),
            ssh: PollPolicy::from_secs(t.ssh_timeout, t.ssh_interval),
            ci: CiPolicy {
                connect_attempts: t.ci_connect_attempts,
                connect_delay: Duration::from_secs(t.ci_connect_delay),
                build_number: PollPolicy::from_secs(t.build_number_timeout, t.build_number_interval),
                build_status: PollPolicy::from_secs(t.build_status_timeout, t.build_status_interval),
            },
            dns: PollPolicy::from_secs(t.dns_timeout, t.dns_interval),
            proxy: self
                .verify_proxy
                .then(|| PollPolicy::from_secs(t.proxy_timeout, t.proxy_interval)),
        }
    }
}

fn require<'a>(value: &'a Option<String>, what: &str, source: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| Error::configuration(format!("missing {what} (set {source})")))
}

fn redact(value: &Option<String>) -> &'static str {
    if value.is_some() { "<redacted>" } else { "<unset>" }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("api_token", &redact(&self.api_token))
            .field("dns_api_token", &redact(&self.dns_api_token))
            .field("zone_name", &self.zone_name)
            .field("subdomain", &self.subdomain)
            .field("domain", &self.domain)
            .field("ci_user", &self.ci_user)
            .field("ci_password", &redact(&self.ci_password))
            .field("ssh_private_key", &redact(&self.ssh_private_key))
            .field("ssh_private_key_file", &self.ssh_private_key_file)
            .field("ssh_key_name", &self.ssh_key_name)
            .field("ssh_user", &self.ssh_user)
            .field("job_name", &self.job_name)
            .field("server_type", &self.server_type)
            .field("image", &self.image)
            .field("location", &self.location)
            .field("agent_count", &self.agent_count)
            .field("agent_registration", &self.agent_registration)
            .field("config_repo", &self.config_repo)
            .field("state_dir", &self.state_dir)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}
