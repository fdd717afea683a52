//! Installation recipes
//!
//! Ordered command lists applied to a host over a `RemoteChannel`. A step
//! fails on a non-zero exit status; stderr output is only logged.

use crate::error::{Error, Result};
use crate::remote::{RemoteChannel, run_checked};
use shell_words::quote;
use std::io::Write;
use tracing::{info, warn};

const CONFIG_DIR: &str = "/var/jenkins_home/jenkins_automation";
const IMAGE_TAG: &str = "jenkins-image";
const PROXY_SITE: &str = "/etc/nginx/sites-available/jenkins.conf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Run { command: String, allow_failure: bool },
    Upload { remote_path: String, contents: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Recipe {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn run(mut self, command: impl Into<String>) -> Self {
        self.steps.push(Step::Run {
            command: command.into(),
            allow_failure: false,
        });
        self
    }

    /// A step whose failure is logged and skipped.
    pub fn run_allow_failure(mut self, command: impl Into<String>) -> Self {
        self.steps.push(Step::Run {
            command: command.into(),
            allow_failure: true,
        });
        self
    }

    pub fn upload(mut self, remote_path: &str, contents: impl Into<String>) -> Self {
        self.steps.push(Step::Upload {
            remote_path: remote_path.to_string(),
            contents: contents.into(),
        });
        self
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|step| match step {
            Step::Run { command, .. } => Some(command.as_str()),
            Step::Upload { .. } => None,
        })
    }

    pub async fn apply(&self, channel: &mut dyn RemoteChannel) -> Result<()> {
        info!(recipe = %self.name, host = channel.host(), steps = self.steps.len(), "applying recipe");
        for (n, step) in self.steps.iter().enumerate() {
            match step {
                Step::Run {
                    command,
                    allow_failure,
                } => match run_checked(channel, command).await {
                    Ok(_) => {}
                    Err(e @ Error::CommandFailed { .. }) if *allow_failure => {
                        warn!(recipe = %self.name, step = n + 1, error = %e, "optional step failed");
                    }
                    Err(e) => return Err(e),
                },
                Step::Upload {
                    remote_path,
                    contents,
                } => {
                    let mut local = tempfile::NamedTempFile::new()?;
                    local.write_all(contents.as_bytes())?;
                    local.flush()?;
                    channel.copy_file(local.path(), remote_path).await?;
                }
            }
        }
        info!(recipe = %self.name, host = channel.host(), "recipe applied");
        Ok(())
    }
}

/// Inputs for the controller recipe.
#[derive(Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    pub admin_user: String,
    pub admin_password: String,
    pub config_repo: String,
    pub branch: Option<String>,
    pub public_domain: Option<String>,
    pub port: u16,
}

impl std::fmt::Debug for ControllerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerOptions")
            .field("admin_user", &self.admin_user)
            .field("admin_password", &"<redacted>")
            .field("config_repo", &self.config_repo)
            .field("branch", &self.branch)
            .field("public_domain", &self.public_domain)
            .field("port", &self.port)
            .finish()
    }
}

/// Docker engine, the configuration repository, and the CI server container
/// built from it.
pub fn controller(options: &ControllerOptions) -> Recipe {
    let mut clone = String::from("git clone ");
    if let Some(branch) = &options.branch {
        clone.push_str(&format!("--branch {} ", quote(branch)));
    }
    clone.push_str(&format!("{} {}", quote(&options.config_repo), CONFIG_DIR));

    let mut env = vec![
        format!("-e JENKINS_USER={}", quote(&options.admin_user)),
        format!("-e JENKINS_PASS={}", quote(&options.admin_password)),
    ];
    if let Some(domain) = &options.public_domain {
        env.push(format!("-e DOMAIN={}", quote(&format!("https://{}", domain))));
    }

    Recipe::new("ci-controller")
        .run("sudo apt-get update -y")
        .run("sudo apt-get install -y ca-certificates curl gnupg lsb-release git")
        .run("sudo mkdir -p /etc/apt/keyrings")
        .run("curl -fsSL https://download.docker.com/linux/ubuntu/gpg | sudo gpg --dearmor --yes -o /etc/apt/keyrings/docker.gpg")
        .run(
            "echo \"deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.gpg] \
             https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable\" | \
             sudo tee /etc/apt/sources.list.d/docker.list > /dev/null",
        )
        .run("sudo apt-get update -y")
        .run("sudo apt-get install -y docker-ce docker-ce-cli containerd.io")
        .run(format!("sudo rm -rf {}", CONFIG_DIR))
        .run(clone)
        .run(format!("sudo docker build -t {} {}", IMAGE_TAG, CONFIG_DIR))
        .run_allow_failure("sudo docker rm -f jenkins")
        .run(format!(
            "sudo docker run -d --name jenkins --restart unless-stopped \
             -p {port}:8080 -p 50000:50000 \
             -v jenkins_home:/var/jenkins_home \
             -v /var/run/docker.sock:/var/run/docker.sock \
             {env} {image}",
            port = options.port,
            env = env.join(" "),
            image = IMAGE_TAG,
        ))
}

/// Java runtime and work directory for an SSH-launched build agent.
pub fn agent(remote_fs: &str) -> Recipe {
    Recipe::new("ci-agent")
        .run("sudo apt-get update -y")
        .run("sudo DEBIAN_FRONTEND=noninteractive apt-get install -y openjdk-17-jre-headless")
        .run(format!("sudo mkdir -p {}", quote(remote_fs)))
}

/// nginx terminating TLS for `domain` in front of the CI server on `upstream_port`.
pub fn reverse_proxy(domain: &str, email: &str, upstream_port: u16) -> Recipe {
    Recipe::new("reverse-proxy")
        .run("DEBIAN_FRONTEND=noninteractive apt-get install -y nginx")
        .run("DEBIAN_FRONTEND=noninteractive apt-get install -y certbot python3-certbot-nginx")
        .run(format!(
            "certbot --nginx -d {} --non-interactive --agree-tos -m {}",
            quote(domain),
            quote(email)
        ))
        .upload(PROXY_SITE, proxy_site(domain, upstream_port))
        .run("rm -f /etc/nginx/sites-enabled/default")
        .run(format!("ln -sf {} /etc/nginx/sites-enabled/jenkins.conf", PROXY_SITE))
        .run("nginx -t")
        .run("systemctl restart nginx")
}

fn proxy_site(domain: &str, upstream_port: u16) -> String {
    format!(
        r#"server {{
    listen 80;
    server_name {domain};

    location / {{
        return 301 https://$host$request_uri;
    }}
}}

server {{
    listen 443 ssl;
    server_name {domain};

    ssl_certificate /etc/letsencrypt/live/{domain}/fullchain.pem;
    ssl_certificate_key /etc/letsencrypt/live/{domain}/privkey.pem;

    location / {{
        proxy_pass http://localhost:{upstream_port}/;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_set_header X-Forwarded-Host $host;
        proxy_set_header X-Forwarded-Port $server_port;
    }}
}}
"#
    )
}

/// The recipes one `create` run applies.
#[derive(Debug, Clone)]
pub struct RecipeBook {
    pub controller: Recipe,
    pub agent: Recipe,
    pub proxy: Option<Recipe>,
}
