//! Jenkins
//!
//! JSON API client. POSTs carry a CSRF crumb when the server issues one.

use super::{AgentNode, CiConnector, CiServer};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct WhoAmI {
    #[serde(rename = "fullName", default)]
    full_name: String,
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct Crumb {
    #[serde(rename = "crumbRequestField")]
    field: String,
    crumb: String,
}

#[derive(Debug, Deserialize)]
struct JobInfo {
    #[serde(rename = "lastBuild")]
    last_build: Option<BuildRef>,
}

#[derive(Debug, Deserialize)]
struct BuildRef {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct BuildInfo {
    result: Option<String>,
}

pub struct JenkinsClient {
    base_url: String,
    user: String,
    password: String,
    http: reqwest::Client,
    crumb: OnceCell<Option<(String, String)>>,
}

impl JenkinsClient {
    pub fn new(base_url: &str, user: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .cookie_store(true)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            http,
            crumb: OnceCell::new(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&self.user, Some(&self.password))
    }

    async fn post(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.user, Some(&self.password));
        if let Some((field, value)) = self.crumb().await? {
            request = request.header(field.as_str(), value.as_str());
        }
        Ok(request)
    }

    /// Fetched once per client. Servers without CSRF protection answer 404.
    async fn crumb(&self) -> Result<&Option<(String, String)>> {
        self.crumb
            .get_or_try_init(|| async {
                let response = self.get("/crumbIssuer/api/json").send().await?;
                if response.status() == StatusCode::NOT_FOUND {
                    debug!("crumb issuer disabled");
                    return Ok::<_, Error>(None);
                }
                let crumb: Crumb = check(response).await?.json().await?;
                Ok(Some((crumb.field, crumb.crumb)))
            })
            .await
    }
}

/// `folder/job` becomes `/job/folder/job/job`.
fn job_path(job: &str) -> String {
    job.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("/job/{}", urlencoding::encode(segment)))
        .collect()
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Ci {
        code: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CiServer for JenkinsClient {
    fn url(&self) -> &str {
        &self.base_url
    }

    async fn whoami(&self) -> Result<String> {
        let response = self.get("/me/api/json").send().await?;
        let me: WhoAmI = check(response).await?.json().await?;
        Ok(if me.full_name.is_empty() { me.id } else { me.full_name })
    }

    async fn trigger_job(&self, job: &str) -> Result<()> {
        let path = format!("{}/build", job_path(job));
        debug!(job, "POST {}", path);
        let response = self.post(&path).await?.send().await?;
        check(response).await?;
        Ok(())
    }

    async fn last_build_number(&self, job: &str) -> Result<Option<u64>> {
        let path = format!("{}/api/json?tree=lastBuild[number]", job_path(job));
        let response = self.get(&path).send().await?;
        let info: JobInfo = check(response).await?.json().await?;
        Ok(info.last_build.map(|b| b.number))
    }

    async fn build_result(&self, job: &str, build: u64) -> Result<Option<String>> {
        let path = format!("{}/{}/api/json?tree=result", job_path(job), build);
        let response = self.get(&path).send().await?;
        let info: BuildInfo = check(response).await?.json().await?;
        Ok(info.result)
    }

    async fn create_node(&self, node: &AgentNode) -> Result<()> {
        let node_type = "hudson.slaves.DumbSlave$DescriptorImpl";
        let launcher = json!({
            "stapler-class": "hudson.plugins.sshslaves.SSHLauncher",
            "$class": "hudson.plugins.sshslaves.SSHLauncher",
            "host": node.host,
            "port": "22",
            "credentialsId": node.credentials_id,
            "sshHostKeyVerificationStrategy": {
                "$class": "hudson.plugins.sshslaves.verifiers.NonVerifyingKeyVerificationStrategy",
                "stapler-class": "hudson.plugins.sshslaves.verifiers.NonVerifyingKeyVerificationStrategy"
            }
        });
        let params = json!({
            "name": node.name,
            "nodeDescription": format!("ephemeral agent at {}", node.host),
            "numExecutors": node.executors,
            "remoteFS": node.remote_fs,
            "labelString": node.label,
            "mode": "NORMAL",
            "type": node_type,
            "retentionStrategy": { "stapler-class": "hudson.slaves.RetentionStrategy$Always" },
            "nodeProperties": { "stapler-class-bag": "true" },
            "launcher": launcher
        });
        let form = [
            ("name", node.name.clone()),
            ("type", node_type.to_string()),
            ("json", params.to_string()),
        ];

        debug!(node = %node.name, "POST /computer/doCreateItem");
        let response = self
            .post("/computer/doCreateItem")
            .await?
            .form(&form)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// Builds `JenkinsClient`s with one set of admin credentials.
#[derive(Clone, Default)]
pub struct JenkinsConnector {
    credentials: Option<(String, String)>,
}

impl JenkinsConnector {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            credentials: Some((user.to_string(), password.to_string())),
        }
    }

    /// A connector that refuses to build clients.
    pub fn unconfigured() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for JenkinsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JenkinsConnector")
            .field("user", &self.credentials.as_ref().map(|(user, _)| user))
            .field("password", &"<redacted>")
            .finish()
    }
}

impl CiConnector for JenkinsConnector {
    fn server(&self, base_url: &str) -> Result<Arc<dyn CiServer>> {
        let (user, password) = self.credentials.as_ref().ok_or_else(|| {
            Error::configuration("missing CI admin credentials (set JENKINS_USER and JENKINS_PASS)")
        })?;
        Ok(Arc::new(JenkinsClient::new(base_url, user, password)?))
    }
}
