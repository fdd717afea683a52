//! Hetzner Cloud
//!
//! HTTP client for the `servers` resource of the Hetzner Cloud v1 API.

use super::{ComputeApi, CreateServer, ServerRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.hetzner.cloud/v1";

#[derive(Debug, Serialize)]
struct CreateServerBody<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    location: &'a str,
    start_after_create: bool,
    ssh_keys: &'a [String],
    labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: ServerBody,
}

#[derive(Debug, Deserialize)]
struct ServerBody {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    public_net: PublicNet,
}

#[derive(Debug, Default, Deserialize)]
struct PublicNet {
    ipv4: Option<Ipv4Net>,
}

#[derive(Debug, Deserialize)]
struct Ipv4Net {
    ip: Ipv4Addr,
}

impl From<ServerBody> for ServerRecord {
    fn from(body: ServerBody) -> Self {
        ServerRecord {
            id: body.id,
            name: body.name,
            status: body.status,
            public_ipv4: body.public_net.ipv4.map(|net| net.ip),
        }
    }
}

pub struct HetznerCloud {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HetznerCloud {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("ci-provisioner/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn server_url(&self, id: u64) -> String {
        format!("{}/servers/{}", self.base_url, id)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Provider {
        code: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ComputeApi for HetznerCloud {
    async fn create_server(&self, request: &CreateServer) -> Result<ServerRecord> {
        let url = format!("{}/servers", self.base_url);
        let body = CreateServerBody {
            name: &request.name,
            server_type: &request.server_type,
            image: &request.image,
            location: &request.location,
            start_after_create: true,
            ssh_keys: &request.ssh_keys,
            labels: &request.labels,
        };

        debug!(name = %request.name, "POST {}", url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let envelope: ServerEnvelope = check(response).await?.json().await?;
        Ok(envelope.server.into())
    }

    async fn get_server(&self, id: u64) -> Result<ServerRecord> {
        let response = self
            .http
            .get(self.server_url(id))
            .bearer_auth(&self.token)
            .send()
            .await?;

        let envelope: ServerEnvelope = check(response).await?.json().await?;
        Ok(envelope.server.into())
    }

    async fn delete_server(&self, id: u64) -> Result<()> {
        let response = self
            .http
            .delete(self.server_url(id))
            .bearer_auth(&self.token)
            .send()
            .await?;

        check(response).await?;
        Ok(())
    }
}
