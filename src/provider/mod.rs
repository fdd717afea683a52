//! Provider Client
//!
//! Create, query and delete compute instances. `ComputeApi` is the raw
//! request/response contract with the cloud; `ProviderClient` works in terms
//! of `ResourceHandle`s and refuses to touch the network for a handle that
//! was never provisioned.

mod hetzner;

pub use hetzner::HetznerCloud;

use crate::error::{Error, Result};
use crate::inventory::{ResourceHandle, Role};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

/// What the provider needs to boot one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub image: String,
    pub server_type: String,
    pub location: String,
    pub ssh_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateServer {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_keys: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub public_ipv4: Option<Ipv4Addr>,
}

/// Raw cloud API. Non-2xx responses surface as `Error::Provider` and are never
/// retried here.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn create_server(&self, request: &CreateServer) -> Result<ServerRecord>;

    async fn get_server(&self, id: u64) -> Result<ServerRecord>;

    async fn delete_server(&self, id: u64) -> Result<()>;
}

#[derive(Clone)]
pub struct ProviderClient {
    api: Arc<dyn ComputeApi>,
}

impl ProviderClient {
    pub fn new(api: Arc<dyn ComputeApi>) -> Self {
        Self { api }
    }

    /// Provision a new billable instance. Not idempotent: a failed run must
    /// delete what this returned before calling it again for the same slot.
    pub async fn create_instance(
        &self,
        role: Role,
        index: Option<usize>,
        spec: &InstanceSpec,
        name: &str,
    ) -> Result<ResourceHandle> {
        let mut labels = BTreeMap::new();
        labels.insert("role".to_string(), role.to_string());
        if let Some(index) = index {
            labels.insert("agent-index".to_string(), index.to_string());
        }

        let request = CreateServer {
            name: name.to_string(),
            server_type: spec.server_type.clone(),
            image: spec.image.clone(),
            location: spec.location.clone(),
            ssh_keys: vec![spec.ssh_key.clone()],
            labels,
        };

        let record = self.api.create_server(&request).await?;
        info!(%role, server_id = record.id, name = %record.name, "instance created");

        Ok(ResourceHandle {
            id: Some(record.id),
            role,
            index,
            name: record.name,
            public_ipv4: record.public_ipv4,
            status: record.status,
        })
    }

    pub async fn status(&self, handle: &ResourceHandle) -> Result<String> {
        let id = handle.id()?;
        Ok(self.api.get_server(id).await?.status)
    }

    pub async fn public_ipv4(&self, handle: &ResourceHandle) -> Result<Ipv4Addr> {
        let id = handle.id()?;
        self.api.get_server(id).await?.public_ipv4.ok_or_else(|| {
            Error::ResourceNotProvisioned(format!(
                "{} (server {}) has no public IPv4",
                handle.label(),
                id
            ))
        })
    }

    /// Deleting an instance the provider no longer knows is not an error.
    pub async fn delete_instance(&self, handle: &ResourceHandle) -> Result<()> {
        let id = handle.id()?;
        match self.api.delete_server(id).await {
            Ok(()) => {
                info!(server_id = id, name = %handle.name, "instance deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(server_id = id, name = %handle.name, "instance already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// `jenkins-server-<ts>` / `jenkins-agent-<index>-<ts>`.
pub fn instance_name(role: Role, index: Option<usize>, timestamp: i64) -> String {
    match (role, index) {
        (Role::Agent, Some(index)) => format!("jenkins-agent-{}-{}", index, timestamp),
        (Role::Agent, None) => format!("jenkins-agent-{}", timestamp),
        (Role::Controller, _) => format!("jenkins-server-{}", timestamp),
    }
}
