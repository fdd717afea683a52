//! Resource Inventory
//!
//! Durable record of the instances provisioned for one environment. The
//! controller and the agents live in separate JSON files under the state
//! directory; their presence at startup is the only way a later invocation
//! learns about instances created by an earlier one.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Provider status literal for a booted instance.
pub const STATUS_RUNNING: &str = "running";

const CONTROLLER_FILE: &str = "controller_vm_info.json";
const AGENTS_FILE: &str = "agent_vms_info.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Agent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Controller => write!(f, "controller"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub id: Option<u64>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub name: String,
    #[serde(default)]
    pub public_ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub status: String,
}

impl ResourceHandle {
    pub fn controller(id: u64, name: &str) -> Self {
        Self {
            id: Some(id),
            role: Role::Controller,
            index: None,
            name: name.to_string(),
            public_ipv4: None,
            status: String::new(),
        }
    }

    pub fn agent(index: usize, id: u64, name: &str) -> Self {
        Self {
            id: Some(id),
            role: Role::Agent,
            index: Some(index),
            name: name.to_string(),
            public_ipv4: None,
            status: String::new(),
        }
    }

    /// Provider id, or `ResourceNotProvisioned` for a handle that never got one.
    pub fn id(&self) -> Result<u64> {
        self.id
            .ok_or_else(|| Error::ResourceNotProvisioned(format!("{} has no provider id", self.label())))
    }

    /// `controller` or `agent-<index>`.
    pub fn label(&self) -> String {
        match (self.role, self.index) {
            (Role::Agent, Some(index)) => format!("agent-{}", index),
            (role, _) => role.to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == STATUS_RUNNING
    }
}

#[derive(Debug)]
pub struct Inventory {
    dir: PathBuf,
    controller: Option<ResourceHandle>,
    agents: Vec<ResourceHandle>,
}

impl Inventory {
    /// An inventory rooted at `dir` that has not read anything from disk.
    pub fn empty(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            controller: None,
            agents: Vec::new(),
        }
    }

    /// Reload whatever a previous invocation persisted. Missing files mean
    /// "nothing known", not "nothing exists".
    pub fn load(dir: &Path) -> Result<Self> {
        let mut inventory = Self::empty(dir);

        let controller_path = dir.join(CONTROLLER_FILE);
        if controller_path.is_file() {
            let content = std::fs::read_to_string(&controller_path)?;
            inventory.controller = Some(serde_json::from_str(&content)?);
        }

        let agents_path = dir.join(AGENTS_FILE);
        if agents_path.is_file() {
            let content = std::fs::read_to_string(&agents_path)?;
            inventory.agents = serde_json::from_str(&content)?;
        }

        debug!(
            dir = %dir.display(),
            controller = inventory.controller.is_some(),
            agents = inventory.agents.len(),
            "loaded inventory"
        );
        Ok(inventory)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn controller(&self) -> Option<&ResourceHandle> {
        self.controller.as_ref()
    }

    pub fn agents(&self) -> &[ResourceHandle] {
        &self.agents
    }

    pub fn agent(&self, index: usize) -> Option<&ResourceHandle> {
        self.agents.iter().find(|a| a.index == Some(index))
    }

    pub fn is_empty(&self) -> bool {
        self.controller.is_none() && self.agents.is_empty()
    }

    /// Controller first, then agents in index order.
    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.controller
            .iter()
            .chain(self.agents.iter())
            .cloned()
            .collect()
    }

    /// Indices are never reused, even after an agent is forgotten.
    pub fn next_agent_index(&self) -> usize {
        self.agents
            .iter()
            .filter_map(|a| a.index)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }

    /// Persist a freshly created controller before anything else happens to it.
    pub fn record_controller(&mut self, handle: ResourceHandle) -> Result<()> {
        info!(name = %handle.name, id = ?handle.id, "recording controller");
        self.controller = Some(handle);
        self.save_controller()
    }

    pub fn record_agent(&mut self, handle: ResourceHandle) -> Result<()> {
        info!(name = %handle.name, id = ?handle.id, index = ?handle.index, "recording agent");
        match self.agents.iter_mut().find(|a| a.index == handle.index) {
            Some(existing) => *existing = handle,
            None => self.agents.push(handle),
        }
        self.agents.sort_by_key(|a| a.index);
        self.save_agents()
    }

    /// Drop a handle after its instance was confirmed deleted.
    pub fn forget(&mut self, handle: &ResourceHandle) -> Result<()> {
        match handle.role {
            Role::Controller => {
                self.controller = None;
                self.save_controller()
            }
            Role::Agent => {
                self.agents.retain(|a| a.index != handle.index);
                self.save_agents()
            }
        }
    }

    /// Remove every persisted record.
    pub fn clear(&mut self) -> Result<()> {
        self.controller = None;
        self.agents.clear();
        remove_if_exists(&self.dir.join(CONTROLLER_FILE))?;
        remove_if_exists(&self.dir.join(AGENTS_FILE))?;
        Ok(())
    }

    fn save_controller(&self) -> Result<()> {
        let path = self.dir.join(CONTROLLER_FILE);
        match &self.controller {
            Some(handle) => write_atomic(&self.dir, &path, &serde_json::to_vec_pretty(handle)?),
            None => remove_if_exists(&path),
        }
    }

    fn save_agents(&self) -> Result<()> {
        let path = self.dir.join(AGENTS_FILE);
        if self.agents.is_empty() {
            return remove_if_exists(&path);
        }
        write_atomic(&self.dir, &path, &serde_json::to_vec_pretty(&self.agents)?)
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
