#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use provisioner::ci::{AgentNode, CiConnector, CiPolicy, CiServer};
use provisioner::coordinator::{Coordinator, Services, Timing};
use provisioner::dns::{AddressResolver, DnsApi, DnsReconciler, DnsRecord, NewRecord, Zone};
use provisioner::inventory::Inventory;
use provisioner::provider::{ComputeApi, CreateServer, ProviderClient, ServerRecord};
use provisioner::readiness::{PollPolicy, PortProbe};
use provisioner::remote::{ChannelFactory, ChannelPool, CommandOutput, RemoteChannel};
use provisioner::{Error, Result};

/// Cloud whose servers report `starting` for a fixed number of polls.
#[derive(Default)]
pub struct FakeCloud {
    pub starting_polls: u32,
    state: Mutex<CloudState>,
}

#[derive(Default)]
struct CloudState {
    next_id: u64,
    servers: HashMap<u64, (String, u32)>,
    created: Vec<String>,
    deleted: Vec<u64>,
    status_calls: u32,
    starting_answers: u32,
}

impl FakeCloud {
    pub fn new(starting_polls: u32) -> Self {
        Self {
            starting_polls,
            state: Mutex::new(CloudState {
                next_id: 100,
                ..Default::default()
            }),
        }
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn deleted(&self) -> Vec<u64> {
        self.state.lock().unwrap().deleted.clone()
    }

    /// Every `get_server` call, answered or not.
    pub fn status_calls(&self) -> u32 {
        self.state.lock().unwrap().status_calls
    }

    pub fn starting_answers(&self) -> u32 {
        self.state.lock().unwrap().starting_answers
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().servers.len()
    }

    fn ip(id: u64) -> Ipv4Addr {
        Ipv4Addr::new(192, 0, 2, (id % 250) as u8)
    }
}

#[async_trait]
impl ComputeApi for FakeCloud {
    async fn create_server(&self, request: &CreateServer) -> Result<ServerRecord> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.servers.insert(id, (request.name.clone(), 0));
        state.created.push(request.name.clone());
        Ok(ServerRecord {
            id,
            name: request.name.clone(),
            status: "initializing".to_string(),
            public_ipv4: None,
        })
    }

    async fn get_server(&self, id: u64) -> Result<ServerRecord> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        let Some((name, polls)) = state.servers.get_mut(&id) else {
            return Err(Error::Provider {
                code: 404,
                body: "not_found".to_string(),
            });
        };
        *polls += 1;
        let starting = *polls <= self.starting_polls;
        let name = name.clone();
        if starting {
            state.starting_answers += 1;
        }
        Ok(ServerRecord {
            id,
            name,
            status: if starting { "starting" } else { "running" }.to_string(),
            public_ipv4: Some(Self::ip(id)),
        })
    }

    async fn delete_server(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.servers.remove(&id).is_none() {
            return Err(Error::Provider {
                code: 404,
                body: "not_found".to_string(),
            });
        }
        state.deleted.push(id);
        Ok(())
    }
}

/// Port that stays closed for the first `closed_checks` probes.
pub struct FakeProbe {
    closed_checks: u32,
    calls: AtomicU32,
}

impl FakeProbe {
    pub fn new(closed_checks: u32) -> Self {
        Self {
            closed_checks,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortProbe for FakeProbe {
    async fn is_open(&self, _addr: SocketAddr) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) >= self.closed_checks
    }
}

/// How a scripted shell reacts to a command containing a given text.
#[derive(Debug, Clone)]
pub enum Fault {
    Exit(String, u32),
    Transport(String),
}

#[derive(Default)]
pub struct ShellLog {
    pub commands: Vec<(String, String)>,
    pub uploads: Vec<(String, String)>,
    pub opened: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeShell {
    pub log: Arc<Mutex<ShellLog>>,
    pub faults: Vec<Fault>,
}

impl FakeShell {
    pub fn failing(fault: Fault) -> Self {
        Self {
            log: Arc::default(),
            faults: vec![fault],
        }
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .log
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|(h, _)| h.clone())
            .collect();
        hosts.dedup();
        hosts
    }
}

struct FakeChannel {
    host: String,
    connected: bool,
    shell: FakeShell,
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    fn host(&self) -> &str {
        &self.host
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        self.connected = true;
        self.shell
            .log
            .lock()
            .unwrap()
            .commands
            .push((self.host.clone(), command.to_string()));

        for fault in &self.shell.faults {
            match fault {
                Fault::Exit(needle, status) if command.contains(needle.as_str()) => {
                    return Ok(CommandOutput {
                        stdout: String::new(),
                        stderr: format!("{}: failed", needle),
                        exit_status: Some(*status),
                    });
                }
                Fault::Transport(needle) if command.contains(needle.as_str()) => {
                    self.connected = false;
                    return Err(Error::execution(&self.host, "connection reset by peer"));
                }
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::new(),
            // package managers write progress to stderr
            stderr: "WARNING: apt does not have a stable CLI interface.".to_string(),
            exit_status: Some(0),
        })
    }

    async fn copy_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        let contents = std::fs::read_to_string(local_path)?;
        self.shell
            .log
            .lock()
            .unwrap()
            .uploads
            .push((remote_path.to_string(), contents));
        Ok(())
    }

    async fn close(&mut self) {
        self.connected = false;
    }
}

impl ChannelFactory for FakeShell {
    fn open(&self, host: &str) -> Box<dyn RemoteChannel> {
        self.log.lock().unwrap().opened.push(host.to_string());
        Box::new(FakeChannel {
            host: host.to_string(),
            connected: false,
            shell: self.clone(),
        })
    }

    fn credential_id(&self) -> String {
        "root".to_string()
    }
}

/// CI server that refuses the first `refusals` identity checks and finishes
/// every build with `result` after `running_polls` status polls.
pub struct FakeCi {
    pub refusals: u32,
    pub running_polls: u32,
    pub result: String,
    pub reject_nodes: Vec<String>,
    state: Mutex<CiState>,
}

#[derive(Default)]
struct CiState {
    whoami_calls: u32,
    last_build: Option<u64>,
    status_polls: u32,
    urls: Vec<String>,
    nodes: Vec<AgentNode>,
}

impl FakeCi {
    pub fn new(refusals: u32, result: &str) -> Arc<Self> {
        Arc::new(Self {
            refusals,
            running_polls: 1,
            result: result.to_string(),
            reject_nodes: Vec::new(),
            state: Mutex::default(),
        })
    }

    pub fn rejecting(refusals: u32, result: &str, reject_nodes: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            refusals,
            running_polls: 1,
            result: result.to_string(),
            reject_nodes: reject_nodes.iter().map(|n| n.to_string()).collect(),
            state: Mutex::default(),
        })
    }

    pub fn whoami_calls(&self) -> u32 {
        self.state.lock().unwrap().whoami_calls
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.lock().unwrap().urls.clone()
    }

    pub fn nodes(&self) -> Vec<AgentNode> {
        self.state.lock().unwrap().nodes.clone()
    }
}

struct FakeCiServer {
    url: String,
    ci: Arc<FakeCi>,
}

#[async_trait]
impl CiServer for FakeCiServer {
    fn url(&self) -> &str {
        &self.url
    }

    async fn whoami(&self) -> Result<String> {
        let mut state = self.ci.state.lock().unwrap();
        state.whoami_calls += 1;
        if state.whoami_calls <= self.ci.refusals {
            return Err(Error::execution(&self.url, "connection refused"));
        }
        Ok("admin".to_string())
    }

    async fn trigger_job(&self, _job: &str) -> Result<()> {
        let mut state = self.ci.state.lock().unwrap();
        state.last_build = Some(state.last_build.unwrap_or(0) + 1);
        state.status_polls = 0;
        Ok(())
    }

    async fn last_build_number(&self, _job: &str) -> Result<Option<u64>> {
        Ok(self.ci.state.lock().unwrap().last_build)
    }

    async fn build_result(&self, _job: &str, _build: u64) -> Result<Option<String>> {
        let mut state = self.ci.state.lock().unwrap();
        state.status_polls += 1;
        if state.status_polls <= self.ci.running_polls {
            Ok(None)
        } else {
            Ok(Some(self.ci.result.clone()))
        }
    }

    async fn create_node(&self, node: &AgentNode) -> Result<()> {
        if self.ci.reject_nodes.iter().any(|n| node.name.contains(n.as_str())) {
            return Err(Error::Ci {
                code: 400,
                body: "node rejected".to_string(),
            });
        }
        self.ci.state.lock().unwrap().nodes.push(node.clone());
        Ok(())
    }
}

pub struct FakeCiConnector(pub Arc<FakeCi>);

impl CiConnector for FakeCiConnector {
    fn server(&self, base_url: &str) -> Result<Arc<dyn CiServer>> {
        self.0.state.lock().unwrap().urls.push(base_url.to_string());
        Ok(Arc::new(FakeCiServer {
            url: base_url.to_string(),
            ci: self.0.clone(),
        }))
    }
}

/// One zone `example.com`; the resolver answers from the published records
/// after `hidden_lookups` lookups.
pub struct FakeDns {
    hidden_lookups: u32,
    lookups: AtomicU32,
    records: Mutex<Vec<DnsRecord>>,
}

impl FakeDns {
    pub fn new(hidden_lookups: u32) -> Arc<Self> {
        Arc::new(Self {
            hidden_lookups,
            lookups: AtomicU32::new(0),
            records: Mutex::default(),
        })
    }

    pub fn records(&self) -> Vec<DnsRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsApi for FakeDns {
    async fn zones(&self, name: &str) -> Result<Vec<Zone>> {
        if name == "example.com" {
            Ok(vec![Zone {
                id: "zone-1".to_string(),
                name: name.to_string(),
            }])
        } else {
            Ok(Vec::new())
        }
    }

    async fn records(&self, zone_id: &str) -> Result<Vec<DnsRecord>> {
        Ok(self
            .records()
            .into_iter()
            .filter(|r| r.zone_id == zone_id)
            .collect())
    }

    async fn create_record(&self, record: &NewRecord) -> Result<DnsRecord> {
        let mut records = self.records.lock().unwrap();
        let created = DnsRecord {
            id: format!("rec-{}", records.len() + 1),
            zone_id: record.zone_id.clone(),
            name: record.name.clone(),
            record_type: record.record_type.clone(),
            value: record.value.clone(),
            ttl: Some(record.ttl),
        };
        records.push(created.clone());
        Ok(created)
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        self.records.lock().unwrap().retain(|r| r.id != record_id);
        Ok(())
    }
}

#[async_trait]
impl AddressResolver for FakeDns {
    async fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        if self.lookups.fetch_add(1, Ordering::SeqCst) < self.hidden_lookups {
            return Ok(Vec::new());
        }
        let label = provisioner::dns::record_name(domain);
        Ok(self
            .records()
            .iter()
            .filter(|r| r.name == label)
            .filter_map(|r| r.value.parse().ok())
            .collect())
    }
}

/// Short budgets so paused-clock tests stay quick.
pub fn fast_timing() -> Timing {
    Timing {
        instance: PollPolicy::new(Duration::from_secs(60), Duration::from_secs(2)),
        ssh: PollPolicy::new(Duration::from_secs(60), Duration::from_secs(2)),
        ci: CiPolicy {
            connect_attempts: 5,
            connect_delay: Duration::from_secs(3),
            build_number: PollPolicy::new(Duration::from_secs(30), Duration::from_secs(1)),
            build_status: PollPolicy::new(Duration::from_secs(30), Duration::from_secs(1)),
        },
        dns: PollPolicy::new(Duration::from_secs(60), Duration::from_secs(5)),
        proxy: None,
    }
}

/// Every collaborator a coordinator talks to, shared with the test.
pub struct World {
    pub cloud: Arc<FakeCloud>,
    pub probe: Arc<FakeProbe>,
    pub shell: FakeShell,
    pub ci: Arc<FakeCi>,
    pub dns: Arc<FakeDns>,
}

impl World {
    pub fn new() -> Self {
        Self {
            cloud: Arc::new(FakeCloud::new(0)),
            probe: Arc::new(FakeProbe::new(0)),
            shell: FakeShell::default(),
            ci: FakeCi::new(0, "SUCCESS"),
            dns: FakeDns::new(0),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            provider: ProviderClient::new(self.cloud.clone()),
            probe: self.probe.clone(),
            channels: ChannelPool::new(Arc::new(self.shell.clone())),
            ci: Arc::new(FakeCiConnector(self.ci.clone())),
            dns: Some(DnsReconciler::new(self.dns.clone(), self.dns.clone())),
            http: reqwest::Client::new(),
        }
    }

    pub fn coordinator(&self, state_dir: &Path) -> Coordinator {
        let inventory = Inventory::load(state_dir).unwrap();
        Coordinator::new(inventory, self.services(), fast_timing())
    }
}
