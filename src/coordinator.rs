//! Lifecycle Coordinator
//!
//! Runs the provisioning pipeline phase by phase, owns the inventory, and
//! tears everything down when a phase fails.

use crate::ci::{AgentNode, BuildRun, CiConnector, CiOrchestrator, CiPolicy};
use crate::dns::{DeleteOutcome, DnsReconciler};
use crate::error::{Error, Result};
use crate::inventory::{Inventory, ResourceHandle, Role, STATUS_RUNNING};
use crate::provider::{InstanceSpec, ProviderClient, instance_name};
use crate::readiness::{PollPolicy, PortProbe, await_condition, http_status, instance_running, port_open};
use crate::recipes::{Recipe, RecipeBook};
use crate::remote::ChannelPool;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    CreateController,
    AwaitControllerReady,
    CreateAgents,
    AwaitAgentsReady,
    InstallCi,
    VerifyCiReachable,
    RegisterAgents,
    RunValidationJob,
    PublishDns,
    InstallProxy,
    Done,
    Teardown,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::CreateController => "create_controller",
            Phase::AwaitControllerReady => "await_controller_ready",
            Phase::CreateAgents => "create_agents",
            Phase::AwaitAgentsReady => "await_agents_ready",
            Phase::InstallCi => "install_ci",
            Phase::VerifyCiReachable => "verify_ci_reachable",
            Phase::RegisterAgents => "register_agents",
            Phase::RunValidationJob => "run_validation_job",
            Phase::PublishDns => "publish_dns",
            Phase::InstallProxy => "install_proxy",
            Phase::Done => "done",
            Phase::Teardown => "teardown",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone)]
pub enum RunEvent {
    PhaseStarted {
        phase: Phase,
    },
    PhaseCompleted {
        phase: Phase,
        elapsed: Duration,
    },
    PhaseFailed {
        phase: Phase,
        error: String,
    },
    InstanceRecorded {
        label: String,
        id: Option<u64>,
    },
    InstanceDeleted {
        label: String,
    },
    TeardownCompleted {
        deleted: usize,
        failures: usize,
    },
}

pub type EventCallback = Box<dyn Fn(&RunEvent) + Send + Sync>;

/// What to do when one agent cannot be registered with the CI server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationPolicy {
    #[default]
    AbortAll,
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsPlan {
    pub zone: String,
    pub domain: String,
    pub ttl: u32,
}

#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub instance: InstanceSpec,
    pub agent_count: usize,
    pub ssh_port: u16,
    pub ci_port: u16,
    pub recipes: RecipeBook,
    pub agent_label: String,
    pub agent_credentials_id: String,
    pub agent_remote_fs: String,
    pub registration: RegistrationPolicy,
    pub validation_job: Option<String>,
    pub dns: Option<DnsPlan>,
    pub teardown_on_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub instance: PollPolicy,
    pub ssh: PollPolicy,
    pub ci: CiPolicy,
    pub dns: PollPolicy,
    /// HTTPS check after the proxy is installed; skipped when `None`.
    pub proxy: Option<PollPolicy>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            instance: PollPolicy::from_secs(300, 10),
            ssh: PollPolicy::from_secs(600, 10),
            ci: CiPolicy::default(),
            dns: PollPolicy::from_secs(600, 15),
            proxy: None,
        }
    }
}

/// External collaborators.
pub struct Services {
    pub provider: ProviderClient,
    pub probe: Arc<dyn PortProbe>,
    pub channels: ChannelPool,
    pub ci: Arc<dyn CiConnector>,
    pub dns: Option<DnsReconciler>,
    pub http: reqwest::Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReport {
    pub label: String,
    pub name: String,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone)]
pub struct CreateReport {
    pub controller_ip: Ipv4Addr,
    pub ci_url: String,
    pub agents: Vec<AgentReport>,
    pub unregistered_agents: Vec<String>,
    pub build: Option<BuildRun>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
    /// Records dropped without deleting their instances.
    pub released: Vec<String>,
    pub dns: Option<DeleteOutcome>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Coordinator {
    inventory: Inventory,
    services: Services,
    timing: Timing,
    listeners: Vec<EventCallback>,
}

impl Coordinator {
    pub fn new(inventory: Inventory, services: Services, timing: Timing) -> Self {
        Self {
            inventory,
            services,
            timing,
            listeners: Vec::new(),
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn on_event(&mut self, callback: EventCallback) {
        self.listeners.push(callback);
    }

    fn emit(&self, event: RunEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }

    fn begin(&self, phase: Phase) -> Instant {
        info!(%phase, "phase started");
        self.emit(RunEvent::PhaseStarted { phase });
        Instant::now()
    }

    fn finish<T>(&self, phase: Phase, started: Instant, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                let elapsed = started.elapsed();
                info!(%phase, elapsed_ms = elapsed.as_millis() as u64, "phase completed");
                self.emit(RunEvent::PhaseCompleted { phase, elapsed });
                Ok(value)
            }
            Err(err) => {
                let err = err.in_phase(phase.name());
                error!(%phase, kind = err.kind(), error = %err, "phase failed");
                self.emit(RunEvent::PhaseFailed {
                    phase,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn require_controller(&self) -> Result<ResourceHandle> {
        self.inventory.controller().cloned().ok_or_else(|| {
            Error::ResourceNotProvisioned(format!(
                "no controller recorded in {}",
                self.inventory.dir().display()
            ))
        })
    }

    /// Provision the whole environment. On failure everything recorded so far
    /// is torn down (unless the plan says otherwise) and the phase error is
    /// returned.
    pub async fn create(&mut self, plan: &CreatePlan) -> Result<CreateReport> {
        if !self.inventory.is_empty() {
            return Err(Error::configuration(format!(
                "{} already tracks instances from an earlier run; run cleanup first",
                self.inventory.dir().display()
            )));
        }

        match self.provision(plan).await {
            Ok(report) => {
                self.services.channels.close_all().await;
                Ok(report)
            }
            Err(err) => {
                if plan.teardown_on_failure {
                    let report = self.teardown(true, plan.dns.as_ref()).await;
                    if !report.is_clean() {
                        warn!(failures = ?report.failures, "teardown incomplete; run cleanup again");
                    }
                } else {
                    self.services.channels.close_all().await;
                    warn!("keeping provisioned instances; run cleanup to remove them");
                }
                Err(err)
            }
        }
    }

    async fn provision(&mut self, plan: &CreatePlan) -> Result<CreateReport> {
        let timestamp = chrono::Utc::now().timestamp();

        let started = self.begin(Phase::CreateController);
        let result = self
            .create_instance(Role::Controller, None, &plan.instance, timestamp)
            .await;
        let controller = self.finish(Phase::CreateController, started, result)?;

        let started = self.begin(Phase::AwaitControllerReady);
        let result = self.await_ready(controller, plan.ssh_port).await;
        let controller_ip = self.finish(Phase::AwaitControllerReady, started, result)?;

        let mut agents = Vec::with_capacity(plan.agent_count);
        for _ in 0..plan.agent_count {
            let index = self.inventory.next_agent_index();

            let started = self.begin(Phase::CreateAgents);
            let result = self
                .create_instance(Role::Agent, Some(index), &plan.instance, timestamp)
                .await;
            let agent = self.finish(Phase::CreateAgents, started, result)?;

            let started = self.begin(Phase::AwaitAgentsReady);
            let name = agent.name.clone();
            let label = agent.label();
            let result = self.await_ready(agent, plan.ssh_port).await;
            let ip = self.finish(Phase::AwaitAgentsReady, started, result)?;
            agents.push(AgentReport { label, name, ip });
        }

        let started = self.begin(Phase::InstallCi);
        let result = self.install_ci(&plan.recipes, controller_ip, &agents).await;
        self.finish(Phase::InstallCi, started, result)?;

        let ci_url = format!("http://{}:{}", controller_ip, plan.ci_port);
        let started = self.begin(Phase::VerifyCiReachable);
        let result = self.connect_ci(&ci_url).await;
        let ci = self.finish(Phase::VerifyCiReachable, started, result)?;

        let mut unregistered_agents = Vec::new();
        if !agents.is_empty() {
            let started = self.begin(Phase::RegisterAgents);
            let result = register_agents(&ci, &agents, plan).await;
            unregistered_agents = self.finish(Phase::RegisterAgents, started, result)?;
        }

        let mut build = None;
        if let Some(job) = &plan.validation_job {
            let started = self.begin(Phase::RunValidationJob);
            let result = ci.run_validation_job(job).await;
            build = Some(self.finish(Phase::RunValidationJob, started, result)?);
        }

        if let Some(dns) = &plan.dns {
            let started = self.begin(Phase::PublishDns);
            let result = self.publish_dns(dns, controller_ip).await;
            self.finish(Phase::PublishDns, started, result)?;
        }

        if let Some(recipe) = &plan.recipes.proxy {
            let domain = plan.dns.as_ref().map(|d| d.domain.as_str());
            let started = self.begin(Phase::InstallProxy);
            let result = self.install_proxy(recipe, controller_ip, domain).await;
            self.finish(Phase::InstallProxy, started, result)?;
        }

        info!(%controller_ip, agents = agents.len(), "environment ready");
        self.emit(RunEvent::PhaseCompleted {
            phase: Phase::Done,
            elapsed: Duration::ZERO,
        });

        Ok(CreateReport {
            controller_ip,
            ci_url,
            agents,
            unregistered_agents,
            build,
            domain: plan.dns.as_ref().map(|d| d.domain.clone()),
        })
    }

    /// Create one instance and persist it before anything else happens.
    async fn create_instance(
        &mut self,
        role: Role,
        index: Option<usize>,
        spec: &InstanceSpec,
        timestamp: i64,
    ) -> Result<ResourceHandle> {
        let name = instance_name(role, index, timestamp);
        let handle = self
            .services
            .provider
            .create_instance(role, index, spec, &name)
            .await?;
        self.record(handle.clone())?;
        Ok(handle)
    }

    fn record(&mut self, handle: ResourceHandle) -> Result<()> {
        let label = handle.label();
        let id = handle.id;
        match handle.role {
            Role::Controller => self.inventory.record_controller(handle)?,
            Role::Agent => self.inventory.record_agent(handle)?,
        }
        self.emit(RunEvent::InstanceRecorded { label, id });
        Ok(())
    }

    /// Instance running, then SSH accepting connections. Returns the address.
    async fn await_ready(&mut self, mut handle: ResourceHandle, ssh_port: u16) -> Result<Ipv4Addr> {
        let provider = &self.services.provider;
        let target = &handle;
        await_condition(
            &format!("{} to be running", handle.name),
            self.timing.instance,
            move || instance_running(provider, target),
        )
        .await?;

        let ip = provider.public_ipv4(&handle).await?;
        let addr = SocketAddr::new(IpAddr::V4(ip), ssh_port);
        let probe = self.services.probe.as_ref();
        await_condition(
            &format!("ssh on {}", addr),
            self.timing.ssh,
            move || port_open(probe, addr),
        )
        .await?;

        info!(instance = %handle.name, %ip, "instance ready");
        handle.public_ipv4 = Some(ip);
        handle.status = STATUS_RUNNING.to_string();
        self.record(handle)?;
        Ok(ip)
    }

    async fn install_ci(
        &mut self,
        recipes: &RecipeBook,
        controller_ip: Ipv4Addr,
        agents: &[AgentReport],
    ) -> Result<()> {
        let channels = &mut self.services.channels;
        recipes
            .controller
            .apply(channels.session(&controller_ip.to_string()))
            .await?;
        for agent in agents {
            recipes.agent.apply(channels.session(&agent.ip.to_string())).await?;
        }
        Ok(())
    }

    async fn connect_ci(&self, url: &str) -> Result<CiOrchestrator> {
        let server = self.services.ci.server(url)?;
        CiOrchestrator::connect(server, self.timing.ci).await
    }

    async fn publish_dns(&self, plan: &DnsPlan, ip: Ipv4Addr) -> Result<()> {
        let dns = self
            .services
            .dns
            .as_ref()
            .ok_or_else(|| Error::configuration("DNS publishing requested but no DNS API is configured"))?;
        let zone_id = dns.resolve_zone_id(&plan.zone).await?;
        dns.publish(&plan.domain, ip, &zone_id, plan.ttl).await?;
        dns.await_propagation(&plan.domain, ip, self.timing.dns).await
    }

    async fn install_proxy(&mut self, recipe: &Recipe, ip: Ipv4Addr, domain: Option<&str>) -> Result<()> {
        recipe
            .apply(self.services.channels.session(&ip.to_string()))
            .await?;

        if let (Some(policy), Some(domain)) = (self.timing.proxy, domain) {
            let url = format!("https://{}/login", domain);
            await_proxy(&self.services.http, &url, policy).await?;
        }
        Ok(())
    }

    /// Publish the address record for the recorded controller.
    pub async fn create_dns(&mut self, plan: &DnsPlan) -> Result<Ipv4Addr> {
        let controller = self.require_controller()?;
        let started = self.begin(Phase::PublishDns);
        let result = async {
            let ip = self.services.provider.public_ipv4(&controller).await?;
            self.publish_dns(plan, ip).await?;
            Ok::<_, Error>(ip)
        }
        .await;
        self.finish(Phase::PublishDns, started, result)
    }

    /// Install the reverse proxy on the recorded controller.
    pub async fn setup_proxy(&mut self, recipe: &Recipe, domain: &str, ssh_port: u16) -> Result<()> {
        let controller = self.require_controller()?;

        let started = self.begin(Phase::AwaitControllerReady);
        let result = self.await_ready(controller, ssh_port).await;
        let ip = self.finish(Phase::AwaitControllerReady, started, result)?;

        let started = self.begin(Phase::InstallProxy);
        let result = self.install_proxy(recipe, ip, Some(domain)).await;
        self.services.channels.close_all().await;
        self.finish(Phase::InstallProxy, started, result)
    }

    /// Check the CI server on the recorded controller and optionally run a job.
    pub async fn test(&mut self, ci_port: u16, job: Option<&str>) -> Result<Option<BuildRun>> {
        let controller = self.require_controller()?;

        let started = self.begin(Phase::VerifyCiReachable);
        let result = async {
            let ip = self.services.provider.public_ipv4(&controller).await?;
            self.connect_ci(&format!("http://{}:{}", ip, ci_port)).await
        }
        .await;
        let ci = self.finish(Phase::VerifyCiReachable, started, result)?;

        let Some(job) = job else {
            return Ok(None);
        };
        let started = self.begin(Phase::RunValidationJob);
        let result = ci.run_validation_job(job).await;
        self.finish(Phase::RunValidationJob, started, result).map(Some)
    }

    /// Best effort: every step is attempted even when an earlier one failed.
    /// A record is dropped only once its instance is confirmed gone, unless
    /// `delete_vms` is false, in which case all records are released as is.
    pub async fn teardown(&mut self, delete_vms: bool, dns: Option<&DnsPlan>) -> TeardownReport {
        let started = self.begin(Phase::Teardown);
        let mut report = TeardownReport::default();

        self.services.channels.close_all().await;

        if delete_vms {
            for handle in self.inventory.handles() {
                let label = handle.label();
                let deleted = match self.services.provider.delete_instance(&handle).await {
                    Ok(()) => Ok(()),
                    Err(Error::ResourceNotProvisioned(reason)) => {
                        warn!(%label, %reason, "record without instance, dropping it");
                        Ok(())
                    }
                    Err(e) => Err(e),
                };

                match deleted.and_then(|()| self.inventory.forget(&handle)) {
                    Ok(()) => {
                        self.emit(RunEvent::InstanceDeleted {
                            label: label.clone(),
                        });
                        report.deleted.push(label);
                    }
                    Err(e) => {
                        error!(%label, error = %e, "failed to delete instance");
                        report.failures.push(format!("{}: {}", label, e));
                    }
                }
            }
        } else {
            report.released = self.inventory.handles().iter().map(|h| h.label()).collect();
            if let Err(e) = self.inventory.clear() {
                report.failures.push(format!("inventory: {}", e));
            }
        }

        if let (Some(plan), Some(dns)) = (dns, self.services.dns.as_ref()) {
            let result = async {
                let zone_id = dns.resolve_zone_id(&plan.zone).await?;
                dns.delete(&plan.domain, &zone_id).await
            }
            .await;
            match result {
                Ok(outcome) => report.dns = Some(outcome),
                Err(e) => {
                    error!(domain = %plan.domain, error = %e, "failed to delete DNS record");
                    report.failures.push(format!("dns {}: {}", plan.domain, e));
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            released = report.released.len(),
            failures = report.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "teardown finished"
        );
        self.emit(RunEvent::TeardownCompleted {
            deleted: report.deleted.len(),
            failures: report.failures.len(),
        });
        report
    }
}

async fn register_agents(
    ci: &CiOrchestrator,
    agents: &[AgentReport],
    plan: &CreatePlan,
) -> Result<Vec<String>> {
    let mut unregistered = Vec::new();
    for agent in agents {
        let mut node = AgentNode::new(
            &agent.name,
            &agent.ip.to_string(),
            &plan.agent_credentials_id,
            &plan.agent_label,
        );
        node.remote_fs = plan.agent_remote_fs.clone();

        match ci.register_agent(&node).await {
            Ok(()) => {}
            Err(e) if plan.registration == RegistrationPolicy::BestEffort => {
                warn!(agent = %agent.label, error = %e, "continuing without agent");
                unregistered.push(agent.label.clone());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(unregistered)
}

/// Poll the public URL until the proxy stops answering with server errors.
/// Certificate issuance and the upstream restart both surface as 5xx.
async fn await_proxy(http: &reqwest::Client, url: &str, policy: PollPolicy) -> Result<reqwest::StatusCode> {
    let status = await_condition(&format!("{} to answer", url), policy, move || {
        http_status(http, url, |s| !s.is_server_error())
    })
    .await?;
    info!(url, %status, "proxy answering");
    Ok(status)
}
