use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::ci::JenkinsConnector;
use crate::cli::{Command, CreateOptions, GlobalOptions, Invocation};
use crate::config::Settings;
use crate::coordinator::{Coordinator, CreatePlan, CreateReport, DnsPlan, Services, TeardownReport};
use crate::dns::{DnsReconciler, HetznerDns, HickoryResolver};
use crate::error::Error;
use crate::inventory::Inventory;
use crate::provider::{HetznerCloud, InstanceSpec, ProviderClient};
use crate::readiness::TcpProbe;
use crate::recipes::{self, ControllerOptions, RecipeBook};
use crate::remote::{ChannelPool, SshCredential, SshFactory};

pub fn run(invocation: Invocation) -> Result<i32> {
    let settings = match load_settings(&invocation.global) {
        Ok(settings) => settings,
        Err(err) => return Ok(report_failure(&err)),
    };

    if invocation.command == Command::Status {
        return Ok(match print_status(&settings) {
            Ok(()) => 0,
            Err(err) => report_failure(&err),
        });
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    Ok(match runtime.block_on(execute(invocation.command, &settings)) {
        Ok(code) => code,
        Err(err) => report_failure(&err),
    })
}

fn load_settings(global: &GlobalOptions) -> crate::Result<Settings> {
    let mut settings = match &global.config {
        Some(path) => Settings::load(path)?,
        None => Settings::discover()?,
    };
    settings.apply_process_env()?;
    if let Some(dir) = &global.state_dir {
        settings.state_dir = dir.clone();
    }
    Ok(settings)
}

/// Inventory as JSON; never touches the network.
fn print_status(settings: &Settings) -> crate::Result<()> {
    let inventory = Inventory::load(&settings.state_dir)?;
    let status = json!({
        "state_dir": settings.state_dir,
        "controller": inventory.controller(),
        "agents": inventory.agents(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Print the failing phase and the underlying error; returns the exit code.
fn report_failure(err: &Error) -> i32 {
    match err.phase() {
        Some(phase) => eprintln!("error: phase {} failed: {}", phase, err.root()),
        None => eprintln!("error: {}", err),
    }
    if let Error::CommandFailed { stderr, .. } = err.root() {
        if !stderr.trim().is_empty() {
            eprintln!("remote stderr:\n{}", stderr.trim_end());
        }
    }
    err.exit_code()
}

async fn execute(command: Command, settings: &Settings) -> crate::Result<i32> {
    match command {
        Command::Create(options) => {
            let plan = create_plan(settings, &options)?;
            let mut coordinator = coordinator(settings, true, true)?;
            let report = coordinator.create(&plan).await?;
            print_create_report(&report);
            Ok(0)
        }
        Command::CreateDns => {
            let plan = dns_plan(settings)?;
            settings.dns_api_token()?;
            let mut coordinator = coordinator(settings, true, false)?;
            let ip = coordinator.create_dns(&plan).await?;
            println!("{} -> {}", plan.domain, ip);
            Ok(0)
        }
        Command::SetupNginx => {
            let domain = settings.domain()?;
            let recipe = recipes::reverse_proxy(&domain, settings.ssl_email()?, settings.ci_port);
            settings.ssh_private_key()?;
            let mut coordinator = coordinator(settings, true, true)?;
            coordinator.setup_proxy(&recipe, &domain, settings.ssh_port).await?;
            println!("reverse proxy ready: https://{}", domain);
            Ok(0)
        }
        Command::Test { job } => {
            settings.ci_user()?;
            settings.ci_password()?;
            let job = job.or_else(|| settings.job_name.clone());
            let mut coordinator = coordinator(settings, true, false)?;
            match coordinator.test(settings.ci_port, job.as_deref()).await? {
                Some(run) => println!(
                    "{} #{} {}",
                    run.job,
                    run.build_number.unwrap_or_default(),
                    run.status
                ),
                None => println!("CI server reachable"),
            }
            Ok(0)
        }
        Command::Cleanup { keep_vms, skip_dns } => {
            let dns = if skip_dns {
                None
            } else {
                match (dns_plan(settings), settings.dns_api_token()) {
                    (Ok(plan), Ok(_)) => Some(plan),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(reason = %e, "skipping DNS cleanup");
                        None
                    }
                }
            };
            let mut coordinator = coordinator(settings, !keep_vms, false)?;
            let report = coordinator.teardown(!keep_vms, dns.as_ref()).await;
            print_teardown_report(&report);
            Ok(if report.is_clean() { 0 } else { 1 })
        }
        Command::Status => print_status(settings).map(|()| 0),
    }
}

fn instance_spec(settings: &Settings) -> crate::Result<InstanceSpec> {
    Ok(InstanceSpec {
        image: settings.image.clone(),
        server_type: settings.server_type()?.to_string(),
        location: settings.location.clone(),
        ssh_key: settings.ssh_key_name()?.to_string(),
    })
}

fn dns_plan(settings: &Settings) -> crate::Result<DnsPlan> {
    Ok(DnsPlan {
        zone: settings.zone_name()?.to_string(),
        domain: settings.domain()?,
        ttl: settings.dns_ttl,
    })
}

/// Every input `create` needs, checked before anything is provisioned.
fn create_plan(settings: &Settings, options: &CreateOptions) -> crate::Result<CreatePlan> {
    settings.api_token()?;
    let instance = instance_spec(settings)?;
    settings.ssh_private_key()?;

    let dns = if options.skip_dns {
        None
    } else {
        settings.dns_api_token()?;
        Some(dns_plan(settings)?)
    };

    let config_repo = match &options.config_repo {
        Some(repo) => repo.clone(),
        None => settings.config_repo()?.to_string(),
    };
    let controller = recipes::controller(&ControllerOptions {
        admin_user: settings.ci_user()?.to_string(),
        admin_password: settings.ci_password()?.to_string(),
        config_repo,
        branch: options.branch.clone().or_else(|| settings.config_branch.clone()),
        public_domain: dns.as_ref().map(|d| d.domain.clone()),
        port: settings.ci_port,
    });
    let proxy = match (&dns, options.skip_proxy) {
        (Some(dns), false) => Some(recipes::reverse_proxy(
            &dns.domain,
            settings.ssl_email()?,
            settings.ci_port,
        )),
        _ => None,
    };

    let validation_job = if options.skip_validation {
        None
    } else {
        settings.job_name.clone()
    };

    Ok(CreatePlan {
        instance,
        agent_count: options.agents.unwrap_or(settings.agent_count),
        ssh_port: settings.ssh_port,
        ci_port: settings.ci_port,
        recipes: RecipeBook {
            controller,
            agent: recipes::agent(&settings.agent_remote_fs),
            proxy,
        },
        agent_label: settings.agent_label.clone(),
        agent_credentials_id: settings.agent_credentials_id.clone(),
        agent_remote_fs: settings.agent_remote_fs.clone(),
        registration: settings.agent_registration,
        validation_job,
        dns,
        teardown_on_failure: settings.teardown_on_failure && !options.keep_on_failure,
    })
}

fn coordinator(settings: &Settings, with_provider: bool, with_ssh: bool) -> crate::Result<Coordinator> {
    let inventory = Inventory::load(&settings.state_dir)?;

    // not contacted when instances are only forgotten
    let token = if with_provider {
        settings.api_token()?
    } else {
        settings.api_token.as_deref().unwrap_or_default()
    };
    let provider = ProviderClient::new(Arc::new(HetznerCloud::new(token)?));

    let credential = if with_ssh {
        Some(SshCredential::from_pem(&settings.ssh_user, &settings.ssh_private_key()?)?)
    } else {
        None
    };
    let factory = SshFactory::new(credential, settings.ssh_port, settings.timing.ssh_connect_timeout());

    let ci = match (&settings.ci_user, &settings.ci_password) {
        (Some(user), Some(password)) => JenkinsConnector::new(user, password),
        _ => JenkinsConnector::unconfigured(),
    };

    let dns = match &settings.dns_api_token {
        Some(token) => Some(DnsReconciler::new(
            Arc::new(HetznerDns::new(token)?),
            Arc::new(HickoryResolver::new(&settings.nameservers)),
        )),
        None => None,
    };

    let services = Services {
        provider,
        probe: Arc::new(TcpProbe {
            connect_timeout: settings.timing.ssh_connect_timeout(),
        }),
        channels: ChannelPool::new(Arc::new(factory)),
        ci: Arc::new(ci),
        dns,
        http: reqwest::Client::new(),
    };

    let mut coordinator = Coordinator::new(inventory, services, settings.timing());
    coordinator.on_event(Box::new(|event| tracing::debug!(?event, "run event")));
    Ok(coordinator)
}

fn print_create_report(report: &CreateReport) {
    info!(controller = %report.controller_ip, "create finished");
    println!("controller: {}", report.controller_ip);
    println!("ci server:  {}", report.ci_url);
    for agent in &report.agents {
        println!("{}:    {} ({})", agent.label, agent.ip, agent.name);
    }
    if !report.unregistered_agents.is_empty() {
        println!("not registered: {}", report.unregistered_agents.join(", "));
    }
    if let Some(run) = &report.build {
        println!(
            "validation: {} #{} {}",
            run.job,
            run.build_number.unwrap_or_default(),
            run.status
        );
    }
    if let Some(domain) = &report.domain {
        println!("domain:     {}", domain);
    }
}

fn print_teardown_report(report: &TeardownReport) {
    for label in &report.deleted {
        println!("deleted {}", label);
    }
    for label in &report.released {
        println!("forgot {} (instance kept)", label);
    }
    if let Some(outcome) = report.dns {
        println!("dns record: {:?}", outcome);
    }
    for failure in &report.failures {
        eprintln!("cleanup failed: {}", failure);
    }
}
