use std::path::PathBuf;

use anyhow::{Result, ensure};
use clap::{Args, Parser, Subcommand, ValueHint, builder::NonEmptyStringValueParser};

/// Options for `create`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub agents: Option<usize>,
    pub config_repo: Option<String>,
    pub branch: Option<String>,
    pub skip_validation: bool,
    pub skip_dns: bool,
    pub skip_proxy: bool,
    pub keep_on_failure: bool,
}

/// The command requested by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create(CreateOptions),
    CreateDns,
    SetupNginx,
    Test { job: Option<String> },
    Cleanup { keep_vms: bool, skip_dns: bool },
    Status,
}

/// Options shared by every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub global: GlobalOptions,
    pub command: Command,
}

/// Parse CLI arguments into an invocation.
pub fn parse() -> Result<Invocation> {
    from_cli(Cli::parse())
}

pub fn parse_from<I, T>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    from_cli(Cli::try_parse_from(args)?)
}

fn from_cli(cli: Cli) -> Result<Invocation> {
    let command = match cli.command {
        Sub::Create(args) => {
            ensure!(
                args.branch.is_none() || args.config_repo.is_some(),
                "--branch requires --config-repo"
            );
            Command::Create(CreateOptions {
                agents: args.agents,
                config_repo: args.config_repo,
                branch: args.branch,
                skip_validation: args.skip_validation,
                skip_dns: args.skip_dns,
                skip_proxy: args.skip_proxy || args.skip_dns,
                keep_on_failure: args.keep_on_failure,
            })
        }
        Sub::CreateDns => Command::CreateDns,
        Sub::SetupNginx => Command::SetupNginx,
        Sub::Test { job } => Command::Test { job },
        Sub::Cleanup { keep_vms, skip_dns } => Command::Cleanup { keep_vms, skip_dns },
        Sub::Status => Command::Status,
    };

    Ok(Invocation {
        global: GlobalOptions {
            config: cli.config,
            state_dir: cli.state_dir,
            log_level: cli.log_level,
        },
        command,
    })
}

#[derive(Parser, Debug)]
#[command(
    name = "ci-provisioner",
    version,
    about = "Provision ephemeral CI environments on a cloud provider",
    disable_help_subcommand = true
)]
struct Cli {
    /// Settings file. Defaults to the nearest provisioner.toml.
    #[arg(long, global = true, value_name = "PATH", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Directory holding the instance inventory.
    #[arg(long, global = true, value_name = "DIR", value_hint = ValueHint::DirPath)]
    state_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(
        long,
        global = true,
        value_name = "LEVEL",
        default_value = "info",
        value_parser = NonEmptyStringValueParser::new()
    )]
    log_level: String,

    #[command(subcommand)]
    command: Sub,
}

#[derive(Subcommand, Debug)]
enum Sub {
    /// Provision controller and agents, install CI, publish DNS and the proxy.
    #[command(alias = "create_jenkins")]
    Create(CreateArgs),

    /// Publish the DNS record for the recorded controller.
    #[command(alias = "create_dns")]
    CreateDns,

    /// Install the TLS reverse proxy on the recorded controller.
    #[command(alias = "setup_nginx")]
    SetupNginx,

    /// Check the CI server and run the validation job.
    #[command(alias = "test_pipeline")]
    Test {
        /// Job to run instead of the configured one.
        #[arg(long, value_parser = NonEmptyStringValueParser::new())]
        job: Option<String>,
    },

    /// Delete recorded instances and the DNS record, then forget them.
    Cleanup {
        /// Forget the instances without deleting them.
        #[arg(long)]
        keep_vms: bool,

        /// Leave the DNS record in place.
        #[arg(long)]
        skip_dns: bool,
    },

    /// Print the recorded inventory as JSON.
    Status,
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Number of agents to provision.
    #[arg(long, value_name = "N")]
    agents: Option<usize>,

    /// Repository with the CI server image and configuration.
    #[arg(long, value_name = "URL", value_parser = NonEmptyStringValueParser::new())]
    config_repo: Option<String>,

    /// Branch of the configuration repository.
    #[arg(long, value_parser = NonEmptyStringValueParser::new())]
    branch: Option<String>,

    /// Do not run the validation job.
    #[arg(long)]
    skip_validation: bool,

    /// Do not publish DNS (implies --skip-proxy).
    #[arg(long)]
    skip_dns: bool,

    /// Do not install the reverse proxy.
    #[arg(long)]
    skip_proxy: bool,

    /// Keep instances when a phase fails.
    #[arg(long)]
    keep_on_failure: bool,
}
