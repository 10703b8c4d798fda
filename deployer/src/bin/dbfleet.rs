// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `dbfleet`: deploy a database cluster, or (on a target host) act as the
//! agent that installs one instance.

use anyhow::bail;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use dbfleet::confirm::AssumeYes;
use dbfleet::confirm::Confirm;
use dbfleet::confirm::ConfirmationPrompt;
use dbfleet::logging::LogConfig;
use dbfleet::logging::LogLevel;
use dbfleet::status::MemberObservation;
use dbfleet::ClusterSpec;
use dbfleet::DeployOptions;
use dbfleet::Deployer;
use dbfleet_node_agent::checks::CheckEnvironment;
use dbfleet_node_agent::executor::HostExecutor;
use dbfleet_node_agent::Agent;
use dbfleet_node_agent::AgentCommand;
use dbfleet_remote_exec::SshConnector;
use display_error_chain::DisplayErrorChain;
use slog::info;
use slog::warn;
use slog::Logger;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "dbfleet",
    about = "Deploy and tear down database clusters over ssh"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install the cluster described by a cluster file
    Deploy {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,

        /// Leave installed nodes in place if the deployment fails
        #[arg(long)]
        no_rollback: bool,
    },
    /// Stage the agent on every node and run its environment check, without
    /// installing anything
    Check {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Uninstall every node of the cluster, best effort
    Remove {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Print one replication status reading per node
    Status {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    #[command(flatten)]
    Agent(AgentCommand),
}

#[derive(Debug, Args)]
struct ClusterArgs {
    /// Path to the cluster file
    #[arg(short, long)]
    config: Utf8PathBuf,

    /// Override the log level from the cluster file
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

impl ClusterArgs {
    fn load(&self) -> anyhow::Result<(ClusterSpec, Logger)> {
        let spec = ClusterSpec::load(&self.config)
            .with_context(|| format!("loading {}", self.config))?;
        let log_config = match self.log_level {
            Some(level) => spec.log.with_level(level),
            None => spec.log.clone(),
        };
        let log = log_config.to_logger()?;
        Ok((spec, log))
    }

    fn deployer(&self) -> anyhow::Result<(Deployer, Logger)> {
        let (spec, log) = self.load()?;
        let connector =
            Arc::new(SshConnector::new(&log, spec.environment.timeouts));
        let deployer = Deployer::new(&log, spec, connector);
        cancel_on_interrupt(&log, &deployer);
        Ok((deployer, log))
    }
}

/// Ctrl-C fails the step in flight instead of killing the process, so
/// rollback still runs.
fn cancel_on_interrupt(log: &Logger, deployer: &Deployer) {
    let token = deployer.cancel_token();
    let log = log.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(log, "interrupted; cancelling");
            token.cancel();
        }
    });
}

fn confirmer(yes: bool) -> Box<dyn Confirm> {
    if yes {
        Box::new(AssumeYes)
    } else {
        Box::new(ConfirmationPrompt::new())
    }
}

fn print_status(observations: &[MemberObservation]) {
    for o in observations {
        println!("{:<40} {:<14} {}", o.address, o.role, o.status);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Deploy { cluster, yes, no_rollback } => {
            let (deployer, log) = cluster.deployer()?;
            let mut confirm = confirmer(yes);
            match deployer
                .deploy(DeployOptions { no_rollback }, confirm.as_mut())
                .await
            {
                Ok(summary) => {
                    println!("{summary}");
                    Ok(())
                }
                Err(failure) => {
                    eprintln!("{}", DisplayErrorChain::new(&failure));
                    eprintln!("{}", failure.rollback);
                    if let Some(host) = failure.error.host() {
                        info!(log, "failed host"; "host" => host);
                    }
                    bail!("deployment of {} failed", cluster.config)
                }
            }
        }
        Command::Check { cluster } => {
            let (deployer, _log) = cluster.deployer()?;
            let report = deployer.check().await?;
            println!("{report}");
            if !report.is_clean() {
                bail!("{} nodes failed the environment check", report.failed.len());
            }
            Ok(())
        }
        Command::Remove { cluster, yes } => {
            let (deployer, _log) = cluster.deployer()?;
            let mut confirm = confirmer(yes);
            let report = deployer.remove(confirm.as_mut()).await?;
            println!("{report}");
            if !report.is_clean() {
                bail!("some nodes could not be removed");
            }
            Ok(())
        }
        Command::Status { cluster } => {
            let (deployer, _log) = cluster.deployer()?;
            print_status(&deployer.status().await);
            Ok(())
        }
        Command::Agent(command) => {
            // The agent runs under the deployer's ssh session; its log goes
            // to stderr, which the deployer captures on failure.
            let log = LogConfig::default().to_logger()?;
            let agent = Agent::new(
                &log,
                HostExecutor::new(log.clone()).as_executor(),
                CheckEnvironment::from_host(),
            );
            agent.run(&command).await?;
            Ok(())
        }
    }
}
