//! `aws-had`, the HA failover daemon for a two-member firewall cluster on
//! AWS. Reacts to cluster-state change events and repoints route tables,
//! secondary private IPs and elastic IPs at the active member.

use std::sync::Arc;

use aws_ha_shared::cluster::CphaProb;
use aws_ha_shared::dynobj::DynamicObjectsCli;
use aws_ha_shared::ec2::AwsEc2;
use aws_ha_shared::metadata::ImdsClient;
use aws_ha_shared::paths::Paths;
use aws_ha_shared::topology::Topology;
use aws_ha_shared::{Error, RETRY_PAUSE};
use clap::{Parser, Subcommand};
use tracing::{error, info};

mod config;
mod controller;
mod migrate;
mod reconciler;
mod server;
#[cfg(test)]
mod testutil;

use config::Config;
use controller::Controller;
use migrate::MigrateContext;
use server::EventServer;

#[derive(Debug, Parser)]
#[command(name = "aws-had")]
struct Cli {
    /// enable debug
    #[arg(short, long)]
    debug: bool,
    /// run outside of AWS
    #[arg(short, long)]
    remote: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// run migrating process - change routes between solutions
    Migrate {
        #[arg(long, default_value = "geo", hide = true)]
        old_solution: String,
        /// eth0 IPs of old cluster members separated by space
        #[arg(long, num_args = 1.., required = true)]
        eth0_peer_list: Vec<String>,
        /// eth1 IPs of old cluster members separated by space
        #[arg(long, num_args = 1.., required = true)]
        eth1_peer_list: Vec<String>,
    },
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}

async fn run(mut cli: Cli) -> Result<(), Error> {
    let paths = Paths::from_env()?;
    let migrating = cli.command.is_some();
    let _guards = aws_ha_shared::init_daemon_tracing(
        cli.debug,
        &paths.daemon_log,
        migrating.then_some(paths.migrate_log.as_path()),
    )?;

    let migrate = match cli.command.take() {
        Some(Command::Migrate {
            old_solution,
            eth0_peer_list,
            eth1_peer_list,
        }) => {
            info!(
                target: aws_ha_shared::MIGRATE_LOG_TARGET,
                "Starting updating route tables process"
            );
            migrate::run_preflight().await?;
            Some(MigrateContext {
                old_solution,
                eth0_peer_list,
                eth1_peer_list,
                changed_routes: Vec::new(),
                not_changed_routes: Vec::new(),
            })
        }
        None => {
            info!("Started");
            None
        }
    };

    // Init retries forever on transient failure; only a configuration the
    // operator must fix first gets to kill the process.
    let mut ctrl = loop {
        match init_controller(&cli, &paths, migrate.clone()).await {
            Ok(ctrl) => break ctrl,
            Err(e @ Error::MissingRegion) => return Err(e),
            Err(e) => {
                error!("{}", e);
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    };

    if ctrl.migrate.is_some() {
        return Ok(());
    }

    let server = EventServer::bind(&paths)?;
    server.run(&mut ctrl).await
}

/// Builds the configuration and collaborators and runs the first
/// reconfiguration cycle.
async fn init_controller(
    cli: &Cli,
    paths: &Paths,
    migrate: Option<MigrateContext>,
) -> Result<Controller, Error> {
    let metadata = Arc::new(ImdsClient::new());
    let config = Config::init(cli.remote, &*metadata, paths).await?;
    let ec2 = AwsEc2::new(&config.region, config.credentials()).await;
    let mut ctrl = Controller {
        config,
        paths: paths.clone(),
        topology: Topology::default(),
        ec2: Arc::new(ec2),
        metadata,
        cluster: Arc::new(CphaProb),
        dynobj: Arc::new(DynamicObjectsCli),
        migrate,
    };
    ctrl.reconf().await?;
    Ok(ctrl)
}
