//! Migration mode: a one-shot pass that redirects routes still pointing at
//! a previous cluster topology's ENIs to this cluster's interfaces.

use std::path::Path;

use aws_ha_shared::ec2::RouteDestination;
use aws_ha_shared::paths::Paths;
use aws_ha_shared::{Error, MIGRATE_LOG_TARGET};
use tokio::process::Command;
use tracing::{error, info};

use crate::controller::Controller;
use crate::reconciler;

pub const MIGRATED_KEY: &str = "migrated_from";

/// The binary whose checks gate the migration.
const PREFLIGHT_COMMAND: &str = "aws-ha-test";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteChange {
    pub rtb_id: String,
    pub destination: RouteDestination,
    /// The ENI the route belonged to before the change.
    pub eni_id: Option<String>,
}

impl std::fmt::Display for RouteChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rtb_id={}, {}, eni_id={}",
            self.rtb_id,
            self.destination,
            self.eni_id.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrateContext {
    pub old_solution: String,
    pub eth0_peer_list: Vec<String>,
    pub eth1_peer_list: Vec<String>,
    pub changed_routes: Vec<RouteChange>,
    pub not_changed_routes: Vec<RouteChange>,
}

/// Runs the environment validator and refuses to migrate unless it passes.
/// Its report lands in the migration log either way.
pub async fn run_preflight() -> Result<(), Error> {
    info!(target: MIGRATE_LOG_TARGET, "Running HA test");
    let output = Command::new(PREFLIGHT_COMMAND).output().await?;
    // The validator writes its report to stderr.
    let report = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        error!(
            target: MIGRATE_LOG_TARGET,
            "HA test failed therefore route tables cannot be updated. Please check your cluster \
             environment, then run the migrate command again. {}",
            report
        );
        return Err(Error::Preflight(
            "HA test failed, route tables were not updated".to_owned(),
        ));
    }
    info!(target: MIGRATE_LOG_TARGET, "{}", report);
    info!(target: MIGRATE_LOG_TARGET, "All tests passed successfully");
    Ok(())
}

/// Resolves each interface's migrate peer list (the other member's ENI plus
/// the declared old-cluster ENIs), rewrites every peer-owned route to the
/// local interfaces and records the outcome.
pub async fn move_routes(ctrl: &mut Controller) -> Result<(), Error> {
    let Some(ctx) = &ctrl.migrate else {
        return Ok(());
    };
    let eth0_peer_list = ctx.eth0_peer_list.clone();
    let eth1_peer_list = ctx.eth1_peer_list.clone();

    ctrl.topology.enrich_metadata(&*ctrl.metadata).await;
    let ec2 = ctrl.ec2.clone();
    for interface in &mut ctrl.topology.interfaces {
        interface.migrate_peer_enis.clear();
        let Some(vpc_id) = interface.vpc_id.clone() else {
            continue;
        };
        let mut peer_ips: Vec<String> = Vec::new();
        if let Some(peer_ip) = &interface.peer_ip {
            peer_ips.push(peer_ip.clone());
        }
        match interface.name.as_str() {
            "eth0" => peer_ips.extend(eth0_peer_list.iter().cloned()),
            "eth1" => peer_ips.extend(eth1_peer_list.iter().cloned()),
            _ => {}
        }
        for peer_ip in peer_ips {
            if let Some(eni) = ec2.interface_by_private_ip(&vpc_id, &peer_ip).await? {
                interface.migrate_peer_enis.push(eni);
            }
        }
    }

    let ops = reconciler::plan_route_ops(ctrl).await?;
    let reports =
        reconciler::execute_ops(&*ctrl.ec2, ops, ctrl.config.calls_in_parallel, true).await;

    let mut changed = Vec::new();
    let mut not_changed = Vec::new();
    for report in reports {
        let reconciler::CloudOp::ReplaceRoute {
            rtb_id,
            destination,
            previous_eni,
            ..
        } = report.op
        else {
            continue;
        };
        let change = RouteChange {
            rtb_id,
            destination,
            eni_id: previous_eni,
        };
        if report.ok {
            changed.push(change);
        } else {
            not_changed.push(change);
        }
    }

    let paths = ctrl.paths.clone();
    if let Some(ctx) = &mut ctrl.migrate {
        ctx.changed_routes = changed;
        ctx.not_changed_routes = not_changed;
        log_route_table_report(ctx, &paths)?;
    }
    Ok(())
}

/// Writes the migration outcome to the migrate log and, on a clean pass,
/// stamps the cloud version files exactly once.
fn log_route_table_report(ctx: &MigrateContext, paths: &Paths) -> Result<(), Error> {
    if !ctx.not_changed_routes.is_empty() {
        error!(
            target: MIGRATE_LOG_TARGET,
            "Error in route tables updating. The route tables that have not changed yet are:"
        );
        for route in &ctx.not_changed_routes {
            error!(target: MIGRATE_LOG_TARGET, "{}", route);
        }
    } else {
        info!(
            target: MIGRATE_LOG_TARGET,
            "Updating route tables process finished successfully"
        );
        mark_migrated(&paths.cloud_version, &ctx.old_solution)?;
        aws_ha_shared::update_json_file(
            &paths.cloud_version_json,
            MIGRATED_KEY,
            serde_json::json!(ctx.old_solution),
        )?;
    }
    if ctx.changed_routes.is_empty() {
        info!(target: MIGRATE_LOG_TARGET, "None of the route tables have changed");
    } else {
        info!(target: MIGRATE_LOG_TARGET, "The route tables that have changed are:");
        for route in &ctx.changed_routes {
            info!(target: MIGRATE_LOG_TARGET, "{}", route);
        }
    }
    Ok(())
}

/// Appends the `migrated_from` line to the textual cloud version file unless
/// it is already there.
fn mark_migrated(path: &Path, old_solution: &str) -> Result<(), Error> {
    let text = std::fs::read_to_string(path)?;
    if !text.contains(MIGRATED_KEY) {
        let mut text = text;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("{}: {}\n", MIGRATED_KEY, old_solution));
        std::fs::write(path, text)?;
    }
    Ok(())
}
