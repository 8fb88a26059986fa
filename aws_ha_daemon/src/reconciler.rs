//! The failover reconciliation ticket: compare the desired state (this
//! member active) with the observed cloud state and issue the mutations that
//! close the gap.
//!
//! A ticket is complete when it finds nothing to change; only then does the
//! status file advance to DONE. A ticket that issued mutations leaves the
//! status at IN_PROGRESS and lets the next poll confirm convergence.

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, instrument};

use aws_ha_shared::crossaz;
use aws_ha_shared::ec2::{Ec2Gateway, RouteDestination};
use aws_ha_shared::status::{update_status_file, FailoverStatus};
use aws_ha_shared::topology::InterfaceType;
use aws_ha_shared::Error;

use crate::config::{ClusterMode, DeployMode};
use crate::controller::Controller;

/// Fan-out degree of the mutation worker pool.
const POOL_SIZE: usize = 10;

/// One planned cloud mutation. Payloads are immutable; execution order
/// between ops is unspecified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudOp {
    ReplaceRoute {
        rtb_id: String,
        destination: RouteDestination,
        eni_id: String,
        /// The ENI the route pointed at before the replacement.
        previous_eni: Option<String>,
    },
    AssignPrivateIps {
        eni_id: String,
        addresses: Vec<String>,
    },
    AssociateAddress {
        eni_id: String,
        private_ip: String,
        allocation_id: String,
    },
}

impl std::fmt::Display for CloudOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudOp::ReplaceRoute {
                rtb_id,
                destination,
                eni_id,
                ..
            } => write!(f, "replace route rtb_id={}, {}, eni_id={}", rtb_id, destination, eni_id),
            CloudOp::AssignPrivateIps { eni_id, addresses } => {
                write!(f, "assign {:?} to {}", addresses, eni_id)
            }
            CloudOp::AssociateAddress {
                eni_id,
                private_ip,
                allocation_id,
            } => write!(
                f,
                "associate {} with {} on {}",
                allocation_id, private_ip, eni_id
            ),
        }
    }
}

#[derive(Debug)]
pub struct OpReport {
    pub op: CloudOp,
    pub ok: bool,
}

/// Performs the takeover for this member. Route redirection and secondary-IP
/// reassignment are planned from the enriched topology and executed before
/// the completion decision.
#[instrument(skip(ctrl), err)]
pub async fn set_local_active(ctrl: &mut Controller) -> Result<(), Error> {
    info!("set_local_active called");
    update_status_file(&ctrl.paths.status_file, FailoverStatus::InProgress)?;

    let mut ops = plan_route_ops(ctrl).await?;
    if ctrl.config.cluster_mode == ClusterMode::HighAvailability {
        // Secondary IPs move with the member in a single AZ; across AZs only
        // the elastic IPs can follow.
        match ctrl.config.deploy_mode {
            DeployMode::SingleAz => plan_private_ip_assignments(ctrl, &mut ops),
            DeployMode::CrossAz => plan_address_associations(ctrl, &mut ops),
        }
    }

    let finished = ops.is_empty();
    let reports = execute_ops(&*ctrl.ec2, ops, ctrl.config.calls_in_parallel, false).await;
    for report in &reports {
        if !report.ok {
            error!("cloud mutation failed: {}", report.op);
        }
    }
    if finished {
        update_status_file(&ctrl.paths.status_file, FailoverStatus::Done)?;
    }
    Ok(())
}

/// Chooses and runs the configured route-replacement strategy.
pub async fn plan_route_ops(ctrl: &Controller) -> Result<Vec<CloudOp>, Error> {
    let mut ops = Vec::new();
    if ctrl.config.replace_all_route_tables {
        plan_all_route_tables(ctrl, &mut ops).await?;
    } else if !ctrl.topology.static_routes.is_empty() {
        plan_static_routes(ctrl, &mut ops).await?;
    } else {
        plan_by_interface(ctrl, &mut ops).await?;
    }
    Ok(ops)
}

/// Default strategy: walk every route table in every VPC the cluster touches
/// and repoint peer-owned routes at the corresponding local ENI.
async fn plan_all_route_tables(ctrl: &Controller, ops: &mut Vec<CloudOp>) -> Result<(), Error> {
    let migrating = ctrl.migrate.is_some();
    for vpc_id in ctrl.topology.vpc_ids() {
        for rtb in ctrl.ec2.route_tables_by_vpc(&vpc_id).await? {
            for route in &rtb.routes {
                let (Some(destination), Some(route_eni)) = (&route.destination, &route.eni_id)
                else {
                    continue;
                };
                for interface in &ctrl.topology.interfaces {
                    let peer_owned = if migrating {
                        interface
                            .migrate_peer_enis
                            .iter()
                            .any(|peer| &peer.id == route_eni)
                    } else {
                        interface
                            .peer_eni
                            .as_ref()
                            .map_or(false, |peer| &peer.id == route_eni)
                    };
                    if !peer_owned {
                        continue;
                    }
                    let Some(local_eni) = &interface.eni_id else {
                        continue;
                    };
                    ops.push(CloudOp::ReplaceRoute {
                        rtb_id: rtb.id.clone(),
                        destination: destination.clone(),
                        eni_id: local_eni.clone(),
                        previous_eni: Some(route_eni.clone()),
                    });
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Per-interface strategy: route tables are looked up by the interface's
/// subnet, falling back to the VPC's main table.
async fn plan_by_interface(ctrl: &Controller, ops: &mut Vec<CloudOp>) -> Result<(), Error> {
    let ha_single_az = ctrl.config.cluster_mode == ClusterMode::HighAvailability
        && ctrl.config.deploy_mode == DeployMode::SingleAz;
    for interface in &ctrl.topology.interfaces {
        debug!("interface name: {}", interface.name);
        // Single-AZ HA redirects internal routes only; the external side is
        // handled by secondary-IP reassignment.
        if ha_single_az && interface.if_type != InterfaceType::Internal {
            debug!("Interface is not internal");
            continue;
        }
        let (Some(vpc_id), Some(subnet_id), Some(local_eni)) =
            (&interface.vpc_id, &interface.subnet_id, &interface.eni_id)
        else {
            debug!("No subnet id");
            continue;
        };
        let mut route_tables = ctrl.ec2.route_tables_by_subnet(vpc_id, subnet_id).await?;
        if route_tables.is_empty() {
            route_tables = ctrl.ec2.main_route_tables(vpc_id).await?;
            if route_tables.is_empty() {
                return Err(Error::NoRouteTable);
            }
        }
        let peer_eni_id = interface.peer_eni.as_ref().map(|peer| peer.id.as_str());
        for rtb in route_tables {
            for route in &rtb.routes {
                let Some(destination) = &route.destination else {
                    debug!("no cidr and prefix_list");
                    continue;
                };
                let matches_peer = ctrl.config.replace_by_interface
                    && route.eni_id.as_deref() == peer_eni_id
                    && peer_eni_id.is_some();
                let matches_default = ctrl.config.always_replace_default
                    && *destination == RouteDestination::Cidr("0.0.0.0/0".to_owned());
                if matches_peer || matches_default {
                    ops.push(CloudOp::ReplaceRoute {
                        rtb_id: rtb.id.clone(),
                        destination: destination.clone(),
                        eni_id: local_eni.clone(),
                        previous_eni: route.eni_id.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Declared-route strategy: only routes whose current target differs from
/// the declaration are touched.
async fn plan_static_routes(ctrl: &Controller, ops: &mut Vec<CloudOp>) -> Result<(), Error> {
    for (rtb_id, routes) in ctrl.topology.resolved_static_routes() {
        let current = ctrl
            .ec2
            .route_table(&rtb_id)
            .await?
            .ok_or(Error::NoRouteTable)?;
        if current.routes.is_empty() {
            return Err(Error::NoRouteTable);
        }
        for declared in routes {
            let destination = RouteDestination::Cidr(declared.destination.clone());
            let current_target = current.routes.iter().find_map(|route| {
                (route.destination.as_ref() == Some(&destination)).then(|| route.eni_id.clone())
            });
            match current_target {
                Some(target) if target.as_deref() == Some(declared.target.as_str()) => {
                    debug!(
                        "{}: {} {} already set",
                        rtb_id, declared.destination, declared.target
                    );
                }
                other => ops.push(CloudOp::ReplaceRoute {
                    rtb_id: rtb_id.clone(),
                    destination,
                    eni_id: declared.target.clone(),
                    previous_eni: other.flatten(),
                }),
            }
        }
    }
    Ok(())
}

/// Single-AZ: claim every secondary private address the peer ENI holds.
fn plan_private_ip_assignments(ctrl: &Controller, ops: &mut Vec<CloudOp>) {
    info!("assign_private_ip_addresses called");
    for interface in &ctrl.topology.interfaces {
        let Some(peer) = &interface.peer_eni else {
            debug!("No peer interface");
            continue;
        };
        let addresses = peer.secondary_ips();
        debug!("Addresses to assign : {:?}", addresses);
        if addresses.is_empty() {
            debug!(
                "No secondary private addresses for interface {}",
                interface.name
            );
            continue;
        }
        let Some(eni_id) = &interface.eni_id else {
            continue;
        };
        ops.push(CloudOp::AssignPrivateIps {
            eni_id: eni_id.clone(),
            addresses,
        });
    }
}

/// Cross-AZ: re-associate every elastic IP the peer currently holds with the
/// mapped local private address.
fn plan_address_associations(ctrl: &Controller, ops: &mut Vec<CloudOp>) {
    debug!("associate_public_ip_addresses called");
    let Some(map) = crossaz::read_map(&ctrl.paths.pair_map) else {
        return;
    };
    for interface in &ctrl.topology.interfaces {
        let Some(peer) = &interface.peer_eni else {
            debug!("No peer interface");
            continue;
        };
        let Some(eni_id) = &interface.eni_id else {
            continue;
        };
        let allocations = peer.allocation_ids();
        if allocations.is_empty() {
            debug!(
                "No secondary public IPs found on peer interface {}",
                peer.id
            );
            continue;
        }
        for (peer_private_ip, allocation_id) in allocations {
            let Some(record) = map.get(&peer_private_ip) else {
                error!(
                    "No pair map entry for peer private IP {}; run {} restart on both members",
                    peer_private_ip,
                    aws_ha_shared::HA_CLI_COMMAND
                );
                continue;
            };
            debug!(
                "Allocation ID {} of remote private {} changed to local private {}",
                allocation_id, peer_private_ip, record.local_ip
            );
            ops.push(CloudOp::AssociateAddress {
                eni_id: eni_id.clone(),
                private_ip: record.local_ip.clone(),
                allocation_id,
            });
        }
    }
}

/// Executes the planned mutations, bounded to [`POOL_SIZE`] in-flight calls
/// when running in parallel, and joins them all before returning. A failed
/// `ReplaceRoute` falls back to `CreateRoute` unless migrating.
pub async fn execute_ops(
    ec2: &dyn Ec2Gateway,
    ops: Vec<CloudOp>,
    parallel: bool,
    migrating: bool,
) -> Vec<OpReport> {
    if parallel {
        stream::iter(ops.into_iter().map(|op| run_op(ec2, op, migrating)))
            .buffered(POOL_SIZE)
            .collect()
            .await
    } else {
        let mut reports = Vec::new();
        for op in ops {
            reports.push(run_op(ec2, op, migrating).await);
        }
        reports
    }
}

async fn run_op(ec2: &dyn Ec2Gateway, op: CloudOp, migrating: bool) -> OpReport {
    let ok = match &op {
        CloudOp::ReplaceRoute {
            rtb_id,
            destination,
            eni_id,
            ..
        } => match ec2.replace_route(rtb_id, destination, eni_id).await {
            Ok(()) => {
                debug!(
                    "replace route called: rtb_id={}, {}, eni_id={}",
                    rtb_id, destination, eni_id
                );
                true
            }
            Err(e) if !migrating => {
                debug!("replace route failed, creating instead: {}", e);
                match ec2.create_route(rtb_id, destination, eni_id).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!("{}", e);
                        false
                    }
                }
            }
            Err(e) => {
                error!("{}", e);
                false
            }
        },
        CloudOp::AssignPrivateIps { eni_id, addresses } => {
            match ec2.assign_private_ips(eni_id, addresses).await {
                Ok(()) => true,
                Err(e) => {
                    error!("{}", e);
                    false
                }
            }
        }
        CloudOp::AssociateAddress {
            eni_id,
            private_ip,
            allocation_id,
        } => match ec2.associate_address(eni_id, private_ip, allocation_id).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Failed to change Allocation ID {} to local private {}: {}",
                    allocation_id, private_ip, e
                );
                false
            }
        },
    };
    OpReport { op, ok }
}
