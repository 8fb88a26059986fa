//! The controller value owned by the event server: configuration, topology
//! and the collaborator handles, plus the poll/reconfigure entry points.

use std::net::Ipv4Addr;
use std::sync::Arc;

use aws_ha_shared::cluster::{ClusterSnapshot, ClusterStateOracle};
use aws_ha_shared::crossaz::{self, CrossAzMapEngine, MapInputs};
use aws_ha_shared::dynobj::DynamicObjectRegistry;
use aws_ha_shared::ec2::Ec2Gateway;
use aws_ha_shared::metadata::InstanceMetadata;
use aws_ha_shared::paths::Paths;
use aws_ha_shared::status::{update_status_file, FailoverStatus};
use aws_ha_shared::topology::Topology;
use aws_ha_shared::{cluster, features, Error};
use tracing::{debug, error, info, instrument};

use crate::config::{ClusterMode, Config, DeployMode};
use crate::migrate::MigrateContext;
use crate::reconciler;

pub struct Controller {
    pub config: Config,
    pub paths: Paths,
    pub topology: Topology,
    pub ec2: Arc<dyn Ec2Gateway>,
    pub metadata: Arc<dyn InstanceMetadata>,
    pub cluster: Arc<dyn ClusterStateOracle>,
    pub dynobj: Arc<dyn DynamicObjectRegistry>,
    pub migrate: Option<MigrateContext>,
}

/// Whether this member must take over the cloud resources, per the cluster
/// mode election rules. In active-active the numerically lower primary IP is
/// the master; the slave acts only while the master is down.
pub fn should_work(mode: ClusterMode, snapshot: &ClusterSnapshot) -> Result<bool, Error> {
    let local_active = snapshot.local.is_active();
    let remote_active = snapshot.remote.is_active();
    match mode {
        ClusterMode::HighAvailability => Ok(local_active),
        ClusterMode::ActiveActive => {
            let local_ip: Ipv4Addr = snapshot
                .local
                .ip
                .parse()
                .map_err(|_| Error::InvalidIp(snapshot.local.ip.clone()))?;
            let remote_ip: Ipv4Addr = snapshot
                .remote
                .ip
                .parse()
                .map_err(|_| Error::InvalidIp(snapshot.remote.ip.clone()))?;
            let im_master = local_ip < remote_ip;
            debug!(
                "\"Active Active\" mode and local found as \"{}\"",
                if im_master { "master" } else { "slave" }
            );
            if im_master {
                Ok(local_active)
            } else {
                Ok(local_active && !remote_active)
            }
        }
    }
}

impl Controller {
    /// Full reconfiguration: reload the cluster topology, intersect it with
    /// the cloud's view of this instance, pick up the static route list and
    /// run a poll cycle.
    #[instrument(skip(self), err)]
    pub async fn reconf(&mut self) -> Result<(), Error> {
        self.topology = Topology::load(self.config.remote).await?;
        self.topology
            .restrict_to_instance(&*self.metadata, &*self.ec2)
            .await?;
        if self.migrate.is_none() {
            self.topology
                .load_static_routes(&self.paths.static_routes)?;
        }
        debug!("cphaconf:\n{:?}", self.topology);
        self.poll().await
    }

    /// One poll cycle: read the members' states, decide whether this member
    /// must act, and reconcile the cloud resources accordingly.
    #[instrument(skip(self), err)]
    pub async fn poll(&mut self) -> Result<(), Error> {
        info!("poll called");
        let snapshot = self.cluster.snapshot().await?;
        info!(
            "local addr: {}, state: {}",
            snapshot.local.ip, snapshot.local.state
        );
        info!(
            "remote addr: {}, state: {}",
            snapshot.remote.ip, snapshot.remote.state
        );

        let should_work = should_work(self.config.cluster_mode, &snapshot)?;
        if !should_work {
            update_status_file(&self.paths.status_file, FailoverStatus::NotStarted)?;
        }
        if !should_work && self.config.deploy_mode == DeployMode::SingleAz {
            return Ok(());
        }

        if self.migrate.is_some() {
            if should_work {
                info!(target: aws_ha_shared::MIGRATE_LOG_TARGET, "Updating route tables...");
                crate::migrate::move_routes(self).await?;
            } else {
                info!(
                    target: aws_ha_shared::MIGRATE_LOG_TARGET,
                    "Check route tables updating information on the other member"
                );
            }
            return Ok(());
        }

        self.update_interfaces(should_work).await
    }

    /// Refreshes the interfaces' cloud-side data, keeps the Cross-AZ map
    /// current, then performs the takeover when this member is the one that
    /// must act.
    async fn update_interfaces(&mut self, should_work: bool) -> Result<(), Error> {
        debug!("Updating interfaces metadata");
        let cross_az = self.config.deploy_mode == DeployMode::CrossAz;
        if cross_az && self.config.cross_az_map_up_to_date && !should_work {
            return Ok(());
        }
        self.topology.enrich_metadata(&*self.metadata).await;
        self.topology.enrich_enis(&*self.ec2, cross_az).await?;
        if cross_az && !self.config.cross_az_map_up_to_date {
            self.update_cross_az_map().await?;
        }
        if should_work {
            reconciler::set_local_active(self).await?;
        }
        Ok(())
    }

    /// Runs the map engine for every non-internal interface pair. Pairing
    /// problems are logged and leave the map untouched; infrastructure
    /// failures abort the ticket.
    async fn update_cross_az_map(&mut self) -> Result<(), Error> {
        let local_vip_ip = cluster::alias_ip("eth0", 1).await?;
        let remote_vip_ip = crossaz::read_remote_vip(&self.paths.remote_vip)?;
        let mut updated = false;
        for interface in &self.topology.interfaces {
            if interface.is_internal() {
                continue;
            }
            let (Some(local_eni), Some(peer_eni)) = (&interface.local_eni, &interface.peer_eni)
            else {
                debug!("No peer interface");
                continue;
            };
            let engine = CrossAzMapEngine::new(&*self.dynobj, &self.paths.pair_map);
            let inputs = MapInputs {
                local_eni,
                peer_eni,
                local_vip_ip: local_vip_ip.clone(),
                remote_vip_ip: remote_vip_ip.clone(),
            };
            match engine.update(&inputs).await {
                Ok(map) => {
                    updated = true;
                    if let Err(e) =
                        features::set_multiple_vips_flag(&self.paths.cloud_features, map.len())
                    {
                        debug!("Failed to send multiple VIPs statistic: {}", e);
                    }
                }
                Err(e) if e.is_map_update_error() => {
                    error!("Updating Cross AZ Cluster map Failed: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        if updated {
            self.config.cross_az_map_up_to_date = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use aws_ha_shared::cluster::MemberState;

    use super::*;

    fn snapshot(local: (&str, &str), remote: (&str, &str)) -> ClusterSnapshot {
        ClusterSnapshot {
            local: MemberState {
                ip: local.0.to_owned(),
                state: local.1.to_owned(),
            },
            remote: MemberState {
                ip: remote.0.to_owned(),
                state: remote.1.to_owned(),
            },
        }
    }

    #[test]
    fn ha_mode_follows_local_state() {
        let mode = ClusterMode::HighAvailability;
        assert!(should_work(mode, &snapshot(("10.0.0.7", "active"), ("10.0.0.3", "standby"))).unwrap());
        assert!(!should_work(mode, &snapshot(("10.0.0.7", "standby"), ("10.0.0.3", "active"))).unwrap());
    }

    #[test]
    fn active_active_slave_defers_to_master() {
        let mode = ClusterMode::ActiveActive;
        // 10.0.0.7 > 10.0.0.3, so the local member is the slave.
        let both_active = snapshot(("10.0.0.7", "active"), ("10.0.0.3", "active"));
        assert!(!should_work(mode, &both_active).unwrap());
        // On the remote (master) side the same situation elects it.
        let master_view = snapshot(("10.0.0.3", "active"), ("10.0.0.7", "active"));
        assert!(should_work(mode, &master_view).unwrap());
    }

    #[test]
    fn active_active_slave_acts_when_master_is_down() {
        let mode = ClusterMode::ActiveActive;
        let master_down = snapshot(("10.0.0.7", "active"), ("10.0.0.3", "down"));
        assert!(should_work(mode, &master_down).unwrap());
        let local_down = snapshot(("10.0.0.7", "down"), ("10.0.0.3", "down"));
        assert!(!should_work(mode, &local_down).unwrap());
    }

    #[test]
    fn master_election_uses_numeric_ordering() {
        let mode = ClusterMode::ActiveActive;
        // String comparison would call 10.0.0.9 > 10.0.0.10; numeric must not.
        let view = snapshot(("10.0.0.9", "active"), ("10.0.0.10", "active"));
        assert!(should_work(mode, &view).unwrap());
    }

    #[test]
    fn malformed_ip_is_rejected() {
        let mode = ClusterMode::ActiveActive;
        let view = snapshot(("not-an-ip", "active"), ("10.0.0.3", "active"));
        assert!(matches!(
            should_work(mode, &view),
            Err(Error::InvalidIp(_))
        ));
    }

    #[tokio::test]
    async fn standby_single_az_member_only_marks_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let ec2 = crate::testutil::FakeEc2::default();
        let mut ctrl = crate::testutil::controller(&dir, ec2.clone());
        ctrl.cluster = Arc::new(crate::testutil::FakeCluster {
            snapshot: snapshot(("10.0.1.5", "standby"), ("10.0.1.6", "active")),
        });

        ctrl.poll().await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&ctrl.paths.status_file).unwrap(),
            FailoverStatus::NotStarted.as_str()
        );
        assert!(ec2.calls().is_empty());
    }
}
