//! Well-known file locations, anchored at `$FWDIR`.

use std::path::{Path, PathBuf};

use crate::Error;

/// The on-disk layout the daemon and the validator share. Tests build one
/// under a temporary directory instead of `$FWDIR`.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Unix datagram socket the event server listens on.
    pub socket: PathBuf,
    /// Pid file written next to the socket.
    pub pid_file: PathBuf,
    /// Persistent Cross-AZ secondary-IP pair map.
    pub pair_map: PathBuf,
    /// Scratch sibling of the pair map rebuilt by the validator.
    pub pair_map_test: PathBuf,
    /// Pointer to the peer member's VIP-bearing private IP.
    pub remote_vip: PathBuf,
    /// Optional static route-table list.
    pub static_routes: PathBuf,
    /// Cluster and deployment mode overrides.
    pub mode_file: PathBuf,
    /// Three-valued failover status observable.
    pub status_file: PathBuf,
    /// Telemetry feature-flag file.
    pub cloud_features: PathBuf,
    /// Textual cloud version file.
    pub cloud_version: PathBuf,
    /// JSON mirror of the cloud version file.
    pub cloud_version_json: PathBuf,
    pub daemon_log: PathBuf,
    pub migrate_log: PathBuf,
}

impl Paths {
    pub fn from_env() -> Result<Self, Error> {
        let fwdir = std::env::var_os("FWDIR").ok_or(Error::MissingFwdir)?;
        Ok(Self::under(Path::new(&fwdir)))
    }

    pub fn under(fwdir: &Path) -> Self {
        Self {
            socket: fwdir.join("tmp/ha.sock"),
            pid_file: fwdir.join("tmp/ha.pid"),
            pair_map: fwdir.join("conf/aws_cross_az_cluster.json"),
            pair_map_test: fwdir.join("conf/aws_cross_az_cluster_test.json"),
            remote_vip: fwdir.join("conf/aws-ha.json"),
            static_routes: fwdir.join("conf/aws_rtb.json"),
            mode_file: fwdir.join("conf/aws_ha_mode.json"),
            status_file: fwdir.join("tmp/cloud_failover_status"),
            cloud_features: fwdir.join("conf/cloud-features.json"),
            cloud_version: PathBuf::from("/etc/cloud-version"),
            cloud_version_json: PathBuf::from("/etc/cloud-version.json"),
            daemon_log: fwdir.join("log/aws_had.elg"),
            migrate_log: fwdir.join("log/aws_ha_migrate.elg"),
        }
    }
}
