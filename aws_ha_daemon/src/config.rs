//! Daemon configuration, assembled from the environment, the instance
//! metadata and the cluster mode file.

use std::path::Path;
use std::str::FromStr;

use aws_ha_shared::metadata::{self, InstanceMetadata};
use aws_ha_shared::paths::Paths;
use aws_ha_shared::Error;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ClusterMode {
    HighAvailability,
    ActiveActive,
}

impl FromStr for ClusterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high_availability" => Ok(ClusterMode::HighAvailability),
            "active_active" => Ok(ClusterMode::ActiveActive),
            other => Err(Error::UnknownClusterMode(other.to_owned())),
        }
    }
}

impl TryFrom<String> for ClusterMode {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum DeployMode {
    SingleAz,
    CrossAz,
}

impl FromStr for DeployMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_az" => Ok(DeployMode::SingleAz),
            "cross_az" => Ok(DeployMode::CrossAz),
            other => Err(Error::UnknownDeployMode(other.to_owned())),
        }
    }
}

impl TryFrom<String> for DeployMode {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

/// Optional overrides read from the mode file.
#[derive(Debug, Clone, Default, Deserialize)]
struct ModeFile {
    cluster_mode: Option<ClusterMode>,
    deploy_mode: Option<DeployMode>,
    replace_by_interface: Option<bool>,
    always_replace_default: Option<bool>,
    replace_all_route_tables: Option<bool>,
    calls_in_parallel: Option<bool>,
}

impl ModeFile {
    fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,
    pub cluster_mode: ClusterMode,
    pub deploy_mode: DeployMode,
    pub replace_by_interface: bool,
    pub always_replace_default: bool,
    pub replace_all_route_tables: bool,
    pub calls_in_parallel: bool,
    /// Set once a Cross-AZ map update succeeded; idle standby polls skip the
    /// rebuild while it holds.
    pub cross_az_map_up_to_date: bool,
    pub remote: bool,
    pub proxy: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl Config {
    /// Builds the runtime configuration. Remote mode takes the region and
    /// credentials from the environment; on a member the region comes from
    /// the instance's availability zone and the modes from the mode file.
    pub async fn init(
        remote: bool,
        metadata: &dyn InstanceMetadata,
        paths: &Paths,
    ) -> Result<Self, Error> {
        let mut config = Config {
            region: String::new(),
            cluster_mode: ClusterMode::HighAvailability,
            deploy_mode: DeployMode::SingleAz,
            replace_by_interface: true,
            always_replace_default: false,
            replace_all_route_tables: true,
            calls_in_parallel: false,
            cross_az_map_up_to_date: false,
            remote,
            proxy: proxy_from_env(),
            access_key: None,
            secret_key: None,
        };
        if remote {
            config.region = std::env::var("EC2_REGION").map_err(|_| Error::MissingRegion)?;
            config.access_key = std::env::var("AWS_ACCESS_KEY").ok();
            config.secret_key = std::env::var("AWS_SECRET_KEY").ok();
        } else {
            config.region = metadata::region(metadata).await?;
            let modes = ModeFile::load(&paths.mode_file)?;
            if let Some(mode) = modes.cluster_mode {
                config.cluster_mode = mode;
            }
            if let Some(mode) = modes.deploy_mode {
                config.deploy_mode = mode;
            }
            if let Some(value) = modes.replace_by_interface {
                config.replace_by_interface = value;
            }
            if let Some(value) = modes.always_replace_default {
                config.always_replace_default = value;
            }
            if let Some(value) = modes.replace_all_route_tables {
                config.replace_all_route_tables = value;
            }
            if let Some(value) = modes.calls_in_parallel {
                config.calls_in_parallel = value;
            }
            debug!("Cluster operation mode: {:?}", config.cluster_mode);
            debug!("Cluster deployment mode: {:?}", config.deploy_mode);
        }
        debug!(
            "init_conf: region={} replace_by_interface={} always_replace_default={} \
             replace_all_route_tables={} calls_in_parallel={} proxy={:?}",
            config.region,
            config.replace_by_interface,
            config.always_replace_default,
            config.replace_all_route_tables,
            config.calls_in_parallel,
            config.proxy,
        );
        Ok(config)
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.clone(), secret.clone())),
            _ => None,
        }
    }
}

/// The `http_proxy` environment variable reduced to `host:port`.
pub fn proxy_from_env() -> Option<String> {
    parse_proxy(&std::env::var("http_proxy").ok()?)
}

fn parse_proxy(value: &str) -> Option<String> {
    let rest = value
        .strip_prefix("http://")
        .or_else(|| value.strip_prefix("https://"))
        .unwrap_or(value);
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(format!("{}:{}", host, port))
}
