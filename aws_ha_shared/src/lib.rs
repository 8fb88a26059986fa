//! Pieces shared between the HA failover daemon (`aws-had`) and the
//! environment validator (`aws-ha-test`).

use std::path::Path;
use std::time::Duration;

use aws_sdk_ec2::error::{
    AssignPrivateIpAddressesError, AssociateAddressError, CreateRouteError,
    DescribeNetworkInterfacesError, DescribeRouteTablesError, ReplaceRouteError,
};
use aws_sdk_ec2::types::SdkError;
use tracing::{Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, LevelFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Context as LayerContext, Filter as LayerFilter, SubscriberExt};
use tracing_subscriber::prelude::*;

pub mod cluster;
pub mod crossaz;
pub mod dynobj;
pub mod ec2;
pub mod features;
pub mod metadata;
pub mod paths;
pub mod status;
pub mod topology;

/// Upper bound on a single cloud API or metadata request.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(20);

/// Pause between retries of the init sequence and of metadata attribute reads.
pub const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Name prefix of every dynamic object owned by the failover daemon.
pub const DYNAMIC_OBJECT_PREFIX: &str = "LocalGatewayExternal";

/// Operator-facing name of the cluster HA control command, used in
/// remediation messages.
pub const HA_CLI_COMMAND: &str = "aws_ha_cli";

/// Tracing target for events that belong in the migration log.
pub const MIGRATE_LOG_TARGET: &str = "migrate";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("serde_json error: {source}")]
    SerdeJson {
        #[from]
        source: serde_json::Error,
    },
    #[error("Tokio Timeout Elapsed: {source}")]
    TokioTimeoutElapsed {
        #[from]
        source: tokio::time::error::Elapsed,
    },
    #[error("http error: {source}")]
    Http {
        #[from]
        source: hyper::Error,
    },
    #[error("invalid uri: {source}")]
    InvalidUri {
        #[from]
        source: hyper::http::uri::InvalidUri,
    },
    #[error("http request error: {source}")]
    HttpRequest {
        #[from]
        source: hyper::http::Error,
    },
    #[error("AWS describe_network_interfaces reported error: {source}")]
    AwsDescribeNetworkInterfaces {
        #[from]
        source: SdkError<DescribeNetworkInterfacesError>,
    },
    #[error("AWS describe_route_tables reported error: {source}")]
    AwsDescribeRouteTables {
        #[from]
        source: SdkError<DescribeRouteTablesError>,
    },
    #[error("AWS replace_route reported error: {source}")]
    AwsReplaceRoute {
        #[from]
        source: SdkError<ReplaceRouteError>,
    },
    #[error("AWS create_route reported error: {source}")]
    AwsCreateRoute {
        #[from]
        source: SdkError<CreateRouteError>,
    },
    #[error("AWS assign_private_ip_addresses reported error: {source}")]
    AwsAssignPrivateIpAddresses {
        #[from]
        source: SdkError<AssignPrivateIpAddressesError>,
    },
    #[error("AWS associate_address reported error: {source}")]
    AwsAssociateAddress {
        #[from]
        source: SdkError<AssociateAddressError>,
    },
    #[error("\"FWDIR\" environment variable is not set")]
    MissingFwdir,
    #[error("\"EC2_REGION\" must be provided when running in remote mode")]
    MissingRegion,
    #[error("Unknown cluster mode \"{0}\". Please verify cluster configuration")]
    UnknownClusterMode(String),
    #[error("Unknown deployment mode \"{0}\". Please verify cluster configuration")]
    UnknownDeployMode(String),
    #[error("Failed to extract local and remote ip addresses. Please verify \"cphaprob stat\" command")]
    ClusterStateUnavailable,
    #[error("invalid IPv4 address \"{0}\"")]
    InvalidIp(String),
    #[error("could not find route table")]
    NoRouteTable,
    #[error("No interface found {0}")]
    UnknownInterface(String),
    #[error("metadata request for {path} failed with status {status}")]
    MetadataStatus { path: String, status: u16 },
    #[error("metadata attribute {0} is unavailable")]
    MetadataUnavailable(String),
    #[error("command \"{command}\" exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error(
        "File {0} is empty. Please delete the file from both members and run \
         aws_ha_cli restart on both members"
    )]
    InvalidCrossAzMap(String),
    #[error(
        "Cannot update Cross AZ Cluster map. Please check that every newly created IP pair has \
         an associated EIP and both members have the same number of secondary IPs"
    )]
    UnpairableSecondaryIps,
    #[error("Failed to create dynamic object {0}")]
    DynamicObjectCreate(String),
    #[error("Failed to delete dynamic object {0}")]
    DynamicObjectDelete(String),
    #[error("{0}")]
    Preflight(String),
}

impl Error {
    /// Errors that abort the current reconciliation ticket but must not take
    /// the Cross-AZ map update down with the whole poll cycle.
    pub fn is_map_update_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidCrossAzMap(_)
                | Error::UnpairableSecondaryIps
                | Error::DynamicObjectCreate(_)
                | Error::DynamicObjectDelete(_)
        )
    }
}

struct MyEnvFilter(EnvFilter);

impl<S> LayerFilter<S> for MyEnvFilter
where
    S: Subscriber,
{
    fn enabled(&self, meta: &Metadata<'_>, ctx: &LayerContext<S>) -> bool {
        self.0.enabled(meta, ctx.to_owned())
    }
}

fn env_filter(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), Error> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "aws_had.elg".to_owned());
    std::fs::create_dir_all(dir)?;
    Ok(tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name)))
}

/// Initializes the daemon's tracing pipeline: everything goes to the daemon
/// log, and events with the [`MIGRATE_LOG_TARGET`] target are additionally
/// copied to the migration log when one is requested.
pub fn init_daemon_tracing(
    debug: bool,
    daemon_log: &Path,
    migrate_log: Option<&Path>,
) -> Result<Vec<WorkerGuard>, Error> {
    let mut guards = Vec::new();
    let (daemon_writer, guard) = file_writer(daemon_log)?;
    guards.push(guard);
    let daemon_layer = fmt::Layer::default()
        .with_writer(daemon_writer)
        .with_ansi(false)
        .with_filter(MyEnvFilter(env_filter(debug)));
    match migrate_log {
        Some(path) => {
            let (migrate_writer, guard) = file_writer(path)?;
            guards.push(guard);
            let migrate_layer = fmt::Layer::default()
                .with_writer(migrate_writer)
                .with_ansi(false)
                .with_filter(Targets::new().with_target(MIGRATE_LOG_TARGET, LevelFilter::INFO));
            tracing_subscriber::Registry::default()
                .with(daemon_layer)
                .with(migrate_layer)
                .init();
        }
        None => {
            tracing_subscriber::Registry::default().with(daemon_layer).init();
        }
    }
    Ok(guards)
}

/// Initializes stderr tracing for one-shot CLI invocations.
pub fn init_cli_tracing(debug: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(debug))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// Serializes `data` the way the map and configuration files are written:
/// pretty-printed JSON with a 4-space indent.
pub fn to_json_pretty<T: serde::Serialize>(data: &T) -> Result<String, Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    data.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Reads a JSON object file, applies `key = value` and writes it back,
/// recreating the file from scratch when it is missing or unparsable.
pub fn update_json_file(path: &Path, key: &str, value: serde_json::Value) -> Result<(), Error> {
    let mut data: serde_json::Map<String, serde_json::Value> = match std::fs::read_to_string(path)
    {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Map::new(),
        Err(e) => return Err(e.into()),
    };
    data.insert(key.to_owned(), value);
    std::fs::write(path, to_json_pretty(&data)?)?;
    Ok(())
}
