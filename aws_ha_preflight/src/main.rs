//! `aws-ha-test`, the one-shot sanity checker for the cluster HA
//! environment.
//!
//! Walks the prerequisites in order (DNS, metadata, IAM, topology, API
//! reachability, clock, ENI configuration, Cross-AZ map freshness) and exits
//! 1 on the first failure with an operator-facing message on stderr.

use std::path::Path;
use std::time::Duration;

use aws_ha_shared::cluster::{self, ClusterStateOracle, CphaProb};
use aws_ha_shared::crossaz::{self, CrossAzMapEngine, MapInputs};
use aws_ha_shared::dynobj::DynamicObjectsCli;
use aws_ha_shared::ec2::{AwsEc2, Ec2Gateway, NetworkInterface};
use aws_ha_shared::metadata::{self, ImdsClient, InstanceMetadata, META_DATA};
use aws_ha_shared::paths::Paths;
use aws_ha_shared::topology::{InterfaceType, Topology};
use aws_ha_shared::{Error, HA_CLI_COMMAND};
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::process::Command;

const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5);

fn main() {
    aws_ha_shared::init_cli_tracing(false);
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error:\n{}", e);
            std::process::exit(1);
        }
    };
    match runtime.block_on(test()) {
        Ok(()) => {
            log("\nAll tests were successful!\n");
        }
        Err(e) => {
            log(&format!("Error:\n{}\n", e));
            std::process::exit(1);
        }
    }
}

fn log(msg: &str) {
    eprint!("{}", msg);
}

fn fail(msg: &str) -> Error {
    Error::Preflight(msg.to_owned())
}

async fn test() -> Result<(), Error> {
    if !Path::new("/etc/in-aws").exists() {
        return Err(fail("This does not look like an AWS environment"));
    }
    let paths = Paths::from_env()?;
    let metadata = ImdsClient::new();

    check_dns_configured().await?;
    check_dns_resolution().await?;
    let (region, vpc_id, domain) = check_metadata(&metadata).await?;
    check_iam(&metadata).await?;
    let mut topology = check_topology().await?;
    check_endpoint_connectivity(&region, &domain).await?;
    check_clock(&metadata).await?;

    let ec2 = AwsEc2::new(&region, None).await;
    restrict_topology(&metadata, &ec2, &mut topology).await?;
    check_interfaces(&ec2, &vpc_id, &mut topology).await?;

    if cross_az_deployment(&paths) {
        check_cross_az_map(&paths, &topology).await?;
        check_standby_holds_no_eips(&topology).await?;
    }
    Ok(())
}

async fn check_dns_configured() -> Result<(), Error> {
    log("\nTesting if DNS is configured...\n");
    let output = Command::new("/bin/clish")
        .args(["-c", "show dns primary"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    let server = Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})")
        .expect("address pattern")
        .captures(&text)
        .map(|captures| captures[1].to_owned())
        .ok_or_else(|| fail("Primary DNS server is not configured"))?;
    log(&format!("Primary DNS server is: {}\n", server));
    Ok(())
}

async fn check_dns_resolution() -> Result<(), Error> {
    log("\nTesting if DNS is working...\n");
    let resolved = tokio::net::lookup_host("s3.amazonaws.com:443")
        .await
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false);
    if !resolved {
        return Err(fail("Failed in DNS resolving test"));
    }
    log("DNS resolving test was successful\n");
    Ok(())
}

async fn check_metadata(
    metadata: &dyn InstanceMetadata,
) -> Result<(String, String, String), Error> {
    log("\nTesting metadata connectivity...\n");
    let failure = "Failed in metadata connectivity test
Verify that outgoing connections over TCP port 80 (HTTP) to 169.254.169.254 are
allowed by the firewall security policy.
See:
http://docs.aws.amazon.com/AWSEC2/latest/UserGuide/ec2-instance-metadata.html";
    let region = metadata::region(metadata).await.map_err(|_| fail(failure))?;
    let mac = metadata
        .get(&format!("{}/network/interfaces/macs/", META_DATA))
        .await
        .map_err(|_| fail(failure))?
        .lines()
        .next()
        .map(|line| line.trim_end_matches('/').to_owned())
        .ok_or_else(|| fail(failure))?;
    let vpc_id = metadata
        .get(&format!("{}/network/interfaces/macs/{}/vpc-id", META_DATA, mac))
        .await
        .map_err(|_| fail(failure))?
        .trim()
        .to_owned();
    let domain = metadata
        .get(&format!("{}/services/domain", META_DATA))
        .await
        .map_err(|_| fail(failure))?
        .trim()
        .to_owned();
    log(&format!("Region : {}\n", region));
    log(&format!("VPC    : {}\n", vpc_id));
    log(&format!("Domain : {}\n", domain));
    Ok((region, vpc_id, domain))
}

async fn check_iam(metadata: &dyn InstanceMetadata) -> Result<(), Error> {
    log("\nTesting for IAM role...\n");
    let role = metadata
        .get(&format!("{}/iam/security-credentials/", META_DATA))
        .await
        .map_err(|_| fail("Failed to retrieve IAM role\nPlease consult sk104418"))?
        .lines()
        .next()
        .map(|line| line.trim().to_owned())
        .filter(|role| !role.is_empty())
        .ok_or_else(|| fail("Failed to retrieve IAM role\nPlease consult sk104418"))?;
    log(&format!("Role: {}\n", role));

    log("\nTesting for IAM credentials...\n");
    let credentials = metadata
        .get(&format!("{}/iam/security-credentials/{}", META_DATA, role))
        .await
        .map_err(|_| fail("Failed to retrieve IAM credentials\nPlease consult sk104418"))?;
    serde_json::from_str::<serde_json::Value>(&credentials)
        .map_err(|_| fail("Failed to retrieve IAM credentials\nPlease consult sk104418"))?;
    log("IAM credentials retrieved successfully\n");
    Ok(())
}

async fn check_topology() -> Result<Topology, Error> {
    log("\nTesting cluster interface configuration...\n");
    let topology = Topology::load(false)
        .await
        .map_err(|_| fail("You do not seem to have a valid cluster configuration"))?;
    if !topology
        .interfaces
        .iter()
        .any(|interface| interface.if_type == InterfaceType::Internal)
    {
        return Err(fail(
            "You do not seem to have internal interfaces defined
Please designate at least one interface as internal in the cluster topology tab",
        ));
    }
    log("Cluster interface configuration tested successfully\n");
    Ok(topology)
}

async fn check_endpoint_connectivity(region: &str, domain: &str) -> Result<(), Error> {
    let endpoint = format!("ec2.{}.{}", region, domain);
    log(&format!("\nTesting connection to {}:443...\n", endpoint));
    let connect = tokio::net::TcpStream::connect(format!("{}:443", endpoint));
    tokio::time::timeout(Duration::from_secs(5), connect)
        .await
        .map_err(|_| endpoint_failure())?
        .map_err(|_| endpoint_failure())?;
    log("The connection was opened successfully\n");
    Ok(())
}

fn endpoint_failure() -> Error {
    fail(
        "Failed to connect to the AWS API endpoint
Please verify that outgoing connections over TCP port 443 (HTTPS) to the AWS
endpoint are allowed by the firewall security policy.
See:
http://docs.aws.amazon.com/general/latest/gr/rande.html#vpc_region",
    )
}

async fn check_clock(metadata: &dyn InstanceMetadata) -> Result<(), Error> {
    log("\nComparing the system clock to AWS\n");
    let date = metadata.date_header().await?;
    let skew = clock_skew(&date, Utc::now())
        .ok_or_else(|| fail("Failed to read the metadata Date header"))?;
    log(&format!("Time difference is {} seconds\n", skew.as_secs()));
    if skew > MAX_CLOCK_SKEW {
        return Err(fail(
            "Your system clock is not set up properly\nPlease set up NTP.",
        ));
    }
    log("The system clock is synchronized\n");
    Ok(())
}

/// Absolute difference between an RFC 2822 `Date:` header and `now`.
fn clock_skew(date_header: &str, now: DateTime<Utc>) -> Option<Duration> {
    let remote = DateTime::parse_from_rfc2822(date_header.trim()).ok()?;
    let skew = now.signed_duration_since(remote.with_timezone(&Utc));
    skew.abs().to_std().ok()
}

async fn restrict_topology(
    metadata: &dyn InstanceMetadata,
    ec2: &dyn Ec2Gateway,
    topology: &mut Topology,
) -> Result<(), Error> {
    topology
        .restrict_to_instance(metadata, ec2)
        .await
        .map_err(|_| {
            fail(
                "Failed to retrieve interfaces from AWS
Please verify that the IAM role is set up correctly.",
            )
        })
}

/// Every interface's local and peer primary IPs must belong to an existing
/// ENI as the *primary* address, with source/destination checking disabled.
/// The descriptions are kept on the topology for the Cross-AZ checks.
async fn check_interfaces(
    ec2: &dyn Ec2Gateway,
    vpc_id: &str,
    topology: &mut Topology,
) -> Result<(), Error> {
    log("\nTesting AWS interface configuration...\n");
    for interface in &mut topology.interfaces {
        let mut lookups: Vec<(String, bool)> = vec![(interface.local_ip.clone(), true)];
        if let Some(peer_ip) = &interface.peer_ip {
            lookups.push((peer_ip.clone(), false));
        }
        for (address, local_side) in lookups {
            let eni = ec2
                .interface_by_private_ip(vpc_id, &address)
                .await
                .map_err(|_| {
                    fail(
                        "Failed to retrieve interfaces from AWS
Please verify that the IAM role is set up correctly.",
                    )
                })?
                .ok_or_else(|| no_primary_eni(&address))?;
            verify_eni(&eni, &address)?;
            if local_side {
                interface.local_eni = Some(eni);
            } else {
                interface.peer_eni = Some(eni);
            }
        }
    }
    Ok(())
}

fn no_primary_eni(address: &str) -> Error {
    fail(&format!(
        "No ENI with primary address {} found
Please verify that {} is the primary and not secondary address
of the appropriate ENI (Elastic Network Interface)",
        address, address
    ))
}

fn verify_eni(eni: &NetworkInterface, address: &str) -> Result<(), Error> {
    if eni.primary_ip() != Some(address) {
        return Err(no_primary_eni(address));
    }
    if eni.source_dest_check == Some(true) {
        return Err(fail(&format!(
            "Please disable source/destination check on interface with address {}",
            address
        )));
    }
    Ok(())
}

/// The deployment is Cross-AZ when the mode file says so.
fn cross_az_deployment(paths: &Paths) -> bool {
    std::fs::read_to_string(&paths.mode_file)
        .ok()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .and_then(|data| {
            data.get("deploy_mode")
                .and_then(|mode| mode.as_str())
                .map(|mode| mode == "cross_az")
        })
        .unwrap_or(false)
}

/// Rebuilds the pair map into the test sibling file and requires it to match
/// the live one byte for byte.
async fn check_cross_az_map(paths: &Paths, topology: &Topology) -> Result<(), Error> {
    if !paths.pair_map.exists() {
        return Err(fail(&format!(
            "The File {} does not exist on this cluster member. Please delete the file from \
             another member (if exists) and run {} restart on both members",
            paths.pair_map.display(),
            HA_CLI_COMMAND
        )));
    }
    log("\nTesting Cross AZ Cluster IP pairs map is up to date...\n");
    let registry = DynamicObjectsCli;
    let local_vip_ip = cluster::alias_ip("eth0", 1).await?;
    let remote_vip_ip = crossaz::read_remote_vip(&paths.remote_vip)?;
    for interface in &topology.interfaces {
        if interface.is_internal() {
            continue;
        }
        let (Some(local_eni), Some(peer_eni)) = (&interface.local_eni, &interface.peer_eni)
        else {
            continue;
        };
        let engine =
            CrossAzMapEngine::with_write_path(&registry, &paths.pair_map, &paths.pair_map_test);
        engine
            .update(&MapInputs {
                local_eni,
                peer_eni,
                local_vip_ip: local_vip_ip.clone(),
                remote_vip_ip: remote_vip_ip.clone(),
            })
            .await?;
    }
    let live = std::fs::read(&paths.pair_map)?;
    let rebuilt = std::fs::read(&paths.pair_map_test)?;
    if live != rebuilt {
        return Err(fail(&format!(
            "The file {} is not updated. Please run {} restart on both members",
            paths.pair_map.display(),
            HA_CLI_COMMAND
        )));
    }
    Ok(())
}

/// On a healthy cluster every EIP-bearing secondary IP lives on the active
/// member; the standby must hold none.
async fn check_standby_holds_no_eips(topology: &Topology) -> Result<(), Error> {
    log("\nTesting all private secondary IPs on active member have associated public IP...\n");
    let snapshot = CphaProb.snapshot().await.map_err(|_| {
        fail("Failed to extract local and remote members' states. Please verify 'cphaprob stat' command")
    })?;
    for interface in &topology.interfaces {
        if interface.if_type == InterfaceType::Internal {
            continue;
        }
        let standby_eni = if snapshot.local.is_active() {
            interface.peer_eni.as_ref()
        } else if snapshot.local.is_standby() {
            interface.local_eni.as_ref()
        } else {
            return Err(fail(
                "Unknown cluster member state. Check your cluster configuration.",
            ));
        };
        let Some(eni) = standby_eni else {
            continue;
        };
        if !eni.allocation_ids().is_empty() {
            return Err(fail(&format!(
                "There are secondary public IPs that are associated to private IPs of the \
                 standby member. For moving all of them to the active member run {} restart \
                 on both members",
                HA_CLI_COMMAND
            )));
        }
    }
    Ok(())
}
