//! Cluster membership state, read from the host's `cphaprob stat` output.

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, error};

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberState {
    pub ip: String,
    pub state: String,
}

impl MemberState {
    /// Covers both plain "active" and qualified states such as
    /// "active attention".
    pub fn is_active(&self) -> bool {
        self.state.starts_with("active")
    }

    pub fn is_standby(&self) -> bool {
        self.state == "standby"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub local: MemberState,
    pub remote: MemberState,
}

/// Source of the two members' states. Production shells out to `cphaprob`;
/// tests inject a fixed snapshot.
#[async_trait]
pub trait ClusterStateOracle: Send + Sync {
    async fn snapshot(&self) -> Result<ClusterSnapshot, Error>;
}

pub struct CphaProb;

#[async_trait]
impl ClusterStateOracle for CphaProb {
    async fn snapshot(&self) -> Result<ClusterSnapshot, Error> {
        let output = Command::new("cphaprob").arg("stat").output().await?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: "cphaprob stat".to_owned(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        parse_stat(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses the member table of `cphaprob stat`. Lines look like
/// `1 (local)  10.0.1.5  100%  ACTIVE` with the `(local)` marker present on
/// exactly one row.
pub fn parse_stat(output: &str) -> Result<ClusterSnapshot, Error> {
    let line = Regex::new(r"^\d+\s+(\(local\)\s+)?([\d.]+)\s+\S+\s+(\S+)")
        .expect("member line pattern");
    let mut local = None;
    let mut remote = None;
    for text in output.lines() {
        if let Some(captures) = line.captures(text) {
            let member = MemberState {
                ip: captures[2].to_owned(),
                state: captures[3].to_lowercase(),
            };
            if captures.get(1).is_some() {
                local = Some(member);
            } else {
                remote = Some(member);
            }
        }
    }
    match (local, remote) {
        (Some(local), Some(remote)) => Ok(ClusterSnapshot { local, remote }),
        _ => Err(Error::ClusterStateUnavailable),
    }
}

/// The address configured on an interface alias, e.g. `eth0:1`, read from
/// `ifconfig`. The `eth0:1` alias carries this member's VIP-bearing private
/// IP in a Cross-AZ cluster.
pub async fn alias_ip(interface: &str, position: u32) -> Result<Option<String>, Error> {
    let name = if position == 0 {
        interface.to_owned()
    } else {
        format!("{}:{}", interface, position)
    };
    let output = Command::new("/sbin/ifconfig").arg(&name).output().await?;
    if !output.status.success() {
        error!("Failed to query interface {}", name);
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    match parse_inet_addr(&text) {
        Some(ip) => {
            debug!("Alias {} holds {}", name, ip);
            Ok(Some(ip))
        }
        None => {
            error!("No secondary ip found");
            Ok(None)
        }
    }
}

fn parse_inet_addr(ifconfig_output: &str) -> Option<String> {
    let rest = ifconfig_output.split("inet addr:").nth(1)?;
    let ip = rest.split_whitespace().next()?;
    (!ip.is_empty()).then(|| ip.to_owned())
}
