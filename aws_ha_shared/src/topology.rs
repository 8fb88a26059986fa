//! The cluster interface topology: what `cphaconf aws_mode` reports,
//! enriched with metadata attributes and ENI descriptions from the cloud.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::ec2::{Ec2Gateway, NetworkInterface};
use crate::metadata::{self, InstanceMetadata, META_DATA};
use crate::{Error, RETRY_PAUSE};

/// Tag-key prefix the cloud template stamps on cluster ENIs to mark their
/// role.
const INTERFACE_TYPE_TAG_PREFIX: &str = "x-chkp-interface-type";

const METADATA_RETRIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum InterfaceType {
    Internal,
    External,
}

impl From<String> for InterfaceType {
    fn from(value: String) -> Self {
        if value == "internal" {
            InterfaceType::Internal
        } else {
            InterfaceType::External
        }
    }
}

impl Default for InterfaceType {
    fn default() -> Self {
        InterfaceType::External
    }
}

/// One interface entry as emitted by `cphaconf aws_mode`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInterface {
    pub name: String,
    #[serde(rename = "type", default)]
    pub if_type: InterfaceType,
    #[serde(rename = "mac-addr")]
    pub mac: String,
    pub ipaddr: String,
    #[serde(rename = "other_member_if_ip")]
    pub peer_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTopology {
    ifs: Vec<RawInterface>,
}

/// A declared route in the optional static route-table list. The target is
/// either an ENI id or a local interface name resolved at reconcile time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticRoute {
    pub destination: String,
    pub target: String,
}

/// One local cluster interface with its enrichment state.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub if_type: InterfaceType,
    pub mac: String,
    pub local_ip: String,
    pub peer_ip: Option<String>,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    pub eni_id: Option<String>,
    /// Peer member's equivalent ENI; `None` once enrichment found no peer.
    pub peer_eni: Option<NetworkInterface>,
    /// This member's own ENI description; populated in Cross-AZ mode only.
    pub local_eni: Option<NetworkInterface>,
    /// All ENIs whose routes must be taken over in migrate mode.
    pub migrate_peer_enis: Vec<NetworkInterface>,
}

impl From<RawInterface> for Interface {
    fn from(raw: RawInterface) -> Self {
        Interface {
            name: raw.name,
            if_type: raw.if_type,
            mac: raw.mac,
            local_ip: raw.ipaddr,
            peer_ip: raw.peer_ip,
            vpc_id: None,
            subnet_id: None,
            eni_id: None,
            peer_eni: None,
            local_eni: None,
            migrate_peer_enis: Vec::new(),
        }
    }
}

impl Interface {
    /// An interface is treated as internal when the topology says so, or
    /// when the peer ENI carries an interface-type tag ending in "internal".
    pub fn is_internal(&self) -> bool {
        if self.if_type == InterfaceType::Internal {
            return true;
        }
        self.peer_eni
            .as_ref()
            .map(|eni| {
                eni.tags.iter().any(|(key, value)| {
                    key.starts_with(INTERFACE_TYPE_TAG_PREFIX) && value.ends_with("internal")
                })
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub interfaces: Vec<Interface>,
    /// Declared static routes keyed by route-table id.
    pub static_routes: HashMap<String, Vec<StaticRoute>>,
}

impl Topology {
    /// Reads the cluster topology. On a member this runs
    /// `cphaconf aws_mode`; in remote mode a `cphaconf.txt` snapshot in the
    /// working directory substitutes for it.
    pub async fn load(remote: bool) -> Result<Self, Error> {
        let text = if remote {
            tokio::fs::read_to_string("cphaconf.txt").await?
        } else {
            let output = Command::new("cphaconf").arg("aws_mode").output().await?;
            if !output.status.success() {
                return Err(Error::CommandFailed {
                    command: "cphaconf aws_mode".to_owned(),
                    status: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let raw: RawTopology = serde_json::from_str(text)?;
        debug!("Number of interfaces {}", raw.ifs.len());
        Ok(Topology {
            interfaces: raw.ifs.into_iter().map(Interface::from).collect(),
            static_routes: HashMap::new(),
        })
    }

    /// Loads the optional static route-table list sitting next to the
    /// cluster configuration.
    pub fn load_static_routes(&mut self, path: &Path) -> Result<(), Error> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                self.static_routes = serde_json::from_str(&text)?;
                debug!("route-tables:\n{:?}", self.static_routes);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.static_routes = HashMap::new();
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Static routes with interface-name targets resolved to ENI ids.
    /// Routes whose target cannot be resolved are skipped.
    pub fn resolved_static_routes(&self) -> HashMap<String, Vec<StaticRoute>> {
        let name_to_eni: HashMap<&str, &str> = self
            .interfaces
            .iter()
            .filter_map(|interface| {
                Some((interface.name.as_str(), interface.eni_id.as_deref()?))
            })
            .collect();
        let mut resolved = HashMap::new();
        for (rtb_id, routes) in &self.static_routes {
            let mut entries = Vec::new();
            for route in routes {
                if route.target.starts_with("eni-") {
                    entries.push(route.clone());
                    continue;
                }
                match name_to_eni.get(route.target.as_str()) {
                    Some(eni_id) => entries.push(StaticRoute {
                        destination: route.destination.clone(),
                        target: (*eni_id).to_owned(),
                    }),
                    None => info!("No interface found for {}", route.target),
                }
            }
            resolved.insert(rtb_id.clone(), entries);
        }
        resolved
    }

    pub fn interface_named(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn vpc_ids(&self) -> BTreeSet<String> {
        self.interfaces
            .iter()
            .filter_map(|interface| interface.vpc_id.clone())
            .collect()
    }

    /// Fills `vpc_id`, `subnet_id` and `eni_id` from the metadata service,
    /// keyed by each interface's MAC. Attributes that stay unavailable after
    /// all retries are left unset; downstream skips such interfaces.
    pub async fn enrich_metadata(&mut self, metadata: &dyn InstanceMetadata) {
        for interface in &mut self.interfaces {
            let prefix = format!("{}/network/interfaces/macs/{}/", META_DATA, interface.mac);
            for attr in ["vpc-id", "subnet-id", "interface-id"] {
                let slot = match attr {
                    "vpc-id" => &mut interface.vpc_id,
                    "subnet-id" => &mut interface.subnet_id,
                    _ => &mut interface.eni_id,
                };
                if slot.is_some() {
                    continue;
                }
                for attempt in 0..METADATA_RETRIES {
                    debug!("Query {} - retry #{}", attr, attempt + 1);
                    match metadata.get(&format!("{}{}", prefix, attr)).await {
                        Ok(value) => {
                            *slot = Some(value.trim().to_owned());
                            break;
                        }
                        Err(_) => {
                            debug!("Attribute {} not found in metadata", attr);
                            tokio::time::sleep(RETRY_PAUSE).await;
                        }
                    }
                }
                if slot.is_none() {
                    debug!("Maximum retries reached - skipping attribute {}", attr);
                }
            }
        }
    }

    /// Fills each interface's peer ENI description and, in Cross-AZ mode,
    /// its own ENI description.
    pub async fn enrich_enis(&mut self, ec2: &dyn Ec2Gateway, cross_az: bool) -> Result<(), Error> {
        for interface in &mut self.interfaces {
            let (Some(vpc_id), Some(peer_ip)) = (&interface.vpc_id, &interface.peer_ip) else {
                interface.peer_eni = None;
                continue;
            };
            interface.peer_eni = ec2.interface_by_private_ip(vpc_id, peer_ip).await?;
            if cross_az {
                interface.local_eni = ec2
                    .interface_by_private_ip(vpc_id, &interface.local_ip)
                    .await?;
            }
        }
        Ok(())
    }

    /// Restricts the interface list to interfaces that also exist on the
    /// cloud side, intersecting by primary private IP with the ENIs attached
    /// to this instance.
    pub async fn restrict_to_instance(
        &mut self,
        metadata: &dyn InstanceMetadata,
        ec2: &dyn Ec2Gateway,
    ) -> Result<(), Error> {
        let instance_id = metadata::instance_id(metadata).await?;
        debug!("Instance id: {}", instance_id);
        let cloud_ips: BTreeSet<String> = ec2
            .interfaces_by_instance(&instance_id)
            .await?
            .into_iter()
            .filter_map(|eni| eni.primary_ip().map(str::to_owned))
            .collect();
        self.interfaces
            .retain(|interface| cloud_ips.contains(&interface.local_ip));
        debug!(
            "Interfaces after intersection with the cloud: {:?}",
            self.interfaces
                .iter()
                .map(|i| i.name.as_str())
                .collect::<Vec<_>>()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec2::PrivateIp;

    const CPHACONF: &str = r#"{
        "ifs": [
            {
                "name": "eth0",
                "type": "internal",
                "mac-addr": "0e:11:22:33:44:55",
                "ipaddr": "10.0.1.5",
                "other_member_if_ip": "10.0.1.6"
            },
            {
                "name": "eth1",
                "type": "external",
                "mac-addr": "0e:11:22:33:44:66",
                "ipaddr": "10.0.2.5",
                "other_member_if_ip": "10.0.2.6"
            }
        ]
    }"#;

    #[test]
    fn parses_cphaconf_output() {
        let topology = Topology::parse(CPHACONF).unwrap();
        assert_eq!(topology.interfaces.len(), 2);
        let eth0 = topology.interface_named("eth0").unwrap();
        assert_eq!(eth0.if_type, InterfaceType::Internal);
        assert_eq!(eth0.local_ip, "10.0.1.5");
        assert_eq!(eth0.peer_ip.as_deref(), Some("10.0.1.6"));
    }

    #[test]
    fn unknown_interface_type_defaults_to_external() {
        let text = r#"{"ifs": [{"name": "eth2", "type": "mgmt",
            "mac-addr": "0e:00:00:00:00:01", "ipaddr": "10.0.3.5"}]}"#;
        let topology = Topology::parse(text).unwrap();
        assert_eq!(topology.interfaces[0].if_type, InterfaceType::External);
        assert!(topology.interfaces[0].peer_ip.is_none());
    }

    #[test]
    fn internal_detected_from_peer_eni_tag() {
        let mut topology = Topology::parse(CPHACONF).unwrap();
        let eth1 = &mut topology.interfaces[1];
        eth1.peer_eni = Some(NetworkInterface {
            id: "eni-peer".to_owned(),
            tags: vec![(
                "x-chkp-interface-type-eth1".to_owned(),
                "private-internal".to_owned(),
            )],
            private_ips: vec![PrivateIp {
                address: "10.0.2.6".to_owned(),
                primary: true,
                association: None,
            }],
            ..Default::default()
        });
        assert!(topology.interfaces[1].is_internal());
    }

    #[test]
    fn static_route_targets_resolved_by_name() {
        let mut topology = Topology::parse(CPHACONF).unwrap();
        topology.interfaces[1].eni_id = Some("eni-local".to_owned());
        topology.static_routes.insert(
            "rtb-1".to_owned(),
            vec![
                StaticRoute {
                    destination: "0.0.0.0/0".to_owned(),
                    target: "eth1".to_owned(),
                },
                StaticRoute {
                    destination: "10.9.0.0/16".to_owned(),
                    target: "eni-explicit".to_owned(),
                },
                StaticRoute {
                    destination: "10.8.0.0/16".to_owned(),
                    target: "eth7".to_owned(),
                },
            ],
        );
        let resolved = topology.resolved_static_routes();
        let routes = &resolved["rtb-1"];
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].target, "eni-local");
        assert_eq!(routes[1].target, "eni-explicit");
    }
}
