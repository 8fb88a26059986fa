//! Fakes and fixtures shared by the daemon's unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_ha_shared::cluster::{ClusterSnapshot, ClusterStateOracle, MemberState};
use aws_ha_shared::dynobj::DynamicObjectRegistry;
use aws_ha_shared::ec2::{
    Association, Ec2Gateway, NetworkInterface, PrivateIp, Route, RouteDestination, RouteTable,
};
use aws_ha_shared::metadata::InstanceMetadata;
use aws_ha_shared::paths::Paths;
use aws_ha_shared::topology::{Interface, InterfaceType, Topology};
use aws_ha_shared::Error;

use crate::config::{ClusterMode, Config, DeployMode};
use crate::controller::Controller;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Describe,
    ReplaceRoute {
        rtb_id: String,
        destination: String,
        eni_id: String,
    },
    CreateRoute {
        rtb_id: String,
        destination: String,
        eni_id: String,
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

#[derive(Default)]
pub struct FakeEc2Inner {
    pub route_tables_by_vpc: HashMap<String, Vec<RouteTable>>,
    pub route_tables_by_subnet: HashMap<(String, String), Vec<RouteTable>>,
    pub main_route_tables: HashMap<String, Vec<RouteTable>>,
    pub interfaces_by_ip: HashMap<(String, String), NetworkInterface>,
    pub instance_interfaces: Vec<NetworkInterface>,
    pub fail_replace: bool,
}

#[derive(Clone, Default)]
pub struct FakeEc2 {
    inner: Arc<Mutex<FakeEc2Inner>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl FakeEc2 {
    pub fn with_state(inner: FakeEc2Inner) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_replacements(&self) {
        self.inner.lock().unwrap().fail_replace = true;
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Ec2Gateway for FakeEc2 {
    async fn interface_by_private_ip(
        &self,
        vpc_id: &str,
        private_ip: &str,
    ) -> Result<Option<NetworkInterface>, Error> {
        self.record(RecordedCall::Describe);
        Ok(self
            .inner
            .lock()
            .unwrap()
            .interfaces_by_ip
            .get(&(vpc_id.to_owned(), private_ip.to_owned()))
            .cloned())
    }

    async fn interfaces_by_instance(
        &self,
        _instance_id: &str,
    ) -> Result<Vec<NetworkInterface>, Error> {
        self.record(RecordedCall::Describe);
        Ok(self.inner.lock().unwrap().instance_interfaces.clone())
    }

    async fn route_tables_by_vpc(&self, vpc_id: &str) -> Result<Vec<RouteTable>, Error> {
        self.record(RecordedCall::Describe);
        Ok(self
            .inner
            .lock()
            .unwrap()
            .route_tables_by_vpc
            .get(vpc_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn route_tables_by_subnet(
        &self,
        vpc_id: &str,
        subnet_id: &str,
    ) -> Result<Vec<RouteTable>, Error> {
        self.record(RecordedCall::Describe);
        Ok(self
            .inner
            .lock()
            .unwrap()
            .route_tables_by_subnet
            .get(&(vpc_id.to_owned(), subnet_id.to_owned()))
            .cloned()
            .unwrap_or_default())
    }

    async fn main_route_tables(&self, vpc_id: &str) -> Result<Vec<RouteTable>, Error> {
        self.record(RecordedCall::Describe);
        Ok(self
            .inner
            .lock()
            .unwrap()
            .main_route_tables
            .get(vpc_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn route_table(&self, rtb_id: &str) -> Result<Option<RouteTable>, Error> {
        self.record(RecordedCall::Describe);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .route_tables_by_vpc
            .values()
            .chain(inner.main_route_tables.values())
            .flatten()
            .find(|rtb| rtb.id == rtb_id)
            .cloned())
    }

    async fn replace_route(
        &self,
        rtb_id: &str,
        destination: &RouteDestination,
        eni_id: &str,
    ) -> Result<(), Error> {
        self.record(RecordedCall::ReplaceRoute {
            rtb_id: rtb_id.to_owned(),
            destination: destination.to_string(),
            eni_id: eni_id.to_owned(),
        });
        if self.inner.lock().unwrap().fail_replace {
            return Err(Error::NoRouteTable);
        }
        Ok(())
    }

    async fn create_route(
        &self,
        rtb_id: &str,
        destination: &RouteDestination,
        eni_id: &str,
    ) -> Result<(), Error> {
        self.record(RecordedCall::CreateRoute {
            rtb_id: rtb_id.to_owned(),
            destination: destination.to_string(),
            eni_id: eni_id.to_owned(),
        });
        Ok(())
    }

    async fn assign_private_ips(&self, eni_id: &str, addresses: &[String]) -> Result<(), Error> {
        self.record(RecordedCall::AssignPrivateIps {
            eni_id: eni_id.to_owned(),
            addresses: addresses.to_vec(),
        });
        Ok(())
    }

    async fn associate_address(
        &self,
        eni_id: &str,
        private_ip: &str,
        allocation_id: &str,
    ) -> Result<(), Error> {
        self.record(RecordedCall::AssociateAddress {
            eni_id: eni_id.to_owned(),
            private_ip: private_ip.to_owned(),
            allocation_id: allocation_id.to_owned(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMetadata {
    pub values: HashMap<String, String>,
}

#[async_trait]
impl InstanceMetadata for FakeMetadata {
    async fn get(&self, path: &str) -> Result<String, Error> {
        self.values
            .get(path)
            .cloned()
            .ok_or_else(|| Error::MetadataUnavailable(path.to_owned()))
    }

    async fn date_header(&self) -> Result<String, Error> {
        Err(Error::MetadataUnavailable("Date header".to_owned()))
    }
}

pub struct FakeCluster {
    pub snapshot: ClusterSnapshot,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            snapshot: ClusterSnapshot {
                local: MemberState {
                    ip: "10.0.1.5".to_owned(),
                    state: "active".to_owned(),
                },
                remote: MemberState {
                    ip: "10.0.1.6".to_owned(),
                    state: "standby".to_owned(),
                },
            },
        }
    }
}

#[async_trait]
impl ClusterStateOracle for FakeCluster {
    async fn snapshot(&self) -> Result<ClusterSnapshot, Error> {
        Ok(self.snapshot.clone())
    }
}

#[derive(Default)]
pub struct NoopRegistry;

#[async_trait]
impl DynamicObjectRegistry for NoopRegistry {
    async fn create(&self, _name: &str, _ip: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn delete(&self, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }
}

pub fn test_config() -> Config {
    Config {
        region: "us-east-1".to_owned(),
        cluster_mode: ClusterMode::HighAvailability,
        deploy_mode: DeployMode::SingleAz,
        replace_by_interface: true,
        always_replace_default: false,
        replace_all_route_tables: true,
        calls_in_parallel: false,
        cross_az_map_up_to_date: false,
        remote: false,
        proxy: None,
        access_key: None,
        secret_key: None,
    }
}

pub fn controller(dir: &tempfile::TempDir, ec2: FakeEc2) -> Controller {
    Controller {
        config: test_config(),
        paths: Paths::under(dir.path()),
        topology: Topology::default(),
        ec2: Arc::new(ec2),
        metadata: Arc::new(FakeMetadata::default()),
        cluster: Arc::new(FakeCluster::default()),
        dynobj: Arc::new(NoopRegistry),
        migrate: None,
    }
}

pub fn eni(id: &str, primary: &str, secondaries: &[(&str, Option<(&str, &str)>)]) -> NetworkInterface {
    let mut private_ips = vec![PrivateIp {
        address: primary.to_owned(),
        primary: true,
        association: None,
    }];
    for (address, eip) in secondaries {
        private_ips.push(PrivateIp {
            address: (*address).to_owned(),
            primary: false,
            association: eip.map(|(public_ip, allocation_id)| Association {
                public_ip: public_ip.to_owned(),
                allocation_id: Some(allocation_id.to_owned()),
            }),
        });
    }
    NetworkInterface {
        id: id.to_owned(),
        private_ips,
        ..Default::default()
    }
}

fn interface(
    name: &str,
    if_type: InterfaceType,
    local_ip: &str,
    peer_ip: &str,
    subnet: &str,
    eni_id: &str,
    peer_eni: NetworkInterface,
) -> Interface {
    Interface {
        name: name.to_owned(),
        if_type,
        mac: format!("0e:00:00:00:00:{}", name.len()),
        local_ip: local_ip.to_owned(),
        peer_ip: Some(peer_ip.to_owned()),
        vpc_id: Some("vpc-1".to_owned()),
        subnet_id: Some(subnet.to_owned()),
        eni_id: Some(eni_id.to_owned()),
        peer_eni: Some(peer_eni),
        local_eni: None,
        migrate_peer_enis: Vec::new(),
    }
}

/// Scenario S1 topology: two interfaces, routes and the external secondary
/// still owned by member B.
pub fn enrich_single_az(ctrl: &mut Controller) {
    ctrl.topology.interfaces = vec![
        interface(
            "eth0",
            InterfaceType::Internal,
            "10.0.1.5",
            "10.0.1.6",
            "subnet-a",
            "eni-Aint",
            eni("eni-Bint", "10.0.1.6", &[]),
        ),
        interface(
            "eth1",
            InterfaceType::External,
            "10.0.2.5",
            "10.0.2.6",
            "subnet-b",
            "eni-Aext",
            eni(
                "eni-Bext",
                "10.0.2.6",
                &[("10.0.2.20", Some(("54.1.1.1", "eipalloc-20")))],
            ),
        ),
    ];
}

pub fn single_az_fake() -> FakeEc2 {
    let mut inner = FakeEc2Inner::default();
    inner.route_tables_by_vpc.insert(
        "vpc-1".to_owned(),
        vec![RouteTable {
            id: "rtb-x".to_owned(),
            routes: vec![
                Route {
                    destination: Some(RouteDestination::Cidr("10.0.0.0/8".to_owned())),
                    eni_id: Some("eni-Bext".to_owned()),
                },
                Route {
                    destination: Some(RouteDestination::Cidr("10.0.0.0/16".to_owned())),
                    eni_id: None,
                },
            ],
        }],
    );
    FakeEc2::with_state(inner)
}

/// Scenario S6: every candidate route already points at this member.
pub fn single_az_fake_converged() -> FakeEc2 {
    let mut inner = FakeEc2Inner::default();
    inner.route_tables_by_vpc.insert(
        "vpc-1".to_owned(),
        vec![RouteTable {
            id: "rtb-x".to_owned(),
            routes: vec![Route {
                destination: Some(RouteDestination::Cidr("10.0.0.0/8".to_owned())),
                eni_id: Some("eni-Aext".to_owned()),
            }],
        }],
    );
    FakeEc2::with_state(inner)
}

pub fn enrich_single_az_converged(ctrl: &mut Controller) {
    enrich_single_az(ctrl);
    // The secondary already moved over; the peer holds only its primary.
    for interface in &mut ctrl.topology.interfaces {
        if let Some(peer) = &mut interface.peer_eni {
            peer.private_ips.retain(|ip| ip.primary);
        }
    }
}

pub fn fake_with_main_table_only() -> FakeEc2 {
    let mut inner = FakeEc2Inner::default();
    inner.main_route_tables.insert(
        "vpc-1".to_owned(),
        vec![RouteTable {
            id: "rtb-main".to_owned(),
            routes: vec![Route {
                destination: Some(RouteDestination::Cidr("0.0.0.0/0".to_owned())),
                eni_id: Some("eni-Bint".to_owned()),
            }],
        }],
    );
    FakeEc2::with_state(inner)
}

pub fn cross_az_fake() -> FakeEc2 {
    FakeEc2::default()
}

/// Cross-AZ topology plus a pair map on disk mapping the peer's EIP-bearing
/// secondary to this member's local secondary.
pub fn enrich_cross_az(ctrl: &mut Controller, dir: &tempfile::TempDir) {
    ctrl.topology.interfaces = vec![interface(
        "eth1",
        InterfaceType::External,
        "10.1.0.5",
        "10.2.0.5",
        "subnet-b",
        "eni-Aext",
        eni(
            "eni-Bext",
            "10.2.0.5",
            &[("10.2.0.10", Some(("54.1.1.1", "eipalloc-peer")))],
        ),
    )];
    let map = serde_json::json!({
        "10.2.0.10": {
            "local_mem_private_ip": "10.1.0.10",
            "remote_mem_private_ip": "10.2.0.10",
            "EIP": "54.1.1.1",
            "dynamic_object_name": "LocalGatewayExternal-54.1.1.1"
        }
    });
    let path = dir.path().join("conf");
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(
        ctrl.paths.pair_map.clone(),
        serde_json::to_string_pretty(&map).unwrap(),
    )
    .unwrap();
}
