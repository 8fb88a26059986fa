//! Typed EC2 model and the cloud gateway the reconciler talks to.
//!
//! Production goes through the AWS SDK; tests substitute a fake behind
//! [`Ec2Gateway`]. Only the fields the failover logic reads appear in the
//! model types.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_ec2::model::Filter;
use aws_sdk_ec2::{Client as Ec2Client, Credentials, Region};
use tracing::{debug, instrument};

use crate::{Error, MAX_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub public_ip: String,
    pub allocation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateIp {
    pub address: String,
    pub primary: bool,
    pub association: Option<Association>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub id: String,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    pub source_dest_check: Option<bool>,
    pub tags: Vec<(String, String)>,
    pub private_ips: Vec<PrivateIp>,
}

impl NetworkInterface {
    pub fn primary_ip(&self) -> Option<&str> {
        self.private_ips
            .iter()
            .find(|ip| ip.primary)
            .map(|ip| ip.address.as_str())
    }

    /// Non-primary private addresses, in ENI order.
    pub fn secondary_ips(&self) -> Vec<String> {
        self.private_ips
            .iter()
            .filter(|ip| !ip.primary)
            .map(|ip| ip.address.clone())
            .collect()
    }

    /// Non-primary private addresses carrying a public association,
    /// keyed by private IP with the public IP as value.
    pub fn secondary_ips_with_eip(&self) -> BTreeMap<String, String> {
        self.private_ips
            .iter()
            .filter(|ip| !ip.primary)
            .filter_map(|ip| {
                ip.association
                    .as_ref()
                    .map(|a| (ip.address.clone(), a.public_ip.clone()))
            })
            .collect()
    }

    /// Non-primary private addresses whose association holds an allocation
    /// id, keyed by private IP with the allocation id as value.
    pub fn allocation_ids(&self) -> BTreeMap<String, String> {
        self.private_ips
            .iter()
            .filter(|ip| !ip.primary)
            .filter_map(|ip| {
                let allocation = ip.association.as_ref()?.allocation_id.as_ref()?;
                Some((ip.address.clone(), allocation.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteDestination {
    Cidr(String),
    PrefixList(String),
}

impl std::fmt::Display for RouteDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteDestination::Cidr(cidr) => write!(f, "cidr={}", cidr),
            RouteDestination::PrefixList(id) => write!(f, "prefix_list_id={}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Option<RouteDestination>,
    pub eni_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    pub id: String,
    pub routes: Vec<Route>,
}

/// The request/response oracle for the EC2 control plane. One method per
/// query or mutation the failover logic issues.
#[async_trait]
pub trait Ec2Gateway: Send + Sync {
    /// The ENI holding `private_ip` inside `vpc_id`, if one exists.
    async fn interface_by_private_ip(
        &self,
        vpc_id: &str,
        private_ip: &str,
    ) -> Result<Option<NetworkInterface>, Error>;

    /// All ENIs attached to the given instance.
    async fn interfaces_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<NetworkInterface>, Error>;

    async fn route_tables_by_vpc(&self, vpc_id: &str) -> Result<Vec<RouteTable>, Error>;

    async fn route_tables_by_subnet(
        &self,
        vpc_id: &str,
        subnet_id: &str,
    ) -> Result<Vec<RouteTable>, Error>;

    /// Route tables with a main association in the VPC, the fallback when no
    /// subnet-scoped table exists.
    async fn main_route_tables(&self, vpc_id: &str) -> Result<Vec<RouteTable>, Error>;

    async fn route_table(&self, rtb_id: &str) -> Result<Option<RouteTable>, Error>;

    async fn replace_route(
        &self,
        rtb_id: &str,
        destination: &RouteDestination,
        eni_id: &str,
    ) -> Result<(), Error>;

    async fn create_route(
        &self,
        rtb_id: &str,
        destination: &RouteDestination,
        eni_id: &str,
    ) -> Result<(), Error>;

    async fn assign_private_ips(&self, eni_id: &str, addresses: &[String]) -> Result<(), Error>;

    async fn associate_address(
        &self,
        eni_id: &str,
        private_ip: &str,
        allocation_id: &str,
    ) -> Result<(), Error>;
}

/// Production gateway backed by the AWS SDK.
#[derive(Clone)]
pub struct AwsEc2 {
    client: Ec2Client,
}

impl AwsEc2 {
    /// Builds a client for `region`. Static credentials are used in remote
    /// mode; otherwise the default chain applies (instance role on a
    /// cluster member).
    pub async fn new(region: &str, credentials: Option<(String, String)>) -> Self {
        let loader = aws_config::from_env().region(Region::new(region.to_owned()));
        let config = match credentials {
            Some((access_key, secret_key)) => {
                loader
                    .credentials_provider(Credentials::new(
                        access_key,
                        secret_key,
                        None,
                        None,
                        "aws-ha-remote",
                    ))
                    .load()
                    .await
            }
            None => loader.load().await,
        };
        Self {
            client: Ec2Client::new(&config),
        }
    }

    fn filter(name: &str, value: &str) -> Filter {
        Filter::builder().name(name).values(value).build()
    }
}

fn convert_interface(eni: aws_sdk_ec2::model::NetworkInterface) -> NetworkInterface {
    NetworkInterface {
        id: eni.network_interface_id.unwrap_or_default(),
        vpc_id: eni.vpc_id,
        subnet_id: eni.subnet_id,
        source_dest_check: eni.source_dest_check,
        tags: eni
            .tag_set
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tag| Some((tag.key?, tag.value.unwrap_or_default())))
            .collect(),
        private_ips: eni
            .private_ip_addresses
            .unwrap_or_default()
            .into_iter()
            .filter_map(|ip| {
                Some(PrivateIp {
                    address: ip.private_ip_address?,
                    primary: ip.primary.unwrap_or(false),
                    association: ip.association.and_then(|a| {
                        Some(Association {
                            public_ip: a.public_ip?,
                            allocation_id: a.allocation_id,
                        })
                    }),
                })
            })
            .collect(),
    }
}

fn convert_route_table(rtb: aws_sdk_ec2::model::RouteTable) -> RouteTable {
    RouteTable {
        id: rtb.route_table_id.unwrap_or_default(),
        routes: rtb
            .routes
            .unwrap_or_default()
            .into_iter()
            .map(|route| Route {
                destination: match (route.destination_cidr_block, route.destination_prefix_list_id)
                {
                    (_, Some(prefix_list)) => Some(RouteDestination::PrefixList(prefix_list)),
                    (Some(cidr), None) => Some(RouteDestination::Cidr(cidr)),
                    (None, None) => None,
                },
                eni_id: route.network_interface_id,
            })
            .collect(),
    }
}

#[async_trait]
impl Ec2Gateway for AwsEc2 {
    #[instrument(skip(self), err)]
    async fn interface_by_private_ip(
        &self,
        vpc_id: &str,
        private_ip: &str,
    ) -> Result<Option<NetworkInterface>, Error> {
        let output = tokio::time::timeout(
            MAX_TIMEOUT,
            self.client
                .describe_network_interfaces()
                .filters(Self::filter("vpc-id", vpc_id))
                .filters(Self::filter("private-ip-address", private_ip))
                .send(),
        )
        .await??;
        let mut interfaces = output.network_interfaces.unwrap_or_default();
        if interfaces.is_empty() {
            debug!(
                "No network interface found for the other member gateway by IP {}",
                private_ip
            );
            return Ok(None);
        }
        Ok(Some(convert_interface(interfaces.swap_remove(0))))
    }

    #[instrument(skip(self), err)]
    async fn interfaces_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<NetworkInterface>, Error> {
        let output = tokio::time::timeout(
            MAX_TIMEOUT,
            self.client
                .describe_network_interfaces()
                .filters(Self::filter("attachment.instance-id", instance_id))
                .send(),
        )
        .await??;
        Ok(output
            .network_interfaces
            .unwrap_or_default()
            .into_iter()
            .map(convert_interface)
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn route_tables_by_vpc(&self, vpc_id: &str) -> Result<Vec<RouteTable>, Error> {
        let output = tokio::time::timeout(
            MAX_TIMEOUT,
            self.client
                .describe_route_tables()
                .filters(Self::filter("vpc-id", vpc_id))
                .send(),
        )
        .await??;
        Ok(output
            .route_tables
            .unwrap_or_default()
            .into_iter()
            .map(convert_route_table)
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn route_tables_by_subnet(
        &self,
        vpc_id: &str,
        subnet_id: &str,
    ) -> Result<Vec<RouteTable>, Error> {
        let output = tokio::time::timeout(
            MAX_TIMEOUT,
            self.client
                .describe_route_tables()
                .filters(Self::filter("vpc-id", vpc_id))
                .filters(Self::filter("association.subnet-id", subnet_id))
                .send(),
        )
        .await??;
        Ok(output
            .route_tables
            .unwrap_or_default()
            .into_iter()
            .map(convert_route_table)
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn main_route_tables(&self, vpc_id: &str) -> Result<Vec<RouteTable>, Error> {
        let output = tokio::time::timeout(
            MAX_TIMEOUT,
            self.client
                .describe_route_tables()
                .filters(Self::filter("vpc-id", vpc_id))
                .filters(Self::filter("association.main", "true"))
                .send(),
        )
        .await??;
        Ok(output
            .route_tables
            .unwrap_or_default()
            .into_iter()
            .map(convert_route_table)
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn route_table(&self, rtb_id: &str) -> Result<Option<RouteTable>, Error> {
        let output = tokio::time::timeout(
            MAX_TIMEOUT,
            self.client
                .describe_route_tables()
                .route_table_ids(rtb_id)
                .send(),
        )
        .await??;
        Ok(output
            .route_tables
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(convert_route_table))
    }

    #[instrument(skip(self), err)]
    async fn replace_route(
        &self,
        rtb_id: &str,
        destination: &RouteDestination,
        eni_id: &str,
    ) -> Result<(), Error> {
        let request = self
            .client
            .replace_route()
            .route_table_id(rtb_id)
            .network_interface_id(eni_id);
        let request = match destination {
            RouteDestination::Cidr(cidr) => request.destination_cidr_block(cidr),
            RouteDestination::PrefixList(id) => request.destination_prefix_list_id(id),
        };
        tokio::time::timeout(MAX_TIMEOUT, request.send()).await??;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn create_route(
        &self,
        rtb_id: &str,
        destination: &RouteDestination,
        eni_id: &str,
    ) -> Result<(), Error> {
        let request = self
            .client
            .create_route()
            .route_table_id(rtb_id)
            .network_interface_id(eni_id);
        let request = match destination {
            RouteDestination::Cidr(cidr) => request.destination_cidr_block(cidr),
            RouteDestination::PrefixList(id) => request.destination_prefix_list_id(id),
        };
        tokio::time::timeout(MAX_TIMEOUT, request.send()).await??;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn assign_private_ips(&self, eni_id: &str, addresses: &[String]) -> Result<(), Error> {
        let mut request = self
            .client
            .assign_private_ip_addresses()
            .network_interface_id(eni_id)
            .allow_reassignment(true);
        for address in addresses {
            request = request.private_ip_addresses(address);
        }
        tokio::time::timeout(MAX_TIMEOUT, request.send()).await??;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn associate_address(
        &self,
        eni_id: &str,
        private_ip: &str,
        allocation_id: &str,
    ) -> Result<(), Error> {
        tokio::time::timeout(
            MAX_TIMEOUT,
            self.client
                .associate_address()
                .allow_reassociation(true)
                .network_interface_id(eni_id)
                .private_ip_address(private_ip)
                .allocation_id(allocation_id)
                .send(),
        )
        .await??;
        Ok(())
    }
}
