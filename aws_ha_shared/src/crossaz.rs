//! The Cross-AZ secondary-IP pair map.
//!
//! A Cross-AZ cluster cannot move secondary private IPs between members, so
//! failover re-associates elastic IPs instead. The map pairs every local
//! secondary private IP with its counterpart on the peer member, remembers
//! which elastic IP belongs to the pair, and exposes the local side to the
//! packet filter through a dynamic object per pair.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::dynobj::DynamicObjectRegistry;
use crate::ec2::NetworkInterface;
use crate::{Error, DYNAMIC_OBJECT_PREFIX, HA_CLI_COMMAND};

pub const REMOTE_VIP_KEY: &str = "remote_member_private_ip_associated_to_vip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRecord {
    #[serde(rename = "local_mem_private_ip")]
    pub local_ip: String,
    #[serde(rename = "remote_mem_private_ip")]
    pub remote_ip: String,
    #[serde(rename = "EIP")]
    pub eip: String,
    pub dynamic_object_name: String,
}

/// The pair map, keyed by the peer member's private IP. Insertion order is
/// preserved so the VIP pair stays first and rebuilds are reproducible.
pub type PairMap = IndexMap<String, PairRecord>;

pub fn dynamic_object_name(eip: &str) -> String {
    format!("{}-{}", DYNAMIC_OBJECT_PREFIX, eip)
}

/// Reads the on-disk pair map for consumers that only look it up (the
/// reconciler's address association step). Missing or unparsable files give
/// `None` with the operator remediation logged.
pub fn read_map(path: &Path) -> Option<PairMap> {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<PairMap>(&text) {
            Ok(map) => {
                debug!("File {} contains: {:?}", path.display(), map);
                Some(map)
            }
            Err(_) => {
                error!(
                    "File {} is empty. Please delete the file from both members and run {} \
                     restart on both members",
                    path.display(),
                    HA_CLI_COMMAND
                );
                None
            }
        },
        Err(_) => {
            error!(
                "The file {} does not exist. Please run {} restart on both members",
                path.display(),
                HA_CLI_COMMAND
            );
            None
        }
    }
}

/// The peer member's VIP-bearing private IP, from its pointer file. A file
/// that exists but holds no valid JSON yields `None`.
pub fn read_remote_vip(path: &Path) -> Result<Option<String>, Error> {
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(data) => {
            let ip = data
                .get(REMOTE_VIP_KEY)
                .and_then(|v| v.as_str())
                .map(str::to_owned);
            if let Some(ip) = &ip {
                info!("Remote private ip associated to VIP is {}", ip);
            }
            Ok(ip)
        }
        Err(_) => {
            info!("The file {} is empty", path.display());
            Ok(None)
        }
    }
}

/// Everything one engine run needs to know about a single non-internal
/// interface pair.
#[derive(Debug, Clone)]
pub struct MapInputs<'a> {
    pub local_eni: &'a NetworkInterface,
    pub peer_eni: &'a NetworkInterface,
    /// The `eth0:1` alias address on this member.
    pub local_vip_ip: Option<String>,
    /// The peer's VIP-bearing private IP, from the pointer file.
    pub remote_vip_ip: Option<String>,
}

/// Rebuilds and persists the pair map for one interface.
pub struct CrossAzMapEngine<'a> {
    registry: &'a dyn DynamicObjectRegistry,
    /// The current map is always read from here.
    read_path: PathBuf,
    /// Updates land here; the validator redirects this to the test sibling.
    write_path: PathBuf,
}

impl<'a> CrossAzMapEngine<'a> {
    pub fn new(registry: &'a dyn DynamicObjectRegistry, map_path: &Path) -> Self {
        Self {
            registry,
            read_path: map_path.to_owned(),
            write_path: map_path.to_owned(),
        }
    }

    /// An engine that reads the live map but writes the rebuild elsewhere,
    /// used by the validator to compare against the live file.
    pub fn with_write_path(
        registry: &'a dyn DynamicObjectRegistry,
        read_path: &Path,
        write_path: &Path,
    ) -> Self {
        Self {
            registry,
            read_path: read_path.to_owned(),
            write_path: write_path.to_owned(),
        }
    }

    /// Brings the pair map in line with the two ENI descriptions and returns
    /// the updated map. Stale pairs are purged together with their dynamic
    /// objects, unpaired secondary IPs are paired (VIP first), and the
    /// result is persisted.
    pub async fn update(&self, inputs: &MapInputs<'_>) -> Result<PairMap, Error> {
        info!("Updating {} with IP pairs", self.write_path.display());
        let mut map = self.read_current()?;

        let local_ips = inputs.local_eni.secondary_ips();
        let remote_ips = inputs.peer_eni.secondary_ips();
        let local_with_eip = inputs.local_eni.secondary_ips_with_eip();
        let remote_with_eip = inputs.peer_eni.secondary_ips_with_eip();

        self.purge_invalid_pairs(&mut map, &local_ips, &remote_ips).await?;

        let local_remain: Vec<String> = local_ips
            .iter()
            .filter(|ip| !map.values().any(|rec| rec.local_ip == **ip))
            .cloned()
            .collect();
        let remote_remain: Vec<String> = remote_ips
            .iter()
            .filter(|ip| !map.values().any(|rec| rec.remote_ip == **ip))
            .cloned()
            .collect();

        if map.is_empty() {
            self.clear_owned_objects().await?;
        }

        let (mut local_without_eip, mut local_with_eip) =
            split_by_eip(&local_remain, &local_with_eip);
        let (mut remote_without_eip, mut remote_with_eip) =
            split_by_eip(&remote_remain, &remote_with_eip);

        // The cluster VIP pair goes in first.
        if let (Some(local_vip), Some(remote_vip)) =
            (&inputs.local_vip_ip, &inputs.remote_vip_ip)
        {
            if remote_remain.contains(remote_vip) {
                if let Some(eip) = local_with_eip.get(local_vip).cloned() {
                    self.insert_pair(&mut map, local_vip, remote_vip, &eip).await?;
                    local_with_eip.remove(local_vip);
                    remote_without_eip.retain(|ip| ip != remote_vip);
                    remote_with_eip.remove(remote_vip);
                } else if local_without_eip.contains(local_vip) {
                    if let Some(eip) = remote_with_eip.get(remote_vip).cloned() {
                        self.insert_pair(&mut map, local_vip, remote_vip, &eip).await?;
                        local_without_eip.retain(|ip| ip != local_vip);
                        remote_with_eip.remove(remote_vip);
                    }
                }
            }
        }

        self.pair_group(&mut map, &local_without_eip, &remote_with_eip, EipSide::Remote)
            .await?;
        self.pair_group(&mut map, &remote_without_eip, &local_with_eip, EipSide::Local)
            .await?;

        self.persist(&map)?;
        info!("Updating Cross AZ Cluster map finished successfully");
        Ok(map)
    }

    /// A missing map file means a full rebuild; a present but unparsable one
    /// means the operator has to intervene.
    fn read_current(&self) -> Result<PairMap, Error> {
        match std::fs::read_to_string(&self.read_path) {
            Ok(text) => serde_json::from_str(&text).map_err(|_| {
                Error::InvalidCrossAzMap(self.read_path.display().to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!(
                    "The file {} does not exist. Please run {} restart on both members",
                    self.read_path.display(),
                    HA_CLI_COMMAND
                );
                Ok(PairMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_invalid_pairs(
        &self,
        map: &mut PairMap,
        local_ips: &[String],
        remote_ips: &[String],
    ) -> Result<(), Error> {
        let stale: Vec<String> = map
            .iter()
            .filter(|(_, rec)| {
                !local_ips.contains(&rec.local_ip) || !remote_ips.contains(&rec.remote_ip)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(record) = map.shift_remove(&key) {
                self.registry.delete(&record.dynamic_object_name).await?;
            }
        }
        Ok(())
    }

    /// Deletes every dynamic object owned by the daemon, leaving the bare
    /// prefix object (the primary gateway object) alone.
    async fn clear_owned_objects(&self) -> Result<(), Error> {
        for name in self.registry.list().await? {
            if name != DYNAMIC_OBJECT_PREFIX && name.starts_with(DYNAMIC_OBJECT_PREFIX) {
                self.registry.delete(&name).await?;
            }
        }
        Ok(())
    }

    async fn pair_group(
        &self,
        map: &mut PairMap,
        without_eip: &[String],
        with_eip: &std::collections::BTreeMap<String, String>,
        eip_side: EipSide,
    ) -> Result<(), Error> {
        if without_eip.len() != with_eip.len() {
            return Err(Error::UnpairableSecondaryIps);
        }
        let mut bare = without_eip.to_vec();
        bare.sort();
        for (bare_ip, (eip_ip, eip)) in bare.iter().zip(with_eip) {
            match eip_side {
                EipSide::Remote => self.insert_pair(map, bare_ip, eip_ip, eip).await?,
                EipSide::Local => self.insert_pair(map, eip_ip, bare_ip, eip).await?,
            }
        }
        Ok(())
    }

    async fn insert_pair(
        &self,
        map: &mut PairMap,
        local_ip: &str,
        remote_ip: &str,
        eip: &str,
    ) -> Result<(), Error> {
        let record = PairRecord {
            local_ip: local_ip.to_owned(),
            remote_ip: remote_ip.to_owned(),
            eip: eip.to_owned(),
            dynamic_object_name: dynamic_object_name(eip),
        };
        self.registry
            .create(&record.dynamic_object_name, &record.local_ip)
            .await?;
        map.insert(remote_ip.to_owned(), record);
        Ok(())
    }

    /// Whole-file replacement so concurrent readers never observe a partial
    /// map.
    fn persist(&self, map: &PairMap) -> Result<(), Error> {
        info!(
            "Writing data: {:?} to file: {}",
            map,
            self.write_path.display()
        );
        if let Some(dir) = self.write_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.write_path.with_extension("json.tmp");
        std::fs::write(&tmp, crate::to_json_pretty(map)?)?;
        std::fs::rename(&tmp, &self.write_path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum EipSide {
    Local,
    Remote,
}

/// Splits the unpaired IPs into those without an EIP (sorted ascending) and
/// those with one (sorted by private IP via the map ordering).
fn split_by_eip(
    remain: &[String],
    with_eip: &std::collections::BTreeMap<String, String>,
) -> (Vec<String>, std::collections::BTreeMap<String, String>) {
    let mut without = Vec::new();
    let mut with = std::collections::BTreeMap::new();
    for ip in remain {
        match with_eip.get(ip) {
            Some(eip) => {
                with.insert(ip.clone(), eip.clone());
            }
            None => without.push(ip.clone()),
        }
    }
    without.sort();
    (without, with)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::ec2::{Association, PrivateIp};

    #[derive(Default)]
    struct FakeRegistry {
        objects: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DynamicObjectRegistry for FakeRegistry {
        async fn create(&self, name: &str, _ip: &str) -> Result<(), Error> {
            self.objects.lock().unwrap().push(name.to_owned());
            Ok(())
        }

        async fn delete(&self, name: &str) -> Result<(), Error> {
            self.objects.lock().unwrap().retain(|n| n != name);
            self.deleted.lock().unwrap().push(name.to_owned());
            Ok(())
        }

        async fn list(&self) -> Result<Vec<String>, Error> {
            Ok(self.objects.lock().unwrap().clone())
        }
    }

    fn eni(id: &str, primary: &str, secondaries: &[(&str, Option<&str>)]) -> NetworkInterface {
        let mut private_ips = vec![PrivateIp {
            address: primary.to_owned(),
            primary: true,
            association: None,
        }];
        for (address, eip) in secondaries {
            private_ips.push(PrivateIp {
                address: (*address).to_owned(),
                primary: false,
                association: eip.map(|public_ip| Association {
                    public_ip: public_ip.to_owned(),
                    allocation_id: Some(format!("eipalloc-{}", public_ip)),
                }),
            });
        }
        NetworkInterface {
            id: id.to_owned(),
            private_ips,
            ..Default::default()
        }
    }

    fn map_file(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("aws_cross_az_cluster.json")
    }

    #[tokio::test]
    async fn builds_map_from_missing_file_and_clears_leftover_objects() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::default();
        registry
            .objects
            .lock()
            .unwrap()
            .extend(["LocalGatewayExternal".to_owned(), "LocalGatewayExternal-9.9.9.9".to_owned()]);
        let local = eni("eni-local", "10.1.0.5", &[("10.1.0.10", Some("54.1.1.1"))]);
        let peer = eni("eni-peer", "10.2.0.5", &[("10.2.0.10", None)]);
        let engine = CrossAzMapEngine::new(&registry, &map_file(&dir));
        let inputs = MapInputs {
            local_eni: &local,
            peer_eni: &peer,
            local_vip_ip: Some("10.1.0.10".to_owned()),
            remote_vip_ip: Some("10.2.0.10".to_owned()),
        };
        let map = engine.update(&inputs).await.unwrap();

        // The stale daemon-owned object went away, the bare prefix survived.
        assert_eq!(
            *registry.deleted.lock().unwrap(),
            vec!["LocalGatewayExternal-9.9.9.9"]
        );
        assert!(registry
            .objects
            .lock()
            .unwrap()
            .contains(&"LocalGatewayExternal".to_owned()));

        let record = &map["10.2.0.10"];
        assert_eq!(record.local_ip, "10.1.0.10");
        assert_eq!(record.remote_ip, "10.2.0.10");
        assert_eq!(record.eip, "54.1.1.1");
        assert_eq!(record.dynamic_object_name, "LocalGatewayExternal-54.1.1.1");
        let on_disk: PairMap =
            serde_json::from_str(&std::fs::read_to_string(map_file(&dir)).unwrap()).unwrap();
        assert_eq!(on_disk, map);
    }

    #[tokio::test]
    async fn purges_pair_whose_local_ip_disappeared() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::default();
        let path = map_file(&dir);
        let mut existing = PairMap::new();
        existing.insert(
            "10.2.0.99".to_owned(),
            PairRecord {
                local_ip: "10.1.0.99".to_owned(),
                remote_ip: "10.2.0.99".to_owned(),
                eip: "54.9.9.9".to_owned(),
                dynamic_object_name: "LocalGatewayExternal-54.9.9.9".to_owned(),
            },
        );
        std::fs::write(&path, crate::to_json_pretty(&existing).unwrap()).unwrap();

        let local = eni("eni-local", "10.1.0.5", &[]);
        let peer = eni("eni-peer", "10.2.0.5", &[]);
        let engine = CrossAzMapEngine::new(&registry, &path);
        let inputs = MapInputs {
            local_eni: &local,
            peer_eni: &peer,
            local_vip_ip: None,
            remote_vip_ip: None,
        };
        let map = engine.update(&inputs).await.unwrap();
        assert!(map.is_empty());
        assert_eq!(
            *registry.deleted.lock().unwrap(),
            vec!["LocalGatewayExternal-54.9.9.9"]
        );
        let on_disk: PairMap =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(on_disk.is_empty());
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::default();
        let local = eni(
            "eni-local",
            "10.1.0.5",
            &[("10.1.0.10", Some("54.1.1.1")), ("10.1.0.11", None)],
        );
        let peer = eni(
            "eni-peer",
            "10.2.0.5",
            &[("10.2.0.10", None), ("10.2.0.11", Some("54.2.2.2"))],
        );
        let engine = CrossAzMapEngine::new(&registry, &map_file(&dir));
        let inputs = MapInputs {
            local_eni: &local,
            peer_eni: &peer,
            local_vip_ip: Some("10.1.0.10".to_owned()),
            remote_vip_ip: Some("10.2.0.10".to_owned()),
        };
        engine.update(&inputs).await.unwrap();
        let first = std::fs::read_to_string(map_file(&dir)).unwrap();
        engine.update(&inputs).await.unwrap();
        let second = std::fs::read_to_string(map_file(&dir)).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn vip_pair_uses_peer_eip_when_local_alias_has_none() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::default();
        let local = eni("eni-local", "10.1.0.5", &[("10.1.0.10", None)]);
        let peer = eni("eni-peer", "10.2.0.5", &[("10.2.0.10", Some("54.3.3.3"))]);
        let engine = CrossAzMapEngine::new(&registry, &map_file(&dir));
        let inputs = MapInputs {
            local_eni: &local,
            peer_eni: &peer,
            local_vip_ip: Some("10.1.0.10".to_owned()),
            remote_vip_ip: Some("10.2.0.10".to_owned()),
        };
        let map = engine.update(&inputs).await.unwrap();
        assert_eq!(map["10.2.0.10"].eip, "54.3.3.3");
        assert_eq!(map["10.2.0.10"].local_ip, "10.1.0.10");
    }

    #[tokio::test]
    async fn vip_pair_is_inserted_before_other_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::default();
        let local = eni(
            "eni-local",
            "10.1.0.5",
            &[("10.1.0.2", Some("54.0.0.2")), ("10.1.0.10", Some("54.1.1.1"))],
        );
        let peer = eni(
            "eni-peer",
            "10.2.0.5",
            &[("10.2.0.2", None), ("10.2.0.10", None)],
        );
        let engine = CrossAzMapEngine::new(&registry, &map_file(&dir));
        let inputs = MapInputs {
            local_eni: &local,
            peer_eni: &peer,
            local_vip_ip: Some("10.1.0.10".to_owned()),
            remote_vip_ip: Some("10.2.0.10".to_owned()),
        };
        let map = engine.update(&inputs).await.unwrap();
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec!["10.2.0.10", "10.2.0.2"]);
        assert_eq!(map["10.2.0.10"].eip, "54.1.1.1");
        assert_eq!(map["10.2.0.2"].eip, "54.0.0.2");
    }

    #[tokio::test]
    async fn mismatched_group_sizes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::default();
        let local = eni(
            "eni-local",
            "10.1.0.5",
            &[("10.1.0.10", None), ("10.1.0.11", None)],
        );
        let peer = eni("eni-peer", "10.2.0.5", &[("10.2.0.10", Some("54.2.2.2"))]);
        let engine = CrossAzMapEngine::new(&registry, &map_file(&dir));
        let inputs = MapInputs {
            local_eni: &local,
            peer_eni: &peer,
            local_vip_ip: None,
            remote_vip_ip: None,
        };
        assert!(matches!(
            engine.update(&inputs).await,
            Err(Error::UnpairableSecondaryIps)
        ));
        assert!(!map_file(&dir).exists());
    }

    #[tokio::test]
    async fn garbage_map_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::default();
        let path = map_file(&dir);
        std::fs::write(&path, "").unwrap();
        let local = eni("eni-local", "10.1.0.5", &[]);
        let peer = eni("eni-peer", "10.2.0.5", &[]);
        let engine = CrossAzMapEngine::new(&registry, &path);
        let inputs = MapInputs {
            local_eni: &local,
            peer_eni: &peer,
            local_vip_ip: None,
            remote_vip_ip: None,
        };
        assert!(matches!(
            engine.update(&inputs).await,
            Err(Error::InvalidCrossAzMap(_))
        ));
    }

    #[test]
    fn map_serializes_with_original_key_names() {
        let mut map = PairMap::new();
        map.insert(
            "10.2.0.10".to_owned(),
            PairRecord {
                local_ip: "10.1.0.10".to_owned(),
                remote_ip: "10.2.0.10".to_owned(),
                eip: "54.1.1.1".to_owned(),
                dynamic_object_name: "LocalGatewayExternal-54.1.1.1".to_owned(),
            },
        );
        let text = crate::to_json_pretty(&map).unwrap();
        assert!(text.contains("\"local_mem_private_ip\": \"10.1.0.10\""));
        assert!(text.contains("\"EIP\": \"54.1.1.1\""));
        assert!(text.contains("    \"10.2.0.10\""));
    }
}
