//! The host's dynamic-object registry: named IP sets consumed by the packet
//! filter policy. Pair-map entries expose their local private IP through one
//! dynamic object each.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::Error;

#[async_trait]
pub trait DynamicObjectRegistry: Send + Sync {
    /// Creates (or overwrites) the named object holding a single address.
    async fn create(&self, name: &str, ip: &str) -> Result<(), Error>;

    async fn delete(&self, name: &str) -> Result<(), Error>;

    /// Names of all registered objects.
    async fn list(&self) -> Result<Vec<String>, Error>;
}

/// Production registry backed by the `dynamic_objects` host command.
pub struct DynamicObjectsCli;

#[async_trait]
impl DynamicObjectRegistry for DynamicObjectsCli {
    async fn create(&self, name: &str, ip: &str) -> Result<(), Error> {
        debug!("Creating dynamic object {} for {}", name, ip);
        let output = Command::new("dynamic_objects")
            .args(["-n", name, "-r", ip, ip, "-a"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::DynamicObjectCreate(name.to_owned()));
        }
        info!("Created dynamic object {}", name);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        debug!("Deleting dynamic object {}", name);
        let output = Command::new("dynamic_objects")
            .args(["-do", name])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::DynamicObjectDelete(name.to_owned()));
        }
        info!("Deleted dynamic object {}", name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, Error> {
        let output = Command::new("dynamic_objects").arg("-l").output().await?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: "dynamic_objects -l".to_owned(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(parse_object_names(&text))
    }
}

/// Object names from `dynamic_objects -l` output; one
/// `object name : <name>` line per object.
fn parse_object_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("object name :"))
        .map(|name| name.trim().to_owned())
        .collect()
}
