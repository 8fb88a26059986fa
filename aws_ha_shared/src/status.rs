//! The cluster failover status file, the public observable for external
//! watchers.

use std::path::Path;

use tracing::debug;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverStatus {
    NotStarted,
    InProgress,
    Done,
}

impl FailoverStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FailoverStatus::NotStarted => "NOT_STARTED",
            FailoverStatus::InProgress => "IN_PROGRESS",
            FailoverStatus::Done => "DONE",
        }
    }
}

impl std::fmt::Display for FailoverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replaces the status file contents with the given status token.
pub fn update_status_file(path: &Path, status: FailoverStatus) -> Result<(), Error> {
    debug!("Updating cluster status file with {} status", status);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, status.as_str())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_file_holds_latest_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud_failover_status");
        update_status_file(&path, FailoverStatus::InProgress).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "IN_PROGRESS");
        update_status_file(&path, FailoverStatus::Done).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "DONE");
    }
}
