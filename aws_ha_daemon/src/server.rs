//! The event server: a unix datagram socket fed by the cluster scripts with
//! short ASCII tokens, driving reconfiguration and poll cycles.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use aws_ha_shared::paths::Paths;
use aws_ha_shared::Error;
use tokio::net::UnixDatagram;
use tracing::{debug, error};

use crate::controller::Controller;

const POLL_TIMEOUT: Duration = Duration::from_secs(5);
const DATAGRAM_MAX: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    Reconf,
    Changed,
    Stop,
}

impl Event {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "RECONF" => Some(Event::Reconf),
            "CHANGED" => Some(Event::Changed),
            "STOP" => Some(Event::Stop),
            _ => None,
        }
    }
}

pub struct EventServer {
    sock: UnixDatagram,
    sock_path: PathBuf,
    pid_path: PathBuf,
}

impl EventServer {
    /// Binds the socket and registers the daemon's pid. Leftovers from a
    /// previous run are removed first.
    pub fn bind(paths: &Paths) -> Result<Self, Error> {
        if let Some(dir) = paths.socket.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&paths.pid_file, std::process::id().to_string())?;
        let _ = std::fs::remove_file(&paths.socket);
        let sock = UnixDatagram::bind(&paths.socket)?;
        Ok(Self {
            sock,
            sock_path: paths.socket.clone(),
            pid_path: paths.pid_file.clone(),
        })
    }

    /// Runs the event loop until a `STOP` arrives. Handler failures are
    /// logged and the loop keeps going; socket failures end it.
    pub async fn run(&self, ctrl: &mut Controller) -> Result<(), Error> {
        loop {
            let events = self.collect_events().await?;
            if events.contains(&Event::Reconf) {
                if let Err(e) = ctrl.reconf().await {
                    error!("{}", e);
                }
            }
            if events.contains(&Event::Changed) {
                if let Err(e) = ctrl.poll().await {
                    error!("{}", e);
                }
            }
            if events.contains(&Event::Stop) {
                debug!("Leaving...");
                return Ok(());
            }
        }
    }

    /// Waits up to the poll timeout for traffic, then drains everything
    /// pending into a set. The drain always ends in would-block, which also
    /// asserts the synthetic `CHANGED` event; an idle timeout therefore
    /// yields `{CHANGED}`.
    pub async fn collect_events(&self) -> Result<BTreeSet<Event>, Error> {
        let mut events = BTreeSet::new();
        let mut buf = [0u8; DATAGRAM_MAX];
        if let Ok(ready) = tokio::time::timeout(POLL_TIMEOUT, self.sock.readable()).await {
            ready?;
        }
        loop {
            match self.sock.try_recv(&mut buf) {
                Ok(len) => {
                    let token = String::from_utf8_lossy(&buf[..len]);
                    let token = token.trim();
                    debug!("received: {}", token);
                    match Event::parse(token) {
                        Some(event) => {
                            events.insert(event);
                        }
                        None => debug!("ignoring unknown event: {}", token),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    events.insert(Event::Changed);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(events)
    }
}

impl Drop for EventServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pid_path);
        let _ = std::fs::remove_file(&self.sock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_ha_shared::paths::Paths;

    #[test]
    fn known_tokens_parse() {
        assert_eq!(Event::parse("RECONF"), Some(Event::Reconf));
        assert_eq!(Event::parse("CHANGED"), Some(Event::Changed));
        assert_eq!(Event::parse("STOP"), Some(Event::Stop));
        assert_eq!(Event::parse("NOPE"), None);
    }

    #[tokio::test]
    async fn pending_datagrams_are_drained_into_a_set() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::under(dir.path());
        let server = EventServer::bind(&paths).unwrap();
        let client = UnixDatagram::unbound().unwrap();
        client.send_to(b"RECONF", &paths.socket).await.unwrap();
        client.send_to(b"RECONF", &paths.socket).await.unwrap();
        client.send_to(b"STOP", &paths.socket).await.unwrap();
        client.send_to(b"bogus", &paths.socket).await.unwrap();

        let events = server.collect_events().await.unwrap();
        // The drain dedups, ignores the unknown token, and always asserts
        // the synthetic CHANGED.
        assert_eq!(
            events,
            BTreeSet::from([Event::Reconf, Event::Changed, Event::Stop])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_yields_synthetic_changed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::under(dir.path());
        let server = EventServer::bind(&paths).unwrap();
        // No traffic at all: after the poll timeout the set holds CHANGED.
        let events = server.collect_events().await.unwrap();
        assert_eq!(events, BTreeSet::from([Event::Changed]));
    }

    #[tokio::test]
    async fn socket_and_pid_file_are_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::under(dir.path());
        {
            let _server = EventServer::bind(&paths).unwrap();
            assert!(paths.socket.exists());
            assert!(paths.pid_file.exists());
        }
        assert!(!paths.socket.exists());
        assert!(!paths.pid_file.exists());
    }
}
