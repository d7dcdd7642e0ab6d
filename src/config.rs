//! Session configuration.

use std::ffi::OsStr;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fabric::{ConnParam, PortSpace, QpCaps};

/// Parameters shared by both roles of a session.
///
/// Every field has a default, so a configuration file only needs to name
/// what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Connection-manager port.
    pub port: u16,

    /// Connection-manager port space used for addressing.
    pub port_space: PortSpace,

    /// Completion queue depth.
    pub cq_capacity: u32,

    /// Queue pair capabilities.
    pub caps: QpCaps,

    /// Bound on address and route resolution, in milliseconds.
    pub resolve_timeout_ms: u64,

    /// Pending connection requests a listener queues.
    pub listen_backlog: i32,

    /// Outstanding RDMA reads this side issues.
    pub initiator_depth: u8,

    /// Outstanding RDMA reads this side serves.
    pub responder_resources: u8,

    /// Transport retries on connect.
    pub retry_count: u8,

    /// Receiver-not-ready retries on connect.
    pub rnr_retry_count: u8,

    /// Bytes the acceptor exposes to its peer.
    pub buffer_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: Self::DEFAULT_PORT,
            port_space: PortSpace::Udp,
            cq_capacity: 16,
            caps: QpCaps::default(),
            resolve_timeout_ms: 2000,
            listen_backlog: 8,
            initiator_depth: 3,
            responder_resources: 3,
            retry_count: 3,
            rnr_retry_count: 0,
            buffer_len: 4 << 20,
        }
    }
}

impl SessionConfig {
    /// The RoCEv2 UDP port.
    pub const DEFAULT_PORT: u16 = 4791;

    /// Load a configuration from a TOML (`.toml`) or JSON (`.json`) file and
    /// validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

        let config = match path.extension().and_then(OsStr::to_str) {
            Some("toml") => Self::from_toml(&text)?,
            Some("json") => Self::from_json(&text)?,
            _ => {
                return Err(Error::Config(format!(
                    "{}: expected a .toml or .json file",
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check that the queue sizes can carry a session.
    pub fn validate(&self) -> Result<()> {
        let caps = &self.caps;
        if self.cq_capacity == 0 || caps.max_send_wr == 0 || caps.max_recv_wr == 0 {
            return Err(Error::Config("queue depths must be non-zero".into()));
        }
        if caps.max_send_sge == 0 || caps.max_recv_sge == 0 {
            return Err(Error::Config(
                "at least one scatter/gather entry is required".into(),
            ));
        }
        if (self.cq_capacity as u64) < caps.max_send_wr as u64 + caps.max_recv_wr as u64 {
            return Err(Error::Config(format!(
                "CQ capacity {} cannot hold {} send and {} receive completions",
                self.cq_capacity, caps.max_send_wr, caps.max_recv_wr
            )));
        }
        if self.buffer_len == 0 || u32::try_from(self.buffer_len).is_err() {
            return Err(Error::Config(format!(
                "buffer length {} out of range",
                self.buffer_len
            )));
        }
        Ok(())
    }

    /// Resolution timeout as a [`Duration`].
    #[inline]
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Connection parameters for `connect`.
    pub fn connect_param(&self) -> ConnParam {
        ConnParam {
            initiator_depth: self.initiator_depth,
            responder_resources: self.responder_resources,
            retry_count: self.retry_count,
            rnr_retry_count: self.rnr_retry_count,
        }
    }

    /// Connection parameters for `accept`. Retry counts only apply to the
    /// connecting side.
    pub fn accept_param(&self) -> ConnParam {
        ConnParam {
            initiator_depth: self.initiator_depth,
            responder_resources: self.responder_resources,
            ..Default::default()
        }
    }
}

/// Resolve a host name or address literal to the first matching socket
/// address on `port`.
pub fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| Error::Config(format!("{} has no address", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.port, 4791);
        assert_eq!(config.port_space, PortSpace::Udp);
        assert_eq!(config.connect_param().retry_count, 3);
        assert_eq!(config.accept_param().retry_count, 0);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SessionConfig::from_toml(
            r#"
            port = 20886
            port_space = "tcp"

            [caps]
            max_send_wr = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 20886);
        assert_eq!(config.port_space, PortSpace::Tcp);
        assert_eq!(config.caps.max_send_wr, 4);
        assert_eq!(config.caps.max_recv_wr, 8);
        assert_eq!(config.cq_capacity, 16);
    }

    #[test]
    fn json_is_accepted() {
        let config = SessionConfig::from_json(r#"{ "buffer_len": 4096 }"#).unwrap();
        assert_eq!(config.buffer_len, 4096);
        assert!(SessionConfig::from_json("{ \"port\": \"x\" }").is_err());
    }

    #[test]
    fn undersized_queues_are_rejected() {
        let mut config = SessionConfig {
            cq_capacity: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.cq_capacity = 16;
        config.caps.max_recv_sge = 0;
        assert!(config.validate().is_err());

        config.caps.max_recv_sge = 1;
        config.buffer_len = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn address_literals_resolve() {
        let addr = resolve_host("192.168.1.20", 4791).unwrap();
        assert_eq!(addr, "192.168.1.20:4791".parse().unwrap());
        let addr = resolve_host("::1", 20886).unwrap();
        assert_eq!(addr.port(), 20886);
    }

    #[test]
    fn load_dispatches_on_extension() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("roce-session-config-{}", std::process::id()));
        fs::create_dir_all(&dir)?;

        let toml_path = dir.join("session.toml");
        fs::write(&toml_path, "listen_backlog = 2\n")?;
        assert_eq!(SessionConfig::load(&toml_path)?.listen_backlog, 2);

        let yaml_path = dir.join("session.yaml");
        fs::write(&yaml_path, "port: 1\n")?;
        assert!(SessionConfig::load(&yaml_path).is_err());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
