//! Configuration for leasehold components
//!
//! All tunables are supplied at startup (TOML file, `LEASEHOLD_*` environment
//! overrides, CLI flags); there is no hot reload. Validation runs before any
//! listener opens and is fatal on error.
//!
//! Safe ranges: lease TTL must be much larger than the probe interval, which
//! in turn must be much larger than typical network round-trips. The defaults
//! (TTL 10s, probe every 1s, probe timeout 500ms) follow that rule.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster-wide settings shared by agents and proxies
    pub cluster: ClusterConfig,

    /// Agent-specific config (present on database nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    /// Proxy-specific config (present on routing nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Cluster-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster identifier (also the lease key namespace)
    pub name: String,

    /// Static member list
    pub members: Vec<MemberSpec>,

    /// Coordination store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Leader lease TTL
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_ms: u64,

    /// Health probe sweep interval
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Per-probe timeout
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Consecutive successful probes before a member counts as healthy
    #[serde(default = "default_rise")]
    pub rise: u32,

    /// Consecutive failed probes before a member counts as unhealthy
    #[serde(default = "default_fall")]
    pub fall: u32,

    /// Timeout applied to every coordination store call
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

fn default_lease_ttl() -> u64 {
    10_000
}
fn default_probe_interval() -> u64 {
    1_000
}
fn default_probe_timeout() -> u64 {
    500
}
fn default_rise() -> u32 {
    2
}
fn default_fall() -> u32 {
    2
}
fn default_store_timeout() -> u64 {
    2_000
}

impl ClusterConfig {
    /// Key under which the leader lease lives in the coordination store
    pub fn lease_key(&self) -> String {
        format!("/{}/leader", self.name)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Look up a member by id
    pub fn member(&self, id: &str) -> Option<&MemberSpec> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("cluster name must not be empty".into()));
        }
        if self.members.is_empty() {
            return Err(Error::InvalidConfig("member list must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for member in &self.members {
            if member.id.is_empty() {
                return Err(Error::InvalidConfig("member id must not be empty".into()));
            }
            if !seen.insert(member.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate member id: {}",
                    member.id
                )));
            }
        }
        if self.lease_ttl_ms == 0 {
            return Err(Error::InvalidConfig("lease_ttl_ms must be > 0".into()));
        }
        if self.probe_interval_ms == 0 {
            return Err(Error::InvalidConfig("probe_interval_ms must be > 0".into()));
        }
        if self.lease_ttl_ms <= self.probe_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "lease_ttl_ms ({}) must exceed probe_interval_ms ({})",
                self.lease_ttl_ms, self.probe_interval_ms
            )));
        }
        if self.rise == 0 || self.fall == 0 {
            return Err(Error::InvalidConfig("rise and fall must be >= 1".into()));
        }
        Ok(())
    }
}

/// One cluster member, as known from static configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    /// Unique, stable member id
    pub id: String,

    /// Address of the member's agent status endpoint (host:port)
    pub status_addr: String,

    /// Address of the member's database backend (host:port)
    pub backend_addr: String,
}

impl MemberSpec {
    /// URL polled by the health prober
    pub fn status_url(&self) -> String {
        format!("http://{}/status", self.status_addr)
    }
}

/// Coordination store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Store endpoints (etcd backend)
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
}

fn default_endpoints() -> Vec<String> {
    vec!["localhost:2379".to_string()]
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: default_endpoints(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Etcd,
    /// In-process store, for tests and single-node development
    Memory,
}

/// Per-node agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// This node's member id (must appear in the cluster member list)
    pub member_id: String,

    /// Bind address for the status endpoint
    pub listen_addr: SocketAddr,

    /// Hook command run to promote the engine to primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promote_command: Option<String>,

    /// Hook command run to demote the engine / reattach it as a replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demote_command: Option<String>,
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listener for write traffic (routes to the primary only)
    pub write_listen: SocketAddr,

    /// Listener for read traffic (round-robin over healthy members)
    pub read_listen: SocketAddr,

    /// Timeout for backend connection establishment
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    3_000
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file, with `LEASEHOLD_*` env overrides
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("LEASEHOLD").separator("__"))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        if let Some(agent) = &self.agent {
            if self.cluster.member(&agent.member_id).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "agent member_id {} is not in the cluster member list",
                    agent.member_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> MemberSpec {
        MemberSpec {
            id: id.to_string(),
            status_addr: format!("127.0.0.1:80{}", id.len()),
            backend_addr: format!("127.0.0.1:54{}", id.len()),
        }
    }

    fn cluster() -> ClusterConfig {
        ClusterConfig {
            name: "pg-main".to_string(),
            members: vec![member("a"), member("bb"), member("ccc")],
            store: StoreConfig::default(),
            lease_ttl_ms: 10_000,
            probe_interval_ms: 1_000,
            probe_timeout_ms: 500,
            rise: 2,
            fall: 2,
            store_timeout_ms: 2_000,
        }
    }

    #[test]
    fn test_valid_cluster() {
        assert!(cluster().validate().is_ok());
        assert_eq!(cluster().lease_key(), "/pg-main/leader");
    }

    #[test]
    fn test_duplicate_member_ids_rejected() {
        let mut config = cluster();
        config.members.push(member("a"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_must_exceed_probe_interval() {
        let mut config = cluster();
        config.lease_ttl_ms = 1_000;
        config.probe_interval_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_thresholds_rejected() {
        let mut config = cluster();
        config.rise = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_agent_id_must_be_known() {
        let config = Config {
            cluster: cluster(),
            agent: Some(AgentConfig {
                member_id: "nope".to_string(),
                listen_addr: "127.0.0.1:8008".parse().unwrap(),
                promote_command: None,
                demote_command: None,
            }),
            proxy: None,
            log_level: "info".to_string(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            file,
            r#"
[cluster]
name = "pg-main"
lease_ttl_ms = 5000

[[cluster.members]]
id = "a"
status_addr = "10.0.0.1:8008"
backend_addr = "10.0.0.1:5432"

[cluster.store]
backend = "memory"

[proxy]
write_listen = "0.0.0.0:5000"
read_listen = "0.0.0.0:5001"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.cluster.name, "pg-main");
        assert_eq!(config.cluster.lease_ttl_ms, 5000);
        assert_eq!(config.cluster.store.backend, StoreBackend::Memory);
        assert_eq!(config.cluster.members[0].status_url(), "http://10.0.0.1:8008/status");
        assert!(config.proxy.is_some());
        assert!(config.validate().is_ok());
    }
}
