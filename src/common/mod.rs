//! Common utilities and types shared across leasehold

pub mod config;
pub mod error;
pub mod utils;

pub use config::{AgentConfig, ClusterConfig, Config, MemberSpec, ProxyConfig, StoreBackend, StoreConfig};
pub use error::{Error, Result};
pub use utils::{jittered, timestamp_now_millis, Backoff};
