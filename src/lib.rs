//! # leasehold
//!
//! Primary election and health-aware routing for replicated database
//! clusters:
//! - Leader lease protocol over a strongly-consistent coordination store
//!   (etcd), with fencing tokens and self-demotion on doubt
//! - Per-node member agent driving engine promote/demote and serving a
//!   status endpoint
//! - Periodic health prober with flap resistance
//! - TCP proxy routing writes to the lease-holding primary and reads
//!   round-robin over healthy members
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────┐
//!                │   Coordination store     │
//!                │  (etcd: CAS + TTL lease) │
//!                └─────┬──────────────┬─────┘
//!         lease ops    │              │   lease watch
//!   ┌──────────────────┤              ├────────────────────┐
//!   │                  │              │                    │
//! ┌─▼──────────┐ ┌─────▼──────┐  ┌────▼───────────────────┐│
//! │ Agent (a)  │ │ Agent (b)  │  │ Proxy                  ││
//! │ lease mgr  │ │ lease mgr  │  │  prober ──► routing ◄──┘│
//! │ engine ctl │ │ engine ctl │  │  write port  read port  │
//! │ /status ◄──┼─┼────────────┼──┼── probes                │
//! └────────────┘ └────────────┘  └─────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start an agent on each database node
//! ```bash
//! leasehold-agent serve --config /etc/leasehold.toml --id pg-1
//! ```
//!
//! ### Start the proxy
//! ```bash
//! leasehold-proxy serve --config /etc/leasehold.toml
//! ```
//!
//! ### Inspect the cluster
//! ```bash
//! leasehold status --config /etc/leasehold.toml
//! ```

pub mod agent;
pub mod common;
pub mod prober;
pub mod proxy;
pub mod store;

// Re-export commonly used types
pub use agent::Agent;
pub use common::{Config, Error, Result};
pub use proxy::ProxyServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
