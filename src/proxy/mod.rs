//! Routing table and proxy core
//!
//! Merges lease-store truth with health-probe results into a live routing
//! table, and dispatches client TCP connections against it: writes go to
//! the lease-holding primary only, reads rotate over healthy members.

pub mod routing;
pub mod server;

pub use routing::{Router, RoutingRebuilder, RoutingTable};
pub use server::{PoolKind, ProxyServer};
