//! Per-node member agent
//!
//! The agent is responsible for:
//! - Running the leader lease election loop against the coordination store
//! - Driving the database engine's promote/demote operations to match
//!   lease state (lease truth wins, never probe results)
//! - Serving the status endpoint polled by the health prober

pub mod engine;
pub mod lease;
pub mod server;

pub use engine::{CommandEngine, DatabaseEngine, EngineRole};
pub use lease::{ElectionState, LeaseManager, LeaseView};
pub use server::{create_router, Agent, AgentState, MemberAgent, MemberStatus};
