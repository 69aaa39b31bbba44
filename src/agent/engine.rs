//! Database engine control interface
//!
//! The replicated database engine is an external collaborator. It is assumed
//! to expose a promote-to-primary operation, an attach-as-replica operation,
//! and a replication lag metric; everything behind those operations
//! (streaming replication, WAL shipping, ...) stays out of scope.

use crate::common::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineRole {
    Primary,
    Replica,
    #[default]
    Unknown,
}

impl std::fmt::Display for EngineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineRole::Primary => write!(f, "primary"),
            EngineRole::Replica => write!(f, "replica"),
            EngineRole::Unknown => write!(f, "unknown"),
        }
    }
}

#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Current engine role
    async fn role(&self) -> Result<EngineRole>;

    /// Promote to primary. Idempotent: promoting an engine that is already
    /// primary is a no-op, not an error.
    async fn promote(&self) -> Result<()>;

    /// Demote and reattach as a replica of `primary` (backend address),
    /// when known. Idempotent like `promote`.
    async fn demote(&self, primary: Option<&str>) -> Result<()>;

    /// Streaming replication lag, in bytes behind the primary
    async fn replication_lag(&self) -> Result<u64>;
}

/// Engine adapter that tracks the role in memory and runs configured hook
/// commands on transitions. With no hooks configured it degenerates to a
/// pure state tracker, which is what single-node development uses.
pub struct CommandEngine {
    role: Mutex<EngineRole>,
    promote_command: Option<String>,
    demote_command: Option<String>,
}

impl CommandEngine {
    pub fn new(promote_command: Option<String>, demote_command: Option<String>) -> Self {
        Self {
            role: Mutex::new(EngineRole::Replica),
            promote_command,
            demote_command,
        }
    }

    async fn run_hook(op: &str, command: &str, primary: Option<&str>) -> Result<()> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(primary) = primary {
            cmd.env("LEASEHOLD_PRIMARY", primary);
        }
        let status = cmd.status().await.map_err(|e| Error::EngineOperation {
            op: op.to_string(),
            reason: e.to_string(),
        })?;
        if !status.success() {
            return Err(Error::EngineOperation {
                op: op.to_string(),
                reason: format!("hook exited with {}", status),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseEngine for CommandEngine {
    async fn role(&self) -> Result<EngineRole> {
        Ok(*self.role.lock().unwrap())
    }

    async fn promote(&self) -> Result<()> {
        if *self.role.lock().unwrap() == EngineRole::Primary {
            return Ok(());
        }
        if let Some(command) = &self.promote_command {
            Self::run_hook("promote", command, None).await?;
        }
        *self.role.lock().unwrap() = EngineRole::Primary;
        Ok(())
    }

    async fn demote(&self, primary: Option<&str>) -> Result<()> {
        if *self.role.lock().unwrap() == EngineRole::Replica {
            return Ok(());
        }
        if let Some(command) = &self.demote_command {
            Self::run_hook("demote", command, primary).await?;
        }
        *self.role.lock().unwrap() = EngineRole::Replica;
        Ok(())
    }

    async fn replication_lag(&self) -> Result<u64> {
        // The state tracker has no real replication stream to measure
        Ok(0)
    }
}
