//! Replication tuning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// When received commands run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandDispatch {
    /// Execute as soon as the message is handled.
    Immediate,
    /// Queue and execute at the start of the next tick.
    #[default]
    Deferred,
}

impl FromStr for CommandDispatch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "deferred" => Ok(Self::Deferred),
            other => Err(format!("unknown command dispatch mode: {}", other)),
        }
    }
}

impl fmt::Display for CommandDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Deferred => write!(f, "deferred"),
        }
    }
}

/// Settings shared by replication servers and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplicationConfig {
    /// Snapshot ids retained for delta baselines
    pub history_capacity: usize,
    /// Client ticks before an unanswered resync request is re-sent
    pub resync_timeout_ticks: u64,
    pub command_dispatch: CommandDispatch,
    /// Retry passes when applying a full payload
    pub max_apply_passes: usize,
    /// Server sends its structure hash after every sync
    pub debug_hash_checks: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            history_capacity: 64,
            resync_timeout_ticks: 120,
            command_dispatch: CommandDispatch::Deferred,
            max_apply_passes: 64,
            debug_hash_checks: false,
        }
    }
}
