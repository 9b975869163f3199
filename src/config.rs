//! Engine settings and the on-disk group configuration.
use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{MpcError, Result};
use crate::message::MAX_MESSAGE_SIZE;

/// Timeouts and limits of the engine. Every field has a default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcConfig {
    /// Bound on a single round.
    pub step_timeout_ms: u64,
    /// Bound on a whole run.
    pub protocol_timeout_ms: u64,
    pub approval_timeout_ms: u64,
    pub approval_poll_ms: u64,
    pub max_message_size: usize,
    /// Followers only join signing runs for approved payloads.
    pub require_approval: bool,
    /// Messages kept per run that arrive before the run is admitted, and the
    /// number of such runs.
    pub max_parked_messages: usize,
    /// Total encoded size of all parked messages.
    pub max_parked_bytes: usize,
}

impl Default for MpcConfig {
    fn default() -> Self {
        MpcConfig {
            step_timeout_ms: 10_000,
            protocol_timeout_ms: 60_000,
            approval_timeout_ms: 10_000,
            approval_poll_ms: 20,
            max_message_size: MAX_MESSAGE_SIZE,
            require_approval: false,
            max_parked_messages: 256,
            max_parked_bytes: 16 * 1024 * 1024,
        }
    }
}

impl MpcConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MpcError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol_timeout_ms)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn approval_poll(&self) -> Duration {
        Duration::from_millis(self.approval_poll_ms.max(1))
    }

    /// How long an admitted run id is remembered, so repeated Requests for it
    /// are ignored.
    pub fn admission_memory(&self) -> Duration {
        self.approval_timeout() + 2 * self.protocol_timeout()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub index: u16,
    pub node_id: String,
    /// Long-term x-only public key, hex.
    pub public_key: String,
    /// Public image of the member's key share, compressed hex.
    #[serde(default)]
    pub public_share: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: String,
    pub threshold: usize,
    pub leader_index: u16,
    pub members: Vec<MemberConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub groups: Vec<GroupEntry>,
}

impl GroupConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MpcError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .map_err(|e| MpcError::InvalidConfig(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_takes_defaults() {
        let config: MpcConfig = serde_json::from_str(r#"{"step_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.step_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert!(!config.require_approval);
        assert_eq!(config.max_parked_bytes, 16 * 1024 * 1024);
        assert_eq!(config.admission_memory(), Duration::from_millis(130_000));
    }

    #[test]
    fn group_entry_without_public_share() {
        let raw = r#"{"groups":[{"id":"g","threshold":2,"leader_index":0,
            "members":[{"index":0,"node_id":"n0","public_key":"ab"}]}]}"#;
        let config: GroupConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.groups[0].members[0].public_share, None);
    }
}
