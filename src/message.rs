//! Wire messages exchanged between peers of a run.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::Share;
use crate::error::{MpcError, Result};

/// Default upper bound on an encoded packet.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A run participant and the x-coordinate it evaluates shares at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub seed: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageCode {
    /// Opens a run on a follower.
    Request,
    Mpc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolKind {
    KeyGen,
    Sign,
}

/// What the leader asks followers to run, carried on the opening Request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub kind: ProtocolKind,
    pub group_id: String,
    #[serde(with = "hex_bytes", default)]
    pub gpk: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub message: Vec<u8>,
    #[serde(default = "default_sign_count")]
    pub sign_count: usize,
    /// Address the signed payload must come from; empty when unchecked.
    #[serde(with = "hex_bytes", default)]
    pub address: Vec<u8>,
}

fn default_sign_count() -> usize {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepMessage {
    pub code: MessageCode,
    pub from: NodeId,
    /// `None` broadcasts to every run peer.
    pub to: Option<NodeId>,
    #[serde(default)]
    pub peers: Option<Vec<PeerInfo>>,
    #[serde(default)]
    pub request: Option<RunRequest>,
    #[serde(default)]
    pub data: Vec<Share>,
    #[serde(with = "hex_blobs", default)]
    pub bytes: Vec<Vec<u8>>,
}

impl StepMessage {
    pub fn mpc(from: NodeId, to: Option<NodeId>) -> Self {
        StepMessage {
            code: MessageCode::Mpc,
            from,
            to,
            peers: None,
            request: None,
            data: vec![],
            bytes: vec![],
        }
    }

    pub fn with_data(mut self, data: Vec<Share>) -> Self {
        self.data = data;
        self
    }

    pub fn with_bytes(mut self, bytes: Vec<Vec<u8>>) -> Self {
        self.bytes = bytes;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub run_id: u64,
    pub step_id: usize,
    pub message: StepMessage,
}

pub fn encode(message: &WireMessage, max_size: usize) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > max_size {
        return Err(MpcError::MessageTooLarge {
            size: bytes.len(),
            max: max_size,
        });
    }
    Ok(bytes)
}

/// Size-check then decode a packet.
pub fn decode(bytes: &[u8], max_size: usize) -> Result<WireMessage> {
    if bytes.len() > max_size {
        return Err(MpcError::MessageTooLarge {
            size: bytes.len(),
            max: max_size,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod hex_blobs {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(blobs: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(blobs.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
