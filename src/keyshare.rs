//! Durable output of key generation.
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::crypto::Share;
use crate::error::{MpcError, Result};
use crate::message::{hex_bytes, PeerInfo};

/// What a peer keeps after key generation to take part in later signing runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyShare {
    pub group_id: String,
    #[serde(with = "hex_bytes")]
    pub gpk: Vec<u8>,
    pub private_share: Share,
    /// Key generation peers and seeds; signing reuses these x-coordinates.
    pub peers: Vec<PeerInfo>,
}

impl KeyShare {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, serde_json::to_vec_pretty(self)?)
            .map_err(|e| MpcError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .map_err(|e| MpcError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Key shares of this node, by GPK bytes.
#[derive(Default)]
pub struct KeyStore {
    shares: RwLock<HashMap<Vec<u8>, KeyShare>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, share: KeyShare) -> Result<()> {
        let mut shares = self.shares.write().unwrap_or_else(PoisonError::into_inner);
        if shares.contains_key(&share.gpk) {
            return Err(MpcError::KeyExists(hex::encode(&share.gpk)));
        }
        shares.insert(share.gpk.clone(), share);
        Ok(())
    }

    pub fn get(&self, gpk: &[u8]) -> Result<KeyShare> {
        self.shares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(gpk)
            .cloned()
            .ok_or(MpcError::UnknownGpk)
    }

    pub fn gpks(&self) -> Vec<Vec<u8>> {
        self.shares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NodeId;
    use secp256kfun::Scalar;

    fn share() -> KeyShare {
        KeyShare {
            group_id: "grp0".into(),
            gpk: vec![2u8; 33],
            private_share: Scalar::from(77u32),
            peers: vec![PeerInfo {
                node_id: NodeId::new("node0"),
                seed: 5,
            }],
        }
    }

    #[test]
    fn second_insert_for_a_gpk_is_refused() {
        let store = KeyStore::new();
        store.insert(share()).unwrap();
        assert!(matches!(store.insert(share()), Err(MpcError::KeyExists(_))));
        assert_eq!(store.get(&[2u8; 33]).unwrap(), share());
        assert_eq!(store.get(&[3u8; 33]), Err(MpcError::UnknownGpk));
    }

    #[test]
    fn survives_a_trip_through_disk() {
        let path = std::env::temp_dir().join(format!("keyshare-{}.json", std::process::id()));
        share().save(&path).unwrap();
        assert_eq!(KeyShare::load(&path).unwrap(), share());
        std::fs::remove_file(&path).unwrap();
    }
}
