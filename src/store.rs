//! Per-run scratch space shared by the steps of one protocol context.
use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};

use crate::crypto::Share;
use crate::error::{MpcError, Result};

/// Well-known result store keys.
pub mod keys {
    /// Leader-chosen peer list, serialized.
    pub const PEERS: &str = "MpcPeers";
    /// Message to sign.
    pub const MESSAGE: &str = "MpcM";
    /// Expected signer address bound to the GPK.
    pub const ADDRESS: &str = "MpcAddress";

    /// This peer's share of the group private key.
    pub const PRIVATE_SHARE: &str = "MpcPrivateShare";
    pub const PUBLIC_SHARE: &str = "MpcPublicShare";
    pub const GPK: &str = "MpcGpk";
    /// Peers whose public key share was accepted, rejected, or missing.
    pub const GPK_OK: &str = "MpcGpkOk";
    pub const GPK_KO: &str = "MpcGpkKo";
    pub const GPK_NO: &str = "MpcGpkNo";

    pub const NONCE_SHARE: &str = "MpcNonceShare";
    pub const NONCE_POINT: &str = "MpcNoncePoint";
    pub const R: &str = "MpcR";
    pub const R_OK: &str = "MpcROk";
    pub const R_KO: &str = "MpcRKo";
    pub const R_NO: &str = "MpcRNo";
    pub const BLIND_SHARE: &str = "MpcBlindShare";
    pub const S: &str = "MpcS";
    pub const V: &str = "MpcV";
    /// Composed signature `R || s`.
    pub const SIGNATURE: &str = "MpcSignature";

    /// Dispute evidence from a share step, one entry per accusation.
    pub const DISPUTES: &str = "MpcDisputes";
    pub const SLASH_COUNT: &str = "MpcSlashCount";
    pub const SLASH_PROOF: &str = "MpcSlashProof";
}

/// `base_i`, the key of the `i`th member of a batch.
pub fn indexed_key(base: &str, ordinal: usize) -> String {
    format!("{base}_{ordinal}")
}

#[derive(Debug, Default, Clone)]
pub struct ResultStore {
    scalars: HashMap<String, Vec<Share>>,
    bytes: HashMap<String, Vec<u8>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scalars(&mut self, key: impl Into<String>, values: Vec<Share>) {
        self.scalars.insert(key.into(), values);
    }

    pub fn set_scalar(&mut self, key: impl Into<String>, value: Share) {
        self.set_scalars(key, vec![value]);
    }

    pub fn get_scalars(&self, key: &str) -> Result<&[Share]> {
        self.scalars
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| MpcError::KeyNotFound(key.to_string()))
    }

    /// First element of a scalar sequence.
    pub fn get_scalar(&self, key: &str) -> Result<&Share> {
        self.get_scalars(key)?
            .first()
            .ok_or_else(|| MpcError::KeyNotFound(key.to_string()))
    }

    pub fn has_scalars(&self, key: &str) -> bool {
        self.scalars.contains_key(key)
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.bytes.insert(key.into(), value);
    }

    pub fn get_bytes(&self, key: &str) -> Result<&[u8]> {
        self.bytes
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| MpcError::KeyNotFound(key.to_string()))
    }

    pub fn has_bytes(&self, key: &str) -> bool {
        self.bytes.contains_key(key)
    }

    pub fn set_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.set_bytes(key, serde_json::to_vec(value)?);
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        Ok(serde_json::from_slice(self.get_bytes(key)?)?)
    }

    /// Like `get_json`, but an unset key yields the default value.
    pub fn get_json_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        if self.has_bytes(key) {
            self.get_json(key)
        } else {
            Ok(T::default())
        }
    }
}
