//! Operator approval of payloads before a node joins a signing run.
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::crypto::sha256;
use crate::error::{MpcError, Result};

/// Key-value store of approved payloads, keyed by `sha256(payload)`.
pub trait ApprovalStore: Send + Sync {
    fn put(&self, key: [u8; 32], value: Vec<u8>) -> Result<()>;
    fn get(&self, key: &[u8; 32]) -> Result<Vec<u8>>;
    fn has(&self, key: &[u8; 32]) -> bool;
}

#[derive(Default)]
pub struct MemoryApprovalStore {
    entries: RwLock<HashMap<[u8; 32], Vec<u8>>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalStore for MemoryApprovalStore {
    fn put(&self, key: [u8; 32], value: Vec<u8>) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
        Ok(())
    }

    fn get(&self, key: &[u8; 32]) -> Result<Vec<u8>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| MpcError::Approval(format!("{} not approved", hex::encode(key))))
    }

    fn has(&self, key: &[u8; 32]) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

pub fn approval_key(payload: &[u8]) -> [u8; 32] {
    sha256(&[payload])
}

/// Mark `payload` as approved for signing.
pub fn add_valid_data(store: &dyn ApprovalStore, payload: &[u8]) -> Result<()> {
    let key = approval_key(payload);
    info!(key = %hex::encode(key), "payload approved");
    store.put(key, payload.to_vec())
}

/// Poll until `payload` is approved, or fail with `Timeout`.
pub async fn wait_for_approval(
    store: &dyn ApprovalStore,
    payload: &[u8],
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let key = approval_key(payload);
    let deadline = Instant::now() + timeout;
    loop {
        if store.has(&key) && store.get(&key)? == payload {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(MpcError::Timeout(format!(
                "approval of {} not found",
                hex::encode(key)
            )));
        }
        debug!(key = %hex::encode(key), "waiting for approval");
        sleep(poll).await;
    }
}
