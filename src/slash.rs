//! Evidence of misbehavior found while judging share disputes.
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::crypto::Share;

/// Which sharing a disputed share belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SharePurpose {
    KeyShare,
    Nonce,
    Blind,
}

impl SharePurpose {
    pub fn tag(self) -> &'static [u8] {
        match self {
            SharePurpose::KeyShare => b"key-share",
            SharePurpose::Nonce => b"nonce",
            SharePurpose::Blind => b"blind",
        }
    }
}

/// A receiver's claim that a share it got does not match the sender's commitment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub purpose: SharePurpose,
    /// Index of the peer that sent the share.
    pub accused: u16,
    pub accuser: u16,
    pub ordinal: usize,
    #[serde(with = "crate::message::hex_bytes")]
    pub commitment: Vec<u8>,
    pub share: Share,
    #[serde(with = "crate::message::hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlashProof {
    pub run_id: u64,
    /// Run-scoped verdict counter, starting at zero.
    pub count: u64,
    pub group_id: String,
    /// Who judged the dispute.
    pub judge: u16,
    pub dispute: Dispute,
    /// `true` convicts `dispute.accused`, `false` convicts `dispute.accuser`.
    pub sender_at_fault: bool,
}

impl SlashProof {
    pub fn convicted(&self) -> u16 {
        if self.sender_at_fault {
            self.dispute.accused
        } else {
            self.dispute.accuser
        }
    }
}

/// Append-only record of every verdict this node reached.
#[derive(Clone, Default, Debug)]
pub struct SlashLedger {
    proofs: Arc<Mutex<Vec<SlashProof>>>,
}

impl SlashLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, proof: SlashProof) {
        self.proofs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(proof);
    }

    pub fn proofs(&self) -> Vec<SlashProof> {
        self.proofs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn proofs_for_run(&self, run_id: u64) -> Vec<SlashProof> {
        self.proofs()
            .into_iter()
            .filter(|proof| proof.run_id == run_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.proofs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
