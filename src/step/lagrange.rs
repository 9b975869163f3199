//! Exchange signature shares and interpolate `s`.
use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::{RunInfo, StepBase, StepLogic};
use crate::crypto::{challenge, decode_point, lagrange_scalars, signature_share, Share};
use crate::error::{MpcError, Result};
use crate::message::StepMessage;
use crate::store::{indexed_key, keys, ResultStore};

pub struct LagrangeStep {
    base: StepBase,
    count: usize,
    local: Vec<Share>,
    /// Peers whose R share was accepted; `s` is interpolated over the same set.
    signers: Vec<u16>,
    received: BTreeMap<u16, Vec<Share>>,
}

impl LagrangeStep {
    pub fn new(count: usize, total: usize) -> Self {
        LagrangeStep {
            base: StepBase::new(total),
            count,
            local: vec![],
            signers: vec![],
            received: BTreeMap::new(),
        }
    }
}

impl StepLogic for LagrangeStep {
    fn name(&self) -> &'static str {
        "lagrange"
    }

    fn init(&mut self, _info: &RunInfo, store: &ResultStore) -> Result<()> {
        let private_share = store.get_scalar(keys::PRIVATE_SHARE)?;
        let nonces = store.get_scalars(keys::NONCE_SHARE)?;
        let blinds = store.get_scalars(keys::BLIND_SHARE)?;
        let message = store.get_bytes(keys::MESSAGE)?;
        if nonces.len() < self.count || blinds.len() < self.count {
            return Err(MpcError::KeyNotFound(indexed_key(
                keys::NONCE_SHARE,
                nonces.len().min(blinds.len()),
            )));
        }
        self.signers = store.get_json(keys::R_OK)?;
        self.local = (0..self.count)
            .map(|ordinal| {
                let r = decode_point(store.get_bytes(&indexed_key(keys::R, ordinal))?)?;
                let e = challenge(message, &r);
                Ok(signature_share(private_share, &nonces[ordinal], &e, &blinds[ordinal]))
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        Ok(vec![
            StepMessage::mpc(info.self_id.clone(), None).with_data(self.local.clone())
        ])
    }

    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool {
        if !self.base.admits(info, &message.from) {
            return false;
        }
        if message.data.len() != self.count {
            warn!(run_id = info.run_id, peer = %message.from, "wrong number of signature shares");
            return false;
        }
        let index = match info.index_of(&message.from) {
            Ok(index) => index,
            Err(_) => return false,
        };
        self.received.insert(index, message.data.clone());
        self.base.record(&message.from);
        true
    }

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())?;
        let have = self
            .signers
            .iter()
            .filter(|index| self.received.contains_key(index))
            .count();
        if have < self.signers.len() || have < info.threshold() {
            return Err(MpcError::InsufficientShares {
                have,
                need: self.signers.len().max(info.threshold()),
            });
        }
        for ordinal in 0..self.count {
            let mut shares = Vec::with_capacity(self.signers.len());
            for index in &self.signers {
                if let Some(values) = self.received.get(index) {
                    shares.push((info.seed_of_index(*index)?, values[ordinal].clone()));
                }
            }
            store.set_scalar(indexed_key(keys::S, ordinal), lagrange_scalars(&shares)?);
        }
        debug!(run_id = info.run_id, signers = ?self.signers, "signature shares combined");
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}
