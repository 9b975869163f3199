//! Closing rounds: every peer must report the same artifact.
use std::collections::BTreeMap;

use tracing::{error, warn};

use super::{RunInfo, StepBase, StepLogic};
use crate::crypto::{decode_point, verify_signature, Share};
use crate::error::{MpcError, Result};
use crate::message::{NodeId, StepMessage};
use crate::store::{indexed_key, keys, ResultStore};

/// Broadcast the GPK and check every peer computed the same bytes.
pub struct AckGpkStep {
    base: StepBase,
    gpk: Vec<u8>,
    reported: BTreeMap<NodeId, Vec<u8>>,
}

impl AckGpkStep {
    pub fn new(total: usize) -> Self {
        AckGpkStep {
            base: StepBase::new(total),
            gpk: vec![],
            reported: BTreeMap::new(),
        }
    }
}

impl StepLogic for AckGpkStep {
    fn name(&self) -> &'static str {
        "ack-gpk"
    }

    fn init(&mut self, _info: &RunInfo, store: &ResultStore) -> Result<()> {
        self.gpk = store.get_bytes(keys::GPK)?.to_vec();
        Ok(())
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        Ok(vec![
            StepMessage::mpc(info.self_id.clone(), None).with_bytes(vec![self.gpk.clone()])
        ])
    }

    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool {
        if !self.base.admits(info, &message.from) || message.bytes.len() != 1 {
            return false;
        }
        self.reported
            .insert(message.from.clone(), message.bytes[0].clone());
        self.base.record(&message.from);
        true
    }

    fn finish(&mut self, info: &RunInfo, _store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())?;
        for peer in &info.peers {
            match self.reported.get(&peer.node_id) {
                Some(gpk) if *gpk == self.gpk => {}
                Some(_) => {
                    error!(run_id = info.run_id, peer = %peer.node_id, "peer reported a different gpk");
                    return Err(MpcError::InvalidMpcAddr);
                }
                None => {
                    error!(run_id = info.run_id, peer = %peer.node_id, "peer never reported its gpk");
                    return Err(MpcError::InvalidMpcAddr);
                }
            }
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}

/// Broadcast `(R, s)` per ordinal, check agreement and verify the signatures.
pub struct AckRsStep {
    base: StepBase,
    count: usize,
    r: Vec<Vec<u8>>,
    s: Vec<Share>,
    reported: BTreeMap<NodeId, (Vec<Vec<u8>>, Vec<Share>)>,
}

impl AckRsStep {
    pub fn new(count: usize, total: usize) -> Self {
        AckRsStep {
            base: StepBase::new(total),
            count,
            r: vec![],
            s: vec![],
            reported: BTreeMap::new(),
        }
    }
}

impl StepLogic for AckRsStep {
    fn name(&self) -> &'static str {
        "ack-rs"
    }

    fn init(&mut self, _info: &RunInfo, store: &ResultStore) -> Result<()> {
        self.r = (0..self.count)
            .map(|ordinal| Ok(store.get_bytes(&indexed_key(keys::R, ordinal))?.to_vec()))
            .collect::<Result<_>>()?;
        self.s = (0..self.count)
            .map(|ordinal| Ok(store.get_scalar(&indexed_key(keys::S, ordinal))?.clone()))
            .collect::<Result<_>>()?;
        store.get_bytes(keys::GPK)?;
        store.get_bytes(keys::MESSAGE)?;
        Ok(())
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        Ok(vec![StepMessage::mpc(info.self_id.clone(), None)
            .with_bytes(self.r.clone())
            .with_data(self.s.clone())])
    }

    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool {
        if !self.base.admits(info, &message.from) {
            return false;
        }
        if message.bytes.len() != self.count || message.data.len() != self.count {
            warn!(run_id = info.run_id, peer = %message.from, "malformed R/S acknowledgement");
            return false;
        }
        self.reported.insert(
            message.from.clone(),
            (message.bytes.clone(), message.data.clone()),
        );
        self.base.record(&message.from);
        true
    }

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())?;
        for peer in &info.peers {
            let (r, s) = self
                .reported
                .get(&peer.node_id)
                .ok_or(MpcError::InvalidMpcR)?;
            if *r != self.r {
                error!(run_id = info.run_id, peer = %peer.node_id, "peer reported a different R");
                return Err(MpcError::InvalidMpcR);
            }
            if *s != self.s {
                error!(run_id = info.run_id, peer = %peer.node_id, "peer reported a different s");
                return Err(MpcError::InvalidMpcS);
            }
        }

        let gpk = decode_point(store.get_bytes(keys::GPK)?)?;
        let message = store.get_bytes(keys::MESSAGE)?;
        for (r, s) in self.r.iter().zip(&self.s) {
            if !verify_signature(&gpk, &decode_point(r)?, s, message) {
                error!(run_id = info.run_id, "threshold signature does not verify");
                return Err(MpcError::VerifyFailed);
            }
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encode_share_point, public_image};
    use crate::message::ProtocolKind;
    use crate::step::tests::test_run;
    use secp256kfun::Scalar;

    #[test]
    fn gpk_disagreement_is_invalid_addr() {
        let infos = test_run(ProtocolKind::KeyGen);
        let gpk = encode_share_point(&public_image(&Scalar::from(5u32))).to_vec();
        let mut store = ResultStore::new();
        store.set_bytes(keys::GPK, gpk.clone());

        let mut step = AckGpkStep::new(4);
        step.init(&infos[0], &store).unwrap();
        for (i, info) in infos.iter().enumerate() {
            let reported = if i == 3 { vec![2u8; 33] } else { gpk.clone() };
            let message = StepMessage::mpc(info.self_id.clone(), None).with_bytes(vec![reported]);
            assert!(step.handle_message(&infos[0], &message));
        }
        assert!(step.is_complete());
        assert_eq!(
            step.finish(&infos[0], &mut store),
            Err(MpcError::InvalidMpcAddr)
        );
    }

    #[test]
    fn unverifiable_signature_is_rejected() {
        let infos = test_run(ProtocolKind::Sign);
        let mut store = ResultStore::new();
        store.set_bytes(
            keys::GPK,
            encode_share_point(&public_image(&Scalar::from(5u32))).to_vec(),
        );
        store.set_bytes(keys::MESSAGE, b"transfer 10".to_vec());
        store.set_bytes(
            indexed_key(keys::R, 0),
            encode_share_point(&public_image(&Scalar::from(7u32))).to_vec(),
        );
        store.set_scalar(indexed_key(keys::S, 0), Scalar::from(9u32));

        let mut steps: Vec<_> = infos.iter().map(|_| AckRsStep::new(1, 4)).collect();
        let mut outbox = vec![];
        for (info, step) in infos.iter().zip(steps.iter_mut()) {
            step.init(info, &store).unwrap();
            outbox.extend(step.create_messages(info).unwrap());
        }
        for message in &outbox {
            assert!(steps[1].handle_message(&infos[1], message));
        }
        assert_eq!(
            steps[1].finish(&infos[1], &mut store),
            Err(MpcError::VerifyFailed)
        );

        outbox[2].data[0] = Scalar::from(10u32);
        for message in &outbox {
            assert!(steps[0].handle_message(&infos[0], message));
        }
        assert_eq!(
            steps[0].finish(&infos[0], &mut store),
            Err(MpcError::InvalidMpcS)
        );
    }
}
