//! Joint random (and zero) secret sharing.
//!
//! Every peer samples one polynomial per ordinal, sends each run peer its
//! evaluation at that peer's seed, and sums what it receives. A share is sent with
//! the sender's commitment to its polynomial and a provenance signature, so a
//! receiver holding an inconsistent share can later prove who was at fault.
use std::collections::BTreeMap;

use rand::thread_rng;
use secp256kfun::{s, Scalar};
use tracing::{debug, warn};

use super::{RunInfo, StepBase, StepLogic};
use crate::crypto::{encode_share_point, public_image, sha256, Commitment, Polynomial, Share};
use crate::error::{MpcError, Result};
use crate::message::StepMessage;
use crate::slash::{Dispute, SharePurpose};
use crate::store::{keys, ResultStore};

/// Digest a share's provenance signature is made over.
pub fn share_digest(
    run_id: u64,
    purpose: SharePurpose,
    ordinal: usize,
    receiver: u16,
    share: &Share,
    commitment: &[u8],
) -> [u8; 32] {
    sha256(&[
        &run_id.to_be_bytes(),
        purpose.tag(),
        &(ordinal as u64).to_be_bytes(),
        &receiver.to_be_bytes(),
        &share.to_bytes(),
        commitment,
    ])
}

pub struct ShareStep {
    base: StepBase,
    purpose: SharePurpose,
    count: usize,
    polynomials: Vec<Polynomial>,
    /// Received shares per ordinal, keyed by sender seed.
    received: BTreeMap<u64, Vec<Share>>,
    disputes: Vec<Dispute>,
}

impl ShareStep {
    pub fn new(purpose: SharePurpose, count: usize, total: usize) -> Self {
        ShareStep {
            base: StepBase::new(total),
            purpose,
            count,
            polynomials: vec![],
            received: BTreeMap::new(),
            disputes: vec![],
        }
    }

    pub fn disputes(&self) -> &[Dispute] {
        &self.disputes
    }

    fn output_key(&self) -> &'static str {
        match self.purpose {
            SharePurpose::KeyShare => keys::PRIVATE_SHARE,
            SharePurpose::Nonce => keys::NONCE_SHARE,
            SharePurpose::Blind => keys::BLIND_SHARE,
        }
    }

    /// Record a sender's shares; a second write for the same seed is refused.
    pub fn insert_shares(&mut self, seed: u64, shares: Vec<Share>) -> Result<()> {
        if self.received.contains_key(&seed) {
            return Err(MpcError::DuplicateShare(seed));
        }
        self.received.insert(seed, shares);
        Ok(())
    }

    /// Check one ordinal's share; `Ok(None)` when it is consistent.
    fn check_share(
        &self,
        info: &RunInfo,
        message: &StepMessage,
        ordinal: usize,
    ) -> Result<Option<Dispute>> {
        let share = &message.data[ordinal];
        let commitment_bytes = &message.bytes[2 * ordinal];
        let signature = &message.bytes[2 * ordinal + 1];
        let commitment = Commitment::from_bytes(commitment_bytes)?;
        if commitment.points().len() != info.threshold() {
            return Err(MpcError::InvalidEncoding(format!(
                "commitment of degree {} from {}",
                commitment.points().len().saturating_sub(1),
                message.from
            )));
        }
        if self.purpose == SharePurpose::Blind && commitment.points()[0].non_zero().is_some() {
            return Err(MpcError::InvalidEncoding(format!(
                "zero sharing from {} has a non-zero constant term",
                message.from
            )));
        }

        let sender = info.group.member_by_id(&message.from)?;
        let receiver = info.self_index()?;
        let digest = share_digest(
            info.run_id,
            self.purpose,
            ordinal,
            receiver,
            share,
            commitment_bytes,
        );
        let signed = info
            .provenance
            .verify(&sender.public_key, &digest, signature);
        let consistent = commitment.verify_share(info.self_seed()?, share)?;
        if signed && consistent {
            return Ok(None);
        }
        Ok(Some(Dispute {
            purpose: self.purpose,
            accused: sender.index,
            accuser: receiver,
            ordinal,
            commitment: commitment_bytes.clone(),
            share: share.clone(),
            signature: signature.clone(),
        }))
    }

    fn accept(&mut self, info: &RunInfo, message: &StepMessage) -> Result<()> {
        if message.data.len() != self.count || message.bytes.len() != 2 * self.count {
            return Err(MpcError::InvalidEncoding(format!(
                "{} shares and {} blobs from {}",
                message.data.len(),
                message.bytes.len(),
                message.from
            )));
        }
        let seed = info.seed_of(&message.from)?;
        let mut disputes = vec![];
        for ordinal in 0..self.count {
            if let Some(dispute) = self.check_share(info, message, ordinal)? {
                warn!(
                    run_id = info.run_id,
                    peer = %message.from,
                    ordinal,
                    purpose = ?self.purpose,
                    "share does not match its commitment"
                );
                disputes.push(dispute);
            }
        }
        self.insert_shares(seed, message.data.clone())?;
        self.disputes.extend(disputes);
        Ok(())
    }
}

impl StepLogic for ShareStep {
    fn name(&self) -> &'static str {
        match self.purpose {
            SharePurpose::KeyShare => "key-share",
            SharePurpose::Nonce => "nonce-share",
            SharePurpose::Blind => "blind-share",
        }
    }

    fn init(&mut self, info: &RunInfo, _store: &ResultStore) -> Result<()> {
        let degree = info.threshold() - 1;
        let mut rng = thread_rng();
        self.polynomials = (0..self.count)
            .map(|_| match self.purpose {
                SharePurpose::Blind => Polynomial::random_zero(degree, &mut rng),
                _ => Polynomial::random(degree, &mut rng),
            })
            .collect();
        Ok(())
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        let commitments: Vec<Vec<u8>> = self
            .polynomials
            .iter()
            .map(|poly| poly.commitment().to_bytes())
            .collect();
        let mut messages = Vec::with_capacity(info.peers.len());
        for peer in &info.peers {
            let receiver = info.index_of(&peer.node_id)?;
            let mut data = Vec::with_capacity(self.count);
            let mut bytes = Vec::with_capacity(2 * self.count);
            for (ordinal, (poly, commitment)) in self.polynomials.iter().zip(&commitments).enumerate() {
                let share = poly.evaluate_at_seed(peer.seed)?;
                let digest = share_digest(
                    info.run_id,
                    self.purpose,
                    ordinal,
                    receiver,
                    &share,
                    commitment,
                );
                bytes.push(commitment.clone());
                bytes.push(info.provenance.sign(&info.self_secret, &digest).to_vec());
                data.push(share);
            }
            messages.push(
                StepMessage::mpc(info.self_id.clone(), Some(peer.node_id.clone()))
                    .with_data(data)
                    .with_bytes(bytes),
            );
        }
        Ok(messages)
    }

    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool {
        if !self.base.admits(info, &message.from) {
            return false;
        }
        match self.accept(info, message) {
            Ok(()) => {
                debug!(run_id = info.run_id, peer = %message.from, step = self.name(), "share accepted");
                self.base.record(&message.from);
                true
            }
            Err(err) => {
                warn!(run_id = info.run_id, peer = %message.from, step = self.name(), %err, "share discarded");
                false
            }
        }
    }

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())?;
        let mut aggregates = vec![Scalar::zero(); self.count];
        for shares in self.received.values() {
            aggregates = aggregates
                .iter()
                .zip(shares)
                .map(|(aggregate, share)| s!(aggregate + share))
                .collect();
        }
        if self.purpose == SharePurpose::KeyShare {
            let public_share = public_image(&aggregates[0]);
            store.set_bytes(
                keys::PUBLIC_SHARE,
                encode_share_point(&public_share).to_vec(),
            );
        }
        store.set_scalars(self.output_key(), aggregates);

        if !self.disputes.is_empty() {
            let mut disputes: Vec<Dispute> = store.get_json_or_default(keys::DISPUTES)?;
            disputes.extend(self.disputes.iter().cloned());
            store.set_json(keys::DISPUTES, &disputes)?;
        }
        debug!(
            run_id = info.run_id,
            step = self.name(),
            senders = self.received.len(),
            disputes = self.disputes.len(),
            "shares aggregated"
        );
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::lagrange_scalars;
    use crate::message::ProtocolKind;
    use crate::step::tests::test_run;

    fn run_sharing(purpose: SharePurpose, count: usize) -> (Vec<RunInfo>, Vec<ShareStep>, Vec<StepMessage>) {
        let infos = test_run(ProtocolKind::Sign);
        let mut steps: Vec<_> = infos
            .iter()
            .map(|info| {
                let mut step = ShareStep::new(purpose, count, infos.len());
                step.init(info, &ResultStore::new()).unwrap();
                step
            })
            .collect();
        let mut outbox = vec![];
        for (info, step) in infos.iter().zip(steps.iter_mut()) {
            outbox.extend(step.create_messages(info).unwrap());
        }
        (infos, steps, outbox)
    }

    fn deliver(infos: &[RunInfo], steps: &mut [ShareStep], outbox: &[StepMessage]) {
        for message in outbox {
            let to = message.to.as_ref().unwrap();
            let i = infos.iter().position(|info| &info.self_id == to).unwrap();
            assert!(steps[i].handle_message(&infos[i], message));
        }
    }

    #[test]
    fn aggregates_interpolate_to_a_common_secret() {
        let (infos, mut steps, outbox) = run_sharing(SharePurpose::Nonce, 2);
        deliver(&infos, &mut steps, &outbox);

        let mut stores = vec![];
        for (info, step) in infos.iter().zip(steps.iter_mut()) {
            assert!(step.is_complete());
            assert!(step.disputes().is_empty());
            let mut store = ResultStore::new();
            step.finish(info, &mut store).unwrap();
            stores.push(store);
        }
        for ordinal in 0..2 {
            let shares: Vec<_> = infos
                .iter()
                .zip(&stores)
                .map(|(info, store)| {
                    (
                        info.self_seed().unwrap(),
                        store.get_scalars(keys::NONCE_SHARE).unwrap()[ordinal].clone(),
                    )
                })
                .collect();
            let all = lagrange_scalars(&shares).unwrap();
            let subset = lagrange_scalars(&shares[1..]).unwrap();
            assert_eq!(all, subset);
        }
    }

    #[test]
    fn zero_sharing_interpolates_to_zero() {
        let (infos, mut steps, outbox) = run_sharing(SharePurpose::Blind, 1);
        deliver(&infos, &mut steps, &outbox);
        let mut shares = vec![];
        for (info, step) in infos.iter().zip(steps.iter_mut()) {
            let mut store = ResultStore::new();
            step.finish(info, &mut store).unwrap();
            shares.push((
                info.self_seed().unwrap(),
                store.get_scalar(keys::BLIND_SHARE).unwrap().clone(),
            ));
        }
        assert_eq!(
            public_image(&lagrange_scalars(&shares[..3]).unwrap()),
            public_image(&Scalar::zero())
        );
    }

    #[test]
    fn duplicate_sender_does_not_touch_the_aggregate() {
        let (infos, mut steps, outbox) = run_sharing(SharePurpose::KeyShare, 1);
        let to_second: Vec<_> = outbox
            .iter()
            .filter(|m| m.to.as_ref() == Some(&infos[1].self_id))
            .cloned()
            .collect();
        assert!(steps[1].handle_message(&infos[1], &to_second[0]));
        assert!(!steps[1].handle_message(&infos[1], &to_second[0]));

        let mut forged = to_second[0].clone();
        forged.data[0] = Scalar::from(1u32);
        assert!(!steps[1].handle_message(&infos[1], &forged));
        assert_eq!(
            steps[1].insert_shares(infos[0].self_seed().unwrap(), vec![Scalar::zero()]),
            Err(MpcError::DuplicateShare(infos[0].self_seed().unwrap()))
        );
    }

    #[test]
    fn inconsistent_share_becomes_a_dispute() {
        let (infos, mut steps, mut outbox) = run_sharing(SharePurpose::Nonce, 1);
        let tampered = outbox
            .iter_mut()
            .find(|m| m.from == infos[3].self_id && m.to.as_ref() == Some(&infos[2].self_id))
            .unwrap();
        tampered.data[0] = Scalar::from(7u32);
        deliver(&infos, &mut steps, &outbox);

        assert_eq!(steps[2].disputes().len(), 1);
        let dispute = &steps[2].disputes()[0];
        assert_eq!(dispute.accused, 3);
        assert_eq!(dispute.accuser, 2);
        assert!(steps[0].disputes().is_empty());

        let mut store = ResultStore::new();
        steps[2].finish(&infos[2], &mut store).unwrap();
        let recorded: Vec<Dispute> = store.get_json(keys::DISPUTES).unwrap();
        assert_eq!(&recorded, steps[2].disputes());
        assert_eq!(steps[2].finish(&infos[2], &mut store), Err(MpcError::StepFinished("nonce-share".into())));
    }
}
