//! Publish the public image of a share and interpolate the group's point.
//!
//! Used twice: on the key share to obtain the GPK, and on the nonce shares to
//! obtain `R`. Senders are partitioned into OK (valid provenance), KO (bad
//! provenance or encoding) and NO (never heard from).
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::{RunInfo, StepBase, StepLogic};
use crate::crypto::{
    decode_point, encode_share_point, lagrange_points, public_image, sha256, SharePoint,
};
use crate::error::{MpcError, Result};
use crate::group::difference;
use crate::message::StepMessage;
use crate::slash::SharePurpose;
use crate::store::{indexed_key, keys, ResultStore};

/// Digest a published point's provenance signature is made over.
pub fn point_digest(run_id: u64, purpose: SharePurpose, ordinal: usize, point: &[u8]) -> [u8; 32] {
    sha256(&[
        &run_id.to_be_bytes(),
        b"point",
        purpose.tag(),
        &(ordinal as u64).to_be_bytes(),
        point,
    ])
}

pub struct PointStep {
    base: StepBase,
    purpose: SharePurpose,
    count: usize,
    local: Vec<SharePoint>,
    accepted: BTreeMap<u16, Vec<SharePoint>>,
    rejected: BTreeSet<u16>,
}

impl PointStep {
    pub fn new(purpose: SharePurpose, count: usize, total: usize) -> Self {
        PointStep {
            base: StepBase::new(total),
            purpose,
            count,
            local: vec![],
            accepted: BTreeMap::new(),
            rejected: BTreeSet::new(),
        }
    }

    fn keys(&self) -> PointKeys {
        match self.purpose {
            SharePurpose::Nonce => PointKeys {
                input: keys::NONCE_SHARE,
                output: keys::R,
                per_peer: keys::NONCE_POINT,
                ok: keys::R_OK,
                ko: keys::R_KO,
                no: keys::R_NO,
            },
            _ => PointKeys {
                input: keys::PRIVATE_SHARE,
                output: keys::GPK,
                per_peer: keys::PUBLIC_SHARE,
                ok: keys::GPK_OK,
                ko: keys::GPK_KO,
                no: keys::GPK_NO,
            },
        }
    }

    fn decode(&self, info: &RunInfo, message: &StepMessage) -> Result<Vec<SharePoint>> {
        if message.bytes.len() != 2 * self.count {
            return Err(MpcError::InvalidEncoding(format!(
                "{} blobs from {}",
                message.bytes.len(),
                message.from
            )));
        }
        let sender = info.group.member_by_id(&message.from)?;
        let mut points = Vec::with_capacity(self.count);
        for ordinal in 0..self.count {
            let point_bytes = &message.bytes[2 * ordinal];
            let digest = point_digest(info.run_id, self.purpose, ordinal, point_bytes);
            if !info
                .provenance
                .verify(&sender.public_key, &digest, &message.bytes[2 * ordinal + 1])
            {
                return Err(MpcError::InvalidEncoding(format!(
                    "bad point signature from {}",
                    message.from
                )));
            }
            points.push(decode_point(point_bytes)?);
        }
        Ok(points)
    }
}

struct PointKeys {
    input: &'static str,
    output: &'static str,
    per_peer: &'static str,
    ok: &'static str,
    ko: &'static str,
    no: &'static str,
}

impl StepLogic for PointStep {
    fn name(&self) -> &'static str {
        match self.purpose {
            SharePurpose::Nonce => "nonce-point",
            _ => "gpk-point",
        }
    }

    fn init(&mut self, _info: &RunInfo, store: &ResultStore) -> Result<()> {
        let shares = store.get_scalars(self.keys().input)?;
        if shares.len() < self.count {
            return Err(MpcError::KeyNotFound(indexed_key(self.keys().input, shares.len())));
        }
        self.local = shares[..self.count].iter().map(public_image).collect();
        Ok(())
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        let mut bytes = Vec::with_capacity(2 * self.count);
        for (ordinal, point) in self.local.iter().enumerate() {
            let encoded = encode_share_point(point);
            let digest = point_digest(info.run_id, self.purpose, ordinal, &encoded);
            bytes.push(encoded.to_vec());
            bytes.push(info.provenance.sign(&info.self_secret, &digest).to_vec());
        }
        Ok(vec![
            StepMessage::mpc(info.self_id.clone(), None).with_bytes(bytes)
        ])
    }

    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool {
        if !self.base.admits(info, &message.from) {
            return false;
        }
        let index = match info.index_of(&message.from) {
            Ok(index) => index,
            Err(_) => return false,
        };
        match self.decode(info, message) {
            Ok(points) => {
                debug!(run_id = info.run_id, peer = %message.from, step = self.name(), "point accepted");
                self.accepted.insert(index, points);
            }
            Err(err) => {
                warn!(run_id = info.run_id, peer = %message.from, step = self.name(), %err, "point rejected");
                self.rejected.insert(index);
            }
        }
        self.base.record(&message.from);
        true
    }

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())?;
        let keys = self.keys();
        let all = info.peer_indexes()?;
        let ok: Vec<u16> = self.accepted.keys().copied().collect();
        let ko: Vec<u16> = self.rejected.iter().copied().collect();
        let heard: Vec<u16> = ok.iter().chain(&ko).copied().collect();
        let no = difference(&all, &heard);
        store.set_json(keys.ok, &ok)?;
        store.set_json(keys.ko, &ko)?;
        store.set_json(keys.no, &no)?;

        if ok.len() < info.threshold() {
            return Err(MpcError::InsufficientShares {
                have: ok.len(),
                need: info.threshold(),
            });
        }

        for ordinal in 0..self.count {
            let mut shares = Vec::with_capacity(ok.len());
            for (index, points) in &self.accepted {
                shares.push((info.seed_of_index(*index)?, points[ordinal]));
                let per_peer = match self.purpose {
                    SharePurpose::Nonce => indexed_key(&indexed_key(keys.per_peer, ordinal), *index as usize),
                    _ => indexed_key(keys.per_peer, *index as usize),
                };
                store.set_bytes(per_peer, encode_share_point(&points[ordinal]).to_vec());
            }
            let combined = lagrange_points(&shares)?;
            if combined.non_zero().is_none() {
                return Err(MpcError::PointZero);
            }
            let encoded = encode_share_point(&combined).to_vec();
            match self.purpose {
                SharePurpose::Nonce => store.set_bytes(indexed_key(keys.output, ordinal), encoded),
                _ => {
                    info!(run_id = info.run_id, gpk = %hex::encode(&encoded), "group public key computed");
                    store.set_bytes(keys.output, encoded)
                }
            }
        }
        debug!(run_id = info.run_id, step = self.name(), ?ok, ?ko, ?no, "points combined");
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decode_share_point, lagrange_scalars, Share};
    use crate::message::ProtocolKind;
    use crate::step::tests::test_run;
    use secp256kfun::proptest::test_runner::{RngAlgorithm, TestRng};
    use secp256kfun::Scalar;

    fn sign_point(info: &RunInfo, ordinal: usize, point: &[u8]) -> Vec<u8> {
        let digest = point_digest(info.run_id, SharePurpose::KeyShare, ordinal, point);
        info.provenance.sign(&info.self_secret, &digest).to_vec()
    }

    fn key_shares(n: usize) -> Vec<Share> {
        let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
        (0..n).map(|_| Scalar::random(&mut rng).mark_zero()).collect()
    }

    #[test]
    fn forged_point_lands_in_ko() {
        let infos = test_run(ProtocolKind::KeyGen);
        let shares = key_shares(4);
        let mut steps = vec![];
        let mut outbox = vec![];
        for (info, share) in infos.iter().zip(&shares) {
            let mut store = ResultStore::new();
            store.set_scalar(keys::PRIVATE_SHARE, share.clone());
            let mut step = PointStep::new(SharePurpose::KeyShare, 1, 4);
            step.init(info, &store).unwrap();
            outbox.extend(step.create_messages(info).unwrap());
            steps.push(step);
        }
        // node3's point re-signed by node2
        let forged_sig = sign_point(&infos[2], 0, &outbox[3].bytes[0]);
        outbox[3].bytes[1] = forged_sig;
        for message in &outbox {
            assert!(steps[0].handle_message(&infos[0], message));
        }
        assert!(steps[0].is_complete());

        let mut store = ResultStore::new();
        steps[0].finish(&infos[0], &mut store).unwrap();
        let ok: Vec<u16> = store.get_json(keys::GPK_OK).unwrap();
        let ko: Vec<u16> = store.get_json(keys::GPK_KO).unwrap();
        let no: Vec<u16> = store.get_json(keys::GPK_NO).unwrap();
        assert_eq!(ok, vec![0, 1, 2]);
        assert_eq!(ko, vec![3]);
        assert!(no.is_empty());

        let seeds: Vec<_> = infos.iter().map(|i| i.self_seed().unwrap()).collect();
        let expected = lagrange_scalars(
            &seeds[..3]
                .iter()
                .copied()
                .zip(shares[..3].iter().cloned())
                .collect::<Vec<_>>(),
        )
        .unwrap();
        assert_eq!(
            decode_share_point(store.get_bytes(keys::GPK).unwrap()).unwrap(),
            public_image(&expected)
        );
    }

    #[test]
    fn too_few_points_is_insufficient() {
        let infos = test_run(ProtocolKind::KeyGen);
        let shares = key_shares(4);
        let mut steps = vec![];
        let mut outbox = vec![];
        for (info, share) in infos.iter().zip(&shares) {
            let mut store = ResultStore::new();
            store.set_scalar(keys::PRIVATE_SHARE, share.clone());
            let mut step = PointStep::new(SharePurpose::KeyShare, 1, 4);
            step.init(info, &store).unwrap();
            outbox.extend(step.create_messages(info).unwrap());
            steps.push(step);
        }
        for message in &mut outbox[2..] {
            message.bytes[0] = vec![9u8; 33];
        }
        for message in &outbox {
            steps[1].handle_message(&infos[1], message);
        }
        let mut store = ResultStore::new();
        assert_eq!(
            steps[1].finish(&infos[1], &mut store),
            Err(MpcError::InsufficientShares { have: 2, need: 3 })
        );
        let ko: Vec<u16> = store.get_json(keys::GPK_KO).unwrap();
        assert_eq!(ko, vec![2, 3]);
    }

    #[test]
    fn init_requires_the_key_share() {
        let infos = test_run(ProtocolKind::Sign);
        let mut step = PointStep::new(SharePurpose::Nonce, 2, 4);
        assert!(matches!(
            step.init(&infos[0], &ResultStore::new()),
            Err(MpcError::KeyNotFound(_))
        ));
    }
}
