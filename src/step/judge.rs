//! Rule on share disputes raised during the sharing rounds.
//!
//! Every peer announces how many disputes it holds and broadcasts each one. Every
//! peer judges every dispute on its own: a correctly signed share that fails the
//! sender's commitment convicts the sender, anything else convicts the accuser.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use super::{share_digest, RunInfo, StepBase, StepLogic};
use crate::crypto::Commitment;
use crate::error::{MpcError, Result};
use crate::message::{NodeId, ProtocolKind, StepMessage};
use crate::slash::{Dispute, SlashProof};
use crate::store::{indexed_key, keys, ResultStore};

/// `true` when the accused sender is at fault.
pub fn judge_dispute(info: &RunInfo, dispute: &Dispute) -> Result<bool> {
    let sender = info.group.member(dispute.accused)?;
    let digest = share_digest(
        info.run_id,
        dispute.purpose,
        dispute.ordinal,
        dispute.accuser,
        &dispute.share,
        &dispute.commitment,
    );
    if !info
        .provenance
        .verify(&sender.public_key, &digest, &dispute.signature)
    {
        return Ok(false);
    }
    let commitment = match Commitment::from_bytes(&dispute.commitment) {
        Ok(commitment) => commitment,
        Err(_) => return Ok(false),
    };
    let seed = info.seed_of_index(dispute.accuser)?;
    Ok(!commitment.verify_share(seed, &dispute.share)?)
}

fn encode_count(count: usize) -> Vec<u8> {
    (count as u64).to_be_bytes().to_vec()
}

fn decode_count(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MpcError::InvalidEncoding("dispute count".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

pub struct JudgeStep {
    base: StepBase,
    disputes: Vec<Dispute>,
    peers: Vec<NodeId>,
    announced: BTreeMap<NodeId, u64>,
    /// Distinct dispute payloads seen per announcing peer.
    seen: BTreeMap<NodeId, BTreeSet<Vec<u8>>>,
    verdicts: Vec<(Dispute, bool)>,
}

impl JudgeStep {
    pub fn new() -> Self {
        JudgeStep {
            base: StepBase::new(0),
            disputes: vec![],
            peers: vec![],
            announced: BTreeMap::new(),
            seen: BTreeMap::new(),
            verdicts: vec![],
        }
    }

    fn accept(&mut self, info: &RunInfo, message: &StepMessage) -> Result<bool> {
        let count = decode_count(message.bytes.first().map(Vec::as_slice).unwrap_or_default())?;
        if let Some(previous) = self.announced.get(&message.from) {
            if *previous != count {
                return Err(MpcError::InvalidEncoding(format!(
                    "{} announced {previous} then {count} disputes",
                    message.from
                )));
            }
        }
        let payload = message.bytes.get(1).cloned().unwrap_or_default();
        if (count == 0) != payload.is_empty() {
            return Err(MpcError::InvalidEncoding("dispute count and payload disagree".into()));
        }
        let seen = self.seen.entry(message.from.clone()).or_default();
        if seen.contains(&payload) {
            return Ok(false);
        }
        if !payload.is_empty() {
            let dispute: Dispute = serde_json::from_slice(&payload)?;
            if dispute.accuser != info.index_of(&message.from)? {
                return Err(MpcError::InvalidEncoding(format!(
                    "{} relayed a dispute raised by {}",
                    message.from, dispute.accuser
                )));
            }
            let sender_at_fault = judge_dispute(info, &dispute)?;
            self.verdicts.push((dispute, sender_at_fault));
        }
        seen.insert(payload);
        self.announced.insert(message.from.clone(), count);
        Ok(true)
    }

    fn all_heard(&self) -> bool {
        self.peers.iter().all(|peer| {
            match (self.announced.get(peer), self.seen.get(peer)) {
                (Some(count), Some(seen)) => seen.len() as u64 >= (*count).max(1),
                _ => false,
            }
        })
    }
}

impl Default for JudgeStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepLogic for JudgeStep {
    fn name(&self) -> &'static str {
        "judge"
    }

    fn init(&mut self, info: &RunInfo, store: &ResultStore) -> Result<()> {
        self.peers = info.peers.iter().map(|p| p.node_id.clone()).collect();
        self.disputes = store.get_json_or_default(keys::DISPUTES)?;
        Ok(())
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        let count = encode_count(self.disputes.len());
        if self.disputes.is_empty() {
            return Ok(vec![
                StepMessage::mpc(info.self_id.clone(), None).with_bytes(vec![count])
            ]);
        }
        self.disputes
            .iter()
            .map(|dispute| {
                Ok(StepMessage::mpc(info.self_id.clone(), None)
                    .with_bytes(vec![count.clone(), serde_json::to_vec(dispute)?]))
            })
            .collect()
    }

    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool {
        if !self.base.admits(info, &message.from) {
            return false;
        }
        match self.accept(info, message) {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(run_id = info.run_id, peer = %message.from, %err, "judge message discarded");
                false
            }
        }
    }

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())?;
        let judge = info.self_index()?;
        self.verdicts.sort_by_key(|(d, _)| (d.accuser, d.accused, d.ordinal, d.purpose.tag()));
        let first_convicted = self.verdicts.first().map(|(dispute, sender_at_fault)| {
            if *sender_at_fault {
                dispute.accused
            } else {
                dispute.accuser
            }
        });
        for (count, (dispute, sender_at_fault)) in self.verdicts.drain(..).enumerate() {
            let proof = SlashProof {
                run_id: info.run_id,
                count: count as u64,
                group_id: info.group.id.clone(),
                judge,
                dispute,
                sender_at_fault,
            };
            warn!(
                run_id = info.run_id,
                convicted = proof.convicted(),
                sender_at_fault,
                "slash proof recorded"
            );
            store.set_json(indexed_key(keys::SLASH_PROOF, count), &proof)?;
            info.slash_ledger.append(proof);
            store.set_json(keys::SLASH_COUNT, &(count as u64 + 1))?;
        }
        debug!(run_id = info.run_id, "judge round closed");
        // a key built from a convicted peer's share is never adopted
        match first_convicted {
            Some(peer) if info.kind == ProtocolKind::KeyGen => Err(MpcError::Slashed(peer)),
            _ => Ok(()),
        }
    }

    fn is_complete(&self) -> bool {
        !self.peers.is_empty() && self.all_heard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Polynomial;
    use crate::slash::SharePurpose;
    use crate::step::tests::test_run;
    use secp256kfun::proptest::test_runner::{RngAlgorithm, TestRng};
    use secp256kfun::Scalar;

    /// A share from `sender` to `receiver`, signed by `signer`.
    fn dispute(
        infos: &[RunInfo],
        sender: usize,
        receiver: usize,
        signer: usize,
        tamper: bool,
    ) -> Dispute {
        let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
        let poly = Polynomial::random(2, &mut rng);
        let commitment = poly.commitment().to_bytes();
        let mut share = poly
            .evaluate_at_seed(infos[receiver].self_seed().unwrap())
            .unwrap();
        if tamper {
            share = Scalar::from(5u32);
        }
        let digest = share_digest(
            infos[0].run_id,
            SharePurpose::Nonce,
            0,
            receiver as u16,
            &share,
            &commitment,
        );
        Dispute {
            purpose: SharePurpose::Nonce,
            accused: sender as u16,
            accuser: receiver as u16,
            ordinal: 0,
            commitment,
            share,
            signature: infos[signer]
                .provenance
                .sign(&infos[signer].self_secret, &digest)
                .to_vec(),
        }
    }

    #[test]
    fn signed_bad_share_convicts_the_sender() {
        let infos = test_run(ProtocolKind::Sign);
        assert!(judge_dispute(&infos[0], &dispute(&infos, 3, 1, 3, true)).unwrap());
    }

    #[test]
    fn false_claims_convict_the_accuser() {
        let infos = test_run(ProtocolKind::Sign);
        // share matches the commitment
        assert!(!judge_dispute(&infos[0], &dispute(&infos, 3, 1, 3, false)).unwrap());
        // share was never signed by the accused
        assert!(!judge_dispute(&infos[0], &dispute(&infos, 3, 1, 1, true)).unwrap());
    }

    #[test]
    fn round_completes_on_announced_counts() {
        let infos = test_run(ProtocolKind::Sign);
        let mut store = ResultStore::new();
        store
            .set_json(keys::DISPUTES, &vec![dispute(&infos, 3, 1, 3, true)])
            .unwrap();

        let mut steps: Vec<JudgeStep> = infos.iter().map(|_| JudgeStep::new()).collect();
        let mut outbox = vec![];
        for (i, (info, step)) in infos.iter().zip(steps.iter_mut()).enumerate() {
            let own = if i == 1 { store.clone() } else { ResultStore::new() };
            step.init(info, &own).unwrap();
            outbox.extend(step.create_messages(info).unwrap());
        }
        assert_eq!(outbox.len(), 4);

        let judge = &mut steps[2];
        for message in &outbox {
            assert!(!judge.is_complete());
            assert!(judge.handle_message(&infos[2], message));
            assert!(!judge.handle_message(&infos[2], message));
        }
        assert!(judge.is_complete());

        let mut results = ResultStore::new();
        judge.finish(&infos[2], &mut results).unwrap();
        let proof: SlashProof = results
            .get_json(&indexed_key(keys::SLASH_PROOF, 0))
            .unwrap();
        assert!(proof.sender_at_fault);
        assert_eq!(proof.convicted(), 3);
        assert_eq!(proof.judge, 2);
        assert_eq!(infos[2].slash_ledger.proofs_for_run(99), vec![proof]);
    }

    #[test]
    fn relayed_disputes_are_refused() {
        let infos = test_run(ProtocolKind::Sign);
        let mut step = JudgeStep::new();
        step.init(&infos[0], &ResultStore::new()).unwrap();
        let relayed = StepMessage::mpc(infos[2].self_id.clone(), None).with_bytes(vec![
            encode_count(1),
            serde_json::to_vec(&dispute(&infos, 3, 1, 3, true)).unwrap(),
        ]);
        assert!(!step.handle_message(&infos[0], &relayed));
    }

    #[test]
    fn key_generation_aborts_on_a_conviction() {
        let infos = test_run(ProtocolKind::KeyGen);
        let mut store = ResultStore::new();
        store
            .set_json(keys::DISPUTES, &vec![dispute(&infos, 3, 1, 3, true)])
            .unwrap();

        let mut steps: Vec<JudgeStep> = infos.iter().map(|_| JudgeStep::new()).collect();
        let mut outbox = vec![];
        for (i, (info, step)) in infos.iter().zip(steps.iter_mut()).enumerate() {
            let own = if i == 1 { store.clone() } else { ResultStore::new() };
            step.init(info, &own).unwrap();
            outbox.extend(step.create_messages(info).unwrap());
        }
        let judge = &mut steps[0];
        for message in &outbox {
            judge.handle_message(&infos[0], message);
        }
        assert!(judge.is_complete());

        let mut results = ResultStore::new();
        assert_eq!(
            judge.finish(&infos[0], &mut results),
            Err(MpcError::Slashed(3))
        );
        // the proof is still recorded before the run aborts
        assert_eq!(infos[0].slash_ledger.proofs_for_run(99).len(), 1);
    }
}
