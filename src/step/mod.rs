//! Protocol rounds.
//!
//! A run is an ordered list of [`Step`]s. Each step is driven through the same life
//! cycle by the [`ProtocolContext`](crate::context::ProtocolContext):
//!
//! 1. `init` reads what earlier steps left in the [`ResultStore`].
//! 2. `create_messages` produces the round's outbound messages.
//! 3. `handle_message` is fed every inbound message stamped with this step's id
//!    until `is_complete` holds.
//! 4. `finish` writes the round's outputs back into the store.
use std::collections::HashSet;
use std::sync::Arc;

use secp256kfun::Scalar;

use crate::crypto::Provenance;
use crate::error::{MpcError, Result};
use crate::group::{x_value, GroupInfo};
use crate::message::{NodeId, PeerInfo, ProtocolKind, StepMessage};
use crate::slash::SlashLedger;
use crate::store::ResultStore;

mod ack;
mod calsign;
mod handshake;
mod judge;
mod lagrange;
mod point;
mod share;

pub use ack::{AckGpkStep, AckRsStep};
pub use calsign::CalSignStep;
pub use handshake::{AcknowledgeStep, GetReadyStep, ReadyStep, RequestStep};
pub use judge::{judge_dispute, JudgeStep};
pub use lagrange::LagrangeStep;
pub use point::{point_digest, PointStep};
pub use share::{share_digest, ShareStep};

/// Everything a step may know about the run it belongs to.
pub struct RunInfo {
    pub run_id: u64,
    pub kind: ProtocolKind,
    pub group: Arc<GroupInfo>,
    pub self_id: NodeId,
    pub self_secret: Scalar,
    pub provenance: Provenance,
    /// Run peers with their seeds.
    pub peers: Vec<PeerInfo>,
    pub leader: NodeId,
    pub slash_ledger: SlashLedger,
}

impl RunInfo {
    pub fn threshold(&self) -> usize {
        self.group.threshold
    }

    pub fn is_leader(&self) -> bool {
        self.self_id == self.leader
    }

    pub fn is_peer(&self, node_id: &NodeId) -> bool {
        self.peers.iter().any(|p| &p.node_id == node_id)
    }

    pub fn seed_of(&self, node_id: &NodeId) -> Result<u64> {
        x_value(&self.peers, node_id)
    }

    pub fn self_seed(&self) -> Result<u64> {
        self.seed_of(&self.self_id)
    }

    pub fn index_of(&self, node_id: &NodeId) -> Result<u16> {
        Ok(self.group.member_by_id(node_id)?.index)
    }

    pub fn self_index(&self) -> Result<u16> {
        self.index_of(&self.self_id)
    }

    /// Group indexes of the run peers.
    pub fn peer_indexes(&self) -> Result<Vec<u16>> {
        self.peers.iter().map(|p| self.index_of(&p.node_id)).collect()
    }

    pub fn seed_of_index(&self, index: u16) -> Result<u64> {
        let node_id = &self.group.member(index)?.node_id;
        self.seed_of(node_id)
    }

    pub fn others(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter().filter(move |p| p.node_id != self.self_id)
    }
}

/// Reply bookkeeping shared by every step.
#[derive(Debug)]
pub struct StepBase {
    expected: usize,
    received: HashSet<NodeId>,
    finished: bool,
}

impl StepBase {
    pub fn new(expected: usize) -> Self {
        StepBase {
            expected,
            received: HashSet::new(),
            finished: false,
        }
    }

    /// Whether a message from `from` may be handled at all.
    pub fn admits(&self, info: &RunInfo, from: &NodeId) -> bool {
        !self.finished && info.is_peer(from) && !self.received.contains(from)
    }

    pub fn record(&mut self, from: &NodeId) {
        self.received.insert(from.clone());
    }

    pub fn received(&self) -> usize {
        self.received.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() >= self.expected
    }

    /// Close the round; a second call is an error.
    pub fn close(&mut self, step: &str) -> Result<()> {
        if self.finished {
            return Err(MpcError::StepFinished(step.to_string()));
        }
        self.finished = true;
        Ok(())
    }
}

pub trait StepLogic {
    fn name(&self) -> &'static str;

    fn init(&mut self, info: &RunInfo, store: &ResultStore) -> Result<()>;

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>>;

    /// Returns `false` when the message was discarded.
    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool;

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()>;

    fn is_complete(&self) -> bool;
}

pub enum Step {
    Request(RequestStep),
    Acknowledge(AcknowledgeStep),
    Ready(ReadyStep),
    GetReady(GetReadyStep),
    Share(ShareStep),
    Point(PointStep),
    Judge(JudgeStep),
    Lagrange(LagrangeStep),
    CalSign(CalSignStep),
    AckGpk(AckGpkStep),
    AckRs(AckRsStep),
}

macro_rules! dispatch {
    ($self:ident, $step:ident => $body:expr) => {
        match $self {
            Step::Request($step) => $body,
            Step::Acknowledge($step) => $body,
            Step::Ready($step) => $body,
            Step::GetReady($step) => $body,
            Step::Share($step) => $body,
            Step::Point($step) => $body,
            Step::Judge($step) => $body,
            Step::Lagrange($step) => $body,
            Step::CalSign($step) => $body,
            Step::AckGpk($step) => $body,
            Step::AckRs($step) => $body,
        }
    };
}

impl StepLogic for Step {
    fn name(&self) -> &'static str {
        dispatch!(self, step => step.name())
    }

    fn init(&mut self, info: &RunInfo, store: &ResultStore) -> Result<()> {
        dispatch!(self, step => step.init(info, store))
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        dispatch!(self, step => step.create_messages(info))
    }

    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool {
        dispatch!(self, step => step.handle_message(info, message))
    }

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()> {
        dispatch!(self, step => step.finish(info, store))
    }

    fn is_complete(&self) -> bool {
        dispatch!(self, step => step.is_complete())
    }
}
