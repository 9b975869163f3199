//! Opening rounds: the leader's request and the ready handshake.
use tracing::debug;

use super::{RunInfo, StepBase, StepLogic};
use crate::error::Result;
use crate::message::{MessageCode, RunRequest, StepMessage};
use crate::store::{keys, ResultStore};

/// Leader: send the peer list and run request to every follower, then wait for
/// each of them to acknowledge.
pub struct RequestStep {
    base: StepBase,
    request: RunRequest,
}

impl RequestStep {
    pub fn new(request: RunRequest, total: usize) -> Self {
        RequestStep {
            base: StepBase::new(total.saturating_sub(1)),
            request,
        }
    }
}

impl StepLogic for RequestStep {
    fn name(&self) -> &'static str {
        "request"
    }

    fn init(&mut self, _info: &RunInfo, _store: &ResultStore) -> Result<()> {
        Ok(())
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        Ok(info
            .others()
            .map(|peer| {
                let mut message =
                    StepMessage::mpc(info.self_id.clone(), Some(peer.node_id.clone()));
                message.code = MessageCode::Request;
                message.peers = Some(info.peers.clone());
                message.request = Some(self.request.clone());
                message
            })
            .collect())
    }

    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool {
        if message.from == info.self_id || !self.base.admits(info, &message.from) {
            return false;
        }
        debug!(run_id = info.run_id, peer = %message.from, "request acknowledged");
        self.base.record(&message.from);
        true
    }

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())?;
        store.set_json(keys::PEERS, &info.peers)
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}

/// Follower: acknowledge the leader's request.
pub struct AcknowledgeStep {
    base: StepBase,
}

impl AcknowledgeStep {
    pub fn new() -> Self {
        AcknowledgeStep {
            base: StepBase::new(0),
        }
    }
}

impl Default for AcknowledgeStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepLogic for AcknowledgeStep {
    fn name(&self) -> &'static str {
        "acknowledge"
    }

    fn init(&mut self, _info: &RunInfo, _store: &ResultStore) -> Result<()> {
        Ok(())
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        Ok(vec![StepMessage::mpc(
            info.self_id.clone(),
            Some(info.leader.clone()),
        )])
    }

    fn handle_message(&mut self, _info: &RunInfo, _message: &StepMessage) -> bool {
        false
    }

    fn finish(&mut self, info: &RunInfo, store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())?;
        store.set_json(keys::PEERS, &info.peers)
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}

/// Leader: tell every follower that all peers are in.
pub struct ReadyStep {
    base: StepBase,
}

impl ReadyStep {
    pub fn new() -> Self {
        ReadyStep {
            base: StepBase::new(0),
        }
    }
}

impl Default for ReadyStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepLogic for ReadyStep {
    fn name(&self) -> &'static str {
        "ready"
    }

    fn init(&mut self, _info: &RunInfo, _store: &ResultStore) -> Result<()> {
        Ok(())
    }

    fn create_messages(&mut self, info: &RunInfo) -> Result<Vec<StepMessage>> {
        Ok(info
            .others()
            .map(|peer| {
                StepMessage::mpc(info.self_id.clone(), Some(peer.node_id.clone()))
                    .with_bytes(vec![b"1".to_vec()])
            })
            .collect())
    }

    fn handle_message(&mut self, _info: &RunInfo, _message: &StepMessage) -> bool {
        false
    }

    fn finish(&mut self, _info: &RunInfo, _store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}

/// Follower: wait for the leader's ready signal.
pub struct GetReadyStep {
    base: StepBase,
}

impl GetReadyStep {
    pub fn new() -> Self {
        GetReadyStep {
            base: StepBase::new(1),
        }
    }
}

impl Default for GetReadyStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepLogic for GetReadyStep {
    fn name(&self) -> &'static str {
        "get-ready"
    }

    fn init(&mut self, _info: &RunInfo, _store: &ResultStore) -> Result<()> {
        Ok(())
    }

    fn create_messages(&mut self, _info: &RunInfo) -> Result<Vec<StepMessage>> {
        Ok(vec![])
    }

    fn handle_message(&mut self, info: &RunInfo, message: &StepMessage) -> bool {
        if message.from != info.leader || !self.base.admits(info, &message.from) {
            return false;
        }
        self.base.record(&message.from);
        true
    }

    fn finish(&mut self, _info: &RunInfo, _store: &mut ResultStore) -> Result<()> {
        self.base.close(self.name())
    }

    fn is_complete(&self) -> bool {
        self.base.is_complete()
    }
}
