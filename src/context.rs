//! Drives one run's steps to completion.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::MpcConfig;
use crate::error::{MpcError, Result};
use crate::message::{NodeId, StepMessage, WireMessage};
use crate::step::{RunInfo, Step, StepLogic};
use crate::store::ResultStore;
use crate::transport::Transport;

/// The state of one run. Owned by a single task; the only way in is the inbox.
pub struct ProtocolContext {
    info: RunInfo,
    steps: Vec<Step>,
    store: ResultStore,
    transport: Arc<dyn Transport>,
    inbox: UnboundedReceiver<WireMessage>,
    /// Messages for steps that have not started yet, by step id.
    pending: BTreeMap<usize, Vec<StepMessage>>,
    step_timeout: Duration,
    protocol_timeout: Duration,
}

impl ProtocolContext {
    pub fn new(
        info: RunInfo,
        steps: Vec<Step>,
        store: ResultStore,
        transport: Arc<dyn Transport>,
        inbox: UnboundedReceiver<WireMessage>,
        config: &MpcConfig,
    ) -> Self {
        ProtocolContext {
            info,
            steps,
            store,
            transport,
            inbox,
            pending: BTreeMap::new(),
            step_timeout: config.step_timeout(),
            protocol_timeout: config.protocol_timeout(),
        }
    }

    pub fn run_id(&self) -> u64 {
        self.info.run_id
    }

    /// Walk every step in order and hand back the filled result store.
    pub async fn run(mut self) -> Result<ResultStore> {
        let run_deadline = Instant::now() + self.protocol_timeout;
        info!(run_id = self.info.run_id, kind = ?self.info.kind, steps = self.steps.len(), "run started");
        for index in 0..self.steps.len() {
            if let Err(err) = self.run_step(index, run_deadline).await {
                error!(run_id = self.info.run_id, step = index, %err, "run aborted");
                return Err(err);
            }
        }
        info!(run_id = self.info.run_id, "run finished");
        Ok(self.store)
    }

    async fn run_step(&mut self, index: usize, run_deadline: Instant) -> Result<()> {
        let step_deadline = (Instant::now() + self.step_timeout).min(run_deadline);
        let step_count = self.steps.len();
        let step = &mut self.steps[index];
        let info = &self.info;
        step.init(info, &self.store)?;

        let mut local = vec![];
        for message in step.create_messages(info)? {
            match message.to.clone() {
                Some(to) if to == info.self_id => local.push(message),
                Some(to) => send(self.transport.as_ref(), info, index, &to, message),
                None => {
                    for peer in info.others() {
                        send(
                            self.transport.as_ref(),
                            info,
                            index,
                            &peer.node_id,
                            message.clone(),
                        );
                    }
                    local.push(message);
                }
            }
        }
        for message in local {
            step.handle_message(info, &message);
        }
        for message in self.pending.remove(&index).unwrap_or_default() {
            step.handle_message(info, &message);
        }

        while !step.is_complete() {
            let wire = match timeout_at(step_deadline, self.inbox.recv()).await {
                Ok(Some(wire)) => wire,
                Ok(None) => return Err(MpcError::Quit("inbox closed".into())),
                Err(_) => {
                    let what = if step_deadline >= run_deadline { "run" } else { "step" };
                    return Err(MpcError::Timeout(format!(
                        "{what} timed out in {} (step {index})",
                        step.name()
                    )));
                }
            };
            if wire.run_id != info.run_id {
                continue;
            }
            if let Some(to) = &wire.message.to {
                if *to != info.self_id {
                    warn!(run_id = info.run_id, to = %to, "message for another node dropped");
                    continue;
                }
            }
            match route(wire.step_id, index, step_count) {
                Route::Late => {
                    debug!(run_id = info.run_id, step = wire.step_id, from = %wire.message.from, "late message dropped");
                }
                Route::Unknown => {
                    warn!(run_id = info.run_id, step = wire.step_id, from = %wire.message.from, "message for a step this run lacks dropped");
                }
                Route::Later => {
                    self.pending
                        .entry(wire.step_id)
                        .or_default()
                        .push(wire.message);
                }
                Route::Current => {
                    step.handle_message(info, &wire.message);
                }
            }
        }

        step.finish(info, &mut self.store)?;
        info!(run_id = info.run_id, step = index, name = step.name(), "step finished");
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Late,
    Current,
    Later,
    Unknown,
}

/// Where a message stamped `step_id` goes while step `index` of `step_count` runs.
fn route(step_id: usize, index: usize, step_count: usize) -> Route {
    if step_id >= step_count {
        Route::Unknown
    } else if step_id < index {
        Route::Late
    } else if step_id == index {
        Route::Current
    } else {
        Route::Later
    }
}

fn send(
    transport: &dyn Transport,
    info: &RunInfo,
    step_id: usize,
    to: &NodeId,
    message: StepMessage,
) {
    let wire = WireMessage {
        run_id: info.run_id,
        step_id,
        message,
    };
    if let Err(err) = transport.send(to, &wire) {
        warn!(run_id = info.run_id, peer = %to, %err, "send failed");
    }
}
