//! Peer-to-peer delivery of wire messages.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::{debug, warn};

use crate::distributor::Distributor;
use crate::error::{MpcError, Result};
use crate::message::{encode, MessageCode, NodeId, WireMessage, MAX_MESSAGE_SIZE};

pub trait Transport: Send + Sync {
    fn send(&self, to: &NodeId, message: &WireMessage) -> Result<()>;
}

/// Rewrites a message in flight, given its destination.
pub type TamperHook = Box<dyn Fn(&NodeId, &mut WireMessage) + Send + Sync>;

/// In-process network joining the distributors of one test or demo.
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<Distributor>>>,
    tamper: RwLock<Option<TamperHook>>,
    /// Times every Request is delivered; delivery is at-least-once.
    request_copies: AtomicUsize,
    max_message_size: usize,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        LocalNetwork {
            nodes: RwLock::new(HashMap::new()),
            tamper: RwLock::new(None),
            request_copies: AtomicUsize::new(1),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, distributor: &Arc<Distributor>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(distributor.node_id().clone(), Arc::downgrade(distributor));
    }

    pub fn set_tamper(&self, hook: TamperHook) {
        *self.tamper.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn clear_tamper(&self) {
        *self.tamper.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn set_request_copies(&self, copies: usize) {
        self.request_copies.store(copies.max(1), Ordering::Relaxed);
    }
}

impl Transport for LocalNetwork {
    fn send(&self, to: &NodeId, message: &WireMessage) -> Result<()> {
        let mut message = message.clone();
        if let Some(hook) = self
            .tamper
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            hook(to, &mut message);
        }
        let packet = encode(&message, self.max_message_size)?;
        let target = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| MpcError::Transport(format!("no route to {to}")))?;
        debug!(run_id = message.run_id, step = message.step_id, peer = %to, bytes = packet.len(), "packet sent");
        let copies = match message.message.code {
            MessageCode::Request => self.request_copies.load(Ordering::Relaxed),
            MessageCode::Mpc => 1,
        };
        for _ in 0..copies {
            if let Err(err) = target.handle_packet(&packet) {
                warn!(peer = %to, %err, "packet refused by receiver");
            }
        }
        Ok(())
    }
}
