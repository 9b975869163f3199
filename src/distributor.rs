//! Node-wide run manager.
//!
//! The distributor owns the table of running contexts, turns raw packets into wire
//! messages and routes them, admits follower runs when a leader's Request arrives,
//! and exposes the leader entry points that open key generation and signing runs.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use rand::{thread_rng, Rng};
use tokio::sync::{broadcast, mpsc, mpsc::UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::approval::{add_valid_data, wait_for_approval, ApprovalStore};
use crate::config::MpcConfig;
use crate::context::ProtocolContext;
use crate::crypto::{decode_point, decode_scalar, public_image, verify_signature};
use crate::error::{MpcError, Result};
use crate::group::{GroupDirectory, GroupInfo};
use crate::keyshare::{KeyShare, KeyStore};
use crate::message::{decode, MessageCode, NodeId, PeerInfo, ProtocolKind, RunRequest, WireMessage};
use crate::parking::{ParkingLot, RecentRuns};
use crate::protocol::{key_generation_steps, signing_steps};
use crate::slash::SlashLedger;
use crate::step::{RunInfo, Step};
use crate::store::{indexed_key, keys, ResultStore};
use crate::transport::Transport;

/// Largest seed a leader hands out.
pub const MAX_ASSIGNED_SEED: u64 = 0xFF_FFFE;
/// Largest seed a follower accepts.
pub const MAX_ACCEPTED_SEED: u64 = 0xFF_FFFF;

/// Caller-chosen parameters of a run.
#[derive(Clone, Debug)]
pub struct Presets {
    pub run_id: Option<u64>,
    /// Signatures produced by one signing run.
    pub sign_count: usize,
    /// Address the GPK must hash to, checked before signatures are released.
    pub address: Option<[u8; 20]>,
}

impl Default for Presets {
    fn default() -> Self {
        Presets {
            run_id: None,
            sign_count: 1,
            address: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureParts {
    /// Compressed nonce point.
    pub r: Vec<u8>,
    pub s: Vec<u8>,
    /// Recovery parity of `R`.
    pub v: u8,
}

impl SignatureParts {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.r.clone();
        bytes.extend_from_slice(&self.s);
        bytes
    }

    pub fn verify(&self, gpk: &[u8], message: &[u8]) -> bool {
        match (decode_point(gpk), decode_point(&self.r), decode_scalar(&self.s)) {
            (Ok(gpk), Ok(r), Ok(s)) => verify_signature(&gpk, &r, &s, message),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutput {
    Gpk(Vec<u8>),
    Signatures(Vec<SignatureParts>),
}

/// Published once for every run this node took part in.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub run_id: u64,
    pub kind: ProtocolKind,
    pub result: Result<RunOutput>,
}

pub struct Distributor {
    directory: Arc<GroupDirectory>,
    config: MpcConfig,
    transport: Arc<dyn Transport>,
    approvals: Arc<dyn ApprovalStore>,
    key_store: KeyStore,
    slash_ledger: SlashLedger,
    runs: RwLock<HashMap<u64, UnboundedSender<WireMessage>>>,
    /// Messages for runs this node has not admitted yet.
    parked: Mutex<ParkingLot>,
    admitted: Mutex<RecentRuns>,
    outcomes: broadcast::Sender<RunOutcome>,
}

impl Distributor {
    pub fn new(
        directory: Arc<GroupDirectory>,
        config: MpcConfig,
        transport: Arc<dyn Transport>,
        approvals: Arc<dyn ApprovalStore>,
    ) -> Arc<Self> {
        let (outcomes, _) = broadcast::channel(64);
        let parked = Mutex::new(ParkingLot::new(&config));
        let admitted = Mutex::new(RecentRuns::new(config.admission_memory()));
        Arc::new(Distributor {
            directory,
            config,
            transport,
            approvals,
            key_store: KeyStore::new(),
            slash_ledger: SlashLedger::new(),
            runs: RwLock::new(HashMap::new()),
            parked,
            admitted,
            outcomes,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        self.directory.self_id()
    }

    pub fn directory(&self) -> &GroupDirectory {
        &self.directory
    }

    pub fn config(&self) -> &MpcConfig {
        &self.config
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    pub fn slash_ledger(&self) -> &SlashLedger {
        &self.slash_ledger
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunOutcome> {
        self.outcomes.subscribe()
    }

    pub fn active_runs(&self) -> usize {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Runs with messages waiting for admission.
    pub fn parked_runs(&self) -> usize {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner).runs()
    }

    /// Approve `payload` for signing on this node.
    pub fn add_valid_data(&self, payload: &[u8]) -> Result<()> {
        add_valid_data(self.approvals.as_ref(), payload)
    }

    /// Adopt a key share produced earlier, e.g. loaded from disk. A public share
    /// known for this node must match it.
    pub fn import_key_share(&self, share: KeyShare) -> Result<()> {
        let index = self.directory.self_index(&share.group_id)?;
        if let Some(expected) = self.directory.public_share(&share.group_id, index)? {
            if public_image(&share.private_share) != expected {
                return Err(MpcError::InvalidConfig(format!(
                    "key share does not match the public share of {} in {}",
                    self.node_id(),
                    share.group_id
                )));
            }
        }
        self.directory.set_gpk(&share.group_id, &share.gpk)?;
        self.key_store.insert(share)
    }

    /// Entry point of the receive path. Only decodes and enqueues.
    pub fn handle_packet(self: &Arc<Self>, packet: &[u8]) -> Result<()> {
        let wire = match decode(packet, self.config.max_message_size) {
            Ok(wire) => wire,
            Err(err) => {
                warn!(node = %self.node_id(), %err, "packet dropped");
                return Err(err);
            }
        };

        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(inbox) = runs.get(&wire.run_id) {
            if inbox.send(wire).is_err() {
                debug!(node = %self.node_id(), "run already closed");
            }
            return Ok(());
        }
        if !self.directory.is_member(&wire.message.from) {
            warn!(node = %self.node_id(), run_id = wire.run_id, from = %wire.message.from, "message from a stranger dropped");
            return Ok(());
        }
        if wire.message.code == MessageCode::Request {
            drop(runs);
            let fresh = self
                .admitted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .admit(wire.run_id, Instant::now());
            if !fresh {
                debug!(node = %self.node_id(), run_id = wire.run_id, "repeated request ignored");
                return Ok(());
            }
            let distributor = Arc::clone(self);
            tokio::spawn(async move { distributor.admit(wire).await });
            return Ok(());
        }
        // still holding the run table, so a registering run cannot miss the message
        self.park(wire, packet.len());
        Ok(())
    }

    fn park(&self, wire: WireMessage, size: usize) {
        let run_id = wire.run_id;
        let step = wire.step_id;
        let parked = self
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .park(wire, size, Instant::now());
        match parked {
            Ok(()) => debug!(node = %self.node_id(), run_id, step, "message parked"),
            Err(refusal) => warn!(node = %self.node_id(), run_id, ?refusal, "message dropped"),
        }
    }

    async fn admit(self: Arc<Self>, wire: WireMessage) {
        let kind = match &wire.message.request {
            Some(request) => request.kind,
            None => {
                warn!(node = %self.node_id(), run_id = wire.run_id, "request without run parameters");
                return;
            }
        };
        let run_id = wire.run_id;
        let result = match kind {
            ProtocolKind::KeyGen => self.acknowledge_key_generation(wire).await.map(|_| ()),
            ProtocolKind::Sign => self.acknowledge_signing(wire).await.map(|_| ()),
        };
        if let Err(err) = result {
            error!(node = %self.node_id(), run_id, %err, "follower run failed");
        }
    }

    /// Leader: generate a new group key with every member of `group_id`.
    pub async fn request_key_generation(
        self: &Arc<Self>,
        group_id: &str,
        presets: Presets,
    ) -> Result<Vec<u8>> {
        let run_id = presets.run_id.unwrap_or_else(new_run_id);
        let result = self.lead_key_generation(run_id, group_id).await;
        self.publish(run_id, ProtocolKind::KeyGen, result.clone().map(RunOutput::Gpk));
        result
    }

    async fn lead_key_generation(self: &Arc<Self>, run_id: u64, group_id: &str) -> Result<Vec<u8>> {
        let group = self.directory.group(group_id)?;
        self.ensure_leader(&group)?;
        let peers = assign_seeds(&self.directory.peers(group_id)?);
        let request = RunRequest {
            kind: ProtocolKind::KeyGen,
            group_id: group_id.to_string(),
            gpk: vec![],
            message: vec![],
            sign_count: 1,
            address: vec![],
        };
        info!(node = %self.node_id(), run_id, group = group_id, "key generation requested");
        let steps = key_generation_steps(true, &request, peers.len());
        let info = self.run_info(run_id, ProtocolKind::KeyGen, group, peers.clone())?;
        let store = self.run_protocol(info, steps, ResultStore::new()).await?;
        self.complete_key_generation(group_id, peers, &store)
    }

    /// Follower: join a key generation run opened by `request`.
    pub async fn acknowledge_key_generation(self: &Arc<Self>, request: WireMessage) -> Result<Vec<u8>> {
        let run_id = request.run_id;
        let result = self.follow_key_generation(request).await;
        self.publish(run_id, ProtocolKind::KeyGen, result.clone().map(RunOutput::Gpk));
        result
    }

    async fn follow_key_generation(self: &Arc<Self>, wire: WireMessage) -> Result<Vec<u8>> {
        let (request, peers) = opening(&wire)?;
        let group = self.directory.group(&request.group_id)?;
        self.check_leader(&group, &wire.message.from)?;
        validate_seeds(&peers)?;
        for peer in &peers {
            group.member_by_id(&peer.node_id)?;
        }
        if peers.len() != group.total() {
            return Err(MpcError::InvalidConfig(format!(
                "{} of {} members invited to key generation",
                peers.len(),
                group.total()
            )));
        }
        info!(node = %self.node_id(), run_id = wire.run_id, group = %request.group_id, "joining key generation");
        let steps = key_generation_steps(false, &request, peers.len());
        let info = self.run_info(wire.run_id, ProtocolKind::KeyGen, group, peers.clone())?;
        let store = self.run_protocol(info, steps, ResultStore::new()).await?;
        self.complete_key_generation(&request.group_id, peers, &store)
    }

    /// Leader: sign `message` under `gpk`, `presets.sign_count` times.
    pub async fn request_signing(
        self: &Arc<Self>,
        gpk: &[u8],
        message: &[u8],
        presets: Presets,
    ) -> Result<Vec<SignatureParts>> {
        let run_id = presets.run_id.unwrap_or_else(new_run_id);
        let result = self.lead_signing(run_id, gpk, message, &presets).await;
        self.publish(
            run_id,
            ProtocolKind::Sign,
            result.clone().map(RunOutput::Signatures),
        );
        result
    }

    async fn lead_signing(
        self: &Arc<Self>,
        run_id: u64,
        gpk: &[u8],
        message: &[u8],
        presets: &Presets,
    ) -> Result<Vec<SignatureParts>> {
        if presets.sign_count == 0 {
            return Err(MpcError::InvalidConfig("sign count must be positive".into()));
        }
        let key_share = self.key_store.get(gpk)?;
        let group = self.directory.group(&key_share.group_id)?;
        self.ensure_leader(&group)?;
        let request = RunRequest {
            kind: ProtocolKind::Sign,
            group_id: key_share.group_id.clone(),
            gpk: gpk.to_vec(),
            message: message.to_vec(),
            sign_count: presets.sign_count,
            address: presets.address.map(|a| a.to_vec()).unwrap_or_default(),
        };
        info!(node = %self.node_id(), run_id, count = presets.sign_count, "signing requested");
        let store = signing_store(&key_share, &request)?;
        let steps = signing_steps(true, &request, key_share.peers.len());
        let info = self.run_info(run_id, ProtocolKind::Sign, group, key_share.peers.clone())?;
        let store = self.run_protocol(info, steps, store).await?;
        collect_signatures(&store, presets.sign_count)
    }

    /// Follower: join a signing run opened by `request`.
    pub async fn acknowledge_signing(
        self: &Arc<Self>,
        request: WireMessage,
    ) -> Result<Vec<SignatureParts>> {
        let run_id = request.run_id;
        let result = self.follow_signing(request).await;
        self.publish(
            run_id,
            ProtocolKind::Sign,
            result.clone().map(RunOutput::Signatures),
        );
        result
    }

    async fn follow_signing(self: &Arc<Self>, wire: WireMessage) -> Result<Vec<SignatureParts>> {
        let (request, peers) = opening(&wire)?;
        validate_seeds(&peers)?;
        if request.sign_count == 0 {
            return Err(MpcError::InvalidConfig("sign count must be positive".into()));
        }
        let key_share = self.key_store.get(&request.gpk)?;
        let group = self.directory.group(&key_share.group_id)?;
        self.check_leader(&group, &wire.message.from)?;
        if peers != key_share.peers {
            return Err(MpcError::InvalidConfig(
                "signing peers differ from the key generation peers".into(),
            ));
        }
        if self.config.require_approval {
            wait_for_approval(
                self.approvals.as_ref(),
                &request.message,
                self.config.approval_timeout(),
                self.config.approval_poll(),
            )
            .await?;
        }
        info!(node = %self.node_id(), run_id = wire.run_id, count = request.sign_count, "joining signing");
        let store = signing_store(&key_share, &request)?;
        let steps = signing_steps(false, &request, peers.len());
        let info = self.run_info(wire.run_id, ProtocolKind::Sign, group, peers)?;
        let store = self.run_protocol(info, steps, store).await?;
        collect_signatures(&store, request.sign_count)
    }

    fn ensure_leader(&self, group: &GroupInfo) -> Result<()> {
        if group.leader()?.node_id != *self.node_id() {
            return Err(MpcError::InvalidConfig(format!(
                "{} is not the leader of {}",
                self.node_id(),
                group.id
            )));
        }
        Ok(())
    }

    fn check_leader(&self, group: &GroupInfo, from: &NodeId) -> Result<()> {
        if group.leader()?.node_id != *from {
            return Err(MpcError::UnknownPeer(format!(
                "{from} is not the leader of {}",
                group.id
            )));
        }
        Ok(())
    }

    fn run_info(
        &self,
        run_id: u64,
        kind: ProtocolKind,
        group: Arc<GroupInfo>,
        peers: Vec<PeerInfo>,
    ) -> Result<RunInfo> {
        if !peers.iter().any(|p| p.node_id == *self.node_id()) {
            return Err(MpcError::UnknownPeer(format!(
                "{} is not a peer of run {run_id}",
                self.node_id()
            )));
        }
        Ok(RunInfo {
            run_id,
            kind,
            leader: group.leader()?.node_id.clone(),
            group,
            self_id: self.node_id().clone(),
            self_secret: self.directory.self_secret().clone(),
            provenance: self.directory.provenance().clone(),
            peers,
            slash_ledger: self.slash_ledger.clone(),
        })
    }

    /// Register the run, drive its context on its own task, and unregister it.
    async fn run_protocol(
        self: &Arc<Self>,
        info: RunInfo,
        steps: Vec<Step>,
        store: ResultStore,
    ) -> Result<ResultStore> {
        let run_id = info.run_id;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        self.register(run_id, inbox_tx)?;
        let context = ProtocolContext::new(
            info,
            steps,
            store,
            Arc::clone(&self.transport),
            inbox_rx,
            &self.config,
        );
        let result = match tokio::spawn(context.run()).await {
            Ok(result) => result,
            Err(err) => Err(MpcError::Quit(err.to_string())),
        };
        self.unregister(run_id);
        result
    }

    fn register(&self, run_id: u64, inbox: UnboundedSender<WireMessage>) -> Result<()> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        if runs.contains_key(&run_id) {
            return Err(MpcError::RunExists(run_id));
        }
        let parked = self
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(run_id);
        if !parked.is_empty() {
            debug!(node = %self.node_id(), run_id, count = parked.len(), "draining parked messages");
        }
        for wire in parked {
            let _ = inbox.send(wire);
        }
        runs.insert(run_id, inbox);
        Ok(())
    }

    fn unregister(&self, run_id: u64) {
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id);
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .discard(run_id);
    }

    fn complete_key_generation(
        &self,
        group_id: &str,
        peers: Vec<PeerInfo>,
        store: &ResultStore,
    ) -> Result<Vec<u8>> {
        let gpk = store.get_bytes(keys::GPK)?.to_vec();
        let private_share = store.get_scalar(keys::PRIVATE_SHARE)?.clone();
        let self_index = self.directory.self_index(group_id)?;
        let mut public_shares = vec![(self_index, public_image(&private_share))];
        for peer in &peers {
            let index = self.directory.index_of(group_id, &peer.node_id)?;
            if index == self_index {
                continue;
            }
            // peers whose point was rejected have no entry
            if let Ok(bytes) = store.get_bytes(&indexed_key(keys::PUBLIC_SHARE, index as usize)) {
                public_shares.push((index, decode_point(bytes)?));
            }
        }
        self.directory.set_public_shares(group_id, &public_shares)?;
        let share = KeyShare {
            group_id: group_id.to_string(),
            gpk: gpk.clone(),
            private_share,
            peers,
        };
        self.import_key_share(share)?;
        info!(node = %self.node_id(), group = group_id, gpk = %hex::encode(&gpk), "key share stored");
        Ok(gpk)
    }

    fn publish(&self, run_id: u64, kind: ProtocolKind, result: Result<RunOutput>) {
        // no subscribers is fine
        let _ = self.outcomes.send(RunOutcome {
            run_id,
            kind,
            result,
        });
    }
}

fn new_run_id() -> u64 {
    thread_rng().gen_range(1..u64::MAX)
}

/// Give every peer a distinct seed in `[1, MAX_ASSIGNED_SEED]`.
pub fn assign_seeds(peers: &[PeerInfo]) -> Vec<PeerInfo> {
    let mut rng = thread_rng();
    let mut used = HashSet::new();
    peers
        .iter()
        .map(|peer| {
            let mut seed = rng.gen_range(1..=MAX_ASSIGNED_SEED);
            while !used.insert(seed) {
                seed = rng.gen_range(1..=MAX_ASSIGNED_SEED);
            }
            PeerInfo {
                node_id: peer.node_id.clone(),
                seed,
            }
        })
        .collect()
}

/// Follower-side admission check of the leader's seed assignment.
pub fn validate_seeds(peers: &[PeerInfo]) -> Result<()> {
    let mut seen = HashSet::new();
    for peer in peers {
        if peer.seed == 0 || peer.seed > MAX_ACCEPTED_SEED {
            return Err(MpcError::MpcSeedOutRange(peer.seed));
        }
        if !seen.insert(peer.seed) {
            return Err(MpcError::MpcSeedDuplicate);
        }
    }
    Ok(())
}

fn opening(wire: &WireMessage) -> Result<(RunRequest, Vec<PeerInfo>)> {
    let message = &wire.message;
    match (message.code, &message.request, &message.peers) {
        (MessageCode::Request, Some(request), Some(peers)) => Ok((request.clone(), peers.clone())),
        _ => Err(MpcError::InvalidEncoding(format!(
            "run {} opened without a request",
            wire.run_id
        ))),
    }
}

fn signing_store(key_share: &KeyShare, request: &RunRequest) -> Result<ResultStore> {
    let mut store = ResultStore::new();
    store.set_scalar(keys::PRIVATE_SHARE, key_share.private_share.clone());
    store.set_bytes(keys::GPK, key_share.gpk.clone());
    store.set_bytes(keys::MESSAGE, request.message.clone());
    match request.address.len() {
        0 => {}
        20 => store.set_bytes(keys::ADDRESS, request.address.clone()),
        len => {
            return Err(MpcError::InvalidConfig(format!(
                "expected address is {len} bytes long"
            )))
        }
    }
    Ok(store)
}

fn collect_signatures(store: &ResultStore, count: usize) -> Result<Vec<SignatureParts>> {
    (0..count)
        .map(|ordinal| {
            let signature = store.get_bytes(&indexed_key(keys::SIGNATURE, ordinal))?;
            let v = store.get_bytes(&indexed_key(keys::V, ordinal))?;
            if signature.len() != 65 || v.len() != 1 {
                return Err(MpcError::InvalidEncoding("composed signature".into()));
            }
            Ok(SignatureParts {
                r: signature[..33].to_vec(),
                s: signature[33..].to_vec(),
                v: v[0],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(seeds: &[u64]) -> Vec<PeerInfo> {
        seeds
            .iter()
            .enumerate()
            .map(|(i, seed)| PeerInfo {
                node_id: NodeId::new(format!("node{i}")),
                seed: *seed,
            })
            .collect()
    }

    #[test]
    fn assigned_seeds_are_distinct_and_in_range() {
        let assigned = assign_seeds(&peers(&[0; 16]));
        assert_eq!(validate_seeds(&assigned), Ok(()));
        assert!(assigned.iter().all(|p| (1..=MAX_ASSIGNED_SEED).contains(&p.seed)));
    }

    #[test]
    fn admission_rejects_bad_seeds() {
        assert_eq!(
            validate_seeds(&peers(&[5, 9, 5])),
            Err(MpcError::MpcSeedDuplicate)
        );
        assert_eq!(
            validate_seeds(&peers(&[5, 0x100_0000])),
            Err(MpcError::MpcSeedOutRange(0x100_0000))
        );
        assert_eq!(validate_seeds(&peers(&[0])), Err(MpcError::MpcSeedOutRange(0)));
        assert_eq!(validate_seeds(&peers(&[1, MAX_ACCEPTED_SEED])), Ok(()));
    }
}
