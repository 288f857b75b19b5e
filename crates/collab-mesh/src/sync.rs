/// History reconciliation: snapshot transfer, missing-step backfill and live step propagation
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    compare_clients, is_client_first, ClientId, CollabEvent, CollaborationError,
    CollaborativeSelection, DocumentEngine, HistoryServer, HistoryStep, MissingSteps,
    Notification, PeerSessionManager, Request, Response, Result, StepId,
};

/// Where the local document stands relative to the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncPhase {
    /// No peer seen yet, or reset by a forced resync
    Unsynced,

    /// Waiting for a snapshot from `donor`
    Syncing { donor: ClientId },

    /// Caught up; live steps apply directly
    Synced,
}

/// Sync flags and the buffer of steps that arrived before the snapshot.
///
/// Only mutated through the transitions below.
#[derive(Debug, Clone)]
pub struct SyncState {
    phase: SyncPhase,
    history_sync_at_least_once: bool,
    pending_steps: Vec<HistoryStep>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Unsynced,
            history_sync_at_least_once: false,
            pending_steps: Vec::new(),
        }
    }

    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    pub fn history_sync_at_least_once(&self) -> bool {
        self.history_sync_at_least_once
    }

    pub fn history_sync_finished(&self) -> bool {
        self.phase == SyncPhase::Synced
    }

    pub fn pending_steps(&self) -> &[HistoryStep] {
        &self.pending_steps
    }

    /// Unsynced -> Synced without receiving anything. Returns the buffered
    /// steps to apply, or `None` if the transition does not apply.
    pub fn become_donor(&mut self) -> Option<Vec<HistoryStep>> {
        if self.phase != SyncPhase::Unsynced {
            return None;
        }
        self.phase = SyncPhase::Synced;
        self.history_sync_at_least_once = true;
        Some(std::mem::take(&mut self.pending_steps))
    }

    /// Unsynced -> Syncing
    pub fn begin_sync(&mut self, donor: ClientId) -> bool {
        if self.phase != SyncPhase::Unsynced {
            return false;
        }
        self.phase = SyncPhase::Syncing { donor };
        true
    }

    /// Syncing -> Syncing with another donor
    pub fn retarget(&mut self, donor: ClientId) -> bool {
        if !matches!(self.phase, SyncPhase::Syncing { .. }) {
            return false;
        }
        self.phase = SyncPhase::Syncing { donor };
        true
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self.phase, SyncPhase::Syncing { .. })
    }

    /// A remote step arrived. Returned if it can be applied now, buffered otherwise.
    pub fn receive(&mut self, step: HistoryStep) -> Option<HistoryStep> {
        if self.phase == SyncPhase::Synced {
            return Some(step);
        }
        self.pending_steps.push(step);
        None
    }

    /// Syncing -> Synced. Returns the buffered steps in arrival order.
    pub fn finish_sync(&mut self) -> Option<Vec<HistoryStep>> {
        if !self.is_syncing() {
            return None;
        }
        self.phase = SyncPhase::Synced;
        self.history_sync_at_least_once = true;
        Some(std::mem::take(&mut self.pending_steps))
    }

    /// Syncing -> Unsynced; the buffer is kept for the next attempt
    pub fn abort_sync(&mut self) {
        if self.is_syncing() {
            self.phase = SyncPhase::Unsynced;
        }
    }

    /// Back to the initial state
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// What happened to a live step handed to `on_remote_step`
#[derive(Debug)]
pub enum StepOutcome {
    /// Held until the snapshot lands
    Buffered,
    Applied,
    /// Already part of the local branch
    Duplicate,
    /// Waiting behind a backfill from the same origin
    Queued,
    /// Its gap is being fetched from the origin
    Backfilling(JoinHandle<()>),
}

/// Brings a newly joined document up to date and keeps it consistent afterwards
pub struct HistoryReconciliationProtocol {
    mesh: Arc<PeerSessionManager>,
    document: Arc<dyn DocumentEngine>,
    server: Arc<dyn HistoryServer>,
    state: Mutex<SyncState>,
    /// Steps queued per origin while a backfill from that origin is in flight
    backfills: Mutex<HashMap<ClientId, Vec<HistoryStep>>>,
    events: broadcast::Sender<CollabEvent>,
    paused: AtomicBool,
}

impl HistoryReconciliationProtocol {
    pub fn new(
        mesh: Arc<PeerSessionManager>,
        document: Arc<dyn DocumentEngine>,
        server: Arc<dyn HistoryServer>,
        events: broadcast::Sender<CollabEvent>,
    ) -> Self {
        Self {
            mesh,
            document,
            server,
            state: Mutex::new(SyncState::new()),
            backfills: Mutex::new(HashMap::new()),
            events,
            paused: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.state.lock().phase().clone()
    }

    pub fn sync_state(&self) -> SyncState {
        self.state.lock().clone()
    }

    /// Stop broadcasting local steps (while offline)
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// A peer finished its handshake. The first one decides whether we are
    /// the snapshot donor or need a snapshot ourselves.
    pub async fn on_peer_ready(&self, peer: &ClientId, remote_start: i64) {
        let local = self.mesh.local();
        let local_first = is_client_first(local.start_time, &local.client_id, remote_start, peer);

        let became_donor = {
            let mut state = self.state.lock();
            if state.phase() != &SyncPhase::Unsynced {
                return;
            }
            if local_first {
                let buffered = state.become_donor().unwrap_or_default();
                self.apply_buffered(buffered);
                true
            } else {
                state.begin_sync(peer.clone());
                false
            }
        };

        if became_donor {
            info!(client_id = %local.client_id, peer = %peer, "acting as snapshot donor");
            let _ = self.events.send(CollabEvent::Synced);
        } else {
            self.sync_history(peer).await;
        }
    }

    /// Fetch a snapshot from `donor`, falling back to older peers and then
    /// the server copy. Returns whether the document ended up synced.
    pub async fn sync_history(&self, donor: &ClientId) -> bool {
        let mut tried = HashSet::new();
        let mut current = donor.clone();

        loop {
            match self.sync_from(&current).await {
                Ok(()) => return true,
                Err(CollaborationError::SessionStopped) | Err(CollaborationError::Cancelled) => {
                    self.state.lock().abort_sync();
                    return false;
                }
                Err(err) => {
                    warn!(peer = %current, error = %err, "snapshot sync failed");
                    tried.insert(current.clone());
                }
            }

            match self.next_donor(&tried) {
                Some(next) if self.state.lock().retarget(next.clone()) => {
                    debug!(peer = %next, "retrying snapshot with next donor");
                    current = next;
                }
                Some(_) => return false,
                None => break,
            }
        }

        self.sync_from_server().await
    }

    /// Connected peers older than us, oldest first, that were not tried yet
    fn next_donor(&self, tried: &HashSet<ClientId>) -> Option<ClientId> {
        let local = self.mesh.local();
        let mut candidates: Vec<(i64, ClientId)> = self
            .mesh
            .connected_peers()
            .into_iter()
            .filter(|p| !tried.contains(&p.peer_id))
            .filter_map(|p| p.start_time.map(|start| (start, p.peer_id)))
            .filter(|(start, id)| {
                !is_client_first(local.start_time, &local.client_id, *start, id)
            })
            .collect();
        candidates.sort_by(|a, b| compare_clients(a.0, &a.1, b.0, &b.1));
        candidates.into_iter().next().map(|(_, id)| id)
    }

    /// One snapshot attempt against `donor`. Applies nothing on failure.
    pub async fn sync_from(&self, donor: &ClientId) -> Result<()> {
        let response = self
            .mesh
            .request_peer(donor, Request::GetHistoryFromSnapshot, None)
            .await?;

        let (steps, history_ids, selection) = match response {
            Response::HistoryFromSnapshot {
                steps,
                history_ids,
                selection,
            } => (steps, history_ids, selection),
            other => {
                return Err(CollaborationError::Protocol(format!(
                    "unexpected response to snapshot request: {}",
                    other.name()
                )))
            }
        };

        if let Some(root) = self.document.branch_ids().first() {
            if !history_ids.contains(root) {
                return Err(CollaborationError::StaleSnapshot(donor.clone()));
            }
        }

        let info = self.mesh.peer(donor);
        {
            // steps arriving meanwhile wait on this lock, so they land after the buffer
            let mut state = self.state.lock();
            if !state.is_syncing() {
                return Err(CollaborationError::Cancelled);
            }

            info!(peer = %donor, steps = steps.len(), "applying snapshot");
            self.document.apply_external_steps(steps);

            if let Some(selection) = selection {
                self.document.apply_external_selection(CollaborativeSelection {
                    client_id: donor.clone(),
                    selection,
                    client_name: info.as_ref().and_then(|i| i.display_name.clone()),
                    client_avatar_url: info.and_then(|i| i.avatar_url),
                });
            }

            let buffered = state.finish_sync().unwrap_or_default();
            self.apply_buffered(buffered);
        }
        let _ = self.events.send(CollabEvent::Synced);
        Ok(())
    }

    async fn sync_from_server(&self) -> bool {
        match self.server.fetch_document().await {
            Ok(snapshot) => {
                {
                    let mut state = self.state.lock();
                    if !state.is_syncing() {
                        return false;
                    }
                    info!("no usable donor, adopting server copy");
                    self.document.replace_content(snapshot);
                    let buffered = state.finish_sync().unwrap_or_default();
                    self.apply_buffered(buffered);
                }
                let _ = self.events.send(CollabEvent::Synced);
                true
            }
            Err(err) => {
                error!(error = %err, "server fallback failed, staying unsynced");
                self.state.lock().abort_sync();
                false
            }
        }
    }

    fn apply_buffered(&self, buffered: Vec<HistoryStep>) {
        if buffered.is_empty() {
            return;
        }
        debug!(steps = buffered.len(), "flushing buffered steps");
        self.document.apply_external_steps(buffered);
    }

    /// A live step arrived from a peer.
    ///
    /// Never waits on the network: a gap is filled by a spawned backfill, and
    /// later steps from the same origin queue behind it.
    pub fn on_remote_step(self: &Arc<Self>, step: HistoryStep) -> StepOutcome {
        let step_id = step.id.clone();
        let Some(step) = self.state.lock().receive(step) else {
            debug!(step_id = %step_id, "buffered step until sync finishes");
            return StepOutcome::Buffered;
        };

        let mut backfills = self.backfills.lock();
        if let Some(queue) = backfills.get_mut(&step.client_id) {
            queue.push(step);
            return StepOutcome::Queued;
        }

        let branch = self.document.branch_ids();
        if branch.contains(&step.id) {
            return StepOutcome::Duplicate;
        }
        let parent_known = step
            .parent_id
            .as_ref()
            .map(|parent| branch.contains(parent))
            .unwrap_or(true);

        if parent_known {
            self.document.apply_external_steps(vec![step]);
            return StepOutcome::Applied;
        }

        backfills.insert(step.client_id.clone(), Vec::new());
        drop(backfills);

        let this = self.clone();
        StepOutcome::Backfilling(tokio::spawn(async move { this.backfill(step).await }))
    }

    /// Fill the gap before `step` from its origin, then apply it together
    /// with anything the origin sent meanwhile
    async fn backfill(&self, step: HistoryStep) {
        let origin = step.client_id.clone();
        let result = self.fetch_missing(&origin, &step.id).await;

        let mut backfills = self.backfills.lock();
        let Some(queued) = backfills.remove(&origin) else {
            debug!(peer = %origin, step_id = %step.id, "backfill superseded by resync");
            return;
        };
        match result {
            Ok(missing) => {
                debug!(peer = %origin, step_id = %step.id, missing = missing.len(), "backfilled gap");
                let mut steps = missing;
                steps.push(step);
                steps.extend(queued);
                self.document.apply_external_steps(steps);
            }
            Err(err) => {
                warn!(
                    peer = %origin,
                    step_id = %step.id,
                    dropped = queued.len() + 1,
                    error = %err,
                    "cannot integrate step, waiting for a resync"
                );
            }
        }
    }

    async fn fetch_missing(&self, origin: &ClientId, to: &StepId) -> Result<Vec<HistoryStep>> {
        let from = self
            .document
            .branch_ids()
            .last()
            .cloned()
            .ok_or_else(|| CollaborationError::Protocol("empty local history".to_string()))?;

        let response = self
            .mesh
            .request_peer(
                origin,
                Request::GetMissingSteps {
                    from_step_id: from,
                    to_step_id: to.clone(),
                },
                None,
            )
            .await?;

        match response {
            Response::MissingSteps(MissingSteps::Steps(steps)) => Ok(steps),
            Response::MissingSteps(MissingSteps::Unavailable) => {
                Err(CollaborationError::MissingStepsUnavailable(origin.clone()))
            }
            other => Err(CollaborationError::Protocol(format!(
                "unexpected response to missing steps request: {}",
                other.name()
            ))),
        }
    }

    /// Send a step produced locally to every connected peer
    pub async fn broadcast_local_step(&self, step: HistoryStep) -> usize {
        if self.is_paused() || self.mesh.is_stopped() {
            debug!(step_id = %step.id, "not broadcasting local step");
            return 0;
        }
        self.mesh.notify_all(Notification::HistoryStep(step)).await
    }

    pub fn snapshot_response(&self) -> Response {
        Response::HistoryFromSnapshot {
            steps: self.document.snapshot_steps(),
            history_ids: self.document.branch_ids(),
            selection: self.document.current_selection(),
        }
    }

    pub fn missing_steps_response(&self, from: &StepId, to: &StepId) -> Response {
        Response::MissingSteps(self.document.missing_steps(from, to))
    }

    /// Drop all peer state and rejoin the mesh from scratch
    pub async fn force_resync(&self) -> Result<()> {
        info!(client_id = %self.mesh.client_id(), "forcing resync");
        self.state.lock().reset();
        self.backfills.lock().clear();
        self.mesh.reset_peers().await;
        self.mesh.join().await
    }
}
