/// Online/offline detection and the pre-save barrier
///
/// Native online/offline signals are unreliable (a closed lid can drop every
/// peer channel without an offline event), so peer connection states are
/// sampled as well. Coming back online checks the local branch against the
/// server copy before saves may proceed.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    CollabEvent, CollaborationError, ConflictHandlers, ConflictReport, ConnectivityConfig,
    DocumentEngine, HistoryReconciliationProtocol, HistoryServer, PeerSessionManager, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Signals fed in by the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
    BrowserOffline,
    BrowserOnline,
    /// Mouse or keyboard activity; only counts if the platform reports a network
    UserActivity { navigator_online: bool },
}

/// Outcome of comparing the local branch against the server copy
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryCheck {
    Consistent,
    Diverged(ConflictReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierState {
    Open,
    Pending,
    Rejected(String),
}

/// Saves wait on this while the connection is suspect
pub struct SaveBarrier {
    state: watch::Sender<BarrierState>,
}

impl Default for SaveBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl SaveBarrier {
    pub fn new() -> Self {
        let (state, _) = watch::channel(BarrierState::Open);
        Self { state }
    }

    pub fn state(&self) -> BarrierState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state() == BarrierState::Open
    }

    pub fn close(&self) {
        self.state.send_replace(BarrierState::Pending);
    }

    pub fn open(&self) {
        self.state.send_replace(BarrierState::Open);
    }

    pub fn reject(&self, reason: impl Into<String>) {
        self.state.send_replace(BarrierState::Rejected(reason.into()));
    }

    /// Resolves once the barrier opens; fails if it gets rejected
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            match rx.borrow_and_update().clone() {
                BarrierState::Open => return Ok(()),
                BarrierState::Rejected(reason) => {
                    return Err(CollaborationError::SaveRejected(reason))
                }
                BarrierState::Pending => {}
            }
            rx.changed()
                .await
                .map_err(|_| CollaborationError::SessionStopped)?;
        }
    }
}

pub struct ConnectivityMonitor {
    mesh: Arc<PeerSessionManager>,
    protocol: Arc<HistoryReconciliationProtocol>,
    document: Arc<dyn DocumentEngine>,
    server: Arc<dyn HistoryServer>,
    conflicts: ConflictHandlers,
    events: broadcast::Sender<CollabEvent>,
    config: ConnectivityConfig,
    status: Mutex<NetworkStatus>,
    /// When every known peer was first seen down
    all_down_since: Mutex<Option<Instant>>,
    barrier: SaveBarrier,
    recovery: tokio::sync::Mutex<()>,
}

impl ConnectivityMonitor {
    pub fn new(
        mesh: Arc<PeerSessionManager>,
        protocol: Arc<HistoryReconciliationProtocol>,
        document: Arc<dyn DocumentEngine>,
        server: Arc<dyn HistoryServer>,
        conflicts: ConflictHandlers,
        events: broadcast::Sender<CollabEvent>,
        config: ConnectivityConfig,
    ) -> Self {
        Self {
            mesh,
            protocol,
            document,
            server,
            conflicts,
            events,
            config,
            status: Mutex::new(NetworkStatus::Online),
            all_down_since: Mutex::new(None),
            barrier: SaveBarrier::new(),
            recovery: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.lock()
    }

    pub fn is_online(&self) -> bool {
        self.status() == NetworkStatus::Online
    }

    pub fn barrier(&self) -> &SaveBarrier {
        &self.barrier
    }

    /// Periodically sample peer connection states until the mesh stops
    pub fn spawn_sampler(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.sample_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if monitor.mesh.is_stopped() {
                    break;
                }
                monitor.sample();
            }
        })
    }

    /// One sampler tick. Goes offline once every known peer has been in a
    /// terminal state for the whole grace period.
    pub fn sample(&self) -> NetworkStatus {
        let states = self.mesh.connection_states();
        let all_down = !states.is_empty() && states.iter().all(|s| s.is_terminal());

        if !all_down {
            *self.all_down_since.lock() = None;
            return self.status();
        }

        let now = Instant::now();
        let since = *self.all_down_since.lock().get_or_insert(now);
        if now.duration_since(since) >= self.config.offline_grace() {
            self.go_offline("every peer connection is down");
        } else {
            debug!(peers = states.len(), "all peers down, within grace period");
        }
        self.status()
    }

    pub async fn handle_signal(&self, signal: NetworkSignal) {
        debug!(?signal, "network signal");
        match signal {
            NetworkSignal::BrowserOffline => self.go_offline("offline event"),
            NetworkSignal::BrowserOnline => {
                if !self.is_online() {
                    let _ = self.go_online().await;
                }
            }
            NetworkSignal::UserActivity { navigator_online } => {
                if navigator_online && !self.is_online() {
                    let _ = self.go_online().await;
                }
            }
        }
    }

    pub fn go_offline(&self, reason: &str) {
        {
            let mut status = self.status.lock();
            if *status == NetworkStatus::Offline {
                return;
            }
            *status = NetworkStatus::Offline;
        }
        warn!(client_id = %self.mesh.client_id(), reason, "going offline");
        self.barrier.close();
        self.protocol.set_paused(true);
        let _ = self.events.send(CollabEvent::Offline);
    }

    /// Check the local branch against the server and resume. On failure the
    /// barrier is rejected and the monitor stays offline for the next signal.
    pub async fn go_online(&self) -> Result<HistoryCheck> {
        let _guard = self.recovery.lock().await;
        if self.is_online() {
            return Ok(HistoryCheck::Consistent);
        }
        self.barrier.close();

        let check = match self.ensure_common_history().await {
            Ok(check) => check,
            Err(err) => {
                error!(error = %err, "history check failed, staying offline");
                self.barrier.reject(err.to_string());
                return Err(err);
            }
        };

        *self.status.lock() = NetworkStatus::Online;
        *self.all_down_since.lock() = None;
        self.protocol.set_paused(false);

        let pruned = self.mesh.prune_terminal_peers().await;
        if !pruned.is_empty() {
            debug!(peers = pruned.len(), "dropped peers that went away while offline");
        }

        if check == HistoryCheck::Consistent && self.mesh.connected_peers().is_empty() {
            if let Err(err) = self.mesh.join().await {
                warn!(error = %err, "re-announce after reconnection failed");
            }
        }

        info!(client_id = %self.mesh.client_id(), "back online");
        self.barrier.open();
        let _ = self.events.send(CollabEvent::Online);
        Ok(check)
    }

    /// Ask the server whether our branch still contains its head. If not,
    /// report the conflict, adopt the server copy and rejoin from scratch.
    pub async fn ensure_common_history(&self) -> Result<HistoryCheck> {
        let local = self.document.snapshot();
        let Some(server_copy) = self
            .server
            .ensure_common_history(local.history_ids.clone())
            .await?
        else {
            debug!("local history consistent with server");
            return Ok(HistoryCheck::Consistent);
        };

        let report = ConflictReport::new(server_copy.clone(), local);
        warn!(
            lost_steps = report.lost_local_changes().len(),
            "local history diverged from the server copy"
        );
        self.conflicts.notify(&report);
        let _ = self.events.send(CollabEvent::Conflict(report.clone()));

        self.document.replace_content(server_copy);
        if let Err(err) = self.protocol.force_resync().await {
            error!(error = %err, "rejoin after conflict failed");
        }
        Ok(HistoryCheck::Diverged(report))
    }
}
