/// The collaborative session: wires identity, mesh, history protocol, presence
/// and connectivity together and owns the inbound dispatch loop.
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{TransportBootstrap, TransportEvent};
use crate::{
    ClientId, ClientProfile, ClientSession, CollabConfig, CollaborationError, ConflictHandlers,
    ConflictReport, ConnectivityMonitor, DocumentEngine, DocumentEvent, Envelope, HistoryServer,
    HistoryReconciliationProtocol, NetworkSignal, Notification, PeerInfo,
    PeerSessionManager, Request, Response, Result, SelectionBroadcaster, SessionRegistry,
    SyncPhase, Transport,
};

/// What the editor shell gets told about
#[derive(Debug, Clone)]
pub enum CollabEvent {
    PeerJoined(ClientId),
    PeerRemoved(ClientId),
    /// Degraded collaboration; local editing continues
    SignalingUnavailable(String),
    Offline,
    Online,
    /// Local changes were discarded in favour of the server copy
    Conflict(ConflictReport),
    Synced,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub document_id: String,
    pub profile: ClientProfile,
    pub config: CollabConfig,
    /// Fixed identity instead of a freshly generated one
    pub identity: Option<ClientSession>,
}

impl SessionOptions {
    pub fn new(document_id: impl Into<String>, profile: ClientProfile) -> Self {
        Self {
            document_id: document_id.into(),
            profile,
            config: CollabConfig::default(),
            identity: None,
        }
    }

    pub fn with_config(mut self, config: CollabConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_identity(mut self, identity: ClientSession) -> Self {
        self.identity = Some(identity);
        self
    }
}

pub struct CollabSession {
    document_id: String,
    client: ClientSession,
    registry: Arc<SessionRegistry>,
    document: Arc<dyn DocumentEngine>,
    server: Arc<dyn HistoryServer>,
    mesh: Arc<PeerSessionManager>,
    protocol: Arc<HistoryReconciliationProtocol>,
    monitor: Arc<ConnectivityMonitor>,
    conflicts: ConflictHandlers,
    events: broadcast::Sender<CollabEvent>,
    signaling_error: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl CollabSession {
    /// Register the document, connect the transport and join the mesh.
    ///
    /// Fails if the document already has a session in `registry` or the relay
    /// cannot be reached at all. A failed join announcement only degrades
    /// collaboration; see `signaling_error`.
    pub async fn start(
        document: Arc<dyn DocumentEngine>,
        transport: Arc<dyn Transport>,
        server: Arc<dyn HistoryServer>,
        registry: Arc<SessionRegistry>,
        options: SessionOptions,
    ) -> Result<Arc<Self>> {
        let SessionOptions {
            document_id,
            profile,
            config,
            identity,
        } = options;

        registry.register(&document_id)?;
        let client = identity.unwrap_or_else(|| ClientSession::new(profile));

        let ice_servers = match registry.ice_servers(server.as_ref()).await {
            Ok(servers) => servers,
            Err(err) => {
                warn!(error = %err, "no ice servers, relying on host candidates");
                Vec::new()
            }
        };

        let bootstrap = TransportBootstrap {
            client_id: client.client_id.clone(),
            start_time: client.start_time,
            ice_servers,
        };
        let inbound = match transport.connect(bootstrap).await {
            Ok(rx) => rx,
            Err(err) => {
                registry.unregister(&document_id);
                return Err(err);
            }
        };

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let conflicts = ConflictHandlers::new();
        let mesh = Arc::new(PeerSessionManager::new(
            client.clone(),
            transport,
            events.clone(),
            config.request_timeout(),
        ));
        let protocol = Arc::new(HistoryReconciliationProtocol::new(
            mesh.clone(),
            document.clone(),
            server.clone(),
            events.clone(),
        ));
        let presence = Arc::new(SelectionBroadcaster::new(
            mesh.clone(),
            document.clone(),
            config.selection_debounce(),
        ));
        let monitor = Arc::new(ConnectivityMonitor::new(
            mesh.clone(),
            protocol.clone(),
            document.clone(),
            server.clone(),
            conflicts.clone(),
            events.clone(),
            config.connectivity.clone(),
        ));

        let session = Arc::new(Self {
            document_id,
            client: client.clone(),
            registry,
            document: document.clone(),
            server,
            mesh: mesh.clone(),
            protocol: protocol.clone(),
            monitor: monitor.clone(),
            conflicts,
            events: events.clone(),
            signaling_error: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let dispatcher = Dispatcher {
            client,
            mesh: mesh.clone(),
            protocol: protocol.clone(),
            presence: presence.clone(),
        };

        {
            let mut tasks = session.tasks.lock();
            tasks.push(tokio::spawn(dispatcher.run(inbound)));
            tasks.push(tokio::spawn(run_local_events(
                document.subscribe(),
                protocol,
                presence.clone(),
            )));
            tasks.push(tokio::spawn(run_presence_cleanup(events.subscribe(), presence)));
            tasks.push(monitor.spawn_sampler());
        }

        if let Err(err) = mesh.join().await {
            warn!(document_id = %session.document_id, error = %err, "collaboration degraded");
            *session.signaling_error.lock() = Some(err.to_string());
        }

        info!(
            document_id = %session.document_id,
            client_id = %session.client.client_id,
            "collaboration session started"
        );
        Ok(session)
    }

    /// Leave the mesh and release the document. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mesh.stop().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.unregister(&self.document_id);
        info!(document_id = %self.document_id, "collaboration session stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn on_conflict<F>(&self, callback: F)
    where
        F: Fn(&ConflictReport) + Send + Sync + 'static,
    {
        self.conflicts.add(callback);
    }

    pub fn events(&self) -> broadcast::Receiver<CollabEvent> {
        self.events.subscribe()
    }

    /// Persist the current document once connectivity is trusted again
    pub async fn save(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(CollaborationError::SessionStopped);
        }
        self.monitor.barrier().wait().await?;
        let snapshot = self.document.snapshot();
        debug!(document_id = %self.document_id, steps = snapshot.history_ids.len(), "saving");
        self.server.save_document(snapshot).await
    }

    pub async fn network_signal(&self, signal: NetworkSignal) {
        if self.is_stopped() {
            return;
        }
        self.monitor.handle_signal(signal).await;
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn client(&self) -> &ClientSession {
        &self.client
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.protocol.phase()
    }

    pub fn peer_count(&self) -> usize {
        self.mesh.peer_count()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.mesh.peers()
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Why the last join announcement failed, if it did
    pub fn signaling_error(&self) -> Option<String> {
        self.signaling_error.lock().clone()
    }
}

/// Routes inbound envelopes and transport events to the components
#[derive(Clone)]
struct Dispatcher {
    client: ClientSession,
    mesh: Arc<PeerSessionManager>,
    protocol: Arc<HistoryReconciliationProtocol>,
    presence: Arc<SelectionBroadcaster>,
}

impl Dispatcher {
    async fn run(self, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            if self.mesh.is_stopped() {
                break;
            }
            match event {
                TransportEvent::Inbound(envelope) => self.dispatch(envelope).await,
                TransportEvent::ChannelOpen(peer) => self.on_channel_open(peer),
                TransportEvent::ConnectionState { peer, state } => {
                    self.mesh.update_state(&peer, state);
                }
                TransportEvent::RelayClosed => {
                    warn!(client_id = %self.client.client_id, "relay connection closed");
                    self.mesh.emit(CollabEvent::SignalingUnavailable(
                        "relay connection closed".to_string(),
                    ));
                }
            }
        }
        debug!(client_id = %self.client.client_id, "dispatch loop finished");
    }

    async fn dispatch(&self, envelope: Envelope) {
        if envelope.from_client_id() == &self.client.client_id {
            return;
        }
        match envelope {
            Envelope::Request {
                from_client_id,
                request_id,
                message,
                ..
            } => {
                debug!(peer = %from_client_id, request = message.name(), request_id, "request");
                let response = self.handle_request(message);
                if let Err(err) = self
                    .mesh
                    .respond(&from_client_id, request_id, response)
                    .await
                {
                    warn!(peer = %from_client_id, error = %err, "could not respond");
                }
            }
            Envelope::Notification {
                from_client_id,
                message,
                ..
            } => self.handle_notification(from_client_id, message).await,
            Envelope::Response {
                request_id,
                message,
                ..
            } => {
                self.mesh.resolve_response(request_id, message);
            }
        }
    }

    fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Hello => Response::Hello {
                start_time: self.client.start_time,
            },
            Request::GetHistoryFromSnapshot => self.protocol.snapshot_response(),
            Request::GetMissingSteps {
                from_step_id,
                to_step_id,
            } => self
                .protocol
                .missing_steps_response(&from_step_id, &to_step_id),
            Request::GetClientName => {
                Response::ClientName(self.client.profile.display_name.clone())
            }
            Request::GetClientAvatar => {
                Response::ClientAvatar(self.client.profile.avatar_url.clone())
            }
            Request::EnsureCommonHistory { .. }
            | Request::FetchDocument
            | Request::SaveDocument(_)
            | Request::GetIceServers => {
                Response::error(format!("{} is served by the server", request.name()))
            }
        }
    }

    async fn handle_notification(&self, from: ClientId, notification: Notification) {
        match notification {
            Notification::Join { start_time } => {
                debug!(peer = %from, start_time, "peer announced");
                self.mesh.on_peer_announced(&from, start_time);
            }
            Notification::HistoryStep(step) => {
                self.protocol.on_remote_step(step);
            }
            Notification::SelectionUpdate(update) => {
                self.presence.on_remote_selection_update(&from, update);
            }
            Notification::Disconnect => {
                self.mesh.remove_peer(&from).await;
            }
            Notification::PeerLeft { client_id } => {
                self.mesh.remove_peer(&client_id).await;
            }
        }
    }

    /// Record the channel and run the handshake off the dispatch loop, since
    /// its responses arrive through this loop
    fn on_channel_open(&self, peer: ClientId) {
        self.mesh.on_channel_open(&peer);
        let this = self.clone();
        tokio::spawn(async move { this.handshake(peer).await });
    }

    async fn handshake(&self, peer: ClientId) {
        let start_time = match self.mesh.request_peer(&peer, Request::Hello, None).await {
            Ok(Response::Hello { start_time }) => start_time,
            Ok(other) => {
                warn!(peer = %peer, response = other.name(), "unexpected handshake response");
                return;
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "handshake failed");
                return;
            }
        };
        self.mesh.set_peer_start_time(&peer, start_time);

        if let Err(err) = self.presence.fetch_profile(&peer).await {
            warn!(peer = %peer, error = %err, "could not fetch peer profile");
        }

        self.protocol.on_peer_ready(&peer, start_time).await;
    }
}

async fn run_local_events(
    mut events: broadcast::Receiver<DocumentEvent>,
    protocol: Arc<HistoryReconciliationProtocol>,
    presence: Arc<SelectionBroadcaster>,
) {
    loop {
        match events.recv().await {
            Ok(DocumentEvent::LocalStep(step)) => {
                protocol.broadcast_local_step(step).await;
            }
            Ok(DocumentEvent::LocalSelection(selection)) => {
                presence.on_local_selection_change(selection);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // peers backfill skipped steps from us on their next gap
                warn!(missed, "local document events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_presence_cleanup(
    mut events: broadcast::Receiver<CollabEvent>,
    presence: Arc<SelectionBroadcaster>,
) {
    loop {
        match events.recv().await {
            Ok(CollabEvent::PeerRemoved(peer)) => presence.on_peer_removed(&peer),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
