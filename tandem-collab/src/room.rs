//! Room orchestrator: the one place that knows both the wire protocol and
//! the in-memory subsystems.
//!
//! ```text
//!            ┌──────────────── Room ────────────────┐
//!  inbound   │                                      │
//! Transport ─┼─► dispatch ─┬─► SyncEngine (per doc) │
//!            │             ├─► PresenceRegistry     │
//!            │             └─► RoomEvent ───────────┼─► application
//!  outbound  │                                      │
//! Transport ◄┼── LocalUpdate / local presence ──────┤
//!            └──────────────────────────────────────┘
//! ```
//!
//! | inbound type | action |
//! |---|---|
//! | `document:update` | `apply_update` on the named document |
//! | `presence` | `apply_awareness_update` unless it is our own |
//! | `join` | seed presence, emit `UserJoined`, send full document state |
//! | `leave` | `handle_remote_leave`, emit `UserLeft` |
//! | `ping` / `pong` / unknown | ignored |

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tandem_core::{
    BatchOutcome, DocumentChange, Emitter, LocalUpdate, Operation, Subscription, SyncEngine,
    SyncError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::presence::{PresenceEvent, PresenceRegistry};
use crate::protocol::{
    now_millis, CursorPosition, DocumentUpdatePayload, JoinPayload, LeavePayload, MessageType,
    PresencePayload, PresenceState, ProtocolError, Selection, TransportMessage, User,
};
use crate::transport::{Transport, TransportError, TransportEvent, WsConnector};

/// Origin recorded for updates merged from the network.
pub const REMOTE_ORIGIN: &str = "remote";

/// Identity of a room and of the local member.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub room_id: String,
    pub project_id: String,
    pub local_user: User,
}

/// Events observed by the application.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Connected,
    Disconnected { clean: bool },
    Reconnecting { attempt: u32, delay: Duration },
    UserJoined(User),
    UserLeft { user_id: String },
    PresenceChanged { user_id: String, state: PresenceState },
    /// A peer's edit was merged into an open document
    DocumentChanged {
        document_id: String,
        change: DocumentChange,
    },
    SyncError(RoomError),
    TransportError(TransportError),
}

/// Room errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomError {
    /// A frame's payload did not match its type
    Protocol(ProtocolError),
    /// An engine refused an update or edit
    Sync {
        document_id: String,
        error: SyncError,
    },
    Transport(TransportError),
    /// The room was destroyed
    Destroyed,
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Sync { document_id, error } => {
                write!(f, "Sync error on document {document_id}: {error}")
            }
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Destroyed => write!(f, "Room destroyed"),
        }
    }
}

impl std::error::Error for RoomError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Sync { error, .. } => Some(error),
            Self::Transport(e) => Some(e),
            Self::Destroyed => None,
        }
    }
}

impl From<ProtocolError> for RoomError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<TransportError> for RoomError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// A collaborative room. Cheap to clone; every clone is the same room.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    info: RoomInfo,
    config: RoomConfig,
    transport: Transport,
    presence: PresenceRegistry,
    documents: Mutex<HashMap<String, OpenDocument>>,
    events: Emitter<RoomEvent>,
    /// Transport and presence listeners owned by the room.
    wiring: Mutex<Vec<Subscription>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

struct OpenDocument {
    engine: Arc<SyncEngine>,
    /// Dropped before the engine is closed.
    listeners: Vec<Subscription>,
}

impl Room {
    /// Create a room around an existing transport. Nothing is sent until
    /// [`Room::connect`].
    pub fn new(info: RoomInfo, transport: Transport, config: RoomConfig) -> Self {
        let presence = PresenceRegistry::new(info.local_user.clone(), config.idle_timeout());
        let inner = Arc::new(RoomInner {
            info,
            config,
            transport,
            presence,
            documents: Mutex::new(HashMap::new()),
            events: Emitter::new(),
            wiring: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let on_transport = inner.transport.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_event(event);
            }
        });
        let weak = Arc::downgrade(&inner);
        let on_presence = inner.presence.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_presence_event(event);
            }
        });
        lock(&inner.wiring).extend([on_transport, on_presence]);

        Self { inner }
    }

    /// Create a room that talks to `{server_url}/rooms/{room_id}` over
    /// WebSocket.
    pub fn with_websocket(server_url: &str, info: RoomInfo, config: RoomConfig) -> Self {
        let url = Transport::room_url(server_url, &info.room_id);
        let transport = Transport::new(
            info.room_id.clone(),
            url,
            Arc::new(WsConnector::new()),
            config.transport(),
        );
        Self::new(info, transport, config)
    }

    /// Connect the transport. The `join` announcement goes out once the
    /// link is up, and again after every reconnect.
    pub async fn connect(&self) -> Result<(), RoomError> {
        if self.is_destroyed() {
            return Err(RoomError::Destroyed);
        }
        self.inner.start_sweeper();
        self.inner.transport.connect().await?;
        Ok(())
    }

    /// Leave the room, disconnect, and close every document. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let room_id = &self.inner.info.room_id;
        log::info!("Destroying room {room_id}");

        if self.inner.transport.is_connected() {
            match TransportMessage::leave(room_id.as_str(), &self.inner.info.local_user.id) {
                Ok(leave) => {
                    self.inner.transport.send(leave);
                }
                Err(e) => log::warn!("Could not encode leave for room {room_id}: {e}"),
            }
        }
        self.inner.transport.disconnect();

        lock(&self.inner.wiring).clear();
        if let Some(sweeper) = lock(&self.inner.sweeper).take() {
            sweeper.abort();
        }
        self.inner.close_all_documents();
        self.inner.presence.clear_listeners();
        self.inner.events.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Whether the transport is connected.
    pub fn is_online(&self) -> bool {
        self.inner.transport.is_connected()
    }

    // ── Documents ───────────────────────────────────────────────

    /// Open a document, or return the already-open one. `initial_content`
    /// only seeds a newly created replica.
    pub fn open_document(
        &self,
        document_id: &str,
        initial_content: &str,
    ) -> Result<DocumentHandle, RoomError> {
        if self.is_destroyed() {
            return Err(RoomError::Destroyed);
        }
        let mut documents = lock(&self.inner.documents);
        if let Some(open) = documents.get(document_id) {
            return Ok(DocumentHandle::new(&open.engine));
        }

        let engine = SyncEngine::with_strategy(
            document_id,
            self.inner.info.local_user.id.as_str(),
            initial_content,
            self.inner.config.conflict_strategy,
        )
        .map_err(|error| RoomError::Sync {
            document_id: document_id.to_string(),
            error,
        })?;
        let engine = Arc::new(engine);
        engine.set_online(self.inner.transport.is_connected());

        let weak = Arc::downgrade(&self.inner);
        let on_update = engine.on_update(move |update| {
            if let Some(inner) = weak.upgrade() {
                inner.broadcast_update(update);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        let on_change = engine.on_change(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.events.emit(&RoomEvent::DocumentChanged {
                    document_id: change.document_id.clone(),
                    change: change.clone(),
                });
            }
        });

        log::info!(
            "Opened document {document_id} in room {}",
            self.inner.info.room_id
        );
        let handle = DocumentHandle::new(&engine);
        documents.insert(
            document_id.to_string(),
            OpenDocument {
                engine,
                listeners: vec![on_update, on_change],
            },
        );
        Ok(handle)
    }

    /// Handle to an open document.
    pub fn document(&self, document_id: &str) -> Option<DocumentHandle> {
        lock(&self.inner.documents)
            .get(document_id)
            .map(|open| DocumentHandle::new(&open.engine))
    }

    /// Ids of the open documents, sorted.
    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.documents).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close a document locally. Peers are not notified. Returns whether it
    /// was open.
    pub fn close_document(&self, document_id: &str) -> bool {
        let removed = lock(&self.inner.documents).remove(document_id);
        match removed {
            Some(open) => {
                close(open);
                log::info!("Closed document {document_id}");
                true
            }
            None => false,
        }
    }

    // ── Presence ────────────────────────────────────────────────

    /// Move the local caret and broadcast it.
    pub fn update_cursor(&self, cursor: CursorPosition) -> PresenceState {
        self.inner.presence.update_cursor(cursor)
    }

    /// Replace the local selection and broadcast it.
    pub fn update_selection(&self, selection: Selection) -> PresenceState {
        self.inner.presence.update_selection(selection)
    }

    /// Local member first, then known remote members.
    pub fn users(&self) -> Vec<User> {
        self.inner.presence.users()
    }

    pub fn presence(&self, user_id: &str) -> Option<PresenceState> {
        self.inner.presence.presence(user_id)
    }

    pub fn all_presences(&self) -> Vec<PresenceState> {
        self.inner.presence.all_presences()
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn info(&self) -> &RoomInfo {
        &self.inner.info
    }

    pub fn room_id(&self) -> &str {
        &self.inner.info.room_id
    }

    pub fn project_id(&self) -> &str {
        &self.inner.info.project_id
    }

    pub fn local_user(&self) -> &User {
        &self.inner.info.local_user
    }

    pub fn config(&self) -> &RoomConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    // ── Events ──────────────────────────────────────────────────

    /// Register a listener for room events.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Room events as an async stream. Ends when the room is destroyed.
    pub fn events(&self) -> RoomEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.inner.events.subscribe(move |event: &RoomEvent| {
            let _ = tx.send(event.clone());
        });
        RoomEvents {
            rx,
            _subscription: subscription,
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("room_id", &self.inner.info.room_id)
            .field("transport", &self.inner.transport)
            .field("documents", &self.document_ids())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Receiver side of [`Room::events`].
#[derive(Debug)]
pub struct RoomEvents {
    rx: mpsc::UnboundedReceiver<RoomEvent>,
    _subscription: Subscription,
}

impl RoomEvents {
    pub async fn recv(&mut self) -> Option<RoomEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RoomEvent> {
        self.rx.try_recv().ok()
    }
}

impl RoomInner {
    // ── Transport side ──────────────────────────────────────────

    fn on_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected { clean } => {
                for engine in self.engines() {
                    engine.set_online(false);
                }
                self.presence.clear_remote();
                self.events.emit(&RoomEvent::Disconnected { clean: *clean });
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                self.events.emit(&RoomEvent::Reconnecting {
                    attempt: *attempt,
                    delay: *delay,
                });
            }
            TransportEvent::Message(message) => self.dispatch(message),
            TransportEvent::Error(error) => {
                self.events.emit(&RoomEvent::TransportError(error.clone()));
            }
            TransportEvent::Binary(data) => {
                log::debug!("Ignoring {} byte binary frame", data.len());
            }
            TransportEvent::StateChanged(_) => {}
        }
    }

    fn on_connected(&self) {
        let room_id = self.info.room_id.as_str();
        let local = &self.info.local_user;
        match TransportMessage::join(room_id, local, &self.presence.local_state()) {
            Ok(join) => {
                self.transport.send(join);
            }
            Err(e) => log::warn!("Could not encode join for room {room_id}: {e}"),
        }
        log::info!("Joined room {room_id} as {}", local.id);

        // Catch peers up on anything edited while offline.
        for engine in self.engines() {
            if !engine.is_online() {
                self.send_full_state(&engine);
                engine.set_online(true);
            }
        }

        self.events.emit(&RoomEvent::Connected);
        self.events.emit(&RoomEvent::UserJoined(local.clone()));
    }

    fn dispatch(&self, message: &TransportMessage) {
        log::debug!("Dispatching {} in room {}", message.kind, self.info.room_id);
        let result = match message.kind {
            MessageType::DocumentUpdate => self.handle_document_update(message),
            MessageType::Presence => self.handle_presence(message),
            MessageType::Join => self.handle_join(message),
            MessageType::Leave => self.handle_leave(message),
            MessageType::Ping | MessageType::Pong => Ok(()),
            MessageType::Unknown => {
                log::debug!("Ignoring message of unknown type");
                Ok(())
            }
        };
        if let Err(error) = result {
            log::warn!("Room {}: {error}", self.info.room_id);
            self.events.emit(&RoomEvent::SyncError(error));
        }
    }

    fn handle_document_update(&self, message: &TransportMessage) -> Result<(), RoomError> {
        let payload: DocumentUpdatePayload = message.payload_as()?;
        let Some(engine) = self.engine(&payload.document_id) else {
            log::debug!("Update for unopened document {}", payload.document_id);
            return Ok(());
        };
        engine
            .apply_update(&payload.update, REMOTE_ORIGIN)
            .map(|_| ())
            .map_err(|error| RoomError::Sync {
                document_id: payload.document_id,
                error,
            })
    }

    fn handle_presence(&self, message: &TransportMessage) -> Result<(), RoomError> {
        let payload: PresencePayload = message.payload_as()?;
        if payload.user_id != self.info.local_user.id {
            self.presence
                .apply_awareness_update(&payload.user_id, payload.state);
        }
        Ok(())
    }

    fn handle_join(&self, message: &TransportMessage) -> Result<(), RoomError> {
        let payload: JoinPayload = message.payload_as()?;
        let user = payload.user;
        if user.id == self.info.local_user.id {
            return Ok(());
        }
        log::info!("{} joined room {}", user.id, self.info.room_id);
        let user_id = user.id.clone();
        self.presence
            .handle_remote_presence(&user_id, user.clone(), payload.presence);
        self.events.emit(&RoomEvent::UserJoined(user));

        // Introduce ourselves and bring the newcomer up to date.
        if self.transport.is_connected() {
            match TransportMessage::presence(self.info.room_id.as_str(), &self.presence.local_state()) {
                Ok(msg) => {
                    self.transport.send(msg);
                }
                Err(e) => log::warn!("Could not encode presence: {e}"),
            }
            for engine in self.engines() {
                self.send_full_state(&engine);
            }
        }
        Ok(())
    }

    fn handle_leave(&self, message: &TransportMessage) -> Result<(), RoomError> {
        let payload: LeavePayload = message.payload_as()?;
        log::info!("{} left room {}", payload.user_id, self.info.room_id);
        self.presence.handle_remote_leave(&payload.user_id);
        Ok(())
    }

    // ── Presence side ───────────────────────────────────────────

    fn on_presence_event(&self, event: &PresenceEvent) {
        match event {
            PresenceEvent::LocalChanged(state) => {
                // Stale presence is not worth queueing; join carries it on reconnect.
                if self.transport.is_connected() {
                    match TransportMessage::presence(self.info.room_id.as_str(), state) {
                        Ok(msg) => {
                            self.transport.send(msg);
                        }
                        Err(e) => log::warn!("Could not encode presence: {e}"),
                    }
                }
                self.events.emit(&RoomEvent::PresenceChanged {
                    user_id: state.user_id.clone(),
                    state: state.clone(),
                });
            }
            PresenceEvent::RemoteChanged { user_id, state } => {
                self.events.emit(&RoomEvent::PresenceChanged {
                    user_id: user_id.clone(),
                    state: state.clone(),
                });
            }
            PresenceEvent::RemoteLeft { user_id } => {
                self.events.emit(&RoomEvent::UserLeft {
                    user_id: user_id.clone(),
                });
            }
        }
    }

    fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = lock(&self.sweeper);
        if sweeper.is_some() {
            return;
        }
        let period = (self.config.idle_timeout() / 2).max(Duration::from_millis(100));
        let weak: Weak<RoomInner> = Arc::downgrade(self);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.presence.prune_idle(now_millis());
                inner.refresh_presence();
            }
        }));
    }

    /// Re-announce the local presence so quiet peers do not expire us.
    fn refresh_presence(&self) {
        if !self.transport.is_connected() {
            return;
        }
        let state = self.presence.local_state();
        match TransportMessage::presence(self.info.room_id.as_str(), &state) {
            Ok(msg) => {
                self.transport.send(msg);
            }
            Err(e) => log::warn!("Could not encode presence: {e}"),
        }
    }

    // ── Documents ───────────────────────────────────────────────

    fn broadcast_update(&self, update: &LocalUpdate) {
        match TransportMessage::document_update(
            self.info.room_id.as_str(),
            &update.document_id,
            update.update.clone(),
        ) {
            Ok(msg) => {
                self.transport.send(msg);
            }
            Err(e) => self.events.emit(&RoomEvent::SyncError(e.into())),
        }
    }

    fn send_full_state(&self, engine: &SyncEngine) {
        let update = match engine.state_update(None) {
            Ok(update) => update,
            Err(error) => {
                self.events.emit(&RoomEvent::SyncError(RoomError::Sync {
                    document_id: engine.document_id().to_string(),
                    error,
                }));
                return;
            }
        };
        match TransportMessage::document_update(
            self.info.room_id.as_str(),
            engine.document_id(),
            update,
        ) {
            Ok(msg) => {
                self.transport.send(msg);
            }
            Err(e) => self.events.emit(&RoomEvent::SyncError(e.into())),
        }
    }

    fn engine(&self, document_id: &str) -> Option<Arc<SyncEngine>> {
        lock(&self.documents)
            .get(document_id)
            .map(|open| open.engine.clone())
    }

    fn engines(&self) -> Vec<Arc<SyncEngine>> {
        lock(&self.documents)
            .values()
            .map(|open| open.engine.clone())
            .collect()
    }

    fn close_all_documents(&self) {
        let drained: Vec<OpenDocument> = lock(&self.documents).drain().map(|(_, d)| d).collect();
        for open in drained {
            close(open);
        }
    }
}

impl Drop for RoomInner {
    fn drop(&mut self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
        self.close_all_documents();
    }
}

fn close(open: OpenDocument) {
    let OpenDocument { engine, listeners } = open;
    drop(listeners);
    engine.close();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The application's view of an open document.
///
/// Holds no ownership: once the room closes the document, every call
/// returns [`SyncError::Closed`].
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    document_id: String,
    engine: Weak<SyncEngine>,
}

impl DocumentHandle {
    fn new(engine: &Arc<SyncEngine>) -> Self {
        Self {
            document_id: engine.document_id().to_string(),
            engine: Arc::downgrade(engine),
        }
    }

    fn engine(&self) -> Result<Arc<SyncEngine>, SyncError> {
        match self.engine.upgrade() {
            Some(engine) if !engine.is_closed() => Ok(engine),
            _ => Err(SyncError::Closed),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn is_open(&self) -> bool {
        self.engine().is_ok()
    }

    pub fn insert(&self, position: u32, content: &str) -> Result<u64, SyncError> {
        self.engine()?.insert(position, content)
    }

    pub fn delete(&self, position: u32, length: u32) -> Result<u64, SyncError> {
        self.engine()?.delete(position, length)
    }

    pub fn apply_operation(&self, op: Operation) -> Result<u64, SyncError> {
        self.engine()?.apply_operation(op)
    }

    pub fn apply_batch(&self, ops: &[Operation], origin: &str) -> Result<BatchOutcome, SyncError> {
        self.engine()?.apply_batch(ops, origin)
    }

    pub fn content(&self) -> Result<String, SyncError> {
        Ok(self.engine()?.content())
    }

    pub fn len(&self) -> Result<u32, SyncError> {
        Ok(self.engine()?.len())
    }

    pub fn version(&self) -> Result<u64, SyncError> {
        Ok(self.engine()?.version())
    }

    pub fn is_online(&self) -> Result<bool, SyncError> {
        Ok(self.engine()?.is_online())
    }

    pub fn state_vector(&self) -> Result<Vec<u8>, SyncError> {
        self.engine()?.state_vector()
    }

    pub fn state_update(&self, peer_state_vector: Option<&[u8]>) -> Result<Vec<u8>, SyncError> {
        self.engine()?.state_update(peer_state_vector)
    }

    /// Subscribe to peer edits merged into this document.
    pub fn on_change<F>(&self, listener: F) -> Result<Subscription, SyncError>
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        Ok(self.engine()?.on_change(listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, Frame, Link};
    use futures_util::future::BoxFuture;
    use serde_json::json;

    /// Connector that hands out one prepared link.
    struct OneShot(Mutex<Option<Link>>);

    impl Connector for OneShot {
        fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
            let link = self.0.lock().unwrap().take();
            Box::pin(async move { link.ok_or(TransportError::ConnectFailed("used".into())) })
        }
    }

    fn info(user: &str) -> RoomInfo {
        RoomInfo {
            room_id: "room".into(),
            project_id: "proj".into(),
            local_user: User::with_id(user, user.to_uppercase()),
        }
    }

    /// A room wired to an in-memory link; the returned link is the relay end.
    fn room_with_link(user: &str) -> (Room, Link) {
        room_with_config(user, RoomConfig::default())
    }

    fn room_with_config(user: &str, config: RoomConfig) -> (Room, Link) {
        let (client, relay) = Link::pair();
        let transport = Transport::new(
            "room",
            "mem://room",
            Arc::new(OneShot(Mutex::new(Some(client)))),
            config.transport(),
        );
        (Room::new(info(user), transport, config), relay)
    }

    fn offline_room(user: &str) -> Room {
        let config = RoomConfig::default();
        let transport = Transport::new(
            "room",
            "mem://room",
            Arc::new(OneShot(Mutex::new(None))),
            config.transport(),
        );
        Room::new(info(user), transport, config)
    }

    async fn next_message(relay: &mut Link) -> TransportMessage {
        match relay.incoming.recv().await.expect("link open") {
            Frame::Text(text) => TransportMessage::decode(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn deliver(relay: &Link, message: &TransportMessage) {
        relay
            .outgoing
            .send(Frame::Text(message.encode().unwrap()))
            .unwrap();
    }

    async fn wait_for<F: Fn(&RoomEvent) -> bool>(events: &mut RoomEvents, pred: F) -> RoomEvent {
        loop {
            let event = events.recv().await.expect("room alive");
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_open_document_is_idempotent() {
        let room = offline_room("alice");
        let a = room.open_document("doc", "hello").unwrap();
        let b = room.open_document("doc", "ignored").unwrap();

        a.insert(5, "!").unwrap();
        assert_eq!(b.content().unwrap(), "hello!");
        assert_eq!(room.document_ids(), vec!["doc".to_string()]);
    }

    #[test]
    fn test_offline_edits_are_queued() {
        let room = offline_room("alice");
        let doc = room.open_document("doc", "").unwrap();
        doc.insert(0, "a").unwrap();
        doc.insert(1, "b").unwrap();

        assert!(!room.is_online());
        assert!(!doc.is_online().unwrap());
        assert_eq!(room.transport().queue_len(), 2);
    }

    #[test]
    fn test_handle_after_close_returns_closed() {
        let room = offline_room("alice");
        let doc = room.open_document("doc", "x").unwrap();
        assert!(room.close_document("doc"));
        assert!(!room.close_document("doc"));

        assert!(!doc.is_open());
        assert_eq!(doc.content(), Err(SyncError::Closed));
        assert_eq!(doc.insert(0, "y"), Err(SyncError::Closed));
        assert!(room.document("doc").is_none());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let room = offline_room("alice");
        let doc = room.open_document("doc", "x").unwrap();
        room.destroy();
        room.destroy();

        assert!(room.is_destroyed());
        assert_eq!(doc.content(), Err(SyncError::Closed));
        assert!(matches!(
            room.open_document("other", ""),
            Err(RoomError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_connect_sends_join_then_emits_user_joined() {
        let (room, mut relay) = room_with_link("alice");
        let mut events = room.events();
        room.connect().await.unwrap();

        let join = next_message(&mut relay).await;
        assert_eq!(join.kind, MessageType::Join);
        let payload: JoinPayload = join.payload_as().unwrap();
        assert_eq!(payload.user.id, "alice");

        assert_eq!(events.recv().await, Some(RoomEvent::Connected));
        assert_eq!(
            events.recv().await,
            Some(RoomEvent::UserJoined(User::with_id("alice", "ALICE")))
        );
        assert!(room.is_online());
    }

    #[tokio::test]
    async fn test_local_edit_is_broadcast() {
        let (room, mut relay) = room_with_link("alice");
        room.connect().await.unwrap();
        let _join = next_message(&mut relay).await;

        let doc = room.open_document("doc", "hello").unwrap();
        doc.insert(5, " world").unwrap();

        let update = next_message(&mut relay).await;
        assert_eq!(update.kind, MessageType::DocumentUpdate);
        let payload: DocumentUpdatePayload = update.payload_as().unwrap();
        assert_eq!(payload.document_id, "doc");

        let peer = SyncEngine::new("doc", "bob", "hello").unwrap();
        peer.apply_update(&payload.update, "alice").unwrap();
        assert_eq!(peer.content(), "hello world");
    }

    #[tokio::test]
    async fn test_remote_update_emits_document_changed() {
        let (room, relay) = room_with_link("alice");
        let mut events = room.events();
        let doc = room.open_document("doc", "hello").unwrap();
        room.connect().await.unwrap();

        let peer = SyncEngine::new("doc", "bob", "hello").unwrap();
        let sv = doc.state_vector().unwrap();
        peer.delete(0, 5).unwrap();
        let update = peer.state_update(Some(&sv)).unwrap();
        deliver(
            &relay,
            &TransportMessage::document_update("room", "doc", update).unwrap(),
        );

        let event = wait_for(&mut events, |e| matches!(e, RoomEvent::DocumentChanged { .. })).await;
        match event {
            RoomEvent::DocumentChanged { document_id, change } => {
                assert_eq!(document_id, "doc");
                assert_eq!(change.origin, REMOTE_ORIGIN);
                assert_eq!(change.ops, vec![Operation::delete(0, 5)]);
            }
            _ => unreachable!(),
        }
        assert_eq!(doc.content().unwrap(), "");
    }

    #[tokio::test]
    async fn test_missing_document_id_is_sync_error() {
        let (room, relay) = room_with_link("alice");
        let mut events = room.events();
        room.connect().await.unwrap();

        let mut bad = TransportMessage::ping("room");
        bad.kind = MessageType::DocumentUpdate;
        bad.payload = json!({ "update": [1, 2, 3] });
        deliver(&relay, &bad);
        // Dispatch keeps going after the bad frame.
        let bob = User::with_id("bob", "Bob");
        deliver(
            &relay,
            &TransportMessage::join("room", &bob, &PresenceState::new("bob")).unwrap(),
        );

        let event = wait_for(&mut events, |e| matches!(e, RoomEvent::SyncError(_))).await;
        assert!(matches!(
            event,
            RoomEvent::SyncError(RoomError::Protocol(ProtocolError::InvalidPayload { .. }))
        ));
        let event = wait_for(&mut events, |e| matches!(e, RoomEvent::UserJoined(u) if u.id == "bob")).await;
        assert_eq!(event, RoomEvent::UserJoined(bob));
    }

    #[tokio::test]
    async fn test_undecodable_update_is_sync_error() {
        let (room, relay) = room_with_link("alice");
        let mut events = room.events();
        let doc = room.open_document("doc", "keep").unwrap();
        room.connect().await.unwrap();

        deliver(
            &relay,
            &TransportMessage::document_update("room", "doc", vec![0xFF, 0xFE, 0xFD]).unwrap(),
        );
        let bob = User::with_id("bob", "Bob");
        deliver(
            &relay,
            &TransportMessage::join("room", &bob, &PresenceState::new("bob")).unwrap(),
        );

        let event = wait_for(&mut events, |e| matches!(e, RoomEvent::SyncError(_))).await;
        match event {
            RoomEvent::SyncError(RoomError::Sync { document_id, error }) => {
                assert_eq!(document_id, "doc");
                assert!(matches!(error, SyncError::Decode(_)), "got {error:?}");
            }
            other => panic!("unexpected {other:?}"),
        }
        wait_for(&mut events, |e| matches!(e, RoomEvent::UserJoined(u) if u.id == "bob")).await;
        assert_eq!(doc.content().unwrap(), "keep");
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_refreshed_while_connected() {
        let config = RoomConfig {
            idle_timeout: 1_000,
            ..RoomConfig::default()
        };
        let (room, mut relay) = room_with_config("alice", config);
        room.connect().await.unwrap();
        assert_eq!(next_message(&mut relay).await.kind, MessageType::Join);

        let start = tokio::time::Instant::now();
        for _ in 0..2 {
            let refresh = next_message(&mut relay).await;
            assert_eq!(refresh.kind, MessageType::Presence);
            let payload: PresencePayload = refresh.payload_as().unwrap();
            assert_eq!(payload.user_id, "alice");
        }
        // Both refreshes land inside one idle window.
        assert!(start.elapsed() <= Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_join_and_leave_track_members() {
        let (room, mut relay) = room_with_link("alice");
        let mut events = room.events();
        room.open_document("doc", "shared").unwrap();
        room.connect().await.unwrap();
        let _join = next_message(&mut relay).await;
        // Offline document catches up once connected.
        let catch_up = next_message(&mut relay).await;
        assert_eq!(catch_up.kind, MessageType::DocumentUpdate);

        let bob = User::with_id("bob", "Bob");
        deliver(
            &relay,
            &TransportMessage::join("room", &bob, &PresenceState::new("bob")).unwrap(),
        );
        wait_for(&mut events, |e| matches!(e, RoomEvent::UserJoined(u) if u.id == "bob")).await;
        assert_eq!(room.users().len(), 2);

        // Newcomer gets our presence and the full document.
        assert_eq!(next_message(&mut relay).await.kind, MessageType::Presence);
        assert_eq!(next_message(&mut relay).await.kind, MessageType::DocumentUpdate);

        deliver(&relay, &TransportMessage::leave("room", "bob").unwrap());
        let left = wait_for(&mut events, |e| matches!(e, RoomEvent::UserLeft { .. })).await;
        assert_eq!(
            left,
            RoomEvent::UserLeft {
                user_id: "bob".into()
            }
        );
        assert!(room.presence("bob").is_none());
    }

    #[tokio::test]
    async fn test_own_presence_echo_ignored() {
        let (room, relay) = room_with_link("alice");
        let mut events = room.events();
        room.connect().await.unwrap();

        let mut echo = PresenceState::new("alice");
        echo.cursor = Some(CursorPosition {
            document_id: None,
            offset: 99,
        });
        deliver(&relay, &TransportMessage::presence("room", &echo).unwrap());
        deliver(&relay, &TransportMessage::leave("room", "nobody").unwrap());
        let carol = User::with_id("carol", "Carol");
        deliver(
            &relay,
            &TransportMessage::join("room", &carol, &PresenceState::new("carol")).unwrap(),
        );
        wait_for(&mut events, |e| matches!(e, RoomEvent::UserJoined(u) if u.id == "carol")).await;

        assert!(room.presence("alice").unwrap().cursor.is_none());
    }

    #[tokio::test]
    async fn test_remote_disconnect_clears_presence() {
        let (room, relay) = room_with_link("alice");
        let mut events = room.events();
        room.connect().await.unwrap();

        let bob = User::with_id("bob", "Bob");
        deliver(
            &relay,
            &TransportMessage::join("room", &bob, &PresenceState::new("bob")).unwrap(),
        );
        wait_for(&mut events, |e| matches!(e, RoomEvent::UserJoined(u) if u.id == "bob")).await;

        let doc = room.open_document("doc", "").unwrap();
        assert!(doc.is_online().unwrap());

        relay.outgoing.send(Frame::Close { clean: true }).unwrap();
        wait_for(&mut events, |e| matches!(e, RoomEvent::Disconnected { clean: true })).await;

        assert!(room.presence("bob").is_none());
        assert!(!doc.is_online().unwrap());
        // Edits still accepted while offline.
        doc.insert(0, "z").unwrap();
        assert_eq!(doc.content().unwrap(), "z");
    }

    #[tokio::test]
    async fn test_destroy_sends_leave() {
        let (room, mut relay) = room_with_link("alice");
        room.connect().await.unwrap();
        let _join = next_message(&mut relay).await;

        room.destroy();
        let leave = next_message(&mut relay).await;
        assert_eq!(leave.kind, MessageType::Leave);
        let payload: LeavePayload = leave.payload_as().unwrap();
        assert_eq!(payload.user_id, "alice");
        assert_eq!(
            relay.incoming.recv().await,
            Some(Frame::Close { clean: true })
        );
        assert!(!room.is_online());
    }
}
