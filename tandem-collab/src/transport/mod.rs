//! One logical connection per room.
//!
//! Physical links come and go; the [`Transport`] hides that behind a stable
//! event stream and an outbound FIFO queue so nothing sent while offline is
//! lost.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ok──► Connected
//!      ▲                          │                 │
//!      │                       failure        unclean close
//!      │                          │                 ▼
//!      └──budget exhausted─── Reconnecting ◄────────┘
//!                                 │   ▲
//!                         timer   ▼   │ failure
//!                              Connecting
//! ```
//!
//! Backoff for attempt `n` is `min(base * 2^(n-1), 30s)`.

mod link;
mod queue;
mod ws;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tandem_core::{Emitter, Subscription};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::protocol::{ProtocolError, TransportMessage};

pub use link::{Connector, Frame, Link};
pub use queue::OutboundQueue;
pub use ws::WsConnector;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Link established and the offline queue flushed
    Connected,
    /// Link lost or closed
    Disconnected { clean: bool },
    /// A reconnect attempt is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Parsed inbound message
    Message(TransportMessage),
    /// Raw inbound binary frame
    Binary(Vec<u8>),
    Error(TransportError),
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Handshake did not finish within the connect timeout
    Timeout(Duration),
    ConnectFailed(String),
    /// Operation needs a live link
    NotConnected,
    /// `disconnect()` raced an in-flight connect
    Cancelled,
    Protocol(ProtocolError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "Connection timeout after {after:?}"),
            Self::ConnectFailed(e) => write!(f, "Connection failed: {e}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Cancelled => write!(f, "Connection attempt cancelled"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// What happened to an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the live link
    Sent,
    /// Stored in the outbound queue until the next connect
    Queued,
    /// Discarded; an `Error` event describes why
    Dropped,
}

/// Reconnect delay for the `attempt`-th retry (1-based).
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

/// Handle onto a room's connection. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    room_id: String,
    url: String,
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    shared: Mutex<Shared>,
    events: Emitter<TransportEvent>,
}

struct Shared {
    state: ConnectionState,
    /// Consecutive failed reconnects since the last successful connect
    attempts: u32,
    queue: OutboundQueue,
    outgoing: Option<mpsc::UnboundedSender<Frame>>,
    /// Bumped whenever the current link or pending attempt is superseded;
    /// tasks holding an older value do nothing.
    session: u64,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Transport {
    /// Create a disconnected transport for `room_id` that dials `url`.
    pub fn new(
        room_id: impl Into<String>,
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: TransportConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                room_id: room_id.into(),
                url: url.into(),
                config,
                connector,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    attempts: 0,
                    queue: OutboundQueue::new(),
                    outgoing: None,
                    session: 0,
                    reader: None,
                    heartbeat: None,
                    reconnect: None,
                }),
                events: Emitter::new(),
            }),
        }
    }

    /// Endpoint for a room on a relay server.
    pub fn room_url(server_url: &str, room_id: &str) -> String {
        format!("{}/rooms/{}", server_url.trim_end_matches('/'), room_id)
    }

    /// Open the link.
    ///
    /// No-op when already connected or connecting. A pending reconnect timer
    /// is cancelled and replaced by this attempt. On failure the transport
    /// is left disconnected.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let Some(session) = self.inner.begin_connect() else {
            return Ok(());
        };
        match self.inner.dial().await {
            Ok(link) => self.inner.establish(session, link),
            Err(error) => {
                self.inner.abort_connect(session, error.clone());
                Err(error)
            }
        }
    }

    /// Close the link and stop all timers. Queued messages are kept for the
    /// next `connect()`. Idempotent.
    pub fn disconnect(&self) {
        let mut events = Vec::new();
        {
            let mut shared = self.inner.lock();
            shared.session += 1;
            shared.abort_tasks();
            if let Some(tx) = shared.outgoing.take() {
                let _ = tx.send(Frame::Close { clean: true });
            }
            shared.attempts = 0;

            let previous = shared.state;
            shared.state = ConnectionState::Disconnected;
            if previous != ConnectionState::Disconnected {
                log::info!("Disconnected from {}", self.inner.url);
                events.push(TransportEvent::StateChanged(ConnectionState::Disconnected));
                if previous == ConnectionState::Connected {
                    events.push(TransportEvent::Disconnected { clean: true });
                }
            }
        }
        self.inner.emit_all(events);
    }

    /// Send `message` now, or queue it if the link is down.
    pub fn send(&self, message: TransportMessage) -> SendOutcome {
        let error = {
            let mut shared = self.inner.lock();
            match shared.transmit(&message) {
                Ok(true) => return SendOutcome::Sent,
                Ok(false) => {
                    let kind = message.kind;
                    shared.queue.push(message);
                    log::debug!("Queued {kind} message ({} pending)", shared.queue.len());
                    return SendOutcome::Queued;
                }
                Err(e) => e,
            }
        };
        log::warn!("Dropping unencodable message: {error}");
        self.inner.events.emit(&TransportEvent::Error(error.into()));
        SendOutcome::Dropped
    }

    /// Send raw bytes. Never queued: while offline this emits an `Error`
    /// event instead.
    pub fn send_binary(&self, data: Vec<u8>) -> SendOutcome {
        let sent = {
            let shared = self.inner.lock();
            match (&shared.state, &shared.outgoing) {
                (ConnectionState::Connected, Some(tx)) => tx.send(Frame::Binary(data)).is_ok(),
                _ => false,
            }
        };
        if sent {
            SendOutcome::Sent
        } else {
            self.inner
                .events
                .emit(&TransportEvent::Error(TransportError::NotConnected));
            SendOutcome::Dropped
        }
    }

    /// Register an event listener.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Messages waiting for the next connect.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("Transport")
            .field("url", &self.inner.url)
            .field("state", &shared.state)
            .field("queued", &shared.queue.len())
            .field("attempts", &shared.attempts)
            .finish()
    }
}

impl Shared {
    /// Write to the live link. `Ok(false)` means there is none.
    fn transmit(&self, message: &TransportMessage) -> Result<bool, ProtocolError> {
        let Some(tx) = self.outgoing.as_ref() else {
            return Ok(false);
        };
        if self.state != ConnectionState::Connected {
            return Ok(false);
        }
        let text = message.encode()?;
        Ok(tx.send(Frame::Text(text)).is_ok())
    }

    fn abort_tasks(&mut self) {
        for task in [
            self.reader.take(),
            self.heartbeat.take(),
            self.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_all(&self, events: Vec<TransportEvent>) {
        for event in &events {
            self.events.emit(event);
        }
    }

    /// Move to Connecting. `None` when a connect is already live or pending.
    fn begin_connect(&self) -> Option<u64> {
        let session = {
            let mut shared = self.lock();
            match shared.state {
                ConnectionState::Connected | ConnectionState::Connecting => return None,
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            }
            if let Some(timer) = shared.reconnect.take() {
                timer.abort();
            }
            shared.session += 1;
            shared.state = ConnectionState::Connecting;
            shared.session
        };
        log::info!("Connecting to {}", self.url);
        self.events
            .emit(&TransportEvent::StateChanged(ConnectionState::Connecting));
        Some(session)
    }

    async fn dial(&self) -> Result<Link, TransportError> {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.connector.connect(&self.url)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Adopt a freshly opened link: flush the queue, start the reader and
    /// heartbeat tasks.
    fn establish(self: &Arc<Self>, session: u64, link: Link) -> Result<(), TransportError> {
        let mut events = Vec::new();
        {
            let mut shared = self.lock();
            if shared.session != session || shared.state != ConnectionState::Connecting {
                let _ = link.outgoing.send(Frame::Close { clean: true });
                return Err(TransportError::Cancelled);
            }

            let Link { outgoing, incoming } = link;
            shared.attempts = 0;
            shared.state = ConnectionState::Connected;
            shared.outgoing = Some(outgoing);

            let queued = shared.queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued messages", queued.len());
                let mut pending = queued.into_iter();
                while let Some(message) = pending.next() {
                    match shared.transmit(&message) {
                        Ok(true) => {}
                        Ok(false) => {
                            // Link died mid-flush; the reader will notice.
                            let mut rest = vec![message];
                            rest.extend(pending);
                            shared.queue.requeue_front(rest);
                            break;
                        }
                        Err(e) => events.push(TransportEvent::Error(e.into())),
                    }
                }
            }

            let weak = Arc::downgrade(self);
            shared.reader = Some(tokio::spawn(read_loop(weak.clone(), session, incoming)));
            let period = self.config.heartbeat_interval;
            shared.heartbeat = if period.is_zero() {
                log::debug!("Heartbeat disabled for {}", self.url);
                None
            } else {
                Some(tokio::spawn(heartbeat_loop(weak, session, period)))
            };

            events.push(TransportEvent::StateChanged(ConnectionState::Connected));
            events.push(TransportEvent::Connected);
        }
        log::info!("Connected to {}", self.url);
        self.emit_all(events);
        Ok(())
    }

    /// A user-initiated connect failed.
    fn abort_connect(&self, session: u64, error: TransportError) {
        let mut events = vec![TransportEvent::Error(error.clone())];
        {
            let mut shared = self.lock();
            if shared.session == session && shared.state == ConnectionState::Connecting {
                shared.state = ConnectionState::Disconnected;
                events.push(TransportEvent::StateChanged(ConnectionState::Disconnected));
            }
        }
        log::warn!("Connect to {} failed: {error}", self.url);
        self.emit_all(events);
    }

    /// The link for `session` reported closure.
    fn on_close(self: &Arc<Self>, session: u64, clean: bool) {
        let mut events = Vec::new();
        {
            let mut shared = self.lock();
            if shared.session != session || shared.state != ConnectionState::Connected {
                return;
            }
            shared.outgoing = None;
            // The reader is the caller; detach rather than abort it.
            shared.reader = None;
            if let Some(heartbeat) = shared.heartbeat.take() {
                heartbeat.abort();
            }
            events.push(TransportEvent::Disconnected { clean });

            if clean {
                log::info!("Connection to {} closed", self.url);
                shared.state = ConnectionState::Disconnected;
                events.push(TransportEvent::StateChanged(ConnectionState::Disconnected));
            } else {
                log::warn!("Connection to {} lost", self.url);
                self.schedule_reconnect(&mut shared, &mut events);
            }
        }
        self.emit_all(events);
    }

    /// Arm the reconnect timer, or settle at Disconnected once the budget
    /// is spent.
    fn schedule_reconnect(self: &Arc<Self>, shared: &mut Shared, events: &mut Vec<TransportEvent>) {
        shared.session += 1;
        if shared.attempts >= self.config.max_reconnect_attempts {
            log::warn!(
                "Giving up on {} after {} reconnect attempts",
                self.url,
                shared.attempts
            );
            shared.state = ConnectionState::Disconnected;
            events.push(TransportEvent::StateChanged(ConnectionState::Disconnected));
            return;
        }

        shared.attempts += 1;
        let attempt = shared.attempts;
        let delay = backoff_delay(
            self.config.reconnect_interval,
            attempt,
            self.config.max_backoff,
        );
        let session = shared.session;
        shared.state = ConnectionState::Reconnecting;
        log::info!("Reconnect attempt {attempt} to {} in {delay:?}", self.url);

        let weak = Arc::downgrade(self);
        shared.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.retry(session).await;
            }
        }));

        events.push(TransportEvent::StateChanged(ConnectionState::Reconnecting));
        events.push(TransportEvent::Reconnecting { attempt, delay });
    }

    async fn retry(self: Arc<Self>, session: u64) {
        {
            let mut shared = self.lock();
            if shared.session != session || shared.state != ConnectionState::Reconnecting {
                return;
            }
            // This task is the timer; detach its own handle.
            shared.reconnect = None;
            shared.state = ConnectionState::Connecting;
        }
        self.events
            .emit(&TransportEvent::StateChanged(ConnectionState::Connecting));

        let error = match self.dial().await {
            Ok(link) => match self.establish(session, link) {
                Ok(()) => return,
                Err(TransportError::Cancelled) => return,
                Err(e) => e,
            },
            Err(e) => e,
        };

        log::warn!("Reconnect to {} failed: {error}", self.url);
        let mut events = vec![TransportEvent::Error(error)];
        {
            let mut shared = self.lock();
            if shared.session != session || shared.state != ConnectionState::Connecting {
                return;
            }
            self.schedule_reconnect(&mut shared, &mut events);
        }
        self.emit_all(events);
    }

    fn on_text(&self, text: &str) {
        match TransportMessage::decode(text) {
            Ok(message) => self.events.emit(&TransportEvent::Message(message)),
            Err(e) => {
                log::warn!("Malformed frame from {}: {e}", self.url);
                self.events.emit(&TransportEvent::Error(e.into()));
            }
        }
    }

    /// Heartbeat send: never queued.
    fn ping(&self, session: u64) {
        let shared = self.lock();
        if shared.session != session {
            return;
        }
        log::trace!("Heartbeat ping to {}", self.url);
        let _ = shared.transmit(&TransportMessage::ping(self.room_id.as_str()));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self
            .shared
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        shared.abort_tasks();
        if let Some(tx) = shared.outgoing.take() {
            let _ = tx.send(Frame::Close { clean: true });
        }
    }
}

async fn read_loop(inner: Weak<Inner>, session: u64, mut incoming: mpsc::UnboundedReceiver<Frame>) {
    let clean = loop {
        let frame = incoming.recv().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match frame {
            Some(Frame::Text(text)) => inner.on_text(&text),
            Some(Frame::Binary(data)) => inner.events.emit(&TransportEvent::Binary(data)),
            Some(Frame::Close { clean }) => break clean,
            None => break false,
        }
    };
    if let Some(inner) = inner.upgrade() {
        inner.on_close(session, clean);
    }
}

async fn heartbeat_loop(inner: Weak<Inner>, session: u64, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        match inner.upgrade() {
            Some(inner) => inner.ping(session),
            None => return,
        }
    }
}
