//! # tandem-collab: Rooms, presence and transport for Tandem
//!
//! Connects [`tandem_core::SyncEngine`] replicas through a relay server.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON over WebSocket   ┌──────────────┐
//! │ Room (alice) │ ◄─────────────────────► │    relay     │
//! └──────┬───────┘    /rooms/{roomId}      └──────┬───────┘
//!        │                                        │
//!   ┌────┴─────────────┐                   other members
//!   │ Transport        │  reconnect, backoff, offline FIFO
//!   │ PresenceRegistry │  cursors, selections, idle expiry
//!   │ SyncEngine × N   │  one per open document
//!   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and payloads
//! - [`config`]: `RoomConfig` / `TransportConfig`
//! - [`transport`]: connection state machine and WebSocket connector
//! - [`presence`]: presence registry
//! - [`room`]: the orchestrator applications talk to

pub mod config;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod transport;

// Re-exports for convenience
pub use config::{ConfigError, RoomConfig, TransportConfig, MAX_BACKOFF};
pub use presence::{PresenceEvent, PresenceRegistry};
pub use protocol::{
    now_millis, CursorPosition, DocumentUpdatePayload, HeartbeatPayload, JoinPayload,
    LeavePayload, MessageType, PresencePayload, PresenceState, ProtocolError, Selection,
    TransportMessage, User,
};
pub use room::{DocumentHandle, Room, RoomError, RoomEvent, RoomEvents, RoomInfo, REMOTE_ORIGIN};
pub use transport::{
    backoff_delay, ConnectionState, Connector, Frame, Link, OutboundQueue, SendOutcome, Transport,
    TransportError, TransportEvent, WsConnector,
};
