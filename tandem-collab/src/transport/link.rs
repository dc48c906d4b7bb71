use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::TransportError;

/// One unit on the physical link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// The link closed. `clean` is true when the closing handshake completed
    /// normally.
    Close { clean: bool },
}

/// An open physical connection as a pair of frame channels.
///
/// Sending [`Frame::Close`] on `outgoing` asks the far side to close
/// cleanly. The link is considered lost when `incoming` yields a
/// [`Frame::Close`] or ends.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<Frame>,
    pub incoming: mpsc::UnboundedReceiver<Frame>,
}

impl Link {
    /// Two connected links, for in-process peers and tests.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Link {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// Opens physical links. Implemented by [`super::WsConnector`]; tests inject
/// in-memory connectors.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>>;
}
