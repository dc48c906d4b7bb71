//! Shared fixtures: an in-process WebSocket relay and a scripted connector.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tandem_collab::{Connector, Link, TransportError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

type Rooms = Arc<Mutex<HashMap<String, broadcast::Sender<(u64, String)>>>>;

/// Minimal relay: every text frame is forwarded to all other connections
/// on the same path.
pub struct Relay {
    pub port: u16,
    kill: watch::Sender<u64>,
    accept: JoinHandle<()>,
}

impl Relay {
    /// Start a relay on a free port.
    pub async fn start() -> Relay {
        Self::start_on(free_port().await).await
    }

    /// Start a relay on `port`, e.g. to bring one back after `shutdown`.
    pub async fn start_on(port: u16) -> Relay {
        let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await.unwrap();
        let (kill, kill_rx) = watch::channel(0u64);
        let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));

        let accept = tokio::spawn(async move {
            let mut next_id = 0u64;
            while let Ok((stream, _)) = listener.accept().await {
                next_id += 1;
                tokio::spawn(serve(stream, next_id, rooms.clone(), kill_rx.clone()));
            }
        });

        Relay { port, kill, accept }
    }

    /// Base URL for `Room::with_websocket`.
    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Cut every live connection without a closing handshake.
    pub fn drop_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    /// Stop accepting and cut everything; later dials are refused.
    pub fn shutdown(self) {
        self.accept.abort();
        self.drop_connections();
    }
}

async fn serve(stream: TcpStream, id: u64, rooms: Rooms, mut kill: watch::Receiver<u64>) {
    let mut path = String::new();
    let record_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, record_path)
    .await
    {
        Ok(ws) => ws,
        Err(_) => return,
    };

    let tx = rooms
        .lock()
        .unwrap()
        .entry(path)
        .or_insert_with(|| broadcast::channel(256).0)
        .clone();
    let mut rx = tx.subscribe();
    let (mut sink, mut source) = ws.split();
    let _ = kill.borrow_and_update();

    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = tx.send((id, text.as_str().to_owned()));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            relayed = rx.recv() => match relayed {
                Ok((from, text)) if from != id => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = kill.changed() => {
                // Drop the socket without a close frame.
                return;
            }
        }
    }
    let _ = sink.close().await;
}

/// Hands out links from a script; `None` entries refuse the dial.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Option<Link>>>,
    dials: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Option<Link>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            dials: AtomicUsize::new(0),
        })
    }

    /// Append another scripted result.
    pub fn push(&self, link: Option<Link>) {
        self.script.lock().unwrap().push_back(link);
    }

    /// Number of connect calls so far.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front().flatten();
        Box::pin(async move { next.ok_or_else(|| TransportError::ConnectFailed("refused".into())) })
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
