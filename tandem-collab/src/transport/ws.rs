//! WebSocket [`Connector`] built on tokio-tungstenite.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use super::link::{Connector, Frame, Link};
use super::TransportError;

/// Connects with `tokio_tungstenite::connect_async` and pumps frames through
/// two spawned tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            log::debug!("WebSocket open: {url}");

            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

            // Writer task: forward outgoing frames to the socket
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let msg = match frame {
                        Frame::Text(text) => Message::Text(text.into()),
                        Frame::Binary(data) => Message::Binary(data.into()),
                        Frame::Close { .. } => {
                            let _ = ws_writer.send(Message::Close(None)).await;
                            break;
                        }
                    };
                    if ws_writer.send(msg).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: forward socket messages as frames
            tokio::spawn(async move {
                let mut clean = false;
                while let Some(msg) = ws_reader.next().await {
                    let frame = match msg {
                        Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                        Ok(Message::Binary(data)) => Frame::Binary(data.into()),
                        Ok(Message::Close(close)) => {
                            clean = close.map_or(true, |c| c.code == CloseCode::Normal);
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            log::debug!("WebSocket read error: {e}");
                            break;
                        }
                    };
                    if in_tx.send(frame).is_err() {
                        return;
                    }
                }
                let _ = in_tx.send(Frame::Close { clean });
            });

            Ok(Link {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}
