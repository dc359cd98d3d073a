//! # WebSocket Transport
//!
//! Opens the socket with `tokio-tungstenite`, then spawns one pump task per
//! session that:
//! - sends the DDP `connect` handshake and reports `connected` / `failed`,
//! - answers server `ping` frames with `pong`,
//! - decodes every text frame and forwards it as a [`TransportEvent`],
//! - writes queued client frames,
//! - closes the socket once the [`Session`] is dropped.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage, WebSocketStream};
use url::Url;

use super::{Connector, Session, SessionPeer, TransportEvent};
use crate::ddp::{ClientMessage, ServerMessage};
use crate::error::TransportError;

/// Connector for `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Session, TransportError> {
        tracing::debug!(url = %endpoint, "Opening WebSocket");
        let (ws_stream, _) = connect_async(endpoint.as_str()).await.map_err(|e| TransportError::Connect {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let (session, peer) = Session::channel();
        tokio::spawn(pump(ws_stream, peer));
        Ok(session)
    }
}

/// Why the pump stopped.
enum PumpExit {
    /// The owning session was dropped; close quietly.
    Released,
    /// The connection ended; report it.
    Lost(String),
}

/// Drives one socket until it closes or the session is dropped.
async fn pump<S>(ws_stream: WebSocketStream<S>, mut peer: SessionPeer)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws_stream.split();

    let exit = 'session: {
        if let Err(e) = send_frame(&mut write, &ClientMessage::connect()).await {
            break 'session PumpExit::Lost(format!("handshake send failed: {}", e));
        }

        loop {
            tokio::select! {
                out = peer.outbound.recv() => {
                    match out {
                        Some(msg) => {
                            if let Err(e) = send_frame(&mut write, &msg).await {
                                break 'session PumpExit::Lost(e.to_string());
                            }
                        }
                        None => break 'session PumpExit::Released,
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            tracing::trace!(frame = %text.as_str(), "DDP message in");
                            let event = match ServerMessage::decode(text.as_str()) {
                                Ok(Some(ServerMessage::Connected { session })) => TransportEvent::Connected { session },
                                Ok(Some(ServerMessage::Failed { version })) => {
                                    let err = TransportError::Handshake(format!("server requires DDP version {}", version));
                                    let _ = peer.inbound.send(TransportEvent::Error(err));
                                    break 'session PumpExit::Lost("handshake rejected".to_string());
                                }
                                Ok(Some(ServerMessage::Ping { id })) => {
                                    if let Err(e) = send_frame(&mut write, &ClientMessage::Pong { id }).await {
                                        break 'session PumpExit::Lost(e.to_string());
                                    }
                                    continue;
                                }
                                Ok(Some(ServerMessage::Pong { .. })) | Ok(None) => continue,
                                Ok(Some(msg)) => TransportEvent::Message(msg),
                                Err(e) => TransportEvent::Error(TransportError::Codec(e.to_string())),
                            };
                            if peer.inbound.send(event).is_err() {
                                break 'session PumpExit::Released;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by server: {} {}", f.code, f.reason.as_str()))
                                .unwrap_or_else(|| "closed by server".to_string());
                            break 'session PumpExit::Lost(reason);
                        }
                        Some(Ok(WsMessage::Binary(bin))) => {
                            tracing::debug!(bytes = bin.len(), "Ignoring binary frame");
                        }
                        // Control frames are answered by tungstenite itself.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break 'session PumpExit::Lost(format!("socket error: {}", e)),
                        None => break 'session PumpExit::Lost("stream closed by remote host".to_string()),
                    }
                }
            }
        }
    };

    match exit {
        PumpExit::Released => {
            tracing::debug!("Session released, closing WebSocket");
            let _ = write.close().await;
        }
        PumpExit::Lost(reason) => {
            tracing::debug!(%reason, "WebSocket session ended");
            let _ = write.close().await;
            let _ = peer.inbound.send(TransportEvent::Disconnected(reason));
        }
    }
}

async fn send_frame<W>(write: &mut W, msg: &ClientMessage) -> Result<(), TransportError>
where
    W: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = msg.encode().map_err(|e| TransportError::Codec(e.to_string()))?;
    tracing::trace!(frame = %text, "DDP message out");
    write
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| TransportError::Socket(e.to_string()))
}
