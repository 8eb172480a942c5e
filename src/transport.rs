//! Message transports the tunnel runs over.
//!
//! The protocol only needs an ordered, message-oriented byte pipe with a close
//! signal; how the socket got opened (upgrade negotiation, TLS, listeners) is the
//! caller's concern. [`Transport`] is that seam. Two implementations ship here: an
//! in-memory pair for tests and examples, and — behind the `tungstenite` feature —
//! any `tokio_tungstenite::WebSocketStream`.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{Result, TunnelError};

/// Close code for a normal, intentional closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when the server hits an internal failure before it can answer,
/// such as an undecodable opening message.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// An ordered, message-oriented byte pipe carrying one exchange.
///
/// A remote closure surfaces from `recv` as
/// `Some(Err(TunnelError::TransportClosed { .. }))` carrying the peer's close code
/// and reason when known; a plain end-of-stream surfaces as `None`. Both mean no
/// further messages will arrive.
#[async_trait]
pub trait Transport: Send {
    /// Sends one complete message.
    async fn send(&mut self, payload: Bytes) -> Result<()>;

    /// Receives the next complete message.
    async fn recv(&mut self) -> Option<Result<Bytes>>;

    /// Closes the pipe, telling the peer why.
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

enum Packet {
    Data(Bytes),
    Close { code: u16, reason: String },
}

/// One half of an in-memory transport pair.
///
/// Unbounded and strictly ordered, which is exactly what the protocol assumes of a
/// WebSocket. Useful for tests and for driving a handler without any socket at all.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Packet>,
    rx: mpsc::UnboundedReceiver<Packet>,
    peer_closed: bool,
    closed: bool,
}

/// Creates a connected pair of in-memory transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: left_tx,
            rx: right_rx,
            peer_closed: false,
            closed: false,
        },
        MemoryTransport {
            tx: right_tx,
            rx: left_rx,
            peer_closed: false,
            closed: false,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, payload: Bytes) -> Result<()> {
        if self.closed {
            return Err(TunnelError::TransportError(
                "send on a closed transport".into(),
            ));
        }
        self.tx
            .send(Packet::Data(payload))
            .map_err(|_| TunnelError::TransportClosed {
                code: None,
                reason: None,
            })
    }

    async fn recv(&mut self) -> Option<Result<Bytes>> {
        if self.peer_closed {
            return None;
        }
        match self.rx.recv().await {
            Some(Packet::Data(payload)) => Some(Ok(payload)),
            Some(Packet::Close { code, reason }) => {
                self.peer_closed = true;
                Some(Err(TunnelError::TransportClosed {
                    code: Some(code),
                    reason: Some(reason),
                }))
            }
            None => None,
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if !self.closed {
            self.closed = true;
            // The peer may already be gone, which is fine.
            let _ = self.tx.send(Packet::Close {
                code,
                reason: reason.to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(feature = "tungstenite")]
mod websocket {
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::{Error, Message};
    use tokio_tungstenite::WebSocketStream;

    use super::Transport;
    use crate::{Result, TunnelError};

    /// Tunnel messages map onto binary WebSocket messages; ping/pong traffic is
    /// transparent, and a peer's close frame carries its code and reason through.
    #[async_trait]
    impl<S> Transport for WebSocketStream<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        async fn send(&mut self, payload: Bytes) -> Result<()> {
            SinkExt::send(self, Message::Binary(payload))
                .await
                .map_err(TunnelError::from)
        }

        async fn recv(&mut self) -> Option<Result<Bytes>> {
            loop {
                return match StreamExt::next(self).await? {
                    Ok(Message::Binary(payload)) => Some(Ok(payload)),
                    Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                    Ok(Message::Close(frame)) => Some(Err(TunnelError::TransportClosed {
                        code: frame.as_ref().map(|frame| frame.code.into()),
                        reason: frame.map(|frame| frame.reason.to_string()),
                    })),
                    Err(error) => Some(Err(error.into())),
                };
            }
        }

        async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_owned().into(),
            };
            match WebSocketStream::close(self, Some(frame)).await {
                Ok(()) | Err(Error::ConnectionClosed) | Err(Error::AlreadyClosed) => Ok(()),
                Err(error) => Err(error.into()),
            }
        }
    }
}
