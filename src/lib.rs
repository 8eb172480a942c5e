//! # wsfetch
//! Tunnels a single HTTP-style request/response exchange over one WebSocket connection,
//! so that a request-handling application normally reachable over TCP/HTTP can instead be
//! driven by a message sent on an already-open socket, while the far end still sees an
//! ordinary, streamable HTTP response.
//!
//! The crate implements the wire protocol and both of its state machines:
//!
//! - the server side ([`serve`], [`ResponseWriter`]) turns handler output (status, headers,
//!   body chunks, completion) into an ordered sequence of CBOR-framed messages, honoring
//!   the at-most-once-headers and no-write-after-close invariants;
//! - the client side ([`fetch`], [`Response`]) reassembles those frames into one logical
//!   response, with an early headers-known resolution, a per-chunk streaming callback,
//!   binary reassembly, MIME-based content decoding and transparent decompression.
//!
//! What it deliberately does not do: WebSocket upgrade negotiation, TLS, authentication,
//! reconnects, or multiplexing several requests onto one socket. One socket carries exactly
//! one exchange; the socket is closed once the terminal frame has been sent or received.
//!
//! # Features
//! The crate provides several optional features that can be enabled in your `Cargo.toml`:
//!
//! - `tungstenite`: Implements [`Transport`] for `tokio_tungstenite::WebSocketStream`, so an
//!   upgraded connection from tokio-tungstenite (or anything built on it) can be handed
//!   straight to [`serve`] or [`fetch`].
//!
//! - `logging`: Enables debug logging for bootstrap, head flushes and close handling using
//!   the `log` crate. Useful for debugging stuck exchanges.
//!
//! - `zlib`: Uses zlib-rs as the flate2 backend for faster gzip/deflate decoding.
//!
//! # Server example
//! ```no_run
//! use wsfetch::{serve, Request, ResponseWriter, ServerOptions};
//!
//! async fn handle(req: Request, res: ResponseWriter) -> wsfetch::Result<()> {
//!     res.insert_header("content-type", "text/plain");
//!     res.write("hello ")?;
//!     res.end(Some(req.method.as_str()))?;
//!     Ok(())
//! }
//!
//! # async fn run(transport: wsfetch::MemoryTransport) -> wsfetch::Result<()> {
//! serve(transport, handle, ServerOptions::default()).await
//! # }
//! ```
//!
//! # Client example
//! ```no_run
//! use wsfetch::{fetch, FetchOptions, Method};
//!
//! # async fn run(transport: wsfetch::MemoryTransport) -> wsfetch::Result<()> {
//! let response = fetch(transport, FetchOptions::new(Method::Get)).await?;
//! println!("status: {}", response.status);
//! let body = response.body().await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod codec;
pub mod compression;
pub mod content;
pub mod frame;
pub mod headers;
pub mod server;
pub mod transport;

use thiserror::Error;

pub use client::{fetch, BodyHandle, FetchOptions, Response};
pub use compression::{Decompression, ACCEPT_ENCODING};
pub use frame::{Frame, FrameKind, Method, Payload, RequestEnvelope};
pub use headers::{HeaderMap, HeaderValue};
pub use server::{serve, Request, RequestSink, ResponseWriter, ServerOptions};
pub use transport::{memory_pair, MemoryTransport, Transport};

/// A result type for tunnel operations, using `TunnelError` as the error type.
///
/// This type alias simplifies function signatures across the crate by providing a
/// standard result type for operations that may return a `TunnelError`.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Represents errors that can occur while tunneling an exchange.
///
/// The variants fall into three groups:
///
/// - Protocol errors (malformed frames, invalid opening envelopes, unsupported
///   content encodings) — these are never retried by the crate; retries, if wanted,
///   are a caller concern.
/// - Lifecycle errors (`AlreadyClosed`, `BootstrapTimeout`, `Aborted`) — a state
///   machine refused an operation past its terminal state or a bound expired.
/// - Transport errors — the socket closed or failed before the terminal frame.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The wire bytes could not be decoded into a frame, or the decoded frame
    /// violates the schema (for example a `finish` frame carrying a chunk).
    /// Fatal to the connection.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The opening message failed validation. The message enumerates every field
    /// that failed. Recovered locally by synthesizing a 400-class response; the
    /// handler is never invoked.
    #[error("invalid request envelope: {0}")]
    InvalidRequestEnvelope(String),

    /// A write or end was attempted on a response past its terminal state,
    /// whether it finished normally or the peer closed the socket first.
    #[error("response already closed")]
    AlreadyClosed,

    /// The decompression pipeline met a content-encoding token it does not
    /// implement. Silently returning compressed bytes would corrupt the logical
    /// body, so this is a hard failure for that response.
    #[error("unsupported content-encoding: {0}")]
    UnsupportedEncoding(String),

    /// The socket closed before the terminal frame. Carries the close code and
    /// reason when the peer provided them.
    #[error("transport closed (code: {code:?}, reason: {reason:?})")]
    TransportClosed {
        /// Close code reported by the peer, if any.
        code: Option<u16>,
        /// Close reason reported by the peer, if any.
        reason: Option<String>,
    },

    /// The socket failed before the terminal frame.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The opening message did not arrive within the bootstrap bound. The socket
    /// is closed and no handler is invoked; there is no peer listener to notify.
    #[error("timed out waiting for the opening message")]
    BootstrapTimeout,

    /// The caller cancelled the in-flight exchange. Both the headers-known and
    /// the deferred-body resolutions observe this exactly once.
    #[error("exchange aborted by the caller")]
    Aborted,

    /// Wraps I/O errors raised by the decompression pipeline.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps serialization errors for JSON payloads.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Wraps errors from the tokio-tungstenite transport adapter.
    #[error(transparent)]
    #[cfg_attr(docsrs, doc(cfg(feature = "tungstenite")))]
    #[cfg(feature = "tungstenite")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
