//! Server half of the tunnel: bootstrap and the response state machine.
//!
//! [`serve`] owns one freshly accepted socket end-to-end. It waits (bounded) for the
//! opening request envelope, validates it, and hands a decoded [`Request`] plus a
//! [`ResponseWriter`] to the external [`RequestSink`]. Whatever the handler writes is
//! framed and pumped to the socket in order; the terminal frame is followed by a
//! socket close.
//!
//! The response lifecycle is an explicit state machine: `Open` (nothing sent) →
//! `Streaming` (head flushed, chunks may follow) → `Closed`. The `Open → Streaming`
//! transition snapshots status and headers atomically onto the first emitted frame —
//! headers are frozen at first flush, and changes made by the handler afterwards
//! never reach the wire. Every closure path (normal end, remote close, transport
//! error) lands in `Closed`, after which any write fails with
//! [`TunnelError::AlreadyClosed`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::codec;
use crate::frame::{Frame, Method, Payload, RequestEnvelope};
use crate::headers::{HeaderMap, HeaderValue};
use crate::transport::{Transport, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL};
use crate::{Result, TunnelError};

/// How long a newly accepted socket may stay silent before it is closed without
/// ever invoking the handler. Guards against half-open sockets holding resources.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Encoding hints under which [`ResponseWriter::write_with_encoding`] converts
/// byte input to text and sends a `string` frame instead of a `buffer` frame.
const TEXTUAL_ENCODINGS: &[&str] = &[
    "ascii", "utf8", "utf-8", "utf16le", "utf-16le", "ucs2", "ucs-2",
];

/// Per-process server configuration, threaded explicitly into [`serve`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Bounded wait for the opening message. Defaults to
    /// [`DEFAULT_BOOTSTRAP_TIMEOUT`].
    pub bootstrap_timeout: Duration,
    /// Headers merged underneath the envelope's own (the envelope wins on
    /// conflict). Typically carries headers from the upgrade request.
    pub base_headers: HashMap<String, String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            base_headers: HashMap::new(),
        }
    }
}

/// The decoded virtual request handed to the [`RequestSink`].
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP verb from the envelope.
    pub method: Method,
    /// Envelope headers merged over [`ServerOptions::base_headers`], keys
    /// lowercased.
    pub headers: HashMap<String, String>,
    /// Request body, if the envelope carried one.
    pub body: Option<Payload>,
}

/// The external collaborator that consumes a virtual request and produces a
/// virtual response.
///
/// Invoked once per connection. The implementation must eventually complete the
/// response exactly once — by calling [`ResponseWriter::end`] or
/// [`ResponseWriter::send_error`] itself, or by returning an error and letting
/// [`serve`]'s error path do it.
///
/// Any `Fn(Request, ResponseWriter) -> impl Future<Output = Result<()>>` closure
/// is a sink, so plain async functions work directly.
#[async_trait]
pub trait RequestSink: Send + Sync {
    /// Handles one virtual request.
    async fn handle(&self, request: Request, response: ResponseWriter) -> Result<()>;
}

#[async_trait]
impl<F, Fut> RequestSink for F
where
    F: Fn(Request, ResponseWriter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, request: Request, response: ResponseWriter) -> Result<()> {
        (self)(request, response).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Streaming,
    Closed,
}

struct Shared {
    phase: Phase,
    status: u16,
    headers: HeaderMap,
    aborted_tx: watch::Sender<bool>,
}

enum Outbound {
    Data(Bytes),
    Finish(Bytes),
}

/// Writable end of one virtual response, bound to one socket.
///
/// Cheap to clone; all clones share the same state machine. Writes are ordered and
/// framed exactly as issued. See the module docs for the lifecycle and the
/// headers-frozen-at-first-flush rule.
#[derive(Clone)]
pub struct ResponseWriter {
    shared: Arc<Mutex<Shared>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ResponseWriter {
    fn channel() -> (Self, Arc<Mutex<Shared>>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (aborted_tx, _) = watch::channel(false);
        let shared = Arc::new(Mutex::new(Shared {
            phase: Phase::Open,
            status: 200,
            headers: HeaderMap::new(),
            aborted_tx,
        }));
        (
            Self {
                shared: Arc::clone(&shared),
                outbound: outbound_tx,
            },
            shared,
            outbound_rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("response state lock poisoned")
    }

    /// The status code the next head flush would carry.
    pub fn status(&self) -> u16 {
        self.lock().status
    }

    /// Sets the status code. Has no wire effect once the head has been flushed.
    pub fn set_status(&self, status: u16) {
        self.lock().status = status;
    }

    /// Reads the first value of a pending header.
    pub fn header(&self, name: &str) -> Option<String> {
        self.lock().headers.get_str(name).map(str::to_owned)
    }

    /// Sets a header, replacing any previous value. Has no wire effect once the
    /// head has been flushed.
    pub fn insert_header(&self, name: impl AsRef<str>, value: impl Into<HeaderValue>) {
        self.lock().headers.insert(name, value);
    }

    /// Appends a header value, keeping previous ones.
    pub fn append_header(&self, name: impl AsRef<str>, value: impl Into<String>) {
        self.lock().headers.append(name, value);
    }

    /// Writes one body chunk.
    ///
    /// The chunk's [`Payload`] variant decides the frame tag. The first successful
    /// write (or end) also carries the head as captured at that moment.
    ///
    /// # Errors
    /// [`TunnelError::AlreadyClosed`] once the response is past its terminal
    /// state, on every closure path.
    pub fn write(&self, chunk: impl Into<Payload>) -> Result<()> {
        let mut shared = self.lock();
        if shared.phase == Phase::Closed {
            return Err(TunnelError::AlreadyClosed);
        }
        let bytes = stamp(&mut shared, Frame::data(chunk.into()))?;
        self.outbound
            .send(Outbound::Data(bytes))
            .map_err(|_| TunnelError::AlreadyClosed)
    }

    /// Writes byte input under an explicit encoding hint.
    ///
    /// A textual hint (`ascii`, `utf8`, `utf-8`, `utf16le`, `utf-16le`, `ucs2`,
    /// `ucs-2`) converts the bytes to text deterministically and sends a `string`
    /// frame; any other hint sends the bytes as a `buffer` frame.
    pub fn write_with_encoding(&self, bytes: impl Into<Bytes>, encoding: &str) -> Result<()> {
        let bytes = bytes.into();
        let encoding = encoding.trim().to_ascii_lowercase();
        if TEXTUAL_ENCODINGS.contains(&encoding.as_str()) {
            self.write(decode_text(&bytes, &encoding))
        } else {
            self.write(bytes)
        }
    }

    /// Completes the response: optionally writes one final chunk, then emits the
    /// terminal frame (carrying the head if nothing was flushed yet) and closes
    /// the socket.
    ///
    /// # Errors
    /// [`TunnelError::AlreadyClosed`] if the response already ended.
    pub fn end(&self, chunk: Option<impl Into<Payload>>) -> Result<()> {
        let mut shared = self.lock();
        if shared.phase == Phase::Closed {
            return Err(TunnelError::AlreadyClosed);
        }

        if let Some(chunk) = chunk {
            let bytes = stamp(&mut shared, Frame::data(chunk.into()))?;
            self.outbound
                .send(Outbound::Data(bytes))
                .map_err(|_| TunnelError::AlreadyClosed)?;
        }

        let bytes = stamp(&mut shared, Frame::finish())?;
        shared.phase = Phase::Closed;
        self.outbound
            .send(Outbound::Finish(bytes))
            .map_err(|_| TunnelError::AlreadyClosed)
    }

    /// Sets the status and completes the response with a textual message.
    pub fn send_error(&self, message: &str, code: u16) -> Result<()> {
        self.set_status(code);
        self.end(Some(message))
    }

    /// Whether the response is past its terminal state.
    pub fn is_closed(&self) -> bool {
        self.lock().phase == Phase::Closed
    }

    /// Resolves when the remote peer tears the socket down before the response
    /// was ended, so handler-side abort semantics can be wired externally. Never
    /// resolves for a normal completion.
    pub async fn aborted(&self) {
        let mut rx = self.lock().aborted_tx.subscribe();
        if *rx.borrow_and_update() {
            return;
        }
        // The sender lives in the shared state, which outlives every writer.
        let _ = rx.changed().await;
    }
}

/// Encodes a frame, attaching the head snapshot on the `Open → Streaming`
/// transition. Must run under the state lock so the snapshot is atomic.
fn stamp(shared: &mut Shared, mut frame: Frame) -> Result<Bytes> {
    if shared.phase == Phase::Open {
        frame = frame.with_head(shared.status, shared.headers.clone());
        shared.phase = Phase::Streaming;

        #[cfg(feature = "logging")]
        log::debug!("head flushed with status {}", shared.status);
    }
    codec::encode(&frame)
}

/// Marks the response forcibly closed and fires the abort signal. Idempotent;
/// only the first transition notifies.
fn force_close(shared: &Mutex<Shared>) {
    let mut shared = shared.lock().expect("response state lock poisoned");
    if shared.phase != Phase::Closed {
        shared.phase = Phase::Closed;
        let _ = shared.aborted_tx.send(true);

        #[cfg(feature = "logging")]
        log::debug!("response forcibly closed by the remote peer");
    }
}

/// Converts bytes to text under a textual encoding hint. Lossy by design: a
/// response write must not fail on a stray byte.
fn decode_text(bytes: &[u8], encoding: &str) -> String {
    match encoding {
        "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Drives one freshly accepted socket through a complete exchange.
///
/// Waits up to [`ServerOptions::bootstrap_timeout`] for the opening envelope, then
/// either dispatches to `sink` or answers with a synthesized error response:
///
/// - an opening message that never arrives closes the socket and returns
///   [`TunnelError::BootstrapTimeout`]; no handler runs, nothing is sent;
/// - undecodable opening bytes close the socket with code 1011 and return
///   [`TunnelError::MalformedFrame`];
/// - a schema-invalid envelope is answered with a 400 response enumerating the
///   failing fields through the normal error path; the handler never runs and
///   `serve` returns `Ok`.
///
/// While the handler runs, framed output is pumped to the socket in order and the
/// socket is watched for remote closure. Remote closure before the terminal frame
/// marks the response forcibly closed (subsequent writes fail
/// [`TunnelError::AlreadyClosed`], [`ResponseWriter::aborted`] resolves) but the
/// handler is driven to completion. After the terminal frame is sent the socket is
/// closed.
pub async fn serve<T, S>(mut transport: T, sink: S, options: ServerOptions) -> Result<()>
where
    T: Transport,
    S: RequestSink,
{
    let opening = match tokio::time::timeout(options.bootstrap_timeout, transport.recv()).await {
        Err(_) => {
            #[cfg(feature = "logging")]
            log::debug!(
                "no opening message within {:?}, closing",
                options.bootstrap_timeout
            );
            let _ = transport.close(CLOSE_NORMAL, "bootstrap timeout").await;
            return Err(TunnelError::BootstrapTimeout);
        }
        Ok(None) => {
            return Err(TunnelError::TransportClosed {
                code: None,
                reason: None,
            })
        }
        Ok(Some(Err(error))) => return Err(error),
        Ok(Some(Ok(bytes))) => bytes,
    };

    let value = match codec::decode_envelope(&opening) {
        Ok(value) => value,
        Err(error) => {
            let _ = transport
                .close(CLOSE_INTERNAL_ERROR, "Internal Server Error")
                .await;
            return Err(error);
        }
    };

    let (writer, shared, outbound) = ResponseWriter::channel();

    match RequestEnvelope::from_value(&value) {
        Ok(envelope) => {
            let mut headers: HashMap<String, String> = options
                .base_headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                .collect();
            for (name, value) in envelope.headers.into_iter().flatten() {
                headers.insert(name.to_ascii_lowercase(), value);
            }
            let request = Request {
                method: envelope.method,
                headers,
                body: envelope.body,
            };
            let handler = sink.handle(request, writer.clone());
            drive(&mut transport, shared, outbound, writer, handler).await
        }
        Err(error) => {
            // No handler runs; the peer still gets a structured answer.
            let message = match &error {
                TunnelError::InvalidRequestEnvelope(message) => message.clone(),
                other => other.to_string(),
            };

            #[cfg(feature = "logging")]
            log::debug!("rejecting invalid envelope: {message}");

            writer.send_error(&message, 400)?;
            drive(&mut transport, shared, outbound, writer, async { Ok(()) }).await
        }
    }
}

/// The per-connection event loop: one logical flow of control multiplexing the
/// handler future, the outbound frame queue, and inbound socket events.
async fn drive<T: Transport>(
    transport: &mut T,
    shared: Arc<Mutex<Shared>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    writer: ResponseWriter,
    handler: impl Future<Output = Result<()>>,
) -> Result<()> {
    let mut handler = pin!(handler);
    let mut handler_done = false;
    // Dropped once the handler finishes, so the outbound queue can drain to None
    // when no handler-held clones remain.
    let mut writer = Some(writer);
    let mut transport_open = true;
    let mut finished = false;

    loop {
        tokio::select! {
            result = &mut handler, if !handler_done => {
                handler_done = true;
                let writer = writer.take().expect("writer kept until the handler completes");
                if let Err(_error) = result {
                    #[cfg(feature = "logging")]
                    log::warn!("handler failed: {_error}");

                    if !writer.is_closed() {
                        let _ = writer.send_error("Internal Server Error", 500);
                    }
                }
            }
            command = outbound.recv() => match command {
                Some(Outbound::Data(bytes)) => {
                    if transport_open && transport.send(bytes).await.is_err() {
                        force_close(&shared);
                        transport_open = false;
                    }
                }
                Some(Outbound::Finish(bytes)) => {
                    if transport_open {
                        let _ = transport.send(bytes).await;
                        let _ = transport.close(CLOSE_NORMAL, "").await;
                        transport_open = false;
                    }
                    finished = true;
                }
                None => {
                    // Every writer is gone and nothing ended the response.
                    if !finished && transport_open {
                        #[cfg(feature = "logging")]
                        log::warn!("response dropped without end, closing the socket");
                        let _ = transport.close(CLOSE_NORMAL, "").await;
                        transport_open = false;
                    }
                    finished = true;
                }
            },
            incoming = transport.recv(), if transport_open => match incoming {
                // The protocol has no second client message; ignore chatter.
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    force_close(&shared);
                    transport_open = false;
                }
            },
        }

        if handler_done && (finished || !transport_open) {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tokio::sync::Notify;

    use super::{serve, Request, ResponseWriter, ServerOptions};
    use crate::codec;
    use crate::frame::{Frame, FrameKind, Method, Payload, RequestEnvelope};
    use crate::transport::{memory_pair, MemoryTransport, Transport};
    use crate::TunnelError;

    async fn send_envelope(client: &mut MemoryTransport, envelope: &RequestEnvelope) {
        let bytes = codec::encode_envelope(envelope).unwrap();
        client.send(bytes).await.unwrap();
    }

    async fn next_frame(client: &mut MemoryTransport) -> Frame {
        let bytes = client.recv().await.expect("frame expected").unwrap();
        codec::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_headers_frozen_at_first_flush() {
        let (mut client, server) = memory_pair();

        let handler = |_req: Request, res: ResponseWriter| async move {
            res.set_status(201);
            res.insert_header("content-type", "text/plain");
            res.write("a")?;
            // Mutations after the first flush never reach the wire.
            res.set_status(500);
            res.insert_header("content-type", "application/json");
            res.write("b")?;
            res.end(None::<Payload>)?;
            Ok(())
        };

        let server_task = tokio::spawn(serve(server, handler, ServerOptions::default()));
        send_envelope(&mut client, &RequestEnvelope::new(Method::Get)).await;

        let first = next_frame(&mut client).await;
        assert_eq!(first.status, Some(201));
        assert_eq!(
            first.headers.as_ref().unwrap().get_str("content-type"),
            Some("text/plain")
        );
        assert_eq!(first.chunk, Some(Payload::Text("a".into())));

        let second = next_frame(&mut client).await;
        assert!(!second.has_head());
        let finish = next_frame(&mut client).await;
        assert_eq!(finish.kind, FrameKind::Finish);
        assert!(!finish.has_head());

        // Finish is last: the next event is the close, then end of stream.
        assert!(matches!(
            client.recv().await,
            Some(Err(TunnelError::TransportClosed { .. }))
        ));
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_write_after_end_fails() {
        let (mut client, server) = memory_pair();

        let handler = |_req: Request, res: ResponseWriter| async move {
            res.end(Some("done"))?;
            assert!(matches!(res.write("late"), Err(TunnelError::AlreadyClosed)));
            assert!(matches!(
                res.end(Some("again")),
                Err(TunnelError::AlreadyClosed)
            ));
            Ok(())
        };

        let server_task = tokio::spawn(serve(server, handler, ServerOptions::default()));
        send_envelope(&mut client, &RequestEnvelope::new(Method::Get)).await;

        let first = next_frame(&mut client).await;
        assert_eq!(first.chunk, Some(Payload::Text("done".into())));
        assert!(first.has_head());
        assert_eq!(next_frame(&mut client).await.kind, FrameKind::Finish);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_finish_alone_carries_head() {
        let (mut client, server) = memory_pair();

        let handler = |_req: Request, res: ResponseWriter| async move {
            res.set_status(204);
            res.end(None::<Payload>)?;
            Ok(())
        };

        let server_task = tokio::spawn(serve(server, handler, ServerOptions::default()));
        send_envelope(&mut client, &RequestEnvelope::new(Method::Head)).await;

        let finish = next_frame(&mut client).await;
        assert_eq!(finish.kind, FrameKind::Finish);
        assert_eq!(finish.status, Some(204));
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_textual_encoding_hint_converts_to_string_frame() {
        let (mut client, server) = memory_pair();

        let handler = |_req: Request, res: ResponseWriter| async move {
            res.write_with_encoding(&b"plain"[..], "UTF-8")?;
            res.write_with_encoding(&b"\x01\x02"[..], "hex")?;
            res.end(None::<Payload>)?;
            Ok(())
        };

        let server_task = tokio::spawn(serve(server, handler, ServerOptions::default()));
        send_envelope(&mut client, &RequestEnvelope::new(Method::Post)).await;

        assert_eq!(next_frame(&mut client).await.kind, FrameKind::String);
        assert_eq!(next_frame(&mut client).await.kind, FrameKind::Buffer);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_envelope_never_reaches_handler() {
        let (mut client, server) = memory_pair();
        let invoked = Arc::new(AtomicBool::new(false));

        let handler = {
            let invoked = Arc::clone(&invoked);
            move |_req: Request, _res: ResponseWriter| {
                let invoked = Arc::clone(&invoked);
                async move {
                    invoked.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        };

        let server_task = tokio::spawn(serve(server, handler, ServerOptions::default()));

        // {"method": "FOO"} is not a valid verb.
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&serde_json::json!({"method": "FOO"}), &mut buf).unwrap();
        client.send(buf.into()).await.unwrap();

        let first = next_frame(&mut client).await;
        assert_eq!(first.status, Some(400));
        match first.chunk {
            Some(Payload::Text(message)) => {
                assert!(!message.is_empty());
                assert!(message.contains("method"), "{message}");
            }
            other => panic!("expected a textual error body, got {other:?}"),
        }
        assert_eq!(next_frame(&mut client).await.kind, FrameKind::Finish);

        server_task.await.unwrap().unwrap();
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_undecodable_opening_message_closes_1011() {
        let (mut client, server) = memory_pair();
        let handler = |_req: Request, _res: ResponseWriter| async move { Ok(()) };

        let server_task = tokio::spawn(serve(server, handler, ServerOptions::default()));
        client.send(vec![0xff, 0x12, 0x00].into()).await.unwrap();

        match client.recv().await.unwrap().unwrap_err() {
            TunnelError::TransportClosed { code, .. } => assert_eq!(code, Some(1011)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            server_task.await.unwrap(),
            Err(TunnelError::MalformedFrame(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_timeout_closes_silently() {
        let (mut client, server) = memory_pair();
        let invoked = Arc::new(AtomicBool::new(false));

        let handler = {
            let invoked = Arc::clone(&invoked);
            move |_req: Request, _res: ResponseWriter| {
                let invoked = Arc::clone(&invoked);
                async move {
                    invoked.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        };

        // Virtual time: the 10s bound elapses instantly once the loop is idle.
        let result = serve(server, handler, ServerOptions::default()).await;
        assert!(matches!(result, Err(TunnelError::BootstrapTimeout)));
        assert!(!invoked.load(Ordering::SeqCst));

        // No response was ever sent; the only event is the close.
        assert!(matches!(
            client.recv().await,
            Some(Err(TunnelError::TransportClosed { .. }))
        ));
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_close_aborts_response() {
        let (mut client, server) = memory_pair();
        let observed = Arc::new(AtomicBool::new(false));
        let proceed = Arc::new(Notify::new());

        let handler = {
            let observed = Arc::clone(&observed);
            let proceed = Arc::clone(&proceed);
            move |_req: Request, res: ResponseWriter| {
                let observed = Arc::clone(&observed);
                let proceed = Arc::clone(&proceed);
                async move {
                    res.write("partial")?;
                    proceed.notify_one();
                    res.aborted().await;
                    observed.store(true, Ordering::SeqCst);
                    assert!(matches!(res.write("more"), Err(TunnelError::AlreadyClosed)));
                    Ok(())
                }
            }
        };

        let server_task = tokio::spawn(serve(server, handler, ServerOptions::default()));
        send_envelope(&mut client, &RequestEnvelope::new(Method::Get)).await;

        let first = next_frame(&mut client).await;
        assert_eq!(first.chunk, Some(Payload::Text("partial".into())));

        proceed.notified().await;
        client.close(1001, "going away").await.unwrap();

        server_task.await.unwrap().unwrap();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handler_error_produces_500() {
        let (mut client, server) = memory_pair();

        let handler = |_req: Request, _res: ResponseWriter| async move {
            Err::<(), _>(TunnelError::TransportError("boom".into()))?;
            Ok(())
        };

        let server_task = tokio::spawn(serve(server, handler, ServerOptions::default()));
        send_envelope(&mut client, &RequestEnvelope::new(Method::Get)).await;

        let first = next_frame(&mut client).await;
        assert_eq!(first.status, Some(500));
        assert_eq!(
            first.chunk,
            Some(Payload::Text("Internal Server Error".into()))
        );
        assert_eq!(next_frame(&mut client).await.kind, FrameKind::Finish);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_base_headers_merge_under_envelope() {
        let (mut client, server) = memory_pair();
        let seen: Arc<std::sync::Mutex<Option<Request>>> = Arc::default();

        let handler = {
            let seen = Arc::clone(&seen);
            move |req: Request, res: ResponseWriter| {
                let seen = Arc::clone(&seen);
                async move {
                    *seen.lock().unwrap() = Some(req);
                    res.end(None::<Payload>)?;
                    Ok(())
                }
            }
        };

        let options = ServerOptions {
            base_headers: [
                ("host".to_owned(), "example.test".to_owned()),
                ("accept".to_owned(), "from-upgrade".to_owned()),
            ]
            .into_iter()
            .collect(),
            ..ServerOptions::default()
        };
        let server_task = tokio::spawn(serve(server, handler, options));

        let mut envelope = RequestEnvelope::new(Method::Get);
        envelope.headers = Some(
            [("accept".to_owned(), "application/json".to_owned())]
                .into_iter()
                .collect(),
        );
        send_envelope(&mut client, &envelope).await;

        assert_eq!(next_frame(&mut client).await.kind, FrameKind::Finish);
        server_task.await.unwrap().unwrap();

        let request = seen.lock().unwrap().take().unwrap();
        assert_eq!(request.headers.get("host").unwrap(), "example.test");
        assert_eq!(request.headers.get("accept").unwrap(), "application/json");
    }

    // Writers can outlive the handler; the loop keeps pumping for spawned tasks.
    #[tokio::test]
    async fn test_response_from_spawned_task() {
        let (mut client, server) = memory_pair();

        let handler = |_req: Request, res: ResponseWriter| async move {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                let _ = res.end(Some("deferred"));
            });
            Ok(())
        };

        let server_task = tokio::spawn(serve(server, handler, ServerOptions::default()));
        send_envelope(&mut client, &RequestEnvelope::new(Method::Get)).await;

        let first = next_frame(&mut client).await;
        assert_eq!(first.chunk, Some(Payload::Text("deferred".into())));
        assert_eq!(next_frame(&mut client).await.kind, FrameKind::Finish);
        server_task.await.unwrap().unwrap();
    }
}
