//! Client half of the tunnel: sends the request envelope and consumes the
//! framed response.
//!
//! [`fetch`] resolves in two stages. The returned [`Response`] is available as
//! soon as the first head-bearing frame arrives, before any of the body has
//! streamed, so callers can branch on status and headers early. The body itself
//! is deferred behind [`Response::body`], which resolves once the terminal frame
//! lands (or rejects if the socket dies first).
//!
//! Chunks are accumulated per frame tag while streaming. At completion exactly
//! one accumulator becomes the body, by fixed precedence: any binary data wins,
//! then concatenated text, then the last JSON value. A mixed binary body is
//! concatenated, run through the [`Decompression`] chain named by
//! `content-encoding`, and interpreted against the `content-type` MIME type; a
//! text body gets a JSON parse attempt for JSON MIME types.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::compression::{encoding_chain, Decompression, ACCEPT_ENCODING};
use crate::content::{accepted_mime_types, content_type, interpret_bytes, interpret_text};
use crate::frame::{FrameKind, Method, Payload, RequestEnvelope};
use crate::headers::HeaderMap;
use crate::transport::{Transport, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL};
use crate::{Result, TunnelError};

/// Observer for body chunks as they stream in, ahead of the final body.
/// Receives every non-terminal chunk in arrival order.
pub type StreamingObserver = Box<dyn FnMut(&Payload) + Send>;

/// Everything describing one virtual request.
///
/// ```no_run
/// use wsfetch::{FetchOptions, Method};
///
/// let options = FetchOptions::new(Method::Post)
///     .header("content-type", "application/json")
///     .body(serde_json::json!({ "q": "rust" }));
/// ```
pub struct FetchOptions {
    /// The HTTP verb to put in the envelope.
    pub method: Method,
    /// Request headers, keys lowercased. `accept` and `accept-encoding`
    /// defaults are injected unless already present.
    pub headers: HashMap<String, String>,
    /// Optional request body.
    pub body: Option<Payload>,
    /// Optional per-chunk observer.
    pub on_streaming: Option<StreamingObserver>,
    /// Decompression pipeline applied to binary bodies.
    pub decompression: Decompression,
    /// Cancels the exchange when triggered; both stages then reject with
    /// [`TunnelError::Aborted`].
    pub cancel: Option<CancellationToken>,
}

impl FetchOptions {
    /// Creates options for the given verb with no headers and no body.
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HashMap::new(),
            body: None,
            on_streaming: None,
            decompression: Decompression::new(),
            cancel: None,
        }
    }

    /// Sets a request header, lowercasing the name.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Sets the request body.
    pub fn body(mut self, body: impl Into<Payload>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Installs a streaming observer.
    pub fn on_streaming(mut self, observer: impl FnMut(&Payload) + Send + 'static) -> Self {
        self.on_streaming = Some(Box::new(observer));
        self
    }

    /// Replaces the decompression pipeline, e.g. to inject a Brotli codec.
    pub fn decompression(mut self, decompression: Decompression) -> Self {
        self.decompression = decompression;
        self
    }

    /// Attaches a cancellation token.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::new(Method::Get)
    }
}

/// The early half of a fetch: status and headers, with the body still pending.
pub struct Response {
    /// Response status code from the head-bearing frame.
    pub status: u16,
    /// Response headers from the head-bearing frame.
    pub headers: HeaderMap,
    body: BodyHandle,
}

impl Response {
    /// Waits for the complete, decoded body. `None` means the response carried
    /// no chunks at all.
    pub async fn body(self) -> Result<Option<Payload>> {
        self.body.wait().await
    }

    /// Splits off the body future, e.g. to await it on another task.
    pub fn into_body(self) -> BodyHandle {
        self.body
    }
}

/// Pending body of an in-flight response.
pub struct BodyHandle {
    rx: oneshot::Receiver<Result<Option<Payload>>>,
}

impl BodyHandle {
    /// Resolves once the terminal frame arrives, or rejects with the error that
    /// ended the exchange.
    pub async fn wait(self) -> Result<Option<Payload>> {
        self.rx
            .await
            .map_err(|_| TunnelError::TransportError("connection driver dropped".into()))?
    }
}

/// Performs one virtual exchange over an established socket.
///
/// Sends the request envelope, then resolves with a [`Response`] as soon as the
/// head is known. The socket is driven on a background task until the exchange
/// completes one way or the other; the task closes the socket itself, so the
/// caller never touches the transport again.
///
/// # Errors
///
/// Rejects before the head is known if the envelope cannot be sent, the socket
/// closes ([`TunnelError::TransportClosed`]), a frame fails to decode
/// ([`TunnelError::MalformedFrame`]), or the exchange is cancelled
/// ([`TunnelError::Aborted`]). Errors after the head is known surface through
/// [`Response::body`] instead.
pub async fn fetch<T>(mut transport: T, options: FetchOptions) -> Result<Response>
where
    T: Transport + 'static,
{
    let FetchOptions {
        method,
        mut headers,
        body,
        on_streaming,
        decompression,
        cancel,
    } = options;

    headers
        .entry("accept".to_owned())
        .or_insert_with(accepted_mime_types);
    headers
        .entry("accept-encoding".to_owned())
        .or_insert_with(|| ACCEPT_ENCODING.to_owned());

    let envelope = RequestEnvelope {
        method,
        headers: Some(headers),
        body,
    };
    transport.send(codec::encode_envelope(&envelope)?).await?;

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = oneshot::channel();
    tokio::spawn(drive(
        transport,
        on_streaming,
        decompression,
        cancel.unwrap_or_default(),
        head_tx,
        body_tx,
    ));

    let (status, headers) = head_rx
        .await
        .map_err(|_| TunnelError::TransportError("connection driver dropped".into()))??;

    Ok(Response {
        status,
        headers,
        body: BodyHandle { rx: body_rx },
    })
}

type HeadSender = oneshot::Sender<Result<(u16, HeaderMap)>>;
type BodySender = oneshot::Sender<Result<Option<Payload>>>;

/// Receive loop for one exchange. Owns the transport; every exit path resolves
/// both stages exactly once and closes the socket.
async fn drive<T: Transport>(
    mut transport: T,
    mut on_streaming: Option<StreamingObserver>,
    decompression: Decompression,
    cancel: CancellationToken,
    head_tx: HeadSender,
    body_tx: BodySender,
) {
    let mut head_tx = Some(head_tx);
    let mut body_tx = Some(body_tx);
    let mut head: Option<(u16, HeaderMap)> = None;

    let mut binary = BytesMut::new();
    let mut text = String::new();
    let mut json: Option<serde_json::Value> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                reject(&mut head_tx, &mut body_tx, TunnelError::Aborted);
                let _ = transport.close(CLOSE_NORMAL, "aborted").await;
                return;
            }
            event = transport.recv() => event,
        };

        let frame = match event {
            None => {
                reject(
                    &mut head_tx,
                    &mut body_tx,
                    TunnelError::TransportClosed {
                        code: None,
                        reason: None,
                    },
                );
                return;
            }
            Some(Err(error)) => {
                reject(&mut head_tx, &mut body_tx, error);
                return;
            }
            Some(Ok(bytes)) => match codec::decode(&bytes) {
                Ok(frame) => frame,
                Err(error) => {
                    reject(&mut head_tx, &mut body_tx, error);
                    let _ = transport.close(CLOSE_INTERNAL_ERROR, "malformed frame").await;
                    return;
                }
            },
        };

        // Only the first head counts; a duplicate on a later frame is ignored.
        if frame.has_head() && head.is_none() {
            let status = frame.status.unwrap_or(200);
            let headers = frame.headers.clone().unwrap_or_default();
            head = Some((status, headers.clone()));
            if let Some(tx) = head_tx.take() {
                let _ = tx.send(Ok((status, headers)));
            }
        }

        if frame.kind == FrameKind::Finish {
            let (status, headers) = head.unwrap_or((200, HeaderMap::new()));
            if let Some(tx) = head_tx.take() {
                let _ = tx.send(Ok((status, headers.clone())));
            }
            let body = conclude(&headers, &decompression, binary.freeze(), text, json);
            if let Some(tx) = body_tx.take() {
                let _ = tx.send(body);
            }
            let _ = transport.close(CLOSE_NORMAL, "").await;
            return;
        }

        if let Some(chunk) = frame.chunk {
            if let Some(observer) = on_streaming.as_mut() {
                observer(&chunk);
            }
            match chunk {
                Payload::Binary(bytes) => binary.extend_from_slice(&bytes),
                Payload::Text(part) => text.push_str(&part),
                // Later JSON chunks replace earlier ones.
                Payload::Json(value) => json = Some(value),
            }
        }
    }
}

/// Collapses the accumulators into the final body: binary beats text beats JSON.
fn conclude(
    headers: &HeaderMap,
    decompression: &Decompression,
    binary: Bytes,
    text: String,
    json: Option<serde_json::Value>,
) -> Result<Option<Payload>> {
    let mime_type = content_type(headers);

    if !binary.is_empty() {
        let chain = encoding_chain(headers);
        let data = if chain.is_empty() {
            binary
        } else {
            decompression.decompress_chain(&binary, &chain)?.into()
        };
        return Ok(Some(interpret_bytes(&mime_type, data)));
    }

    if !text.is_empty() {
        return Ok(Some(interpret_text(&mime_type, text)));
    }

    Ok(json.map(Payload::Json))
}

/// Fans one terminal error out to whichever stages are still pending.
fn reject(head_tx: &mut Option<HeadSender>, body_tx: &mut Option<BodySender>, error: TunnelError) {
    #[cfg(feature = "logging")]
    log::debug!("exchange failed: {error}");

    if let Some(tx) = head_tx.take() {
        let _ = tx.send(Err(duplicate(&error)));
    }
    if let Some(tx) = body_tx.take() {
        let _ = tx.send(Err(error));
    }
}

/// Rebuilds an error for the second pending stage. Variants whose payloads are
/// cloneable are preserved structurally; the rest degrade to a textual
/// transport error.
fn duplicate(error: &TunnelError) -> TunnelError {
    match error {
        TunnelError::TransportClosed { code, reason } => TunnelError::TransportClosed {
            code: *code,
            reason: reason.clone(),
        },
        TunnelError::MalformedFrame(message) => TunnelError::MalformedFrame(message.clone()),
        TunnelError::InvalidRequestEnvelope(message) => {
            TunnelError::InvalidRequestEnvelope(message.clone())
        }
        TunnelError::UnsupportedEncoding(token) => {
            TunnelError::UnsupportedEncoding(token.clone())
        }
        TunnelError::TransportError(message) => TunnelError::TransportError(message.clone()),
        TunnelError::AlreadyClosed => TunnelError::AlreadyClosed,
        TunnelError::BootstrapTimeout => TunnelError::BootstrapTimeout,
        TunnelError::Aborted => TunnelError::Aborted,
        other => TunnelError::TransportError(other.to_string()),
    }
}
