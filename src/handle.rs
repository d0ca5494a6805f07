use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use http::header::SET_COOKIE;
use http::{HeaderMap, StatusCode, Uri};

use crate::error::{classify_io_error, HttpError};
use crate::progress::{CancelToken, ProgressListener, ProgressReader};
use crate::response::{Charset, Response};
use crate::throttle::SlotGuard;
use crate::util::{charset_from_content_type, is_gzip_encoded, lock_unpoisoned};
use crate::validator::Validator;

/// Default attempt budget for one logical request, shared by retries and
/// followed redirects.
pub(crate) const DEFAULT_ATTEMPTS: u32 = 10;

/// Status line and headers of the latest response, kept inspectable after the
/// transport is gone.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseHead {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self { status, headers }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Looks up a cookie value across all `Set-Cookie` headers.
    pub fn cookie_value(&self, name: &str) -> Option<String> {
        for header in self.headers.get_all(SET_COOKIE) {
            let text = header.to_str().ok()?;
            let pair = text.split(';').next().unwrap_or_default();
            if let Some((cookie_name, value)) = pair.split_once('=') {
                if cookie_name.trim() == name {
                    return Some(value.trim().to_owned());
                }
            }
        }
        None
    }
}

/// Live transport attachment: the unread body plus everything needed to
/// decode it, and the throttle slot to free on release.
pub(crate) struct LiveConnection {
    pub(crate) head: ResponseHead,
    pub(crate) body: ureq::Body,
    pub(crate) listener: Option<Arc<dyn ProgressListener>>,
    pub(crate) slot: Option<SlotGuard>,
    pub(crate) read_timeout_ms: u128,
}

#[derive(Default)]
struct HandleState {
    requested_uri: Option<Uri>,
    redirected_uri: Option<Uri>,
    attempts_left: u32,
    live: Option<LiveConnection>,
    dead: Option<ResponseHead>,
    response: Option<Response>,
    validator: Option<Validator>,
}

/// Cancellable per-logical-request resource: tracks the attempt budget,
/// redirect state, the live transport, and the memoized decoded response.
/// Safe to share across threads; `disconnect`/`interrupt` may be called
/// concurrently with an in-flight `execute` or `read`.
#[derive(Default)]
pub struct ConnectionHandle {
    cancel: CancelToken,
    state: Mutex<HandleState>,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Resets the handle for a fresh logical request. Clears stale redirect,
    /// validator, and cancellation state.
    pub(crate) fn init_request(&self, uri: Uri, attempts: u32) {
        self.disconnect_and_clear();
        self.cancel.reset();
        let mut state = lock_unpoisoned(&self.state);
        state.requested_uri = Some(uri);
        state.redirected_uri = None;
        state.attempts_left = attempts;
        state.dead = None;
        state.response = None;
        state.validator = None;
    }

    /// Consumes one attempt; returns whether a retry is still permitted.
    pub(crate) fn next_attempt(&self) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if state.attempts_left == 0 {
            return false;
        }
        state.attempts_left -= 1;
        true
    }

    pub(crate) fn set_requested_uri(&self, uri: Uri) {
        let mut state = lock_unpoisoned(&self.state);
        state.requested_uri = Some(uri);
    }

    pub(crate) fn set_redirected_uri(&self, uri: Option<Uri>) {
        let mut state = lock_unpoisoned(&self.state);
        state.redirected_uri = uri;
    }

    pub(crate) fn set_validator(&self, validator: Option<Validator>) {
        let mut state = lock_unpoisoned(&self.state);
        state.validator = validator;
    }

    /// Records the latest response head so status and headers stay
    /// inspectable even when the engine never binds the body.
    pub(crate) fn record_head(&self, head: ResponseHead) {
        let mut state = lock_unpoisoned(&self.state);
        state.dead = Some(head);
    }

    /// Binds a live transport. Fails with the distinguished disconnected
    /// error if the handle was interrupted since `init_request`, without
    /// ever exposing the connection.
    pub(crate) fn set_connection(&self, connection: LiveConnection) -> Result<(), HttpError> {
        if self.cancel.is_interrupted() {
            // Dropping the connection closes it.
            return Err(HttpError::Disconnected);
        }
        let mut state = lock_unpoisoned(&self.state);
        state.dead = Some(connection.head.clone());
        state.live = Some(connection);
        drop(state);
        self.cancel.clear_disconnect();
        Ok(())
    }

    /// Fail-fast poll for a concurrent disconnect request.
    pub(crate) fn check_disconnected(&self) -> Result<(), HttpError> {
        if self.cancel.is_cancelled() {
            self.disconnect_and_clear();
            return Err(HttpError::Disconnected);
        }
        Ok(())
    }

    /// Idempotent: closes the live transport if present, keeps its head
    /// inspectable, and frees the throttle slot.
    pub(crate) fn disconnect_and_clear(&self) {
        let connection = {
            let mut state = lock_unpoisoned(&self.state);
            state.live.take()
        };
        // Dropping outside the lock closes the body and releases the slot.
        drop(connection);
    }

    /// Requests cancellation of the current transfer from any thread.
    pub fn disconnect(&self) {
        self.cancel.request_disconnect();
        self.disconnect_and_clear();
    }

    /// Sticky cancellation: also poisons the next `set_connection` until the
    /// handle is reused for a fresh request.
    pub fn interrupt(&self) {
        self.cancel.interrupt();
        self.disconnect_and_clear();
    }

    pub fn requested_uri(&self) -> Option<Uri> {
        lock_unpoisoned(&self.state).requested_uri.clone()
    }

    /// URI of the redirect target recorded while following redirects, if any.
    pub fn redirected_uri(&self) -> Option<Uri> {
        lock_unpoisoned(&self.state).redirected_uri.clone()
    }

    pub fn status(&self) -> Option<StatusCode> {
        lock_unpoisoned(&self.state)
            .dead
            .as_ref()
            .map(ResponseHead::status)
    }

    pub fn headers(&self) -> Option<HeaderMap> {
        lock_unpoisoned(&self.state)
            .dead
            .as_ref()
            .map(|head| head.headers().clone())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        lock_unpoisoned(&self.state)
            .dead
            .as_ref()
            .and_then(|head| head.header(name).map(ToOwned::to_owned))
    }

    pub fn cookie_value(&self, name: &str) -> Option<String> {
        lock_unpoisoned(&self.state)
            .dead
            .as_ref()
            .and_then(|head| head.cookie_value(name))
    }

    /// Validator extracted from the latest successful response, for the
    /// caller to persist and replay.
    pub fn validator(&self) -> Option<Validator> {
        lock_unpoisoned(&self.state).validator.clone()
    }

    /// Pulls and decodes the response body. Memoized: the first call drains
    /// the transport, later calls return the cached response without
    /// touching the network. The transport is always released afterward,
    /// success or failure.
    pub fn read(&self) -> Result<Response, HttpError> {
        let connection = {
            let mut state = lock_unpoisoned(&self.state);
            if let Some(response) = &state.response {
                return Ok(response.clone());
            }
            state.live.take()
        };
        let Some(connection) = connection else {
            return Err(HttpError::Disconnected);
        };
        let charset = Charset::resolve(
            charset_from_content_type(connection.head.headers()).as_deref(),
        );
        let mut buffer = Vec::new();
        let outcome = drain_connection(connection, &self.cancel, &mut buffer);
        outcome?;
        let response = Response::new(Bytes::from(buffer), charset);
        let mut state = lock_unpoisoned(&self.state);
        state.response = Some(response.clone());
        Ok(response)
    }

    /// Streams the response body into a caller-supplied sink instead of
    /// buffering it. Not memoized; the body can be pulled once.
    pub fn read_into<W: Write>(&self, sink: &mut W) -> Result<u64, HttpError> {
        let connection = {
            let mut state = lock_unpoisoned(&self.state);
            state.live.take()
        };
        let Some(connection) = connection else {
            return Err(HttpError::Disconnected);
        };
        let mut counting = CountingWriter { inner: sink, written: 0 };
        let outcome = drain_connection(connection, &self.cancel, &mut counting);
        let written = counting.written;
        outcome?;
        Ok(written)
    }
}

struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buffer: &[u8]) -> std::io::Result<usize> {
        let count = self.inner.write(buffer)?;
        self.written += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Copies the body through gzip decoding and the progress decorator into the
/// sink. Consumes the connection, so the transport and throttle slot are
/// released on every path.
fn drain_connection<W: Write>(
    connection: LiveConnection,
    cancel: &CancelToken,
    sink: &mut W,
) -> Result<(), HttpError> {
    let LiveConnection {
        head,
        body,
        listener,
        slot,
        read_timeout_ms,
    } = connection;
    let gzip = is_gzip_encoded(head.headers());
    // A compressed body's decoded length is unknown ahead of time.
    let total = if gzip { None } else { body.content_length() };
    let raw = body.into_reader();
    let decoded: Box<dyn Read> = if gzip {
        Box::new(flate2::read::GzDecoder::new(raw))
    } else {
        Box::new(raw)
    };
    let mut progress = ProgressReader::new(decoded, cancel.clone(), listener, total);
    let outcome = std::io::copy(&mut progress, sink);
    drop(slot);
    match outcome {
        Ok(_) => Ok(()),
        Err(error) => Err(classify_io_error(error, read_timeout_ms)),
    }
}
