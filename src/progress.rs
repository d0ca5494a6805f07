use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum interval between progress callbacks, except at the first and last
/// byte of a known-length transfer.
pub(crate) const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, progress: u64, total: u64);
}

impl<F: Fn(u64, u64) + Send + Sync> ProgressListener for F {
    fn on_progress(&self, progress: u64, total: u64) {
        self(progress, total)
    }
}

/// Marker carried inside an `io::Error` when an operation was aborted by a
/// disconnect request. The engine downcasts it back into
/// [`HttpError::Disconnected`](crate::HttpError::Disconnected).
#[derive(Debug)]
pub(crate) struct DisconnectedIo;

impl std::fmt::Display for DisconnectedIo {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("request was disconnected")
    }
}

impl std::error::Error for DisconnectedIo {}

/// Marker carried inside an `io::Error` when an entity produced a different
/// number of bytes than its declared content length.
#[derive(Debug)]
pub(crate) struct LengthMismatchIo {
    pub(crate) declared: u64,
    pub(crate) produced: u64,
}

impl std::fmt::Display for LengthMismatchIo {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "entity declared {} bytes but produced {}",
            self.declared, self.produced
        )
    }
}

impl std::error::Error for LengthMismatchIo {}

pub(crate) fn is_disconnected_io(error: &io::Error) -> bool {
    error
        .get_ref()
        .is_some_and(|inner| inner.is::<DisconnectedIo>())
}

pub(crate) fn length_mismatch_io(error: &io::Error) -> Option<(u64, u64)> {
    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<LengthMismatchIo>())
        .map(|mismatch| (mismatch.declared, mismatch.produced))
}

#[derive(Debug, Default)]
struct CancelState {
    // Reset by the next set_connection; a pending disconnect only applies to
    // the transfer it was issued against.
    disconnect_requested: AtomicBool,
    // Sticky until the next init_request.
    interrupted: AtomicBool,
}

/// Cross-thread cancellation flag shared between a [`ConnectionHandle`]
/// (crate::ConnectionHandle) and the stream decorators polling it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request_disconnect(&self) {
        self.state.disconnect_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::SeqCst);
        self.state.disconnect_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_disconnect(&self) {
        self.state.disconnect_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.state.disconnect_requested.store(false, Ordering::SeqCst);
        self.state.interrupted.store(false, Ordering::SeqCst);
    }

    /// True when either cancellation flag is raised. The sticky interrupt is
    /// included so it stays visible to I/O polls even after a
    /// `clear_disconnect` races with it.
    pub fn is_cancelled(&self) -> bool {
        self.state.disconnect_requested.load(Ordering::SeqCst)
            || self.state.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::SeqCst)
    }

    /// Fails fast with the distinguished disconnected failure when a
    /// disconnect was requested from any thread.
    pub(crate) fn check_io(&self) -> io::Result<()> {
        if self.is_cancelled() {
            return Err(io::Error::other(DisconnectedIo));
        }
        Ok(())
    }
}

struct ProgressState {
    listener: Option<Arc<dyn ProgressListener>>,
    total: u64,
    progress: u64,
    last_report: Option<Instant>,
}

impl ProgressState {
    fn new(listener: Option<Arc<dyn ProgressListener>>, total: Option<u64>) -> Self {
        // Nothing meaningful to report without a positive total.
        let total = total.unwrap_or(0);
        let listener = if total > 0 { listener } else { None };
        let mut state = Self {
            listener,
            total,
            progress: 0,
            last_report: None,
        };
        state.report_if_due(true);
        state
    }

    fn advance(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        self.progress = self.progress.saturating_add(count);
        let boundary = self.progress >= self.total;
        self.report_if_due(boundary);
    }

    fn report_if_due(&mut self, boundary: bool) {
        let Some(listener) = &self.listener else {
            return;
        };
        let due = boundary
            || self
                .last_report
                .is_none_or(|last| last.elapsed() >= PROGRESS_INTERVAL);
        if due {
            listener.on_progress(self.progress, self.total);
            self.last_report = Some(Instant::now());
        }
    }
}

/// Read decorator: polls the cancellation token before every operation,
/// throttles progress callbacks, and optionally enforces that the stream
/// yields exactly its declared length.
pub struct ProgressReader<R: Read> {
    inner: R,
    cancel: CancelToken,
    state: ProgressState,
    exact_length: Option<u64>,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(
        inner: R,
        cancel: CancelToken,
        listener: Option<Arc<dyn ProgressListener>>,
        total: Option<u64>,
    ) -> Self {
        Self {
            inner,
            cancel,
            state: ProgressState::new(listener, total),
            exact_length: None,
        }
    }

    /// Upload mode: EOF before `declared` bytes, or any byte past it, is an
    /// entity length mismatch.
    pub(crate) fn with_exact_length(mut self, declared: u64) -> Self {
        self.exact_length = Some(declared);
        self
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.cancel.check_io()?;
        let count = self.inner.read(buffer)?;
        if let Some(declared) = self.exact_length {
            let produced = self.state.progress.saturating_add(count as u64);
            if count == 0 && self.state.progress < declared {
                return Err(io::Error::other(LengthMismatchIo {
                    declared,
                    produced: self.state.progress,
                }));
            }
            if produced > declared {
                return Err(io::Error::other(LengthMismatchIo { declared, produced }));
            }
        }
        self.state.advance(count as u64);
        Ok(count)
    }
}

/// Write decorator with the same cancellation and reporting contract as
/// [`ProgressReader`].
pub struct ProgressWriter<W: Write> {
    inner: W,
    cancel: CancelToken,
    state: ProgressState,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(
        inner: W,
        cancel: CancelToken,
        listener: Option<Arc<dyn ProgressListener>>,
        total: Option<u64>,
    ) -> Self {
        Self {
            inner,
            cancel,
            state: ProgressState::new(listener, total),
        }
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        self.cancel.check_io()?;
        let count = self.inner.write(buffer)?;
        self.state.advance(count as u64);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.cancel.check_io()?;
        self.inner.flush()
    }
}
