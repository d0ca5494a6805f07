use std::io;

use http::StatusCode;
use thiserror::Error;

use crate::progress::{is_disconnected_io, length_mismatch_io};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stable discriminant for [`HttpError`], usable as a metric/log label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    InvalidHeader,
    UnsupportedScheme,
    UnsafeRedirect,
    Disconnected,
    ConnectionReset,
    ConnectTimeout,
    ReadTimeout,
    InvalidCertificate,
    TlsNegotiation,
    Transport,
    HttpStatus,
    NotModified,
    EntityLengthMismatch,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidHeader => "invalid_header",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::UnsafeRedirect => "unsafe_redirect",
            Self::Disconnected => "disconnected",
            Self::ConnectionReset => "connection_reset",
            Self::ConnectTimeout => "connect_timeout",
            Self::ReadTimeout => "read_timeout",
            Self::InvalidCertificate => "invalid_certificate",
            Self::TlsNegotiation => "tls_negotiation",
            Self::Transport => "transport",
            Self::HttpStatus => "http_status",
            Self::NotModified => "not_modified",
            Self::EntityLengthMismatch => "entity_length_mismatch",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HttpError {
    #[error("invalid or reserved header: {name}")]
    InvalidHeader { name: String },
    #[error("unsupported uri scheme: {uri}")]
    UnsupportedScheme { uri: String },
    #[error("refusing redirect from verified https to insecure target: {uri}")]
    UnsafeRedirect { uri: String },
    #[error("request was disconnected")]
    Disconnected,
    #[error("connection reset: {source}")]
    ConnectionReset {
        #[source]
        source: BoxError,
    },
    #[error("connect timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u128 },
    #[error("read timed out after {timeout_ms}ms")]
    ReadTimeout { timeout_ms: u128 },
    #[error("invalid server certificate: {message}")]
    InvalidCertificate { message: String },
    #[error("tls negotiation failed: {message}")]
    TlsNegotiation { message: String },
    #[error("transport failure: {source}")]
    Transport {
        #[source]
        source: BoxError,
    },
    #[error("http status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("not modified")]
    NotModified,
    #[error("entity length mismatch: declared {declared} bytes, produced {produced}")]
    EntityLengthMismatch { declared: u64, produced: u64 },
}

impl HttpError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidHeader { .. } => ErrorKind::InvalidHeader,
            Self::UnsupportedScheme { .. } => ErrorKind::UnsupportedScheme,
            Self::UnsafeRedirect { .. } => ErrorKind::UnsafeRedirect,
            Self::Disconnected => ErrorKind::Disconnected,
            Self::ConnectionReset { .. } => ErrorKind::ConnectionReset,
            Self::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            Self::ReadTimeout { .. } => ErrorKind::ReadTimeout,
            Self::InvalidCertificate { .. } => ErrorKind::InvalidCertificate,
            Self::TlsNegotiation { .. } => ErrorKind::TlsNegotiation,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::NotModified => ErrorKind::NotModified,
            Self::EntityLengthMismatch { .. } => ErrorKind::EntityLengthMismatch,
        }
    }

    /// Failure kinds the engine may retry against the attempt budget.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset { .. } | Self::TlsNegotiation { .. }
        )
    }

    /// User-initiated cancellation; callers usually treat this as silent.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Conditional-request short-circuit: the cached body is still valid.
    pub const fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified)
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status).ok(),
            Self::NotModified => Some(StatusCode::NOT_MODIFIED),
            _ => None,
        }
    }
}

/// Classifies a low-level I/O failure observed while streaming a body. The
/// distinguished markers injected by the stream decorators take priority;
/// otherwise the error kind decides between the retryable connection-reset
/// class and a generic transport failure.
pub(crate) fn classify_io_error(error: io::Error, read_timeout_ms: u128) -> HttpError {
    if is_disconnected_io(&error) {
        return HttpError::Disconnected;
    }
    if let Some((declared, produced)) = length_mismatch_io(&error) {
        return HttpError::EntityLengthMismatch { declared, produced };
    }
    match error.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => HttpError::ConnectionReset {
            source: Box::new(error),
        },
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => HttpError::ReadTimeout {
            timeout_ms: read_timeout_ms,
        },
        _ => HttpError::Transport {
            source: Box::new(error),
        },
    }
}
