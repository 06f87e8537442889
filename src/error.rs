//! Error types for the pagesmith engine.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`EngineError`] — **Fatal for the request**: the facade call cannot
//!   proceed at all (no document loaded, unsupported file format, storage
//!   unavailable). Returned as `Err(EngineError)` from facade methods.
//!
//! * [`PageFailure`] — **Non-fatal**: a single page failed (decode glitch,
//!   transient API error after retries) but the batch continues. Carried on
//!   `processing-error` events together with a classified [`ErrorKind`] so
//!   the shell can decide how loudly to surface it.
//!
//! The separation lets the shell abort a whole request on fatal errors while
//! treating per-page failures as progress information.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by facade-level operations.
///
/// Page-level failures use [`PageFailure`] and flow through the event bus
/// rather than being propagated here.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Document errors ───────────────────────────────────────────────────

    /// The file extension is not one of the supported document formats.
    #[error("Unsupported format: '{path}' ({extension:?})\nSupported: pdf, png, jpg, jpeg, bmp, gif, tiff, webp")]
    UnsupportedFormat {
        path: PathBuf,
        extension: Option<String>,
    },

    /// The file exists but could not be parsed as its claimed format.
    #[error("Failed to decode '{path}': {detail}")]
    DecodeError { path: PathBuf, detail: String },

    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// A facade method that needs a loaded document was called without one.
    #[error("No document is loaded")]
    DocumentNotLoaded,

    /// A requested page number is outside the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: u32, total: u32 },

    /// The page selection resolved to nothing.
    #[error("Page selection is empty")]
    EmptySelection,

    // ── Job errors ────────────────────────────────────────────────────────

    /// Only one batch job may run at a time.
    #[error("A processing job is already running; cancel it first")]
    JobAlreadyRunning,

    /// The operation requires input the caller did not provide.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ── Config errors ─────────────────────────────────────────────────────

    /// Configuration failed validation or could not be read.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Storage errors ────────────────────────────────────────────────────

    /// The cache or history database rejected an operation.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Filesystem operation failed.
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classified error kinds carried on error events.
///
/// The engine maps every per-page failure onto one of these before emitting
/// a `processing-error` event; the shell keys its messaging off the kind,
/// never off free-form text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Fatal for the document, not the session.
    UnsupportedFormat,
    /// Per-page decode failure; recovered by the placeholder render.
    DecodeError,
    /// No document loaded when the operation needed one.
    DocumentNotLoaded,
    /// Cooperative cancellation; informational only.
    Cancelled,
    /// HTTP 429 after all retries.
    RateLimited,
    /// Request deadline exceeded after all retries.
    Timeout,
    /// Transport-level failure after all retries.
    Network,
    /// HTTP 5xx after all retries.
    ServiceUnavailable,
    /// HTTP 401/403; terminal for the page.
    Unauthorized,
    /// Other HTTP 4xx; terminal for the page.
    BadRequest,
    /// Response body did not parse after the final retry.
    MalformedResponse,
    /// A durable cache row could not be read back; evicted, treated as miss.
    CacheCorrupt,
    /// History write failed; logged, page result still delivered.
    HistoryWriteFailed,
}

impl ErrorKind {
    /// Stable wire name used in event payloads and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorKind::DecodeError => "DECODE_ERROR",
            ErrorKind::DocumentNotLoaded => "DOCUMENT_NOT_LOADED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Network => "NETWORK",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorKind::CacheCorrupt => "CACHE_CORRUPT",
            ErrorKind::HistoryWriteFailed => "HISTORY_WRITE_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal, classified failure for a single page.
///
/// Clone-able so the cache's single-flight fan-out can hand the same failure
/// to every waiter.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("page {page:?}: {kind}: {message}")]
pub struct PageFailure {
    /// Page the failure belongs to, if page-scoped.
    pub page: Option<u32>,
    /// Classified kind.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// HTTP status code when the failure came off the wire.
    pub code: Option<u16>,
}

impl PageFailure {
    pub fn new(page: impl Into<Option<u32>>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            page: page.into(),
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// Shorthand for a cooperative-cancellation failure.
    pub fn cancelled(page: impl Into<Option<u32>>) -> Self {
        Self::new(page, ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names_are_stable() {
        assert_eq!(ErrorKind::RateLimited.as_str(), "RATE_LIMITED");
        assert_eq!(ErrorKind::CacheCorrupt.as_str(), "CACHE_CORRUPT");
        assert_eq!(ErrorKind::Unauthorized.to_string(), "UNAUTHORIZED");
    }

    #[test]
    fn page_failure_display_includes_kind() {
        let f = PageFailure::new(3, ErrorKind::Timeout, "deadline exceeded").with_code(408);
        let s = f.to_string();
        assert!(s.contains("TIMEOUT"));
        assert!(s.contains("deadline exceeded"));
        assert_eq!(f.code, Some(408));
    }

    #[test]
    fn serde_round_trip_keeps_kind() {
        let f = PageFailure::new(None, ErrorKind::MalformedResponse, "bad json");
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("MALFORMED_RESPONSE"));
        let back: PageFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::MalformedResponse);
    }
}
