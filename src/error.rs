use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rendering engine error: {0}")]
    Engine(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Navigation timeout after {budget:?} waiting for {condition}")]
    NavigationTimeout { condition: String, budget: Duration },

    #[error("Readiness check failed: {0}")]
    Readiness(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Job deadline timeout after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Context teardown failed: {0}")]
    Teardown(String),
}

/// Caller-facing failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing or malformed input, rejected before any context is allocated
    ValidationError,
    /// A wait condition was not met within its budget
    NavigationTimeout,
    /// Connection, DNS or unreachable-class failure
    NetworkUnreachable,
    /// Explicit load failure
    NavigationFailed,
    /// Readiness signal timed out; informational only, never a job failure
    ReadinessDegraded,
    /// The artifact could not be produced
    CaptureFailure,
    /// Anything unmatched
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NavigationTimeout => "NavigationTimeout",
            ErrorKind::NetworkUnreachable => "NetworkUnreachable",
            ErrorKind::NavigationFailed => "NavigationFailed",
            ErrorKind::ReadinessDegraded => "ReadinessDegraded",
            ErrorKind::CaptureFailure => "CaptureFailure",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }
}

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out"];

const UNREACHABLE_MARKERS: &[&str] = &[
    "err_name_not_resolved",
    "err_name_resolution_failed",
    "err_connection_refused",
    "err_connection_reset",
    "err_connection_timed_out",
    "err_address_unreachable",
    "err_internet_disconnected",
    "enotfound",
    "econnrefused",
    "eai_again",
    "getaddrinfo",
    "unreachable",
    "dns",
];

const NAVIGATION_MARKERS: &[&str] = &["net::err_", "navigation failed"];

/// Normalises low-level failures into [`ErrorKind`]s.
///
/// Classification only chooses the kind and the caller-facing message; a
/// failed job stays failed whatever the outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(&self, error: &RenderError) -> ClassifiedError {
        let kind = match error {
            RenderError::Validation(_) => ErrorKind::ValidationError,
            RenderError::Capture(_) => ErrorKind::CaptureFailure,
            RenderError::NavigationTimeout { .. } | RenderError::DeadlineExceeded(_) => {
                ErrorKind::NavigationTimeout
            }
            RenderError::Navigation(message) => match classify_message(message) {
                ErrorKind::InternalError => ErrorKind::NavigationFailed,
                kind => kind,
            },
            other => classify_message(&other.to_string()),
        };

        ClassifiedError::new(kind, error.to_string())
    }
}

/// Map a raw failure message onto the taxonomy.
///
/// The unreachable markers include `ERR_CONNECTION_TIMED_OUT`, which does not
/// contain the literal `timed out`, so it lands in `NetworkUnreachable`.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if contains_any(TIMEOUT_MARKERS) {
        ErrorKind::NavigationTimeout
    } else if contains_any(UNREACHABLE_MARKERS) {
        ErrorKind::NetworkUnreachable
    } else if contains_any(NAVIGATION_MARKERS) {
        ErrorKind::NavigationFailed
    } else {
        ErrorKind::InternalError
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Engine(format!("unexpected evaluation result: {err}"))
    }
}
