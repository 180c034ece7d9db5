//! Centralized error taxonomy for the engine (spec.md §7).
//!
//! `Error::Response` models "thrown a response object" (auth rejection,
//! handler short-circuit): it is propagated as-is and never reaches
//! `onError`. Every other variant is a genuine failure and is classified
//! per the table in spec.md §7.

use crate::response::Response;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A handler or middleware short-circuited with a concrete response.
    /// Not logged; not passed to `onError`.
    Response(Response),
    /// Route lookup missed, or a queue name has no registered handler.
    NotFound(String),
    /// Route matched but the method is not in its accepted set.
    MethodNotAllowed,
    /// Request carries a body whose Content-Type the route does not accept.
    UnsupportedMediaType(String),
    /// `authenticate` returned a user without an `id` — a programmer error.
    AuthMisconfigured(String),
    /// Any other failure raised by user code or the engine itself.
    Handler(String),
    /// The step deadline elapsed before a result was produced.
    Timeout,
    /// Startup-time manifest validation failure (spec.md §4.B).
    Manifest { source: String, message: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Response(r) => write!(f, "thrown response ({})", r.status),
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::MethodNotAllowed => write!(f, "method not allowed"),
            Error::UnsupportedMediaType(ct) => write!(f, "unsupported media type: {}", ct),
            Error::AuthMisconfigured(msg) => write!(f, "authenticate misconfigured: {}", msg),
            Error::Handler(msg) => write!(f, "handler error: {}", msg),
            Error::Timeout => write!(f, "timed out"),
            Error::Manifest { source, message } => {
                write!(f, "manifest error in {}: {}", source, message)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Handler(format!("JSON error: {}", err))
    }
}

/// Startup-fatal error, distinct from `Error` because it can never be
/// recovered by `onError` — it aborts `Services::build()`.
#[derive(Debug)]
pub struct ManifestError {
    pub source: String,
    pub message: String,
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.message)
    }
}

impl std::error::Error for ManifestError {}

impl ManifestError {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        ManifestError {
            source: source.into(),
            message: message.into(),
        }
    }
}
