//! Action executor abstraction for campaign workers
//!
//! Defines the `ActionExecutor` and `TargetResolver` traits that decouple the
//! dispatch engine from whatever actually performs a unit of work. The engine
//! only sees an `Outcome` per attempt and uses its `ErrorKind` to drive retry
//! and resource retirement:
//! - `Transient` / `RateLimited` are retried with backoff
//! - `AuthInvalid` retires the resource for the rest of the campaign
//! - `NotFound` / `Unknown` count as plain failures

pub mod classify;
pub mod http;

pub use classify::classify_status;
pub use http::{HttpExecutor, HttpResolver};

use common::Secret;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Why a single execution attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, connection resets, 5xx
    Transient,
    /// Explicit backpressure from the remote side
    RateLimited,
    /// Credential rejected, never reuse the resource
    AuthInvalid,
    /// Target vanished or the action does not apply
    NotFound,
    /// Anything the executor could not classify
    Unknown,
}

impl ErrorKind {
    /// Whether another attempt with the same resource may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimited)
    }

    /// Whether the resource must be retired immediately.
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorKind::AuthInvalid)
    }

    /// Label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::AuthInvalid => "auth_invalid",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Result of one `ActionExecutor::execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(ErrorKind),
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn error_kind(self) -> Option<ErrorKind> {
        match self {
            Outcome::Success => None,
            Outcome::Failure(kind) => Some(kind),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure(kind) => kind.label(),
        }
    }
}

/// The entity a campaign acts on, as returned by a `TargetResolver`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    /// Stable identifier used for per-resource dedup
    pub id: String,
    /// The reference the caller supplied before resolution
    pub reference: String,
}

/// Credential handed to an executor for one attempt.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub secret: Secret<String>,
}

/// Errors from resolving a target reference.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("target not found: {0}")]
    NotFound(String),

    #[error("target resolver unavailable: {0}")]
    Unavailable(String),
}

/// Performs one unit of work for a credential against a target.
///
/// Implementations must not retry internally; the dispatcher owns retry,
/// backoff and rate limiting. Uses `Pin<Box<dyn Future>>` return types so
/// executors can be shared as `Arc<dyn ActionExecutor>`.
pub trait ActionExecutor: Send + Sync {
    /// Identifier for logging (e.g. "http")
    fn id(&self) -> &str;

    fn execute<'a>(
        &'a self,
        credential: &'a Credential,
        target: &'a Target,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;
}

/// Turns a user-supplied reference into a concrete `Target`.
pub trait TargetResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        reference: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Target, ResolutionError>> + Send + 'a>>;
}
