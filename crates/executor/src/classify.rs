//! HTTP status classification
//!
//! Maps a remote response status onto the `ErrorKind` taxonomy used by the
//! dispatcher. Only 401/403 retire a credential; 429 is treated as
//! backpressure and slows the rate limiter down.

use crate::{ErrorKind, Outcome};

/// Classify an HTTP status code into an execution outcome.
///
/// 2xx succeed. 401/403 are `AuthInvalid`, 404/410 `NotFound`, 429
/// `RateLimited`, 408 and 5xx `Transient`. Everything else is `Unknown`.
pub fn classify_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        401 | 403 => Outcome::Failure(ErrorKind::AuthInvalid),
        404 | 410 => Outcome::Failure(ErrorKind::NotFound),
        429 => Outcome::Failure(ErrorKind::RateLimited),
        408 | 500..=599 => Outcome::Failure(ErrorKind::Transient),
        _ => Outcome::Failure(ErrorKind::Unknown),
    }
}
