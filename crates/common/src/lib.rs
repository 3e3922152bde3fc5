//! Common types shared by the campaign dispatch crates

mod backoff;
mod error;
mod secret;

pub use backoff::Backoff;
pub use error::{Error, Result};
pub use secret::Secret;
