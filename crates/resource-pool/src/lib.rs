//! Rotating credential pool for campaign workers
//!
//! Holds the resources loaded for one campaign and hands them out least
//! recently used first. Each resource remembers the targets it has already
//! acted on, so a credential never repeats an action against the same target.
//!
//! Resource lifecycle:
//! 1. Loaded from a `ResourceSource`, validity `Unknown`
//! 2. Worker acquires a `Lease` for a target, resource is held exclusively
//! 3. Worker releases the lease with the execution outcome
//! 4. Success → `Valid`; auth rejection or three unexplained failures in a
//!    row → `Invalid`, never handed out again
//! 5. Resources persist until the campaign ends

pub mod error;
pub mod pool;
pub mod source;

pub use error::{Error, Result};
pub use pool::{Disposition, Lease, PoolOptions, ResourcePool, Validity};
pub use source::{FileSource, ResourceEntry, ResourceSource, StaticSource};
