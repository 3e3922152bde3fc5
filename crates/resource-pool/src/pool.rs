//! Resource state and least-recently-used selection
//!
//! The pool owns every resource for the lifetime of a campaign. Workers get a
//! `Lease` from `acquire` and hand it back by value through `release` (after
//! executing) or `return_unused` (cancelled before executing), so a lease can
//! only ever be settled once.
//!
//! Selection skips resources that are `Invalid`, already held by another
//! worker (unless sharing is enabled), or have already targeted the requested
//! target. Among the rest, the least recently used wins; never-used resources
//! go first, in load order.

use std::collections::HashSet;

use common::Secret;
use executor::{Credential, ErrorKind, Outcome};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::source::{Parsed, ResourceEntry, ResourceSource};

/// Validity of a resource as observed by the campaign.
///
/// Transitions:
/// - Unknown → Valid (first success)
/// - Unknown/Valid → Invalid (auth rejected, or repeated unexplained failures)
/// - Invalid is final for the campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Unknown,
    Valid,
    Invalid,
}

impl Validity {
    pub fn label(self) -> &'static str {
        match self {
            Validity::Unknown => "unknown",
            Validity::Valid => "valid",
            Validity::Invalid => "invalid",
        }
    }
}

/// What happened to a resource when its lease was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Requeued,
    Retired,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Allow several workers to hold the same resource at once.
    pub allow_shared: bool,
    /// Consecutive `Unknown` failures after which a resource is retired.
    ///
    /// A resource acts on each target at most once, so the streak can only
    /// build up when one pool serves several targets.
    pub unknown_failure_limit: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            allow_shared: false,
            unknown_failure_limit: 3,
        }
    }
}

struct Resource {
    id: String,
    secret: Secret<String>,
    usage_count: u64,
    last_used: Option<Instant>,
    validity: Validity,
    previously_targeted: HashSet<String>,
    holders: usize,
    unknown_streak: u32,
}

impl Resource {
    fn new(id: String, secret: Secret<String>) -> Self {
        Self {
            id,
            secret,
            usage_count: 0,
            last_used: None,
            validity: Validity::Unknown,
            previously_targeted: HashSet::new(),
            holders: 0,
            unknown_streak: 0,
        }
    }
}

/// Next free `res-<n>` id, numbered by load position.
fn generated_id(taken: &mut HashSet<String>, mut position: usize) -> String {
    loop {
        position += 1;
        let id = format!("res-{position}");
        if taken.insert(id.clone()) {
            return id;
        }
    }
}

/// Exclusive claim on one resource for one target.
#[derive(Debug)]
pub struct Lease {
    slot: usize,
    credential: Credential,
    target_id: String,
}

impl Lease {
    pub fn id(&self) -> &str {
        &self.credential.id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }
}

/// Campaign-scoped credential pool.
///
/// A single `Mutex` guards all resource state; every public method takes it
/// briefly and never holds it across I/O.
pub struct ResourcePool {
    resources: Mutex<Vec<Resource>>,
    options: PoolOptions,
}

impl ResourcePool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
            options,
        }
    }

    /// Load resources from `source`, skipping malformed records, duplicate
    /// identifiers and repeated bare credentials. Bare credentials are named
    /// `res-<n>` by load position. Returns the number of resources added.
    pub async fn load(&self, source: &dyn ResourceSource) -> Result<usize> {
        let records = source.load().await?;

        let mut resources = self.resources.lock().await;
        let mut seen_ids: HashSet<String> = resources.iter().map(|r| r.id.clone()).collect();
        let mut seen_secrets: HashSet<Secret<String>> =
            resources.iter().map(|r| r.secret.clone()).collect();
        let mut loaded = 0usize;
        let mut skipped = 0usize;
        let mut duplicates = 0usize;

        for (line, raw) in records.iter().enumerate() {
            match ResourceEntry::parse(raw) {
                Parsed::Entry(ResourceEntry { id, secret }) => {
                    let id = match id {
                        Some(id) if seen_ids.insert(id.clone()) => id,
                        Some(_) => {
                            duplicates += 1;
                            continue;
                        }
                        // Bare records are matched on the credential itself
                        None if seen_secrets.contains(&secret) => {
                            duplicates += 1;
                            continue;
                        }
                        None => generated_id(&mut seen_ids, resources.len()),
                    };
                    seen_secrets.insert(secret.clone());
                    resources.push(Resource::new(id, secret));
                    loaded += 1;
                }
                Parsed::Ignored => {}
                Parsed::Malformed => {
                    debug!(line = line + 1, "skipping malformed resource record");
                    skipped += 1;
                }
            }
        }

        if loaded == 0 {
            warn!(source = %source.describe(), skipped, duplicates, "no usable resources");
            return Err(Error::NoUsableEntries {
                skipped,
                duplicates,
            });
        }

        info!(
            source = %source.describe(),
            loaded,
            skipped,
            duplicates,
            total = resources.len(),
            "resources loaded"
        );
        Ok(loaded)
    }

    /// Lease the least recently used resource that has not yet acted on
    /// `target_id`. Returns `None` when no such resource is free.
    pub async fn acquire(&self, target_id: &str) -> Option<Lease> {
        let mut resources = self.resources.lock().await;
        let allow_shared = self.options.allow_shared;

        let slot = resources
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.validity != Validity::Invalid
                    && (allow_shared || r.holders == 0)
                    && !r.previously_targeted.contains(target_id)
            })
            .min_by_key(|(idx, r)| (r.last_used, *idx))
            .map(|(idx, _)| idx)?;

        let resource = &mut resources[slot];
        resource.holders += 1;
        resource.previously_targeted.insert(target_id.to_string());
        debug!(resource_id = %resource.id, target_id, "resource acquired");

        Some(Lease {
            slot,
            credential: Credential {
                id: resource.id.clone(),
                secret: resource.secret.clone(),
            },
            target_id: target_id.to_string(),
        })
    }

    /// Settle a lease after an execution and apply the outcome to the
    /// resource's validity.
    pub async fn release(&self, lease: Lease, outcome: Outcome) -> Disposition {
        let mut resources = self.resources.lock().await;
        let limit = self.options.unknown_failure_limit;
        let resource = &mut resources[lease.slot];

        resource.holders = resource.holders.saturating_sub(1);
        resource.usage_count += 1;
        resource.last_used = Some(Instant::now());

        let retire_reason = match outcome {
            Outcome::Success => {
                resource.unknown_streak = 0;
                if resource.validity == Validity::Unknown {
                    resource.validity = Validity::Valid;
                }
                None
            }
            Outcome::Failure(ErrorKind::AuthInvalid) => Some("auth_invalid"),
            Outcome::Failure(ErrorKind::Unknown) => {
                resource.unknown_streak += 1;
                (resource.unknown_streak >= limit).then_some("repeated_unknown")
            }
            Outcome::Failure(_) => {
                resource.unknown_streak = 0;
                None
            }
        };

        match retire_reason {
            Some(reason) if resource.validity != Validity::Invalid => {
                resource.validity = Validity::Invalid;
                warn!(resource_id = %resource.id, reason, "resource retired");
                metrics::counter!("pool_resources_retired_total", "reason" => reason).increment(1);
                Disposition::Retired
            }
            Some(_) => Disposition::Retired,
            None => Disposition::Requeued,
        }
    }

    /// Give back a lease that was never executed. The resource keeps its
    /// usage statistics and may be used against the same target again.
    pub async fn return_unused(&self, lease: Lease) {
        let mut resources = self.resources.lock().await;
        let resource = &mut resources[lease.slot];
        resource.holders = resource.holders.saturating_sub(1);
        resource.previously_targeted.remove(&lease.target_id);
        debug!(resource_id = %resource.id, target_id = %lease.target_id, "lease returned unused");
    }

    /// Resources that are not `Invalid`.
    pub async fn available_count(&self) -> usize {
        let resources = self.resources.lock().await;
        resources
            .iter()
            .filter(|r| r.validity != Validity::Invalid)
            .count()
    }

    /// Total number of loaded resources.
    pub async fn len(&self) -> usize {
        self.resources.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn validity(&self, resource_id: &str) -> Option<Validity> {
        let resources = self.resources.lock().await;
        resources
            .iter()
            .find(|r| r.id == resource_id)
            .map(|r| r.validity)
    }

    pub async fn usage_count(&self, resource_id: &str) -> Option<u64> {
        let resources = self.resources.lock().await;
        resources
            .iter()
            .find(|r| r.id == resource_id)
            .map(|r| r.usage_count)
    }

    /// Pool summary for the monitor endpoint. Never includes credentials.
    ///
    /// Status mapping: no invalid resources → healthy, some → degraded,
    /// none available → exhausted.
    pub async fn health(&self) -> serde_json::Value {
        let resources = self.resources.lock().await;

        let mut unknown = 0usize;
        let mut valid = 0usize;
        let mut invalid = 0usize;
        let mut in_use = 0usize;
        let mut entries = Vec::with_capacity(resources.len());

        for r in resources.iter() {
            match r.validity {
                Validity::Unknown => unknown += 1,
                Validity::Valid => valid += 1,
                Validity::Invalid => invalid += 1,
            }
            if r.holders > 0 {
                in_use += 1;
            }
            entries.push(serde_json::json!({
                "id": r.id,
                "validity": r.validity.label(),
                "usage_count": r.usage_count,
                "in_use": r.holders > 0,
            }));
        }

        let total = resources.len();
        let status = if total == 0 || invalid == total {
            "exhausted"
        } else if invalid > 0 {
            "degraded"
        } else {
            "healthy"
        };

        serde_json::json!({
            "status": status,
            "resources_total": total,
            "resources_unknown": unknown,
            "resources_valid": valid,
            "resources_invalid": invalid,
            "resources_in_use": in_use,
            "resources": entries,
        })
    }
}
