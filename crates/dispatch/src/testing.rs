//! Test doubles shared by the worker and controller tests

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use executor::{ActionExecutor, Credential, Outcome, ResolutionError, Target, TargetResolver};

type OutcomeFn = Box<dyn Fn(&str) -> Outcome + Send + Sync>;

/// Executor whose outcome depends only on the resource id.
pub(crate) struct FakeExecutor {
    outcome_for: OutcomeFn,
    delay: Duration,
    panic_on: Option<String>,
    calls: AtomicU64,
    active: Mutex<HashMap<String, usize>>,
    max_per_resource: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new(outcome_for: impl Fn(&str) -> Outcome + Send + Sync + 'static) -> Self {
        Self {
            outcome_for: Box::new(outcome_for),
            delay: Duration::ZERO,
            panic_on: None,
            calls: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            max_per_resource: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_| Outcome::Success)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn panicking_on(mut self, resource_id: &str) -> Self {
        self.panic_on = Some(resource_id.to_string());
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls seen for any single resource.
    pub fn max_per_resource(&self) -> usize {
        self.max_per_resource.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl ActionExecutor for FakeExecutor {
    fn id(&self) -> &str {
        "fake"
    }

    fn execute<'a>(
        &'a self,
        credential: &'a Credential,
        _target: &'a Target,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on.as_deref() == Some(credential.id.as_str()) {
            panic!("executor blew up on {}", credential.id);
        }
        self.executed.lock().unwrap().push(credential.id.clone());
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(credential.id.clone()).or_insert(0);
            *count += 1;
            self.max_per_resource.fetch_max(*count, Ordering::SeqCst);
        }
        let outcome = (self.outcome_for)(&credential.id);
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(count) = self.active.lock().unwrap().get_mut(&credential.id) {
                *count -= 1;
            }
            outcome
        })
    }
}

/// Resolver backed by a fixed map of reference to target id.
pub(crate) struct FakeResolver {
    known: HashMap<String, String>,
}

impl FakeResolver {
    pub fn with(reference: &str, id: &str) -> Self {
        Self {
            known: HashMap::from([(reference.to_string(), id.to_string())]),
        }
    }
}

impl TargetResolver for FakeResolver {
    fn resolve<'a>(
        &'a self,
        reference: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Target, ResolutionError>> + Send + 'a>> {
        Box::pin(async move {
            self.known
                .get(reference)
                .map(|id| Target {
                    id: id.clone(),
                    reference: reference.to_string(),
                })
                .ok_or_else(|| ResolutionError::NotFound(reference.to_string()))
        })
    }
}

pub(crate) fn resource_records(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("r{i}=secret-{i}")).collect()
}

pub(crate) fn target() -> Target {
    Target {
        id: "target-1".into(),
        reference: "alpha".into(),
    }
}
