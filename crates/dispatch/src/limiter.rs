//! Sliding-window rate limiter shared by all workers
//!
//! Admits at most `max_calls` within any trailing `period`. Waiters queue on a
//! fair async mutex, so under contention they are admitted in arrival order.
//! The window itself sits behind a short-held sync lock so that `penalize`
//! and `configure` never wait behind a sleeping caller.
//!
//! Adaptive mode: `penalize(factor)` shrinks the effective limit for
//! `penalty_cooldown`, after which the configured limit comes back.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

struct Window {
    /// `None` means unlimited
    configured_max: Option<usize>,
    effective_max: usize,
    period: Duration,
    penalty_cooldown: Duration,
    penalty_until: Option<Instant>,
    calls: VecDeque<Instant>,
}

impl Window {
    fn restore_if_cooled(&mut self, now: Instant) {
        if let (Some(until), Some(max)) = (self.penalty_until, self.configured_max)
            && now >= until
        {
            self.effective_max = max;
            self.penalty_until = None;
            info!(max_calls = max, "rate limit penalty expired");
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= self.period {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit now, or return the instant at which admission should be retried.
    fn try_admit(&mut self, now: Instant) -> Result<(), Instant> {
        self.restore_if_cooled(now);
        if self.configured_max.is_none() {
            return Ok(());
        }
        self.purge(now);

        let max = self.effective_max;
        if self.calls.len() < max {
            self.calls.push_back(now);
            return Ok(());
        }

        // The call at `len - max` must leave the window before one more fits.
        let blocking = self.calls[self.calls.len() - max];
        let mut wake = blocking + self.period;
        if let Some(until) = self.penalty_until {
            wake = wake.min(until);
        }
        Err(wake)
    }
}

pub struct RateLimiter {
    turn: tokio::sync::Mutex<()>,
    window: Mutex<Window>,
    reconfigured: Notify,
}

impl RateLimiter {
    /// Allow `max_calls` per trailing `period`. A zero limit is raised to one.
    pub fn new(max_calls: u32, period: Duration) -> Self {
        let max = max_calls.max(1) as usize;
        Self::with_window(Window {
            configured_max: Some(max),
            effective_max: max,
            period,
            penalty_cooldown: Duration::from_secs(30),
            penalty_until: None,
            calls: VecDeque::with_capacity(max),
        })
    }

    /// A limiter that admits every call immediately.
    pub fn unlimited() -> Self {
        Self::with_window(Window {
            configured_max: None,
            effective_max: usize::MAX,
            period: Duration::ZERO,
            penalty_cooldown: Duration::ZERO,
            penalty_until: None,
            calls: VecDeque::new(),
        })
    }

    fn with_window(window: Window) -> Self {
        Self {
            turn: tokio::sync::Mutex::new(()),
            window: Mutex::new(window),
            reconfigured: Notify::new(),
        }
    }

    /// How long a penalty lasts before the configured limit is restored.
    pub fn with_penalty_cooldown(self, cooldown: Duration) -> Self {
        self.window().penalty_cooldown = cooldown;
        self
    }

    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the limit at runtime. Clears any active penalty and wakes the
    /// caller at the head of the queue so it can re-check.
    pub fn configure(&self, max_calls: u32, period: Duration) {
        let max = max_calls.max(1) as usize;
        {
            let mut window = self.window();
            window.configured_max = Some(max);
            window.effective_max = max;
            window.period = period;
            window.penalty_until = None;
        }
        info!(max_calls = max, period_ms = period.as_millis() as u64, "rate limit configured");
        self.reconfigured.notify_waiters();
    }

    /// Wait until one more call fits in the window, then record it.
    pub async fn acquire_slot(&self) {
        let _turn = self.turn.lock().await;
        loop {
            let notified = self.reconfigured.notified();
            let wake = match self.window().try_admit(Instant::now()) {
                Ok(()) => return,
                Err(wake) => wake,
            };
            debug!(
                wait_ms = wake.saturating_duration_since(Instant::now()).as_millis() as u64,
                "rate limited, waiting for slot"
            );
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = notified => {}
            }
        }
    }

    /// Shrink the effective limit by `factor` (clamped to `(0, 1]`) for the
    /// penalty cooldown. Never drops below one call per period. No-op on an
    /// unlimited limiter.
    pub fn penalize(&self, factor: f64) {
        let mut window = self.window();
        let Some(_) = window.configured_max else {
            return;
        };
        let factor = if factor.is_finite() {
            factor.clamp(f64::MIN_POSITIVE, 1.0)
        } else {
            1.0
        };
        let shrunk = ((window.effective_max as f64) * factor).floor() as usize;
        window.effective_max = shrunk.max(1);
        window.penalty_until = Some(Instant::now() + window.penalty_cooldown);
        info!(
            effective_max = window.effective_max,
            cooldown_secs = window.penalty_cooldown.as_secs(),
            "rate limit penalized"
        );
        metrics::counter!("campaign_rate_limit_penalties_total").increment(1);
    }

    /// Current limit after penalties; `None` when unlimited.
    pub fn effective_max(&self) -> Option<usize> {
        let mut window = self.window();
        window.restore_if_cooled(Instant::now());
        window.configured_max.map(|_| window.effective_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn eleven_calls_at_five_per_second_take_two_seconds() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..11 {
            limiter.acquire_slot().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "took {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn never_admits_more_than_max_in_any_window() {
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(1)));
        let admitted = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..6 {
                    limiter.acquire_slot().await;
                    admitted.lock().unwrap().push(Instant::now());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut times = admitted.lock().unwrap().clone();
        times.sort();
        assert_eq!(times.len(), 24);
        for (i, &t) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .filter(|&&other| other.duration_since(t) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 5, "{in_window} calls within one second");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_arrival_order() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_millis(100)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for id in 0..5 {
            let limiter = limiter.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                limiter.acquire_slot().await;
                order.lock().unwrap().push(id);
            }));
            tokio::task::yield_now().await;
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.acquire_slot().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.effective_max(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_shrinks_then_restores() {
        let limiter =
            RateLimiter::new(4, Duration::from_secs(1)).with_penalty_cooldown(Duration::from_secs(5));

        limiter.penalize(0.5);
        assert_eq!(limiter.effective_max(), Some(2));
        limiter.penalize(0.1);
        assert_eq!(limiter.effective_max(), Some(1));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.effective_max(), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn penalized_limiter_slows_admission() {
        let limiter =
            RateLimiter::new(4, Duration::from_secs(1)).with_penalty_cooldown(Duration::from_secs(60));
        limiter.penalize(0.5);

        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire_slot().await;
        }
        // 2 per second: the 3rd and 4th calls wait for the next window
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn configure_wakes_waiting_caller() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(10)));
        limiter.acquire_slot().await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                limiter.acquire_slot().await;
                start.elapsed()
            })
        };
        tokio::task::yield_now().await;

        limiter.configure(5, Duration::from_secs(10));
        let waited = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should be admitted after reconfigure")
            .unwrap();
        assert!(waited < Duration::from_secs(10));
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.effective_max(), Some(1));
    }
}
