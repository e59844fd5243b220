//! A leaky-bucket RPS throttler for outgoing DHT queries (spec.md §4.7).
//!
//! [`ThrottlerCore`] holds the deterministic queueing/release logic and is
//! unit-testable without a real clock or executor. [`Throttler`] wraps it
//! with a background `tokio` timer loop and posts released actions onto
//! the runtime, matching the "disabled submissions bypass immediately"
//! behavior.

use log::{trace, warn};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub enabled: bool,
    pub max_rps: f64,
    pub leak_probability: f64,
    pub max_queue_size: usize,
    pub timer_interval: Duration,
    /// Window, in releases, over which latency min/max/avg are computed.
    pub latency_window: usize,
    /// Window over which the instantaneous release rate is measured.
    pub rate_window: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            enabled: false,
            max_rps: 1000.0,
            leak_probability: 0.1,
            max_queue_size: 1000,
            timer_interval: Duration::from_millis(10),
            latency_window: 100,
            rate_window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub current_rate: f64,
    pub drop_count: u64,
    pub queue_len: usize,
    pub min_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
    pub avg_latency: Option<Duration>,
}

struct QueuedAction<T> {
    submitted_at: Instant,
    payload: T,
}

/// The deterministic core of the throttler: a bounded FIFO queue plus the
/// bookkeeping needed to release actions at `max_rps` and to apply the
/// Bernoulli leak policy on overflow.
pub struct ThrottlerCore<T> {
    config: Config,
    queue: VecDeque<QueuedAction<T>>,
    release_history: VecDeque<Instant>,
    latency_history: VecDeque<Duration>,
    drop_count: u64,
}

impl<T> ThrottlerCore<T> {
    pub fn new(config: Config) -> ThrottlerCore<T> {
        ThrottlerCore {
            config,
            queue: VecDeque::new(),
            release_history: VecDeque::new(),
            latency_history: VecDeque::new(),
            drop_count: 0,
        }
    }

    /// Submits `payload`. When the throttler is disabled, returns it back
    /// immediately for the caller to run (bypass mode). Otherwise queues
    /// it (applying the leaky-bucket overflow policy if the queue is
    /// full) and returns `None`.
    pub fn submit(&mut self, payload: T, now: Instant) -> Option<T> {
        if !self.config.enabled {
            return Some(payload);
        }

        if self.queue.len() < self.config.max_queue_size {
            self.queue.push_back(QueuedAction {
                submitted_at: now,
                payload,
            });
            return None;
        }

        let leak: f64 = rand::thread_rng().gen();
        if leak < self.config.leak_probability {
            self.queue.pop_front();
            self.drop_count += 1;
            self.queue.push_back(QueuedAction {
                submitted_at: now,
                payload,
            });
        } else {
            self.drop_count += 1;
        }
        None
    }

    fn current_rate(&self, now: Instant) -> f64 {
        let window = self.config.rate_window;
        let count = self
            .release_history
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) <= window)
            .count();
        count as f64 / window.as_secs_f64()
    }

    /// Releases as many queued actions as fit under the rate budget.
    /// Called from the 10ms timer in the real deployment; tests call it
    /// directly with a controlled `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<T> {
        let mut released = Vec::new();

        while !self.queue.is_empty() && self.current_rate(now) < self.config.max_rps {
            let action = self.queue.pop_front().expect("checked non-empty");
            let latency = now.saturating_duration_since(action.submitted_at);

            self.release_history.push_back(now);
            self.latency_history.push_back(latency);
            if self.latency_history.len() > self.config.latency_window {
                self.latency_history.pop_front();
            }

            released.push(action.payload);
        }

        let cutoff = self.config.rate_window * 2;
        while let Some(&front) = self.release_history.front() {
            if now.saturating_duration_since(front) > cutoff {
                self.release_history.pop_front();
            } else {
                break;
            }
        }

        released
    }

    pub fn metrics(&self, now: Instant) -> Metrics {
        Metrics {
            current_rate: self.current_rate(now),
            drop_count: self.drop_count,
            queue_len: self.queue.len(),
            min_latency: self.latency_history.iter().min().copied(),
            max_latency: self.latency_history.iter().max().copied(),
            avg_latency: if self.latency_history.is_empty() {
                None
            } else {
                Some(self.latency_history.iter().sum::<Duration>() / self.latency_history.len() as u32)
            },
        }
    }
}

/// Async wrapper running a background release loop on the `tokio`
/// runtime. Queued payloads are boxed `FnOnce` actions; releasing one
/// posts it onto the runtime via `tokio::spawn`.
#[derive(Clone)]
pub struct Throttler {
    core: Arc<Mutex<ThrottlerCore<Box<dyn FnOnce() + Send>>>>,
}

impl Throttler {
    pub fn spawn(config: Config) -> Throttler {
        let core = Arc::new(Mutex::new(ThrottlerCore::<Box<dyn FnOnce() + Send>>::new(config)));
        let background = core.clone();
        let interval = config.timer_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let released = {
                    let mut core = background.lock().expect("throttler mutex poisoned");
                    core.tick(Instant::now())
                };
                if !released.is_empty() {
                    trace!("throttler releasing {} actions", released.len());
                }
                for action in released {
                    tokio::spawn(async move { action() });
                }
            }
        });
        Throttler { core }
    }

    /// Submits `action`. If the throttler is disabled, runs it
    /// immediately on the runtime; otherwise it is queued and released by
    /// the background loop.
    pub fn submit(&self, action: impl FnOnce() + Send + 'static) {
        let now = Instant::now();
        let bypassed = {
            let mut core = self.core.lock().expect("throttler mutex poisoned");
            core.submit(Box::new(action), now)
        };
        match bypassed {
            Some(action) => {
                tokio::spawn(async move { action() });
            }
            None => {}
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.core
            .lock()
            .expect("throttler mutex poisoned")
            .metrics(Instant::now())
    }
}

pub fn warn_on_high_drop_rate(metrics: &Metrics) {
    if metrics.drop_count > 0 && metrics.queue_len == 0 {
        warn!("throttler has dropped {} actions so far", metrics.drop_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_throttler_bypasses_immediately() {
        let mut core: ThrottlerCore<u32> = ThrottlerCore::new(Config {
            enabled: false,
            ..Config::default()
        });
        let now = Instant::now();
        assert_eq!(core.submit(1, now), Some(1));
    }

    #[test]
    fn enabled_throttler_queues_then_releases_under_rate() {
        let mut core: ThrottlerCore<u32> = ThrottlerCore::new(Config {
            enabled: true,
            max_rps: 1000.0,
            ..Config::default()
        });
        let now = Instant::now();
        assert_eq!(core.submit(1, now), None);
        assert_eq!(core.submit(2, now), None);

        let released = core.tick(now + Duration::from_millis(10));
        assert_eq!(released, vec![1, 2]);
    }

    #[test]
    fn rate_limit_defers_release_past_budget() {
        let mut core: ThrottlerCore<u32> = ThrottlerCore::new(Config {
            enabled: true,
            max_rps: 1.0,
            rate_window: Duration::from_secs(1),
            ..Config::default()
        });
        let now = Instant::now();
        core.submit(1, now);
        core.submit(2, now);

        let released = core.tick(now);
        assert_eq!(released, vec![1]);
        assert_eq!(core.metrics(now).queue_len, 1);
    }

    #[test]
    fn overflow_drops_something_and_counts_it() {
        let mut core: ThrottlerCore<u32> = ThrottlerCore::new(Config {
            enabled: true,
            max_queue_size: 2,
            leak_probability: 0.0,
            ..Config::default()
        });
        let now = Instant::now();
        core.submit(1, now);
        core.submit(2, now);
        core.submit(3, now); // leak_probability 0.0: new item 3 is dropped.

        assert_eq!(core.metrics(now).drop_count, 1);
        assert_eq!(core.metrics(now).queue_len, 2);
    }

    #[test]
    fn overflow_can_leak_the_queue_head() {
        let mut core: ThrottlerCore<u32> = ThrottlerCore::new(Config {
            enabled: true,
            max_queue_size: 2,
            leak_probability: 1.0,
            ..Config::default()
        });
        let now = Instant::now();
        core.submit(1, now);
        core.submit(2, now);
        core.submit(3, now); // leak_probability 1.0: head (1) is leaked, 3 enqueued.

        let released = core.tick(now + Duration::from_secs(2));
        assert_eq!(released, vec![2, 3]);
        assert_eq!(core.metrics(now).drop_count, 1);
    }

    #[tokio::test]
    async fn spawned_throttler_runs_disabled_action_immediately() {
        let throttler = Throttler::spawn(Config {
            enabled: false,
            ..Config::default()
        });
        let (tx, rx) = tokio::sync::oneshot::channel();
        throttler.submit(move || {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("action should have run promptly")
            .unwrap();
    }
}
