//! Circuit breaker (C3) — per-endpoint failure gate.
//!
//! A small state machine (`closed`/`open`/`half_open`) guarded by a single
//! mutex per endpoint, with a registry keyed by endpoint name.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{CoreError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig { failure_threshold: 5, recovery_timeout: Duration::from_secs(30) }
    }
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    /// Set when a half-open probe is let through; cleared on the probe's
    /// outcome. Gates every caller but the first during half-open.
    probe_in_flight: bool,
}

/// A single endpoint's breaker. Transitions happen under `self.inner`'s
/// mutex only — no cross-endpoint coordination.
pub struct Breaker {
    endpoint: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl Breaker {
    fn new(endpoint: String, config: BreakerConfig) -> Self {
        Breaker {
            endpoint,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_at: None,
                next_probe_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call should be allowed right now. `open` transitions to
    /// `half_open` lazily here once `next_probe_at` has passed, allowing
    /// exactly one probe call through; any caller arriving while that probe
    /// is still in flight is rejected, same as `open`.
    pub async fn allow(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ErrorKind::SpecialistUnavailable(self.endpoint.clone()).into())
                } else {
                    inner.probe_in_flight = true;
                    info!(endpoint = %self.endpoint, "breaker half-open, allowing probe call");
                    Ok(())
                }
            }
            BreakerState::Open => {
                let now = Instant::now();
                if inner.next_probe_at.map(|t| now >= t).unwrap_or(false) {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(endpoint = %self.endpoint, "breaker half-open, allowing probe call");
                    Ok(())
                } else {
                    Err(ErrorKind::SpecialistUnavailable(self.endpoint.clone()).into())
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != BreakerState::Closed {
            info!(endpoint = %self.endpoint, "breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.next_probe_at = None;
        inner.probe_in_flight = false;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            BreakerState::HalfOpen => {
                warn!(endpoint = %self.endpoint, "probe failed, breaker re-opened");
                inner.state = BreakerState::Open;
                inner.next_probe_at = Some(Instant::now() + self.config.recovery_timeout);
                inner.probe_in_flight = false;
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        endpoint = %self.endpoint,
                        failures = inner.failure_count,
                        "breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.next_probe_at = Some(Instant::now() + self.config.recovery_timeout);
                }
            }
            BreakerState::Open => {
                // Already open; extend the probe window isn't necessary.
            }
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }
}

/// Registry of per-endpoint breakers, one [`Breaker`] (and its own mutex)
/// per logical endpoint name.
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, Arc<Breaker>>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        BreakerRegistry { breakers: Arc::new(DashMap::new()), config }
    }

    pub fn get_or_create(&self, endpoint: &str) -> Arc<Breaker> {
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(endpoint.to_string(), self.config)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        });
        let breaker = registry.get_or_create("content_analysis");

        for _ in 0..3 {
            breaker.record_failure().await;
        }

        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(breaker.allow().await.is_err());
    }

    #[tokio::test]
    async fn half_open_probe_resets_on_success() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
        });
        let breaker = registry.get_or_create("audience_insights");

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow().await.is_ok());
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_reopens_on_failure() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
        });
        let breaker = registry.get_or_create("seo_discoverability");

        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow().await.is_ok());

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn only_one_concurrent_caller_gets_the_half_open_probe() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
        });
        let breaker = registry.get_or_create("monetization");

        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let attempts = (0..5).map(|_| {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { breaker.allow().await.is_ok() })
        });
        let results = futures::future::join_all(attempts).await;
        let allowed = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert_eq!(allowed, 1);
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn independent_endpoints_do_not_share_state() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.get_or_create("content_analysis");
        let b = registry.get_or_create("monetization");

        for _ in 0..5 {
            a.record_failure().await;
        }

        assert_eq!(a.state().await, BreakerState::Open);
        assert_eq!(b.state().await, BreakerState::Closed);
    }
}
