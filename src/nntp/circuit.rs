//! Per-server circuit breaker
//!
//! Guards a flaky downstream: `Closed` routes normally, `Open` skips the
//! server, `HalfOpen` admits exactly one probe after the cooldown.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Observable breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal routing
    Closed,
    /// Server skipped until the cooldown elapses
    Open,
    /// One probe in flight; everyone else is skipped
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Circuit breaker with a consecutive-failure open threshold and a fixed
/// cooldown before a single half-open probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker that opens at `threshold` consecutive failures and
    /// admits a probe after `cooldown`.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner::Closed),
        }
    }

    /// Ask to route a request through this server.
    ///
    /// Returns false while the circuit is open (cooldown running) or while a
    /// half-open probe is already in flight. When the cooldown has elapsed,
    /// the first caller transitions to `HalfOpen` and becomes the probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match &*inner {
            Inner::Closed => true,
            Inner::Open { since } if since.elapsed() >= self.cooldown => {
                *inner = Inner::HalfOpen;
                true
            }
            Inner::Open { .. } => false,
            Inner::HalfOpen => false,
        }
    }

    /// Record a success-class outcome (data returned, or a definitive
    /// NotFound): closes the circuit.
    pub fn on_success(&self) {
        *self.lock() = Inner::Closed;
    }

    /// Record a failure with the server's current consecutive-failure count.
    ///
    /// A failed half-open probe re-opens with a fresh cooldown; a closed
    /// circuit opens once the threshold is reached.
    pub fn on_failure(&self, consecutive_failures: u32) {
        let mut inner = self.lock();
        match &*inner {
            Inner::HalfOpen => *inner = Inner::Open { since: Instant::now() },
            Inner::Closed if consecutive_failures >= self.threshold => {
                *inner = Inner::Open { since: Instant::now() };
            }
            _ => {}
        }
    }

    /// Current state (for stats and tests)
    pub fn state(&self) -> CircuitState {
        match &*self.lock() {
            Inner::Closed => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen => CircuitState::HalfOpen,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned breaker mutex means a panic mid-transition; the state is
        // a plain enum so continuing with it is safe.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
