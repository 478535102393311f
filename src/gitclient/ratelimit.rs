//! Outbound request pacing per provider.
//!
//! Each client owns one limiter. The limiter spaces requests at the
//! provider's nominal rate and adapts from the rate headers parsed off every
//! response: when the remaining budget runs low the pacing interval is
//! stretched, and near exhaustion admission is refused until the advertised
//! reset passes.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::error::GitClientError;

/// Near-term API headroom as advertised by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub limit: u32,
    pub remaining: u32,
    pub reset: OffsetDateTime,
}

/// Remaining/limit ratio below which pacing slows down.
const SLOWDOWN_RATIO: f64 = 0.10;
/// Remaining/limit ratio below which admission is refused until reset.
const REFUSE_RATIO: f64 = 0.02;
/// Pacing multiplier applied in the slowdown band.
const SLOWDOWN_FACTOR: u32 = 5;

struct LimiterState {
    budget: RateBudget,
    next_allowed: Instant,
}

pub struct RateLimiter {
    /// Base spacing between requests; `None` means unlimited (fallback).
    spacing: Option<Duration>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    fn new(spacing: Option<Duration>, nominal: u32, window: Duration) -> Self {
        let reset = OffsetDateTime::now_utc() + window;
        RateLimiter {
            spacing,
            state: Mutex::new(LimiterState {
                budget: RateBudget {
                    limit: nominal,
                    remaining: nominal,
                    reset,
                },
                next_allowed: Instant::now(),
            }),
        }
    }

    /// GitHub-family pacing: ~5,000 requests per hour.
    pub fn github() -> Self {
        let window = Duration::from_secs(3600);
        RateLimiter::new(Some(window / 5_000), 5_000, window)
    }

    /// GitLab-family pacing: ~2,000 requests per minute.
    pub fn gitlab() -> Self {
        let window = Duration::from_secs(60);
        RateLimiter::new(Some(window / 2_000), 2_000, window)
    }

    /// Admits everything; used by the command-line fallback client.
    pub fn unlimited() -> Self {
        RateLimiter::new(None, 1_000_000, Duration::from_secs(3600))
    }

    /// Current pacing interval, stretched when the budget runs low.
    fn current_spacing(&self, budget: &RateBudget) -> Duration {
        let Some(base) = self.spacing else {
            return Duration::ZERO;
        };
        if budget.limit > 0 {
            let ratio = budget.remaining as f64 / budget.limit as f64;
            if ratio < SLOWDOWN_RATIO {
                return base * SLOWDOWN_FACTOR;
            }
        }
        base
    }

    /// Whether the budget is spent and the reset lies in the future.
    fn exhausted(budget: &RateBudget) -> Option<OffsetDateTime> {
        if budget.reset <= OffsetDateTime::now_utc() {
            return None;
        }
        if budget.remaining == 0 {
            return Some(budget.reset);
        }
        if budget.limit > 0 {
            let ratio = budget.remaining as f64 / budget.limit as f64;
            if ratio < REFUSE_RATIO {
                return Some(budget.reset);
            }
        }
        None
    }

    /// Non-blocking admission decision. Claims a slot when it returns true.
    pub fn allow(&self) -> bool {
        if self.spacing.is_none() {
            return true;
        }
        let mut state = self.state.lock();
        if RateLimiter::exhausted(&state.budget).is_some() {
            return false;
        }
        let now = Instant::now();
        if now < state.next_allowed {
            return false;
        }
        let spacing = self.current_spacing(&state.budget);
        state.next_allowed = now + spacing;
        true
    }

    /// Block until admitted, the token is cancelled, or the budget is spent
    /// beyond its reset window.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), GitClientError> {
        if self.spacing.is_none() {
            return Ok(());
        }
        loop {
            let sleep_for = {
                let mut state = self.state.lock();
                if let Some(reset) = RateLimiter::exhausted(&state.budget) {
                    return Err(GitClientError::RateLimited { reset });
                }
                let now = Instant::now();
                if now >= state.next_allowed {
                    let spacing = self.current_spacing(&state.budget);
                    state.next_allowed = now + spacing;
                    return Ok(());
                }
                state.next_allowed - now
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(GitClientError::Cancelled),
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Refresh the budget from response headers. Called after every response.
    pub fn update_limit(&self, limit: u32, remaining: u32, reset: OffsetDateTime) {
        let mut state = self.state.lock();
        state.budget = RateBudget {
            limit,
            remaining,
            reset,
        };
    }

    pub fn get_limit(&self) -> RateBudget {
        self.state.lock().budget
    }
}
