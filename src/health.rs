use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Component-level health, aggregated for the admin surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthReport {
    pub store: bool,
    pub trigger: bool,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.store && self.trigger
    }
}

/// The state of the health check system
enum HealthCheckState {
    /// No check has ever been performed
    Initial,

    /// A check is currently in progress, all requests await this future
    Checking {
        future: Shared<BoxFuture<'static, HealthReport>>,
    },

    /// We have a cached result from a completed check
    Cached {
        report: HealthReport,
        checked_at: Instant,
    },
}

struct HealthCheckerInner {
    state: Mutex<HealthCheckState>,
    had_success: AtomicBool,
}

/// Manages health check state with caching and singleflight behavior:
/// concurrent probes share one in-flight check, and results are cached
/// briefly so the admin surface cannot hammer the store.
pub struct HealthChecker {
    inner: Arc<HealthCheckerInner>,
    check_fn: Arc<dyn Fn() -> BoxFuture<'static, HealthReport> + Send + Sync>,
}

impl HealthChecker {
    pub fn new<F, Fut>(check_fn: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HealthReport> + Send + 'static,
    {
        Self {
            inner: Arc::new(HealthCheckerInner {
                state: Mutex::new(HealthCheckState::Initial),
                had_success: AtomicBool::new(false),
            }),
            check_fn: Arc::new(move || check_fn().boxed()),
        }
    }

    pub async fn check(&self) -> HealthReport {
        let mut state = self.inner.state.lock().await;

        match &*state {
            HealthCheckState::Initial => {
                let future = self.create_check_future();
                *state = HealthCheckState::Checking {
                    future: future.clone(),
                };
                drop(state);
                future.await
            }
            HealthCheckState::Checking { future } => {
                // Join existing check (singleflight)
                let future = future.clone();
                drop(state);
                future.await
            }
            HealthCheckState::Cached { report, checked_at } => {
                // Until the first success, re-check aggressively so startup
                // problems surface quickly.
                let window = if self.inner.had_success.load(Ordering::Relaxed) {
                    Duration::from_secs(15)
                } else {
                    Duration::from_secs(1)
                };

                if checked_at.elapsed() < window {
                    return *report;
                }

                let future = self.create_check_future();
                *state = HealthCheckState::Checking {
                    future: future.clone(),
                };
                drop(state);
                future.await
            }
        }
    }

    fn create_check_future(&self) -> Shared<BoxFuture<'static, HealthReport>> {
        let inner = Arc::clone(&self.inner);
        let check_fn = Arc::clone(&self.check_fn);

        async move {
            let report = (check_fn)().await;

            *inner.state.lock().await = HealthCheckState::Cached {
                report,
                checked_at: Instant::now(),
            };

            if report.healthy() {
                inner.had_success.store(true, Ordering::Relaxed);
            }

            report
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_reports_component_health() {
        let checker = HealthChecker::new(|| async {
            HealthReport {
                store: true,
                trigger: false,
            }
        });
        let report = checker.check().await;
        assert!(report.store);
        assert!(!report.trigger);
        assert!(!report.healthy());
    }

    #[tokio::test]
    async fn test_healthy_result_is_cached() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let checker = HealthChecker::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                HealthReport {
                    store: true,
                    trigger: true,
                }
            }
        });

        assert!(checker.check().await.healthy());
        assert!(checker.check().await.healthy());
        assert_eq!(calls.load(Ordering::Relaxed), 1, "second check served from cache");
    }
}
