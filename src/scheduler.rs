//! Poll scheduler: owns one entry per repository, promotes due entries on
//! each tick, and dispatches them into a bounded worker pool.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RepoConfig;
use crate::worker::{self, PollContext};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub interval: Duration,
    pub max_workers: usize,
    pub shutdown_deadline: Duration,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
struct ScheduledEntry {
    repo: RepoConfig,
    next_poll: OffsetDateTime,
    last_poll: Option<OffsetDateTime>,
    poll_count: u64,
    enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total: usize,
    pub enabled: usize,
    pub interval_secs: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_poll: Option<OffsetDateTime>,
}

struct RunState {
    cancel: CancellationToken,
    tracker: TaskTracker,
    loop_handle: JoinHandle<()>,
}

pub struct Scheduler {
    options: SchedulerOptions,
    ctx: Arc<PollContext>,
    /// Hot-path reads (ready-set capture, status) take the read side only.
    entries: RwLock<HashMap<String, ScheduledEntry>>,
    running: Mutex<Option<RunState>>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, ctx: Arc<PollContext>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(options.max_workers));
        Arc::new(Scheduler {
            options,
            ctx,
            entries: RwLock::new(HashMap::new()),
            running: Mutex::new(None),
            permits,
        })
    }

    fn interval_for(&self, repo: &RepoConfig) -> Duration {
        repo.interval.unwrap_or(self.options.interval)
    }

    /// Create or replace the entry for a repository. Disabled repositories
    /// are not scheduled.
    pub fn schedule(&self, repo: RepoConfig) {
        if !repo.enabled {
            tracing::debug!(repo = %repo.name, "repository disabled, not scheduling");
            return;
        }
        let next_poll = OffsetDateTime::now_utc() + self.interval_for(&repo);
        let name = repo.name.clone();
        let entry = ScheduledEntry {
            repo,
            next_poll,
            last_poll: None,
            poll_count: 0,
            enabled: true,
        };
        self.entries.write().insert(name.clone(), entry);
        tracing::info!(repo = %name, next_poll = %next_poll, "repository scheduled");
    }

    /// Remove a repository's entry; absent entries are not an error.
    pub fn unschedule(&self, name: &str) {
        if self.entries.write().remove(name).is_some() {
            tracing::info!(repo = %name, "repository unscheduled");
        }
    }

    pub fn next_poll_time(&self, name: &str) -> Option<OffsetDateTime> {
        self.entries.read().get(name).map(|e| e.next_poll)
    }

    pub fn poll_count(&self, name: &str) -> Option<u64> {
        self.entries.read().get(name).map(|e| e.poll_count)
    }

    pub fn status(&self) -> SchedulerStatus {
        let entries = self.entries.read();
        let enabled = entries.values().filter(|e| e.enabled).count();
        let next_poll = entries
            .values()
            .filter(|e| e.enabled)
            .map(|e| e.next_poll)
            .min();
        SchedulerStatus {
            running: self.running.lock().is_some(),
            total: entries.len(),
            enabled,
            interval_secs: self.options.interval.as_secs(),
            next_poll,
        }
    }

    /// Begin ticking. Fails when already running.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let loop_handle = tokio::spawn(Arc::clone(self).run_loop(cancel.clone(), tracker.clone()));
        *running = Some(RunState {
            cancel,
            tracker,
            loop_handle,
        });

        tracing::info!(
            interval_secs = self.options.interval.as_secs(),
            max_workers = self.options.max_workers,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop ticking and drain in-flight cycles, bounded by the shutdown
    /// deadline. Idempotent.
    pub async fn stop(&self) {
        let state = self.running.lock().take();
        let Some(state) = state else {
            tracing::debug!("scheduler already stopped");
            return;
        };

        state.cancel.cancel();
        state.tracker.close();
        let _ = state.loop_handle.await;

        if tokio::time::timeout(self.options.shutdown_deadline, state.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                deadline_secs = self.options.shutdown_deadline.as_secs(),
                "shutdown deadline expired, abandoning in-flight poll cycles"
            );
        } else {
            tracing::info!("scheduler stopped");
        }
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken, tracker: TaskTracker) {
        let mut ticker = tokio::time::interval(self.options.interval.min(TICK_CAP));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.dispatch_due(&cancel, &tracker),
            }
        }
    }

    /// Promote due entries into the worker pool.
    ///
    /// The ready set is captured under the read lock; each entry's
    /// `next_poll` and counter are bumped under the write lock only once a
    /// worker permit is held, so entries skipped on a saturated pool stay
    /// due and go out on the next tick instead of queueing.
    fn dispatch_due(&self, cancel: &CancellationToken, tracker: &TaskTracker) {
        let now = OffsetDateTime::now_utc();

        let ready: Vec<String> = {
            let entries = self.entries.read();
            entries
                .values()
                .filter(|e| e.enabled && e.next_poll <= now)
                .map(|e| e.repo.name.clone())
                .collect()
        };

        for name in ready {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                tracing::debug!("worker pool saturated, remaining entries wait for the next tick");
                break;
            };

            let repo = {
                let mut entries = self.entries.write();
                match entries.get_mut(&name) {
                    Some(entry) => {
                        entry.next_poll = now + self.interval_for(&entry.repo);
                        entry.last_poll = Some(now);
                        entry.poll_count += 1;
                        entry.repo.clone()
                    }
                    // Unscheduled between capture and dispatch.
                    None => continue,
                }
            };

            let ctx = Arc::clone(&self.ctx);
            let child = cancel.child_token();
            tracker.spawn(async move {
                worker::run_cycle(&ctx, &repo, child).await;
                drop(permit);
            });
        }
    }
}

/// Tick granularity cap so long poll intervals still observe due entries
/// (and cancellation) promptly.
const TICK_CAP: Duration = Duration::from_secs(30);
