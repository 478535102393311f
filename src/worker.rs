//! One poll cycle per worker invocation: build a client, detect changes,
//! probe for pipeline resources, generate events, dispatch.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::config::RepoConfig;
use crate::db::SqliteStore;
use crate::events::{EventGenerator, EventStatus};
use crate::gitclient::{ClientOptions, create_client};
use crate::monitor;
use crate::pipeline;
use crate::trigger::TriggerSink;

/// Everything a worker needs for a cycle; shared across the pool.
pub struct PollContext {
    pub store: Arc<SqliteStore>,
    pub sink: Arc<dyn TriggerSink>,
    pub generator: EventGenerator,
    pub client_options: ClientOptions,
    pub registry: StatusRegistry,
}

/// The last observed outcome for one repository, surfaced on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PollOutcome {
    #[serde(with = "time::serde::rfc3339")]
    pub last_poll_at: OffsetDateTime,
    pub last_error: Option<String>,
    pub changes: usize,
    pub events_dispatched: usize,
}

/// Concurrent map of repository name to its latest outcome.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    outcomes: Arc<DashMap<String, PollOutcome>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        StatusRegistry::default()
    }

    pub fn record_success(&self, repo: &str, changes: usize, events_dispatched: usize) {
        self.outcomes.insert(
            repo.to_string(),
            PollOutcome {
                last_poll_at: OffsetDateTime::now_utc(),
                last_error: None,
                changes,
                events_dispatched,
            },
        );
    }

    pub fn record_error(&self, repo: &str, error: impl std::fmt::Display) {
        self.outcomes.insert(
            repo.to_string(),
            PollOutcome {
                last_poll_at: OffsetDateTime::now_utc(),
                last_error: Some(error.to_string()),
                changes: 0,
                events_dispatched: 0,
            },
        );
    }

    pub fn get(&self, repo: &str) -> Option<PollOutcome> {
        self.outcomes.get(repo).map(|o| o.clone())
    }

    pub fn snapshot(&self) -> std::collections::BTreeMap<String, PollOutcome> {
        self.outcomes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Run one fetch → detect → generate → dispatch cycle.
///
/// Failures never propagate: they are logged, recorded on the repository's
/// status, and the repository stays on its schedule.
pub async fn run_cycle(ctx: &PollContext, repo: &RepoConfig, cancel: CancellationToken) {
    let client = match create_client(repo, &ctx.client_options, cancel) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(repo = %repo.name, error = %e, "failed to build provider client");
            ctx.registry.record_error(&repo.name, &e);
            return;
        }
    };

    let changes = match monitor::detect_changes(repo, client.as_ref(), ctx.store.as_ref()).await {
        Ok(changes) => changes,
        Err(e) => {
            tracing::warn!(repo = %repo.name, error = %e, "detection cycle failed");
            ctx.registry.record_error(&repo.name, &e);
            client.close().await;
            return;
        }
    };

    if changes.is_empty() {
        tracing::debug!(repo = %repo.name, "no branch changes");
        ctx.registry.record_success(&repo.name, 0, 0);
        client.close().await;
        return;
    }

    tracing::info!(repo = %repo.name, changes = changes.len(), "branch changes detected");

    // Probe the newest surviving revision for pipeline resources; a probe
    // failure never fails the cycle.
    let probe = match changes.iter().find(|c| !c.new_commit.is_empty()) {
        Some(change) => {
            let dir = repo
                .pipeline_dir
                .as_deref()
                .unwrap_or(pipeline::DEFAULT_PIPELINE_DIR);
            match pipeline::probe(client.as_ref(), &change.new_commit, dir).await {
                Ok(probe) => probe,
                Err(e) => {
                    tracing::warn!(repo = %repo.name, error = %e, "pipeline probe failed");
                    None
                }
            }
        }
        None => None,
    };

    let mut events = ctx.generator.generate(repo, &changes);
    if let Some(probe) = &probe {
        for event in &mut events {
            event
                .metadata
                .insert("pipeline.present".to_string(), probe.present.to_string());
            if !probe.files.is_empty() {
                event
                    .metadata
                    .insert("pipeline.files".to_string(), probe.files.join(","));
            }
        }
    }

    let mut dispatched = 0usize;
    for event in &events {
        if let Err(e) = ctx.store.record_event(event).await {
            tracing::warn!(event_id = %event.id, error = %e, "failed to journal event");
        }

        match ctx.sink.send(event).await {
            Ok(()) => {
                dispatched += 1;
                if let Err(e) = ctx
                    .store
                    .update_event_status(&event.id, EventStatus::Dispatched, None)
                    .await
                {
                    tracing::warn!(event_id = %event.id, error = %e, "failed to mark event dispatched");
                }
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    retryable = e.is_retryable(),
                    error = %e,
                    "event dispatch failed"
                );
                if let Err(e) = ctx
                    .store
                    .update_event_status(&event.id, EventStatus::Failed, Some(&e.to_string()))
                    .await
                {
                    tracing::warn!(event_id = %event.id, error = %e, "failed to mark event failed");
                }
            }
        }
    }

    client.close().await;
    ctx.registry
        .record_success(&repo.name, changes.len(), dispatched);
}
