use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod admin;
mod config;
mod db;
mod events;
mod gitclient;
mod health;
mod monitor;
mod pipeline;
mod scheduler;
mod trigger;
mod worker;

use admin::{AdminState, RepoSummary};
use config::Args;
use db::{SqliteStore, StateStore};
use events::EventGenerator;
use gitclient::ClientOptions;
use health::{HealthChecker, HealthReport};
use scheduler::{Scheduler, SchedulerOptions};
use trigger::{HttpTrigger, LogTrigger, TriggerSink};
use worker::{PollContext, StatusRegistry};

fn init_tracing() {
    let use_json = std::env::var("LOG_JSON")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let filter = if let Ok(rust_log) = std::env::var("RUST_LOG") {
        EnvFilter::new(rust_log)
    } else {
        let our_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

        EnvFilter::new(format!("warn,gitsentry={our_level}"))
    };

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_ansi(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();

    let repositories = match config::load_repositories(&args.config) {
        Ok(repositories) => repositories,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    if repositories.is_empty() {
        tracing::warn!(config = %args.config.display(), "no repositories configured");
    }

    let store = match SqliteStore::connect(&args.database).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error: failed to open database {}: {e}", args.database.display());
            std::process::exit(1);
        }
    };
    if let Err(e) = store.initialize().await {
        eprintln!("Error: failed to initialize database schema: {e}");
        std::process::exit(1);
    }

    let sink: Arc<dyn TriggerSink> = match (&args.webhook_url, args.dry_run) {
        (Some(url), false) => {
            let trigger = HttpTrigger::new(url.clone(), Duration::from_secs(30))
                .expect("Failed to build webhook client");
            tracing::info!(webhook = %url, "HTTP trigger sink configured");
            Arc::new(trigger)
        }
        (url, _) => {
            if url.is_some() {
                tracing::info!("dry-run enabled, events will be logged only");
            } else {
                tracing::warn!("no webhook URL configured, events will be logged only");
            }
            Arc::new(LogTrigger)
        }
    };

    let client_options = ClientOptions {
        retry_attempts: args.retry_attempts,
        retry_backoff: Duration::from_millis(args.retry_backoff_ms),
        git_timeout: Duration::from_secs(args.git_timeout),
        enable_fallback: args.enable_fallback,
        ..ClientOptions::default()
    };

    let registry = StatusRegistry::new();
    let ctx = Arc::new(PollContext {
        store: store.clone(),
        sink: sink.clone(),
        generator: EventGenerator::new("gitsentry"),
        client_options,
        registry: registry.clone(),
    });

    let scheduler = Scheduler::new(
        SchedulerOptions {
            interval: Duration::from_secs(args.polling_interval),
            max_workers: args.max_workers,
            shutdown_deadline: Duration::from_secs(args.shutdown_deadline),
        },
        ctx,
    );

    let summaries: Vec<RepoSummary> = repositories.iter().map(RepoSummary::from_config).collect();
    for repo in repositories {
        scheduler.schedule(repo);
    }
    scheduler.start().expect("Scheduler failed to start");

    let health = {
        let store = store.clone();
        let sink = sink.clone();
        Arc::new(HealthChecker::new(move || {
            let store = store.clone();
            let sink = sink.clone();
            async move {
                HealthReport {
                    store: store.health_check().await.is_ok(),
                    trigger: sink.health_check().await,
                }
            }
        }))
    };

    let admin_router = admin::router(AdminState {
        scheduler: scheduler.clone(),
        registry,
        health,
        store: store.clone(),
        repositories: Arc::new(summaries),
    });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .expect("Failed to bind admin listener");
    tracing::info!(addr = %args.listen, "admin surface listening");

    let admin_task = tokio::spawn(async move {
        axum::serve(listener, admin_router)
            .await
            .expect("Admin server error");
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install signal handler");
    tracing::info!("shutdown signal received");

    scheduler.stop().await;
    sink.close().await;
    store.close().await;
    admin_task.abort();
    tracing::info!("shutdown complete");
}
