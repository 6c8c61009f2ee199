use anyhow::{Context, Result};
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};

use codebot_core::store::{EventStore, SqliteStore, DATABASE_FILE_NAME};
use codebot_server::agent::{ClaudeCliAgent, CodeAgent};
use codebot_server::classifier::{Classifier, CommandClassifier, KeywordClassifier};
use codebot_server::config::{ClassifierKind, Config};
use codebot_server::gate::DedupGate;
use codebot_server::git::{CommandGit, GitProvider};
use codebot_server::github::{GitHubClient, ReviewPlatform};
use codebot_server::lifecycle::LifecycleService;
use codebot_server::poller::Poller;
use codebot_server::queue;
use codebot_server::reconciliation::reconcile_on_startup;
use codebot_server::runner::TaskRunner;
use codebot_server::webhook::webhook_router;
use codebot_server::worker::{spawn_workers, ReviewProcessor};
use codebot_server::workspace::WorkspaceResolver;
use codebot_server::AppState;

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "codebot",
        "version": codebot_server::get_bot_version()
    })))
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown requested, finishing in-flight work");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting codebot {}", codebot_server::get_bot_version());

    let config = Config::from_env().context("Failed to load configuration")?;

    let db_path = config.state_dir.join(DATABASE_FILE_NAME);
    info!("Using state database: {}", db_path.display());
    let store: Arc<dyn EventStore> = Arc::new(
        SqliteStore::new(&db_path).context("Failed to initialize SQLite database")?,
    );

    if config.reset_poll_times {
        let cleared = store.clear_cursors().await?;
        warn!("CODEBOT_RESET_POLL_TIMES set, cleared {} poll cursors", cleared);
    }

    let platform: Arc<dyn ReviewPlatform> = Arc::new(GitHubClient::new(
        config.github_app_id,
        config.github_installation_id,
        config.github_private_key.clone(),
    )?);
    let git: Arc<dyn GitProvider> = Arc::new(CommandGit);
    let agent: Arc<dyn CodeAgent> = Arc::new(ClaudeCliAgent::new(&config.agent_command));
    let classifier: Arc<dyn Classifier> = match config.classifier {
        ClassifierKind::Command => Arc::new(CommandClassifier::new(agent.clone())),
        ClassifierKind::Keyword => Arc::new(KeywordClassifier),
    };

    let workspaces = Arc::new(WorkspaceResolver::new(
        &config.workspace_root,
        &config.branch_prefix,
        git.clone(),
    ));
    let lifecycle = Arc::new(LifecycleService::new(store.clone(), workspaces.clone()));

    // Recover from a previous crash before accepting any deliveries
    reconcile_on_startup(store.as_ref(), &lifecycle, &workspaces).await?;

    let (sender, receiver) = queue::channel(config.max_queue_size);
    let gate = Arc::new(DedupGate::new(store.clone(), sender, &config.bot_login));

    let cancel = CancellationToken::new();

    let runner = TaskRunner::new(
        store.clone(),
        platform.clone(),
        git.clone(),
        agent.clone(),
        workspaces.clone(),
        &config.branch_prefix,
        config.task_interval,
    );

    let processor = Arc::new(ReviewProcessor::new(
        platform.clone(),
        git,
        agent,
        classifier,
        workspaces,
        &config.branch_prefix,
    ));
    let mut background = spawn_workers(config.max_workers, processor, receiver, cancel.clone());
    info!("Started {} worker(s)", config.max_workers);

    if config.enable_task_runner {
        let runner_cancel = cancel.clone();
        background.push(tokio::spawn(async move { runner.run(runner_cancel).await }));
    } else {
        info!("Task runner disabled, submitted tasks stay pending");
    }

    if config.enable_polling {
        let poller = Poller::new(
            store.clone(),
            platform,
            gate.clone(),
            lifecycle.clone(),
            config.poll_interval,
            config.processed_retention,
        );
        let poll_cancel = cancel.clone();
        background.push(tokio::spawn(async move { poller.run(poll_cancel).await }));
    } else {
        info!("Polling disabled, relying on webhooks only");
    }

    if config.github_webhook_secret.is_none() {
        warn!("GITHUB_WEBHOOK_SECRET is not set, webhook deliveries will be rejected");
    }

    let app_state = Arc::new(AppState {
        store,
        gate,
        lifecycle,
        webhook_secret: config.github_webhook_secret.clone(),
        branch_prefix: config.branch_prefix.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    for result in futures_util::future::join_all(background).await {
        if let Err(e) = result {
            error!("Background task panicked: {}", e);
        }
    }
    info!("Shutdown complete");

    Ok(())
}
