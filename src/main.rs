use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use tether_cloud::{ChaChaEncryptor, CloudConfig, HttpBlobStore};
use tether_core::events::{SyncEvent, SyncKind};
use tether_git::ProcessGit;
use tether_store::conversations::ConversationRepo;
use tether_store::devices::DeviceRepo;
use tether_store::Database;
use tether_sync::SyncCoordinator;
use tether_telemetry::{init_telemetry, MetricsRecorder, TelemetryConfig};

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig::default());

    tracing::info!("starting tether daemon");

    // Local state lives under ~/.tether
    let tether_dir = home_dir().join(".tether");
    let db_dir = tether_dir.join("database");
    std::fs::create_dir_all(&db_dir).context("failed to create database directory")?;
    let db_path = db_dir.join("tether.db");
    let db = Database::open(&db_path).context("failed to open database")?;
    tracing::info!(path = %db_path.display(), "database opened");

    // Register this device on first start
    let hostname = hostname();
    let device = DeviceRepo::new(db.clone())
        .get_or_create(&hostname)
        .context("failed to register device")?;
    tracing::info!(device_id = %device.id, hostname = %device.hostname, "device registered");

    // Cloud endpoint and payload key
    let base_url = std::env::var("TETHER_API_URL")
        .unwrap_or_else(|_| "https://api.tether.dev".to_string());
    let auth_token = std::env::var("TETHER_API_TOKEN").unwrap_or_default();
    if auth_token.is_empty() {
        tracing::warn!("TETHER_API_TOKEN not set; uploads will be rejected");
    }
    let blob_store = Arc::new(HttpBlobStore::new(CloudConfig::new(
        base_url,
        SecretString::from(auth_token),
    )));
    let encryptor = Arc::new(
        ChaChaEncryptor::from_key_file(&tether_dir.join("sync.key"))
            .context("failed to load sync key")?,
    );

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp"));
    let git = Arc::new(ProcessGit::new(&cwd));

    let (event_tx, event_rx) = broadcast::channel::<SyncEvent>(1024);
    tokio::spawn(log_events(event_rx));

    let mut coordinator = SyncCoordinator::new(db.clone(), blob_store, encryptor, git, event_tx);
    if let Some(metrics) = guard.metrics() {
        coordinator = coordinator.with_metrics(metrics.clone());
        tokio::spawn(metrics_loop(
            metrics,
            db.clone(),
            guard.config().metrics_snapshot_interval_secs,
            guard.config().metrics_retention_days,
        ));
    }
    let coordinator = Arc::new(coordinator);

    let cancel = CancellationToken::new();
    let sync_interval = std::env::var("TETHER_SYNC_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);
    tokio::spawn(sync_loop(
        coordinator.clone(),
        db.clone(),
        sync_interval,
        cancel.clone(),
    ));

    tracing::info!(
        workdir = %cwd.display(),
        sync_interval_secs = sync_interval,
        "tether daemon ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    // In-flight syncs observe the token and leave local state untouched
    cancel.cancel();
    tracing::info!("shutting down");
    Ok(())
}

/// Periodically upload any conversation the stream moved past. No-ops
/// cost nothing, so sweeping every conversation is cheap.
async fn sync_loop(
    coordinator: Arc<SyncCoordinator>,
    db: Database,
    interval_secs: u64,
    cancel: CancellationToken,
) {
    let conversations = ConversationRepo::new(db);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let rows = match conversations.list(u32::MAX, 0) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list conversations");
                continue;
            }
        };

        for row in rows {
            match coordinator.upload(&row.id, &cancel).await {
                Ok(outcome) if outcome.kind != SyncKind::Noop => {
                    tracing::info!(
                        conversation_id = %row.id,
                        kind = outcome.kind.as_str(),
                        messages = outcome.message_count,
                        "background sync"
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    tracing::warn!(conversation_id = %row.id, error = %e, "background sync failed");
                }
            }
        }
    }
}

/// Mirror sync lifecycle events into the log stream.
async fn log_events(mut rx: broadcast::Receiver<SyncEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                tracing::debug!(
                    conversation_id = %event.conversation_id(),
                    event = event.event_type(),
                    "sync event"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Periodically snapshot metrics to SQLite and prune old rows.
async fn metrics_loop(
    metrics: Arc<MetricsRecorder>,
    db: Database,
    interval_secs: u64,
    retention_days: u32,
) {
    let conversations = ConversationRepo::new(db);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        match conversations.list(u32::MAX, 0) {
            Ok(rows) => {
                metrics.gauge_set("tether.daemon.conversations", &[], rows.len() as f64);
            }
            Err(e) => tracing::warn!(error = %e, "failed to count conversations"),
        }

        if let Err(e) = metrics.snapshot() {
            tracing::warn!(error = %e, "metrics snapshot failed");
        }
        if let Err(e) = metrics.prune(retention_days) {
            tracing::warn!(error = %e, "metrics prune failed");
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown-host".to_string())
}
