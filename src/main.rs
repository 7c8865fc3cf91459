use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use liaison_clients::{HttpBotChannel, HttpContactResolver, LiveAgentClient};
use liaison_engine::{Collaborators, ManagerConfig, SessionManager};
use liaison_settings::LiaisonSettings;
use liaison_store::{Database, DedupCache, SqliteContextCache, SqliteSessionStore};
use liaison_telemetry::{parse_level, TelemetryConfig};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

/// Bridges bot-channel conversations with a live-agent chat backend.
#[derive(Debug, Parser)]
#[command(name = "liaison", version)]
struct Cli {
    /// Settings file (defaults to ~/.liaison/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port; overrides settings and LIAISON_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Skip resuming sessions persisted by a previous run.
    #[arg(long)]
    no_recover: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => liaison_settings::load_settings_from_path(path),
        None => liaison_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let telemetry = liaison_telemetry::init_telemetry(telemetry_config(&settings));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting liaison");

    let db_path = settings.storage.resolved_db_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    let context = Arc::new(SqliteContextCache::new(
        db.clone(),
        settings.session.context_retention(),
    ));
    let agent_chat =
        LiveAgentClient::new(settings.live_agent.clone()).context("live agent client")?;
    let bot_channel = HttpBotChannel::new(&settings.bot_channel).context("bot channel client")?;
    let contacts = HttpContactResolver::new(&settings.contacts).context("contacts client")?;
    let collaborators = Collaborators {
        agent_chat: Arc::new(agent_chat),
        bot_channel: Arc::new(bot_channel),
        contacts: Arc::new(contacts),
        store: Arc::new(SqliteSessionStore::new(db)),
        context: context.clone(),
    };

    let manager = SessionManager::new(ManagerConfig::from_settings(&settings), collaborators);
    if cli.no_recover {
        tracing::info!("session recovery skipped");
    } else {
        match manager.recover_sessions().await {
            Ok(report) => tracing::info!(
                resumed = report.resumed,
                removed = report.removed,
                "sessions recovered"
            ),
            Err(e) => tracing::error!(error = %e, "session recovery failed"),
        }
    }
    manager.start_maintenance(MAINTENANCE_INTERVAL);

    let dedup = Arc::new(DedupCache::new(settings.session.dedup_ttl()));
    let sweeper = liaison_store::dedup::start_sweeper(dedup.clone(), settings.session.dedup_ttl());

    let shutdown = CancellationToken::new();
    let server = liaison_server::start(
        liaison_server::ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
            ..Default::default()
        },
        liaison_server::AppState {
            manager: manager.clone(),
            dedup,
            context,
            logs: telemetry.logs(),
        },
        shutdown.clone(),
    )
    .await
    .context("failed to start server")?;
    tracing::info!(port = server.port, "liaison ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    shutdown.cancel();
    manager.shutdown().await;
    sweeper.abort();
    server.join().await;
    Ok(())
}

fn telemetry_config(settings: &LiaisonSettings) -> TelemetryConfig {
    let module_levels = settings
        .logging
        .module_levels
        .iter()
        .filter_map(|(module, level)| parse_level(level).map(|level| (module.clone(), level)))
        .collect();
    TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(tracing::Level::INFO),
        module_levels,
        log_to_sqlite: settings.storage.log_to_sqlite,
        log_db_path: settings.storage.resolved_log_db_path(),
    }
}
