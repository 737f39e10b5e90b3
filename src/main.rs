use std::sync::Arc;

use mail_alert::AppConfig;
use mail_alert::mail::ImapFetcher;
use mail_alert::notify::SenderRegistry;
use mail_alert::service::MonitorService;
use mail_alert::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;

    eprintln!("📬 {} v{}", config.system.app_name, config.system.app_version);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Check interval: {}s", config.monitor.check_interval.as_secs());
    eprintln!("   Workers: {}\n", config.dispatcher.max_workers);

    // ── Database ─────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

    // ── Pipeline ─────────────────────────────────────────────────────
    let fetcher = Arc::new(ImapFetcher::new(config.monitor.io_timeout));
    let senders = Arc::new(SenderRegistry::with_defaults());
    let service = MonitorService::new(&config, db, fetcher, senders);

    service.start().await?;
    let status = service.status().await;
    tracing::info!(mailboxes = status.mailbox_count, "Monitoring started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    service.stop().await;

    Ok(())
}
