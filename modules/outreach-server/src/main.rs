use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use outreach_common::AppConfig;
use outreach_events::EventStore;
use outreach_sequencer::executor::{LogChannel, WebhookChannel};
use outreach_sequencer::journal::{Journal, MemoryJournal};
use outreach_sequencer::ledger::{MemoryLedger, PgCreditLedger};
use outreach_sequencer::leads::{MemoryLeadStore, PgLeadStore};
use outreach_sequencer::notify::{NoopBackend, Notifier, NotifyBackend, WebhookBackend};
use outreach_sequencer::sequences::{MemorySequenceCatalog, PgSequenceCatalog};
use outreach_sequencer::{ChannelExecutor, DeliveryChannel, SchedulerConfig, Sequencer, SequencerDeps};

mod rest;
mod ticker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    info!("Starting outreach-server");

    let config = AppConfig::from_env()?;
    config.log_redacted();

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    // Delivery and notification endpoints
    let channel: Arc<dyn DeliveryChannel> = match &config.delivery_webhook_url {
        Some(url) => Arc::new(WebhookChannel::with_client(url.clone(), http_client.clone())),
        None => {
            warn!("DELIVERY_WEBHOOK_URL not set, steps will only be logged");
            Arc::new(LogChannel)
        }
    };
    let executor = Arc::new(ChannelExecutor::new(channel));
    let backend: Arc<dyn NotifyBackend> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookBackend::new(url.clone())),
        None => Arc::new(NoopBackend),
    };

    let (deps, sweeper) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(20).connect(url).await?;
            info!("Connected to database");

            sqlx::migrate!("../../migrations").run(&pool).await?;
            info!("Migrations complete");

            let ledger = PgCreditLedger::new(pool.clone());
            let journal: Arc<dyn Journal> = Arc::new(EventStore::new(pool.clone()));
            let deps = SequencerDeps::new(
                Arc::new(ledger.clone()),
                Arc::new(PgLeadStore::new(pool.clone())),
                Arc::new(PgSequenceCatalog::new(pool)),
                executor,
                Notifier::new(backend, journal.clone()),
                journal,
            );
            (deps, Some(ledger))
        }
        None => {
            warn!("DATABASE_URL not set, state is kept in memory and lost on restart");
            let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
            let deps = SequencerDeps::new(
                Arc::new(MemoryLedger::new()),
                Arc::new(MemoryLeadStore::new()),
                Arc::new(MemorySequenceCatalog::new()),
                executor,
                Notifier::new(backend, journal.clone()),
                journal,
            );
            (deps, None)
        }
    };

    let sequencer = Sequencer::new(deps, SchedulerConfig::from_app_config(&config));

    ticker::spawn(
        sequencer.clone(),
        Duration::from_secs(config.tick_interval_secs.max(1)),
        sweeper,
    );

    let state = Arc::new(rest::AppState::new(sequencer, http_client));
    let app = rest::build_router(state);

    let addr = format!("{}:{}", config.web_host, config.web_port);
    info!("Outreach server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
