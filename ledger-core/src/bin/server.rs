//! Ledger server binary
//!
//! Connects the engine to Postgres and NATS and runs until ctrl-c. Callers
//! embed `Ledger` behind their own transport.

use anyhow::Context;
use ledger_core::{
    Config, EventPublisher, Ledger, Metrics, NatsPublisher, NoopPublisher, PgLedgerStore,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::load().context("Failed to load configuration")?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting wallet ledger server"
    );

    let store = PgLedgerStore::connect(&config.database, config.engine.lock_timeout_ms)
        .await
        .context("Failed to connect to Postgres")?;
    store.ensure_schema().await.context("Failed to apply ledger schema")?;

    let publisher: Arc<dyn EventPublisher> = if config.events.enabled {
        Arc::new(
            NatsPublisher::connect(&config.events.nats_url, &config.events.subject_prefix)
                .await
                .context("Failed to connect to NATS")?,
        )
    } else {
        tracing::warn!("Entry events disabled");
        Arc::new(NoopPublisher)
    };

    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    let ledger = Ledger::new(store, config.engine.clone())
        .with_publisher(publisher)
        .with_metrics(metrics.clone());
    tracing::info!(?ledger, "Ledger ready");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger server");
    match metrics.gather_text() {
        Ok(snapshot) => tracing::info!(metrics = %snapshot, "Final metrics snapshot"),
        Err(e) => tracing::warn!(error = %e, "Could not render metrics"),
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn"));

    let json = std::env::var("LEDGER_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
