use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use water_client::domain::UsageIncrement;
use water_ingest::{
    api::{self, ApiState, PgUsageRepository},
    config::AppConfig,
    metrics_server, observability,
    pipeline::Pipeline,
    sinks::{DailyUsageSink, PgConnector},
    sources::{MqttSource, RawMessage},
    transform::{PayloadDecoder, PayloadDefaults, UsageIncrementValidation},
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let utc_offset = cfg.defaults.utc_offset()?;
    let op_timeout = cfg.database.operation_timeout();
    let token = CancellationToken::new();

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr, token.clone())?;
    }

    // The API and schema bootstrap share one lazily connected pool, so a database
    // that is down at boot never stops ingestion; the ingestion workers keep
    // their own dedicated connections.
    let pool = if cfg.api.is_some() || cfg.database.apply_schema {
        Some(api::lazy_pool(&cfg.database).context("invalid database.uri")?)
    } else {
        None
    };

    if cfg.database.apply_schema {
        if let Some(pool) = &pool {
            match water_client::db::ensure_schema(pool).await {
                Ok(()) => tracing::info!("database schema applied"),
                Err(e) => tracing::warn!(error = %e, "failed to apply database schema, continuing"),
            }
        }
    }

    let connector = Arc::new(PgConnector::new(&cfg.database.uri, op_timeout)?);
    let (source, mut broker) = MqttSource::spawn(&cfg.mqtt, token.clone());
    let pipeline: Pipeline<_, RawMessage, UsageIncrement, _> = Pipeline {
        source,
        decoder: Arc::new(PayloadDecoder::new(
            PayloadDefaults {
                device_id: cfg.defaults.device_id.clone(),
                liters: cfg.defaults.liters,
            },
            utc_offset,
        )),
        transforms: vec![Arc::new(UsageIncrementValidation)],
        sink: DailyUsageSink::new(connector, cfg.sink.workers, cfg.sink.channel_capacity),
    };
    let mut ingest = tokio::spawn(pipeline.run());
    tracing::info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        topic = %cfg.mqtt.topic,
        workers = cfg.sink.workers,
        "ingestion started"
    );

    let mut server = match (&cfg.api, pool) {
        (Some(api_cfg), Some(pool)) => {
            let state = ApiState::new(
                Arc::new(PgUsageRepository::new(pool, op_timeout)),
                cfg.defaults.device_id.clone(),
                utc_offset,
            );
            let bind_addr = api_cfg.bind_addr.clone();
            let token = token.clone();
            Some(tokio::spawn(async move { api::serve(&bind_addr, state, token).await }))
        }
        _ => None,
    };

    let mut ingest_done = false;
    tokio::select! {
        _ = shutdown_signal() => tracing::info!("shutdown signal received"),
        res = &mut ingest => {
            // The source only ends on cancellation, so getting here is a failure.
            ingest_done = true;
            tracing::error!(result = ?res, "ingestion pipeline exited unexpectedly");
        }
    }
    token.cancel();

    let grace = cfg.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        if !ingest_done {
            match (&mut ingest).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "ingestion pipeline failed"),
                Err(e) => tracing::error!(error = %e, "ingestion pipeline task failed"),
            }
        }
        // The broker task flushes acks for everything the pipeline finished.
        if let Err(e) = (&mut broker).await {
            tracing::error!(error = %e, "MQTT task failed");
        }
        if let Some(server) = server.as_mut() {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "usage API failed"),
                Err(e) => tracing::error!(error = %e, "usage API task failed"),
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(grace_ms = grace.as_millis() as u64, "shutdown grace elapsed, exiting");
    }

    tracing::info!("water-ingest stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
