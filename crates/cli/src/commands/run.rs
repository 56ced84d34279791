//! `run`: collector HTTP surface plus window aggregator in one process

use anyhow::Context;
use collector::{Collector, CollectorConfig, DLQConfig, FileDeadLetterQueue};
use eventlog::{InMemoryLog, LogClient};
use llm_telemetry_config::{LogBackend, LogConfig, PipelineConfig};
use processor::{
    AggregateSink, AggregatorConfig, JsonLinesSink, SledConfig, SledStateStore, WindowAggregator,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn execute(config: PipelineConfig) -> anyhow::Result<()> {
    info!(service = %config.service.name, "Starting telemetry pipeline");

    let log = open_log(&config.log)?;

    let dead_letters = Arc::new(FileDeadLetterQueue::new(DLQConfig::from(&config.dead_letter))?);
    if config.dead_letter.retention_days > 0 {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(config.dead_letter.retention_days);
        let purged = dead_letters.purge_older_than(cutoff).await?;
        if purged > 0 {
            info!(purged, "Purged expired dead letters");
        }
    }

    let collector = Arc::new(Collector::new(
        CollectorConfig::from(&config.collector),
        log.clone(),
        dead_letters,
    )?);
    collector.start()?;

    let store = Arc::new(
        SledStateStore::open(SledConfig::from(&config.state))
            .await
            .context("opening state store")?,
    );
    let sink = Arc::new(JsonLinesSink::open(&config.sink.path).context("opening sink")?);
    let aggregator = Arc::new(WindowAggregator::new(
        AggregatorConfig::from(&config.aggregator),
        log,
        store.clone(),
        sink.clone(),
    )?);

    let addr: SocketAddr = format!("{}:{}", config.service.host, config.service.port)
        .parse()
        .context("invalid service address")?;
    let (stop_http, mut http_stopped) = watch::channel(false);
    let server = tokio::spawn(collector::http::serve(addr, collector.clone(), async move {
        let _ = http_stopped.changed().await;
    }));

    let mut aggregating = tokio::spawn(Arc::clone(&aggregator).run());

    let exited_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            info!("Shutdown signal received");
            None
        }
        joined = &mut aggregating => {
            warn!("Aggregator stopped on its own");
            Some(joined)
        }
    };

    // stop intake first so everything accepted reaches the log before the aggregator stops
    let _ = stop_http.send(true);
    match server.await {
        Ok(result) => result.context("HTTP server")?,
        Err(e) => warn!(error = %e, "HTTP server task failed"),
    }
    collector.shutdown().await?;

    aggregator.shutdown();
    let joined = match exited_early {
        Some(joined) => joined,
        None => aggregating.await,
    };
    joined.context("aggregator task panicked")??;

    sink.flush().await?;
    store.flush().await?;

    let stats = aggregator.stats();
    info!(
        events_folded = stats.events_folded,
        duplicates_skipped = stats.duplicates_skipped,
        late_dropped = stats.late_dropped,
        windows_emitted = stats.windows_emitted,
        "Telemetry pipeline stopped"
    );
    Ok(())
}

fn open_log(config: &LogConfig) -> anyhow::Result<Arc<dyn LogClient>> {
    match config.backend {
        LogBackend::Memory => {
            warn!(
                partitions = config.partitions,
                "Using the in-memory log; events do not survive a restart"
            );
            Ok(Arc::new(InMemoryLog::new(config.partitions)))
        }
        #[cfg(feature = "kafka")]
        LogBackend::Kafka => {
            let kafka = eventlog::KafkaLog::new(eventlog::KafkaLogConfig {
                brokers: config.kafka.brokers.clone(),
                topic: config.kafka.topic.clone(),
                client_id: config.kafka.client_id.clone(),
                partitions: config.partitions,
                message_timeout_ms: config.kafka.message_timeout_ms,
            })?;
            Ok(Arc::new(kafka))
        }
        #[cfg(not(feature = "kafka"))]
        LogBackend::Kafka => {
            anyhow::bail!("log.backend is kafka but this binary was built without the `kafka` feature")
        }
    }
}
