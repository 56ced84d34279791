//! Configuration management for the LLM telemetry pipeline
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! environment variables prefixed with `TELEMETRY_` (`__` separates nesting,
//! e.g. `TELEMETRY_COLLECTOR__QUEUE_CAPACITY=5000`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Service / HTTP settings
    pub service: ServiceConfig,

    /// Ingestion collector
    pub collector: CollectorConfig,

    /// Windowed aggregator
    pub aggregator: AggregatorConfig,

    /// Aggregation state store
    pub state: StateConfig,

    /// Durable log backend
    pub log: LogConfig,

    /// Dead-letter queue
    pub dead_letter: DeadLetterConfig,

    /// Aggregate row sink
    pub sink: SinkConfig,

    /// Logging settings
    pub observability: ObservabilityConfig,
}

impl PipelineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        Self::figment(config_path.as_deref())
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    /// Build the provider stack without extracting it
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment.merge(Env::prefixed("TELEMETRY_").split("__"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.port == 0 {
            return Err(invalid("service.port must be non-zero"));
        }

        let c = &self.collector;
        if c.queue_capacity == 0 {
            return Err(invalid("collector.queue_capacity must be at least 1"));
        }
        if c.publisher_workers == 0 {
            return Err(invalid("collector.publisher_workers must be at least 1"));
        }
        if !(c.max_latency_ms.is_finite() && c.max_latency_ms > 0.0) {
            return Err(invalid("collector.max_latency_ms must be positive"));
        }
        if c.critical_threshold_percent > 100
            || c.warning_threshold_percent > c.critical_threshold_percent
        {
            return Err(invalid(
                "collector thresholds must satisfy warning <= critical <= 100",
            ));
        }
        if c.retry.max_attempts == 0 {
            return Err(invalid("collector.retry.max_attempts must be at least 1"));
        }
        if c.retry.multiplier < 1.0 {
            return Err(invalid("collector.retry.multiplier must be >= 1.0"));
        }
        if c.retry.base_delay_ms > c.retry.max_delay_ms {
            return Err(invalid(
                "collector.retry.base_delay_ms must not exceed max_delay_ms",
            ));
        }

        let a = &self.aggregator;
        if a.window_size_secs == 0 {
            return Err(invalid("aggregator.window_size_secs must be at least 1"));
        }
        if a.batch_size == 0 {
            return Err(invalid("aggregator.batch_size must be at least 1"));
        }
        if a.idle_tick_ms == 0 {
            return Err(invalid("aggregator.idle_tick_ms must be at least 1"));
        }

        if self.log.partitions == 0 {
            return Err(invalid("log.partitions must be at least 1"));
        }
        if self.log.backend == LogBackend::Kafka && self.log.kafka.brokers.is_empty() {
            return Err(invalid("log.kafka.brokers is required for the kafka backend"));
        }

        if self.dead_letter.max_file_size_bytes == 0 {
            return Err(invalid("dead_letter.max_file_size_bytes must be non-zero"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::ValidationError(msg.to_string())
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// HTTP bind host
    pub host: String,

    /// HTTP bind port
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "llm-telemetry".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Bounded publish queue capacity
    pub queue_capacity: usize,

    /// Number of publisher workers draining the queue
    pub publisher_workers: usize,

    /// Upper bound accepted for `latency_ms`
    pub max_latency_ms: f64,

    /// Upper bound accepted for token counts
    pub max_tokens: u64,

    /// Publish retry policy
    pub retry: RetryConfig,

    /// Time allowed for draining in-flight jobs on shutdown
    pub shutdown_timeout_secs: u64,

    /// Queue fill percentage logged as a warning
    pub warning_threshold_percent: u8,

    /// Queue fill percentage logged as critical
    pub critical_threshold_percent: u8,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            publisher_workers: 4,
            max_latency_ms: 600_000.0,
            max_tokens: 2_000_000,
            retry: RetryConfig::default(),
            shutdown_timeout_secs: 30,
            warning_threshold_percent: 80,
            critical_threshold_percent: 95,
        }
    }
}

/// Exponential backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            max_attempts: 5,
        }
    }
}

/// Aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Tumbling window length
    pub window_size_secs: u64,

    /// Out-of-orderness tolerated before a window may close
    pub allowed_lateness_secs: u64,

    /// Silence after which a partition's watermark advances with wall-clock time
    pub idle_timeout_secs: u64,

    /// Maximum records folded per commit
    pub batch_size: usize,

    /// Interval of idle ticks that drive closure without new records
    pub idle_tick_ms: u64,

    /// Acknowledged closed-window tombstones older than this are pruned
    pub closed_retention_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_size_secs: 60,
            allowed_lateness_secs: 10,
            idle_timeout_secs: 30,
            batch_size: 500,
            idle_tick_ms: 1_000,
            closed_retention_secs: 86_400,
        }
    }
}

/// State store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory of the sled database
    pub path: PathBuf,

    /// Flush to disk on every commit
    pub sync_commits: bool,

    /// sled page cache size
    pub cache_capacity_bytes: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/state"),
            sync_commits: true,
            cache_capacity_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Log backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogBackend {
    Memory,
    Kafka,
}

/// Durable log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub backend: LogBackend,

    /// Partition count (for kafka, must match the topic)
    pub partitions: u32,

    pub kafka: KafkaConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: LogBackend::Memory,
            partitions: 4,
            kafka: KafkaConfig::default(),
        }
    }
}

/// Kafka connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers
    pub brokers: String,

    pub topic: String,

    pub client_id: String,

    pub message_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "llm-telemetry-events".to_string(),
            client_id: "llm-telemetry".to_string(),
            message_timeout_ms: 30_000,
        }
    }
}

/// Dead-letter queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Directory holding `dlq.jsonl` and its rotations
    pub path: PathBuf,

    pub max_file_size_bytes: u64,

    pub max_files: usize,

    /// Records older than this are purged
    pub retention_days: i64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/dlq"),
            max_file_size_bytes: 100 * 1024 * 1024,
            max_files: 10,
            retention_days: 7,
        }
    }
}

/// Aggregate sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// JSON-lines output file
    pub path: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/aggregates.jsonl"),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,

    /// Enable structured JSON logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}
