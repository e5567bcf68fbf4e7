use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pricefeed_queue::{
    sqs_client, DeadLetterSink, LogOnlyDeadLetterSink, ReceiveOptions, SqsDeadLetterSink,
};
use pricefeed_storage::{DeadLetterSpool, PgStoreConfig, PgTarget};
use thiserror::Error;
use tracing::info;

use crate::normalize::NormalizeDefaults;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub provider: String,
    pub region: String,
    pub queue_url: Option<String>,
    pub dlq_url: Option<String>,
    pub receive: ReceiveOptions,
}

impl QueueConfig {
    pub fn is_sqs(&self) -> bool {
        self.provider.eq_ignore_ascii_case("sqs")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub database: PgStoreConfig,
    pub defaults: NormalizeDefaults,
    pub queue: QueueConfig,
    pub dead_letter_dir: Option<PathBuf>,
    pub web_port: u16,
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank values are treated the same.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let target = match env.get("DATABASE_URL") {
            Some(url) => PgTarget::Url(url),
            None => PgTarget::Parts {
                host: env.require("DB_HOST")?,
                port: env.parse_or("DB_PORT", 5432)?,
                database: env.require("DB_NAME")?,
                user: env.require("DB_USER")?,
                password: env.require("DB_PASSWORD")?,
                require_tls: env
                    .get("DB_SSLMODE")
                    .is_some_and(|mode| mode.eq_ignore_ascii_case("require")),
            },
        };
        let statement_timeout = env
            .get("DB_STATEMENT_TIMEOUT_MS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| ConfigError::Invalid {
                        key: "DB_STATEMENT_TIMEOUT_MS",
                        value,
                    })
            })
            .transpose()?;

        let fallback = NormalizeDefaults::default();
        let defaults = NormalizeDefaults {
            branch: env.get("DEFAULT_BRANCH").unwrap_or(fallback.branch),
            unit: env.get("DEFAULT_UNIT").unwrap_or(fallback.unit),
        };

        let receive_defaults = ReceiveOptions::default();
        let receive = ReceiveOptions {
            max_messages: env.parse_or("SQS_BATCH_SIZE", receive_defaults.max_messages)?,
            wait_seconds: env.parse_or("SQS_WAIT_TIME_SECONDS", receive_defaults.wait_seconds)?,
            visibility_timeout: env
                .parse_or("SQS_VISIBILITY_TIMEOUT", receive_defaults.visibility_timeout)?,
        };
        let receive = ReceiveOptions {
            max_messages: receive.clamped_max_messages(),
            ..receive
        };

        let queue = QueueConfig {
            provider: env.get("QUEUE_PROVIDER").unwrap_or_else(|| "sqs".to_string()),
            region: env
                .get("AWS_REGION")
                .or_else(|| env.get("AWS_DEFAULT_REGION"))
                .unwrap_or_else(|| "eu-central-1".to_string()),
            queue_url: env.get("SQS_QUEUE_URL"),
            dlq_url: env.get("DLQ_URL"),
            receive,
        };

        Ok(Self {
            database: PgStoreConfig {
                target,
                statement_timeout,
            },
            defaults,
            queue,
            dead_letter_dir: env.get("DEAD_LETTER_DIR").map(PathBuf::from),
            web_port: env.parse_or("PRICEFEED_WEB_PORT", 8000)?,
        })
    }

    /// SQS when a DLQ is configured, then the local spool, then log-and-drop.
    pub async fn dead_letter_sink(&self) -> Arc<dyn DeadLetterSink> {
        let sink: Arc<dyn DeadLetterSink> = match (&self.queue.dlq_url, &self.dead_letter_dir) {
            (Some(dlq_url), _) if self.queue.is_sqs() => Arc::new(SqsDeadLetterSink::new(
                sqs_client(&self.queue.region).await,
                dlq_url.clone(),
            )),
            (_, Some(dir)) => Arc::new(DeadLetterSpool::new(dir.clone())),
            _ => Arc::new(LogOnlyDeadLetterSink),
        };
        info!(sink = sink.name(), "dead-letter sink selected");
        sink
    }
}
