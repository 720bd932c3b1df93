use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Database. Memory-backed stores are used when unset.
    pub database_url: Option<String>,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    // Scheduler
    pub tick_interval_secs: u64,
    pub tick_max_concurrency: usize,
    pub executor_timeout_secs: u64,

    // Retry policy for retryable executor failures
    pub retry_initial_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_max_attempts: u32,

    // Outbound webhooks
    pub delivery_webhook_url: Option<String>,
    pub notify_webhook_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: env::var("DATABASE_URL").ok(),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: parsed_env("WEB_PORT", 3000)?,
            tick_interval_secs: parsed_env("TICK_INTERVAL_SECS", 30)?,
            tick_max_concurrency: parsed_env("TICK_MAX_CONCURRENCY", 16)?,
            executor_timeout_secs: parsed_env("EXECUTOR_TIMEOUT_SECS", 20)?,
            retry_initial_delay_secs: parsed_env("RETRY_INITIAL_DELAY_SECS", 60)?,
            retry_max_delay_secs: parsed_env("RETRY_MAX_DELAY_SECS", 3600)?,
            retry_max_attempts: parsed_env("RETRY_MAX_ATTEMPTS", 5)?,
            delivery_webhook_url: env::var("DELIVERY_WEBHOOK_URL").ok(),
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),
        };

        Ok(config)
    }

    pub fn log_redacted(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview_opt(&self.database_url));
        tracing::info!("  WEB: {}:{}", self.web_host, self.web_port);
        tracing::info!(
            "  TICK: every {}s, concurrency {}, executor timeout {}s",
            self.tick_interval_secs,
            self.tick_max_concurrency,
            self.executor_timeout_secs
        );
        tracing::info!(
            "  RETRY: initial {}s, max {}s, attempts {}",
            self.retry_initial_delay_secs,
            self.retry_max_delay_secs,
            self.retry_max_attempts
        );
        tracing::info!("  DELIVERY_WEBHOOK_URL: {}", preview_opt(&self.delivery_webhook_url));
        tracing::info!("  NOTIFY_WEBHOOK_URL: {}", preview_opt(&self.notify_webhook_url));
    }
}

fn parsed_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

/// First few characters of a secret, enough to tell two apart.
fn preview_opt(val: &Option<String>) -> String {
    match val {
        Some(v) if !v.is_empty() => {
            let head: String = v.chars().take(12).collect();
            format!("{}...({} chars)", head, v.chars().count())
        }
        _ => "<not set>".to_string(),
    }
}
