//! Runtime configuration, loaded from environment variables with an
//! optional `loyalty_ledger.toml` providing defaults. Mirrors the
//! teacher's `env::var(...).unwrap_or_else(...)` convention in `main()`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    pub max_job_attempts: u32,
    pub poll_interval_ms: u64,
    pub notification_webhook_url: Option<String>,
    pub notification_signing_secret: Option<String>,
    pub settlement_lookback_days: i64,
    pub bind_addr: String,
    pub stale_processing_reclaim_secs: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "loyalty_ledger.db".to_string(),
            max_job_attempts: 5,
            poll_interval_ms: 1000,
            notification_webhook_url: None,
            notification_signing_secret: None,
            settlement_lookback_days: 1,
            bind_addr: "0.0.0.0:8080".to_string(),
            stale_processing_reclaim_secs: 300,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let mut cfg = if let Ok(raw) = std::fs::read_to_string("loyalty_ledger.toml") {
            toml::from_str(&raw).context("parsing loyalty_ledger.toml")?
        } else {
            AppConfig::default()
        };

        if let Ok(v) = env::var("DATABASE_PATH") {
            cfg.database_path = v;
        }
        if let Ok(v) = env::var("MAX_JOB_ATTEMPTS") {
            cfg.max_job_attempts = v.parse().context("invalid MAX_JOB_ATTEMPTS")?;
        }
        if let Ok(v) = env::var("POLL_INTERVAL_MS") {
            cfg.poll_interval_ms = v.parse().context("invalid POLL_INTERVAL_MS")?;
        }
        if let Ok(v) = env::var("NOTIFICATION_WEBHOOK_URL") {
            cfg.notification_webhook_url = Some(v);
        }
        if let Ok(v) = env::var("NOTIFICATION_SIGNING_SECRET") {
            cfg.notification_signing_secret = Some(v);
        }
        if let Ok(v) = env::var("SETTLEMENT_LOOKBACK_DAYS") {
            cfg.settlement_lookback_days = v.parse().context("invalid SETTLEMENT_LOOKBACK_DAYS")?;
        }
        if let Ok(v) = env::var("BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = env::var("STALE_PROCESSING_RECLAIM_SECS") {
            cfg.stale_processing_reclaim_secs = v
                .parse()
                .context("invalid STALE_PROCESSING_RECLAIM_SECS")?;
        }

        Ok(cfg)
    }
}

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loyalty_ledger=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
