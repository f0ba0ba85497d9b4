//! HTTP ingress binary: accepts receipts and redeem requests, enqueues
//! the corresponding jobs, and serves status/balance/config reads.

use anyhow::{Context, Result};
use loyalty_ledger::api::{self, AppState};
use loyalty_ledger::clock::SystemClock;
use loyalty_ledger::config::{init_tracing, AppConfig};
use loyalty_ledger::db::Db;
use loyalty_ledger::ids::UuidGenerator;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load().context("loading configuration")?;
    let db = Db::open(&config.database_path).context("opening database")?;

    let state = AppState {
        db,
        clock: Arc::new(SystemClock),
        ids: Arc::new(UuidGenerator),
        config: Arc::new(config.clone()),
    };

    let app = api::router(state);
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "loyalty-ledger-api listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
