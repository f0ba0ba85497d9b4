//! Background worker binary: one process, one `WORKER` role (spec.md §6).
//! Each role loops claiming/processing at most one unit of work per
//! iteration and polls on `poll_interval_ms` between iterations.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use loyalty_ledger::clock::SystemClock;
use loyalty_ledger::config::{init_tracing, AppConfig};
use loyalty_ledger::db::Db;
use loyalty_ledger::ids::UuidGenerator;
use loyalty_ledger::jobs::{reclaim_stale_processing, JobWorker};
use loyalty_ledger::models::JobKind;
use loyalty_ledger::notifications::NotificationDispatcher;
use loyalty_ledger::settlement::SettlementReporter;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab-case")]
enum WorkerRole {
    Scheduler,
    Submitter,
    Reconciler,
    Freezer,
    RuleRunner,
    Notifier,
    Settlement,
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "WORKER")]
    worker: WorkerRole,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = AppConfig::load().context("loading configuration")?;
    let db = Db::open(&config.database_path).context("opening database")?;
    let clock = SystemClock;
    let ids = UuidGenerator;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;

    info!(role = ?args.worker, "loyalty-ledger-worker starting");

    let poll = Duration::from_millis(config.poll_interval_ms);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, exiting cleanly");
                return Ok(());
            }
            did_work = run_iteration(args.worker, &db, &clock, &ids, &config, &http) => {
                match did_work {
                    Ok(true) => continue,
                    Ok(false) => tokio::time::sleep(poll).await,
                    Err(err) => {
                        warn!(error = %err, "worker iteration failed");
                        tokio::time::sleep(poll).await;
                    }
                }
            }
        }
    }
}

async fn run_iteration(
    role: WorkerRole,
    db: &Db,
    clock: &SystemClock,
    ids: &UuidGenerator,
    config: &AppConfig,
    http: &reqwest::Client,
) -> Result<bool> {
    match role {
        WorkerRole::Scheduler => {
            let worker = JobWorker { db, clock, ids, config };
            Ok(worker.process_once(JobKind::Receipt).await?)
        }
        WorkerRole::Submitter => {
            let worker = JobWorker { db, clock, ids, config };
            Ok(worker.process_once(JobKind::Redeem).await?)
        }
        WorkerRole::RuleRunner => {
            let worker = JobWorker { db, clock, ids, config };
            let receipt_done = worker.process_once(JobKind::Receipt).await?;
            let redeem_done = worker.process_once(JobKind::Redeem).await?;
            Ok(receipt_done || redeem_done)
        }
        WorkerRole::Reconciler => {
            let affected = reclaim_stale_processing(db, clock, config.stale_processing_reclaim_secs).await?;
            if affected > 0 {
                info!(affected, "reclaimed stale processing jobs");
            }
            Ok(affected > 0)
        }
        WorkerRole::Freezer => {
            // Merchant freeze/unfreeze is driven by an external risk signal
            // this system does not define; the role exists so deployments
            // can wire one in without touching the job/notification/
            // settlement loops. Nothing to do on its own.
            Ok(false)
        }
        WorkerRole::Notifier => {
            let dispatcher = NotificationDispatcher { db, clock, http, config };
            Ok(dispatcher.dispatch_once().await?)
        }
        WorkerRole::Settlement => {
            let reporter = SettlementReporter {
                db,
                clock,
                lookback_days: config.settlement_lookback_days,
            };
            let rows = reporter.run_once().await?;
            Ok(!rows.is_empty())
        }
    }
}
