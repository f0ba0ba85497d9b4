//! Generic job processor (spec.md §4.7): state machine, plugin execution,
//! and mutation application, identical in shape for receipt and redeem
//! jobs.

mod mutations;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::Db;
use crate::error::LedgerError;
use crate::ids::IdGenerator;
use crate::lots::ConsumeScope;
use crate::models::{Job, JobKind, JobStatus, Receipt, ReceiptItem, RedeemRequest};
use crate::plugins::helpers::DbHelpers;
use crate::plugins::{
    default_receipt_chain, default_redeem_chain, runner, ReceiptContext, RedeemContext,
    RedeemOutcome,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::{info, warn};

pub use mutations::apply_mutations;

pub struct JobWorker<'a> {
    pub db: &'a Db,
    pub clock: &'a dyn Clock,
    pub ids: &'a dyn IdGenerator,
    pub config: &'a AppConfig,
}

impl<'a> JobWorker<'a> {
    /// Claims and runs at most one due job of `job_kind`. Returns `true` if
    /// a job was found (whether it completed, rescheduled, or failed).
    pub async fn process_once(&self, job_kind: JobKind) -> Result<bool, LedgerError> {
        let Some(job) = self.claim_next_job(job_kind).await? else {
            return Ok(false);
        };

        match self.run_job(&job).await {
            Ok(()) => {
                info!(job_id = %job.job_id, tenant = %job.tenant, "job completed");
            }
            Err(err) => {
                warn!(job_id = %job.job_id, error = %err, "job attempt failed");
                self.finalize_failure(&job, &err).await?;
            }
        }
        Ok(true)
    }

    async fn claim_next_job(&self, job_kind: JobKind) -> Result<Option<Job>, LedgerError> {
        let mut conn = self.db.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| LedgerError::Transient(e.into()))?;
        let now = self.clock.now();

        let row = tx
            .query_row(
                "SELECT job_id, tenant, reference_id, attempts FROM jobs
                 WHERE job_type = ?1 AND status = 'pending' AND available_at <= ?2
                 ORDER BY created_at ASC LIMIT 1",
                params![job_kind.as_str(), now.to_rfc3339()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| LedgerError::Transient(e.into()))?;

        let Some((job_id, tenant, reference_id, attempts)) = row else {
            tx.commit().map_err(|e| LedgerError::Transient(e.into()))?;
            return Ok(None);
        };

        let new_attempts = attempts + 1;
        tx.execute(
            "UPDATE jobs SET status = 'processing', attempts = ?1, available_at = ?2 WHERE job_id = ?3",
            params![new_attempts, now.to_rfc3339(), job_id],
        )
        .map_err(|e| LedgerError::Transient(e.into()))?;
        tx.commit().map_err(|e| LedgerError::Transient(e.into()))?;

        Ok(Some(Job {
            job_id,
            tenant,
            job_type: job_kind,
            reference_id,
            status: JobStatus::Processing,
            attempts: new_attempts as u32,
            last_error: None,
            result_summary: None,
            available_at: now,
            completed_at: None,
            created_at: now,
        }))
    }

    async fn run_job(&self, job: &Job) -> Result<(), LedgerError> {
        match job.job_type {
            JobKind::Receipt => self.run_receipt_job(job).await,
            JobKind::Redeem => self.run_redeem_job(job).await,
        }
    }

    async fn run_receipt_job(&self, job: &Job) -> Result<(), LedgerError> {
        let mut conn = self.db.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| LedgerError::Transient(e.into()))?;
        let now = self.clock.now();

        let receipt = load_receipt(&tx, &job.tenant, &job.reference_id)?
            .ok_or(LedgerError::ReceiptPayloadMissing)?;

        let customer_account = format!("{}::acct::{}", job.tenant, receipt.account_ref);
        let merchant_liability_account =
            format!("{}::{}::merchant_liability", job.tenant, receipt.merchant_id);

        let scope = ConsumeScope {
            tenant: job.tenant.clone(),
            customer_account: customer_account.clone(),
            program_id: receipt.program_id.clone(),
            unit: "points".into(),
        };
        let helpers = DbHelpers {
            tenant: &job.tenant,
            tx: &tx,
            clock: self.clock,
            ids: self.ids,
            scope,
        };

        let ctx = ReceiptContext {
            tenant: &job.tenant,
            receipt: &receipt,
            customer_account,
            merchant_liability_account,
        };

        let chain = default_receipt_chain();
        let mutations = runner::run_receipt_plugins(&chain, &ctx, &helpers)?;

        let program_config = helpers.get_program_config(&receipt.program_id)?;
        let mut summary = serde_json::Map::new();
        for mutation in &mutations {
            apply_mutations(&tx, &job.tenant, self.ids, now, mutation, &program_config, None)?;
            if let Some(serde_json::Value::Object(map)) = &mutation.summary {
                for (k, v) in map {
                    summary.insert(k.clone(), v.clone());
                }
            }
        }

        finalize_job_success(&tx, job, now, serde_json::Value::Object(summary), self.ids)?;
        tx.commit().map_err(|e| LedgerError::Transient(e.into()))?;
        Ok(())
    }

    async fn run_redeem_job(&self, job: &Job) -> Result<(), LedgerError> {
        let mut conn = self.db.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| LedgerError::Transient(e.into()))?;
        let now = self.clock.now();

        let request = load_redeem_request(&tx, &job.tenant, &job.reference_id)?
            .ok_or(LedgerError::ReceiptPayloadMissing)?;

        let customer_account = format!("{}::acct::{}", job.tenant, request.account_id);
        let scope = ConsumeScope {
            tenant: job.tenant.clone(),
            customer_account: customer_account.clone(),
            program_id: request.program_id.clone(),
            unit: request.unit.clone(),
        };
        let helpers = DbHelpers {
            tenant: &job.tenant,
            tx: &tx,
            clock: self.clock,
            ids: self.ids,
            scope,
        };

        let ctx = RedeemContext {
            tenant: &job.tenant,
            request: &request,
            customer_account,
        };

        let chain = default_redeem_chain();
        let outcome = runner::run_redeem_plugins(&chain, &ctx, &helpers)?
            .ok_or(LedgerError::NoRedeemPluginAccepted)?;

        let mutation = match outcome {
            RedeemOutcome::Success(m) => m,
            RedeemOutcome::Failure { reason, retryable } => {
                drop(helpers);
                if retryable {
                    return Err(LedgerError::Plugin(reason));
                }
                finalize_job_terminal_failure(&tx, job, now, &reason, self.ids)?;
                tx.commit().map_err(|e| LedgerError::Transient(e.into()))?;
                return Ok(());
            }
        };

        let program_config = helpers.get_program_config(&request.program_id)?;
        apply_mutations(
            &tx,
            &job.tenant,
            self.ids,
            now,
            &mutation,
            &program_config,
            request.burn_merchant_id.as_deref(),
        )?;

        let summary = mutation.summary.clone().unwrap_or(serde_json::Value::Null);
        finalize_job_success(&tx, job, now, summary, self.ids)?;
        tx.commit().map_err(|e| LedgerError::Transient(e.into()))?;
        Ok(())
    }

    async fn finalize_failure(&self, job: &Job, err: &LedgerError) -> Result<(), LedgerError> {
        let mut conn = self.db.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| LedgerError::Transient(e.into()))?;
        let now = self.clock.now();

        if err.retryable() && job.attempts < self.config.max_job_attempts {
            let delay_ms = (job.attempts as i64 * 5_000).min(60_000);
            let available_at = now + chrono::Duration::milliseconds(delay_ms);
            tx.execute(
                "UPDATE jobs SET status = 'pending', available_at = ?1, last_error = ?2
                 WHERE job_id = ?3",
                params![available_at.to_rfc3339(), err.to_string(), job.job_id],
            )
            .map_err(|e| LedgerError::Transient(e.into()))?;
        } else {
            finalize_job_terminal_failure(&tx, job, now, &err.to_string(), self.ids)?;
        }

        tx.commit().map_err(|e| LedgerError::Transient(e.into()))?;
        Ok(())
    }
}

fn finalize_job_success(
    tx: &rusqlite::Transaction<'_>,
    job: &Job,
    now: DateTime<Utc>,
    summary: serde_json::Value,
    ids: &dyn IdGenerator,
) -> Result<(), LedgerError> {
    let summary_raw = serde_json::to_string(&summary).map_err(|e| LedgerError::Transient(e.into()))?;
    tx.execute(
        "UPDATE jobs SET status = 'completed', completed_at = ?1, result_summary = ?2
         WHERE job_id = ?3",
        params![now.to_rfc3339(), summary_raw, job.job_id],
    )
    .map_err(|e| LedgerError::Transient(e.into()))?;
    insert_notification(tx, job, "completed", Some(&summary), None, now, ids)
}

fn finalize_job_terminal_failure(
    tx: &rusqlite::Transaction<'_>,
    job: &Job,
    now: DateTime<Utc>,
    error: &str,
    ids: &dyn IdGenerator,
) -> Result<(), LedgerError> {
    tx.execute(
        "UPDATE jobs SET status = 'failed', completed_at = ?1, last_error = ?2 WHERE job_id = ?3",
        params![now.to_rfc3339(), error, job.job_id],
    )
    .map_err(|e| LedgerError::Transient(e.into()))?;
    insert_notification(tx, job, "failed", None, Some(error), now, ids)
}

fn insert_notification(
    tx: &rusqlite::Transaction<'_>,
    job: &Job,
    status: &str,
    summary: Option<&serde_json::Value>,
    error: Option<&str>,
    now: DateTime<Utc>,
    ids: &dyn IdGenerator,
) -> Result<(), LedgerError> {
    let notification_id = ids.generate_id();
    let summary_raw = summary
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| LedgerError::Transient(e.into()))?;
    tx.execute(
        "INSERT INTO job_notifications
            (notification_id, tenant, job_type, job_id, reference_id, status, summary, error, available_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            notification_id,
            job.tenant,
            job.job_type.as_str(),
            job.job_id,
            job.reference_id,
            status,
            summary_raw,
            error,
            now.to_rfc3339(),
        ],
    )
    .map_err(|e| LedgerError::Transient(e.into()))?;
    Ok(())
}

fn load_receipt(
    tx: &rusqlite::Transaction<'_>,
    tenant: &str,
    receipt_id: &str,
) -> Result<Option<Receipt>, LedgerError> {
    let row: Option<(String, Option<String>, String, Option<String>, String, String, String, Option<String>, String, String)> = tx
        .query_row(
            "SELECT receipt_id, idempotency_key, merchant_id, store_id, account_ref,
                    program_id, grand_total_cents, processor_txn_id, issued_at, payload
             FROM receipts WHERE tenant = ?1 AND receipt_id = ?2",
            params![tenant, receipt_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            },
        )
        .optional()
        .map_err(|e| LedgerError::Transient(e.into()))?;

    let Some((
        receipt_id,
        idempotency_key,
        merchant_id,
        store_id,
        account_ref,
        program_id,
        grand_total_cents,
        processor_txn_id,
        issued_at,
        payload,
    )) = row
    else {
        return Ok(None);
    };

    let items: Vec<ReceiptItem> =
        serde_json::from_str(&payload).map_err(|e| LedgerError::Transient(e.into()))?;

    Ok(Some(Receipt {
        receipt_id,
        tenant: tenant.to_string(),
        idempotency_key,
        merchant_id,
        store_id,
        account_ref,
        program_id,
        grand_total_cents: crate::amount::from_db(&grand_total_cents).map_err(LedgerError::Transient)?,
        processor_txn_id,
        issued_at: DateTime::parse_from_rfc3339(&issued_at)
            .map_err(|e| LedgerError::Transient(e.into()))?
            .with_timezone(&Utc),
        items,
    }))
}

fn load_redeem_request(
    tx: &rusqlite::Transaction<'_>,
    tenant: &str,
    request_id: &str,
) -> Result<Option<RedeemRequest>, LedgerError> {
    tx.query_row(
        "SELECT request_id, idempotency_key, account_id, program_id, unit, qty, memo, burn_merchant_id
         FROM redeem_requests WHERE tenant = ?1 AND request_id = ?2",
        params![tenant, request_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        },
    )
    .optional()
    .map_err(|e| LedgerError::Transient(e.into()))?
    .map(
        |(request_id, idempotency_key, account_id, program_id, unit, qty, memo, burn_merchant_id)| {
            Ok(RedeemRequest {
                request_id,
                tenant: tenant.to_string(),
                idempotency_key,
                account_id,
                program_id,
                unit,
                qty: crate::amount::from_db(&qty).map_err(LedgerError::Transient)?,
                memo,
                burn_merchant_id,
            })
        },
    )
    .transpose()
}

/// Reclaims jobs stuck in `processing` past `stale_processing_reclaim_secs`
/// (a worker crashed mid-transaction) back to `pending`.
pub async fn reclaim_stale_processing(
    db: &Db,
    clock: &dyn Clock,
    threshold_secs: i64,
) -> Result<u64, LedgerError> {
    let conn = db.lock().await;
    let cutoff = clock.now() - chrono::Duration::seconds(threshold_secs);
    let affected = conn
        .execute(
            "UPDATE jobs SET status = 'pending'
             WHERE status = 'processing' AND available_at <= ?1",
            params![cutoff.to_rfc3339()],
        )
        .map_err(|e| LedgerError::Transient(e.into()))?;
    Ok(affected as u64)
}
