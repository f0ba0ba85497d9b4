//! Outbox notification dispatcher (spec.md §4.9). Grounded in the
//! teacher's `HmacSha256` signing pattern (`vault/execution.rs`).

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::Db;
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

struct DueNotification {
    notification_id: String,
    tenant: String,
    job_type: String,
    job_id: String,
    reference_id: String,
    status: String,
    summary: Option<String>,
    error: Option<String>,
    delivery_attempts: i64,
}

pub struct NotificationDispatcher<'a> {
    pub db: &'a Db,
    pub clock: &'a dyn Clock,
    pub http: &'a reqwest::Client,
    pub config: &'a AppConfig,
}

impl<'a> NotificationDispatcher<'a> {
    /// Drains one due notification. Returns `false` when the outbox is
    /// empty.
    pub async fn dispatch_once(&self) -> Result<bool, LedgerError> {
        let Some(webhook_url) = &self.config.notification_webhook_url else {
            return Ok(false);
        };

        let Some(row) = self.claim_due().await? else {
            return Ok(false);
        };

        let body = json!({
            "tenantId": row.tenant,
            "jobType": row.job_type,
            "jobId": row.job_id,
            "referenceId": row.reference_id,
            "status": row.status,
            "summary": row.summary.as_ref().and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok()),
            "error": row.error,
        });
        let body_bytes = serde_json::to_vec(&body).map_err(|e| LedgerError::Transient(e.into()))?;

        let mut request = self
            .http
            .post(webhook_url)
            .header("content-type", "application/json")
            .header("x-tenant-id", &row.tenant)
            .header("x-job-type", &row.job_type)
            .header("x-job-id", &row.job_id);

        if let Some(secret) = &self.config.notification_signing_secret {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|e| LedgerError::Transient(e.into()))?;
            mac.update(&body_bytes);
            let signature = hex::encode(mac.finalize().into_bytes());
            request = request.header("x-signature-sha256", signature);
        }

        let now = self.clock.now();
        match request.body(body_bytes).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.mark_delivered(&row.notification_id, now).await?;
                info!(notification_id = %row.notification_id, "notification delivered");
            }
            Ok(resp) => {
                let status = resp.status();
                self.reschedule(&row.notification_id, row.delivery_attempts, now, &format!("HTTP {status}"))
                    .await?;
                warn!(notification_id = %row.notification_id, %status, "notification delivery rejected");
            }
            Err(err) => {
                self.reschedule(&row.notification_id, row.delivery_attempts, now, &err.to_string())
                    .await?;
                warn!(notification_id = %row.notification_id, error = %err, "notification delivery failed");
            }
        }

        Ok(true)
    }

    async fn claim_due(&self) -> Result<Option<DueNotification>, LedgerError> {
        let mut conn = self.db.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| LedgerError::Transient(e.into()))?;
        let now = self.clock.now();

        let row = tx
            .query_row(
                "SELECT notification_id, tenant, job_type, job_id, reference_id, status,
                        summary, error, delivery_attempts
                 FROM job_notifications
                 WHERE delivered_at IS NULL AND available_at <= ?1
                 ORDER BY available_at ASC LIMIT 1",
                params![now.to_rfc3339()],
                |row| {
                    Ok(DueNotification {
                        notification_id: row.get(0)?,
                        tenant: row.get(1)?,
                        job_type: row.get(2)?,
                        job_id: row.get(3)?,
                        reference_id: row.get(4)?,
                        status: row.get(5)?,
                        summary: row.get(6)?,
                        error: row.get(7)?,
                        delivery_attempts: row.get(8)?,
                    })
                },
            )
            .optional()
            .map_err(|e| LedgerError::Transient(e.into()))?;

        // Bump available_at forward a touch so a second dispatcher loop
        // iteration (or worker) doesn't pick the same row mid-delivery;
        // the mutex already serializes this, but it keeps the query
        // self-describing if that ever changes.
        if let Some(row) = &row {
            tx.execute(
                "UPDATE job_notifications SET available_at = ?1 WHERE notification_id = ?2",
                params![now.to_rfc3339(), row.notification_id],
            )
            .map_err(|e| LedgerError::Transient(e.into()))?;
        }
        tx.commit().map_err(|e| LedgerError::Transient(e.into()))?;
        Ok(row)
    }

    async fn mark_delivered(&self, notification_id: &str, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE job_notifications
             SET delivered_at = ?1, delivery_attempts = delivery_attempts + 1
             WHERE notification_id = ?2",
            params![now.to_rfc3339(), notification_id],
        )
        .map_err(|e| LedgerError::Transient(e.into()))?;
        Ok(())
    }

    async fn reschedule(
        &self,
        notification_id: &str,
        delivery_attempts: i64,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<(), LedgerError> {
        let truncated: String = error.chars().take(1024).collect();
        let available_at = now + chrono::Duration::milliseconds(5 * self.config.poll_interval_ms as i64);
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE job_notifications
             SET available_at = ?1, error = ?2, delivery_attempts = ?3
             WHERE notification_id = ?4",
            params![available_at.to_rfc3339(), truncated, delivery_attempts + 1, notification_id],
        )
        .map_err(|e| LedgerError::Transient(e.into()))?;
        Ok(())
    }
}
