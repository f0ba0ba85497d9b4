//! Periodic settlement aggregation (spec.md §4.10): net points per
//! merchant liability account over a reporting window.

use crate::amount::{self, Amount};
use crate::clock::Clock;
use crate::db::Db;
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::info;

pub struct SettlementReporter<'a> {
    pub db: &'a Db,
    pub clock: &'a dyn Clock,
    pub lookback_days: i64,
}

#[derive(Debug, Clone)]
pub struct SettlementRow {
    pub tenant: String,
    pub merchant_account: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub net_points: Amount,
}

impl<'a> SettlementReporter<'a> {
    /// Aggregates `ledger_lines` joined against `ledger_journal` for every
    /// account matching `%::merchant_liability`, grouped by `(tenant,
    /// account_id)`, over `[period_start, period_end)`, and upserts the
    /// result into `settlement_reports`.
    pub async fn run_once(&self) -> Result<Vec<SettlementRow>, LedgerError> {
        let period_end = self.clock.now();
        let period_start = period_end - chrono::Duration::days(self.lookback_days);

        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT j.tenant, l.account_id, l.credit, l.debit
                 FROM ledger_lines l
                 JOIN ledger_journal j ON j.entry_id = l.entry_id
                 WHERE l.account_id LIKE '%::merchant_liability'
                   AND j.created_at >= ?1 AND j.created_at < ?2",
            )
            .map_err(|e| LedgerError::Transient(e.into()))?;

        let mut by_account: std::collections::HashMap<(String, String), Amount> = std::collections::HashMap::new();
        let mut rows = stmt
            .query(params![period_start.to_rfc3339(), period_end.to_rfc3339()])
            .map_err(|e| LedgerError::Transient(e.into()))?;
        while let Some(row) = rows.next().map_err(|e| LedgerError::Transient(e.into()))? {
            let tenant: String = row.get(0).map_err(|e| LedgerError::Transient(e.into()))?;
            let account_id: String = row.get(1).map_err(|e| LedgerError::Transient(e.into()))?;
            let credit = amount::from_db(&row.get::<_, String>(2).map_err(|e| LedgerError::Transient(e.into()))?)
                .map_err(LedgerError::Transient)?;
            let debit = amount::from_db(&row.get::<_, String>(3).map_err(|e| LedgerError::Transient(e.into()))?)
                .map_err(LedgerError::Transient)?;
            let entry = by_account.entry((tenant, account_id)).or_insert_with(amount::zero);
            *entry += credit - debit;
        }
        drop(rows);
        drop(stmt);

        let mut out = Vec::new();
        for ((tenant, merchant_account), net_points) in by_account {
            conn.execute(
                "INSERT INTO settlement_reports (tenant, merchant_account, period_start, period_end, net_points, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                 ON CONFLICT(tenant, merchant_account, period_start, period_end)
                 DO UPDATE SET net_points = excluded.net_points",
                params![
                    tenant,
                    merchant_account,
                    period_start.to_rfc3339(),
                    period_end.to_rfc3339(),
                    amount::to_db(&net_points),
                ],
            )
            .map_err(|e| LedgerError::Transient(e.into()))?;

            info!(%tenant, %merchant_account, net_points = %amount::to_db(&net_points), "settlement period reported");
            out.push(SettlementRow {
                tenant,
                merchant_account,
                period_start,
                period_end,
                net_points,
            });
        }

        Ok(out)
    }
}
