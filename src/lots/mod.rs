//! Point lot store (spec.md §4.2): per-earn inventory with FIFO,
//! expiry-aware consumption.

use crate::amount::{self, Amount};
use crate::error::LedgerError;
use crate::ids::IdGenerator;
use chrono::{DateTime, Utc};
use num_traits::Zero;
use rusqlite::{params, params_from_iter, Transaction};

#[derive(Debug, Clone)]
pub struct CreateLot {
    pub tenant: String,
    pub program_id: String,
    pub unit: String,
    pub customer_account: String,
    pub merchant_id: Option<String>,
    pub earn_entry_id: String,
    pub qty: Amount,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct LotFilter {
    /// Restrict eligible lots to these merchant ids. `None` = no restriction.
    pub merchant_ids: Option<Vec<String>>,
    /// Restrict eligible lots to those created within the last N days.
    pub max_age_days: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ConsumeScope {
    pub tenant: String,
    pub customer_account: String,
    pub program_id: String,
    pub unit: String,
}

/// Inserts one lot row with `qty_total = qty_remaining = qty`.
pub fn create_lot(
    tx: &Transaction<'_>,
    lot: &CreateLot,
    now: DateTime<Utc>,
    ids: &dyn IdGenerator,
) -> Result<String, LedgerError> {
    let lot_id = ids.generate_id();
    tx.execute(
        "INSERT INTO point_lots
            (lot_id, tenant, program_id, unit, customer_account, merchant_id,
             earn_entry_id, qty_total, qty_remaining, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            lot_id,
            lot.tenant,
            lot.program_id,
            lot.unit,
            lot.customer_account,
            lot.merchant_id,
            lot.earn_entry_id,
            amount::to_db(&lot.qty),
            amount::to_db(&lot.qty),
            lot.expires_at.map(|d| d.to_rfc3339()),
            now.to_rfc3339(),
        ],
    )
    .map_err(|e| LedgerError::Transient(e.into()))?;
    Ok(lot_id)
}

fn eligible_query(scope: &ConsumeScope, filter: &LotFilter, now: DateTime<Utc>) -> (String, Vec<String>) {
    let mut sql = String::from(
        "SELECT lot_id, qty_remaining FROM point_lots
         WHERE tenant = ? AND customer_account = ? AND program_id = ? AND unit = ?
           AND qty_remaining <> '0'
           AND (expires_at IS NULL OR expires_at > ?)",
    );
    let mut binds = vec![
        scope.tenant.clone(),
        scope.customer_account.clone(),
        scope.program_id.clone(),
        scope.unit.clone(),
    ];

    if let Some(merchant_ids) = &filter.merchant_ids {
        if merchant_ids.is_empty() {
            sql.push_str(" AND 0");
        } else {
            let placeholders = merchant_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            sql.push_str(&format!(" AND merchant_id IN ({placeholders})"));
            binds.extend(merchant_ids.iter().cloned());
        }
    }

    if let Some(max_age_days) = filter.max_age_days {
        sql.push_str(" AND created_at >= ?");
        let cutoff = now - chrono::Duration::days(max_age_days);
        binds.push(cutoff.to_rfc3339());
    }

    sql.push_str(
        " ORDER BY (CASE WHEN expires_at IS NULL THEN 1 ELSE 0 END) ASC, expires_at ASC, created_at ASC",
    );

    (sql, binds)
}

/// Atomically decrements lots in FIFO (`expires_at NULLS LAST, created_at`)
/// order until `amount` is covered. Fails with `InsufficientLots` if the
/// scope cannot cover it; callers must abort the transaction on failure.
pub fn consume(
    tx: &Transaction<'_>,
    scope: &ConsumeScope,
    amount: &Amount,
    filter: &LotFilter,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let mut remaining = amount.clone();
    if remaining.is_zero() {
        return Ok(());
    }

    // `now` is threaded through the expiry predicate via the bound parameter.
    let (sql, binds) = eligible_query_with_now(scope, filter, now);
    let mut stmt = tx.prepare(&sql).map_err(|e| LedgerError::Transient(e.into()))?;
    let mut rows = stmt
        .query(params_from_iter(binds.iter()))
        .map_err(|e| LedgerError::Transient(e.into()))?;

    let mut plan: Vec<(String, Amount, Amount)> = Vec::new(); // (lot_id, take, remaining_qty)
    while remaining > amount::zero() {
        let Some(row) = rows.next().map_err(|e| LedgerError::Transient(e.into()))? else {
            return Err(LedgerError::InsufficientLots);
        };
        let lot_id: String = row.get(0).map_err(|e| LedgerError::Transient(e.into()))?;
        let qty_remaining_raw: String = row.get(1).map_err(|e| LedgerError::Transient(e.into()))?;
        let qty_remaining = amount::from_db(&qty_remaining_raw).map_err(LedgerError::Transient)?;

        let take = if qty_remaining < remaining {
            qty_remaining.clone()
        } else {
            remaining.clone()
        };
        remaining -= &take;
        let new_remaining = &qty_remaining - &take;
        plan.push((lot_id, take, new_remaining));
    }
    drop(rows);
    drop(stmt);

    for (lot_id, _take, new_remaining) in &plan {
        tx.execute(
            "UPDATE point_lots SET qty_remaining = ?1 WHERE lot_id = ?2",
            params![amount::to_db(new_remaining), lot_id],
        )
        .map_err(|e| LedgerError::Transient(e.into()))?;
    }

    Ok(())
}

fn eligible_query_with_now(
    scope: &ConsumeScope,
    filter: &LotFilter,
    now: DateTime<Utc>,
) -> (String, Vec<String>) {
    let (sql, mut binds) = eligible_query(scope, filter, now);
    // eligible_query placed `?` for `now` right after the four scope binds;
    // insert the real value there.
    binds.insert(4, now.to_rfc3339());
    (sql, binds)
}

/// `Σqty_remaining` under the same scope and non-expired predicate.
pub fn sum_eligible(
    conn: &rusqlite::Connection,
    scope: &ConsumeScope,
    filter: &LotFilter,
    now: DateTime<Utc>,
) -> Result<Amount, LedgerError> {
    let (sql, binds) = eligible_query_with_now(scope, filter, now);
    let sql = sql.replace("SELECT lot_id, qty_remaining", "SELECT qty_remaining, qty_remaining");
    let mut stmt = conn.prepare(&sql).map_err(|e| LedgerError::Transient(e.into()))?;
    let mut rows = stmt
        .query(params_from_iter(binds.iter()))
        .map_err(|e| LedgerError::Transient(e.into()))?;

    let mut total = amount::zero();
    while let Some(row) = rows.next().map_err(|e| LedgerError::Transient(e.into()))? {
        let raw: String = row.get(0).map_err(|e| LedgerError::Transient(e.into()))?;
        total += amount::from_db(&raw).map_err(LedgerError::Transient)?;
    }
    Ok(total)
}

/// Sums `qty_remaining` grouped by `merchant_id` for the fallback
/// attribution path (spec.md §4.8 step 3).
pub fn sum_eligible_by_merchant(
    conn: &rusqlite::Connection,
    scope: &ConsumeScope,
    now: DateTime<Utc>,
) -> Result<Vec<(Option<String>, Amount)>, LedgerError> {
    let mut stmt = conn
        .prepare(
            "SELECT merchant_id, qty_remaining FROM point_lots
             WHERE tenant = ?1 AND customer_account = ?2 AND program_id = ?3 AND unit = ?4
               AND qty_remaining <> '0'
               AND (expires_at IS NULL OR expires_at > ?5)",
        )
        .map_err(|e| LedgerError::Transient(e.into()))?;

    let mut rows = stmt
        .query(params![
            scope.tenant,
            scope.customer_account,
            scope.program_id,
            scope.unit,
            now.to_rfc3339(),
        ])
        .map_err(|e| LedgerError::Transient(e.into()))?;

    let mut totals: Vec<(Option<String>, Amount)> = Vec::new();
    while let Some(row) = rows.next().map_err(|e| LedgerError::Transient(e.into()))? {
        let merchant_id: Option<String> = row.get(0).map_err(|e| LedgerError::Transient(e.into()))?;
        let raw: String = row.get(1).map_err(|e| LedgerError::Transient(e.into()))?;
        let qty = amount::from_db(&raw).map_err(LedgerError::Transient)?;
        match totals.iter_mut().find(|(m, _)| *m == merchant_id) {
            Some((_, total)) => *total += qty,
            None => totals.push((merchant_id, qty)),
        }
    }
    Ok(totals)
}
