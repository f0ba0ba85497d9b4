//! Redemption rule & attribution store (spec.md §4.8).

use crate::amount::{self, Amount};
use crate::error::LedgerError;
use crate::lots::{self, ConsumeScope, LotFilter};
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct RedemptionRule {
    pub earn_merchant_id: String,
    pub burn_merchant_id: String,
    pub earn_merchant_account: String,
    pub expiry_days_override: Option<i64>,
    pub settlement_adjustment_bps: Option<i64>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AttributionItem {
    pub account_id: String,
    pub amount: Amount,
    pub settlement_adjustment_bps: Option<i64>,
}

/// Returns all enabled rules for `burn_merchant_id`. With no burn merchant,
/// returns empty — there is nothing to attribute against.
pub fn load_rules(
    conn: &rusqlite::Connection,
    tenant: &str,
    burn_merchant_id: Option<&str>,
) -> Result<Vec<RedemptionRule>, LedgerError> {
    let Some(burn_merchant_id) = burn_merchant_id else {
        return Ok(Vec::new());
    };

    let mut stmt = conn
        .prepare(
            "SELECT earn_merchant_id, burn_merchant_id, earn_merchant_account,
                    expiry_days_override, settlement_adjustment_bps, enabled
             FROM merchant_redemption_rules
             WHERE tenant = ?1 AND burn_merchant_id = ?2 AND enabled = 1",
        )
        .map_err(|e| LedgerError::Transient(e.into()))?;

    let rules = stmt
        .query_map(params![tenant, burn_merchant_id], |row| {
            Ok(RedemptionRule {
                earn_merchant_id: row.get(0)?,
                burn_merchant_id: row.get(1)?,
                earn_merchant_account: row.get(2)?,
                expiry_days_override: row.get(3)?,
                settlement_adjustment_bps: row.get(4)?,
                enabled: row.get::<_, i64>(5)? != 0,
            })
        })
        .map_err(|e| LedgerError::Transient(e.into()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LedgerError::Transient(e.into()))?;

    Ok(rules)
}

pub fn get_frozen_merchants(
    conn: &rusqlite::Connection,
    tenant: &str,
    accounts: &[String],
) -> Result<HashSet<String>, LedgerError> {
    let mut frozen = HashSet::new();
    if accounts.is_empty() {
        return Ok(frozen);
    }
    let placeholders = accounts.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT merchant_account FROM merchant_status
         WHERE tenant = ? AND frozen = 1 AND merchant_account IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| LedgerError::Transient(e.into()))?;
    let mut binds: Vec<&str> = vec![tenant];
    binds.extend(accounts.iter().map(|s| s.as_str()));
    let mut rows = stmt
        .query(rusqlite::params_from_iter(binds))
        .map_err(|e| LedgerError::Transient(e.into()))?;
    while let Some(row) = rows.next().map_err(|e| LedgerError::Transient(e.into()))? {
        frozen.insert(row.get(0).map_err(|e| LedgerError::Transient(e.into()))?);
    }
    Ok(frozen)
}

pub(crate) fn min_expiry_bound(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

pub struct AttributionRequest<'a> {
    pub scope: &'a ConsumeScope,
    pub partner_accounts: &'a [String],
    pub partner_map: &'a HashMap<String, String>,
    pub expiry_days: Option<i64>,
    pub burn_merchant_id: Option<&'a str>,
}

/// Maps a customer's outstanding lots onto partner accounts (spec.md §4.8).
pub fn get_outstanding_attribution(
    conn: &rusqlite::Connection,
    tenant: &str,
    req: &AttributionRequest<'_>,
    now: DateTime<Utc>,
) -> Result<Vec<AttributionItem>, LedgerError> {
    let frozen = get_frozen_merchants(conn, tenant, req.partner_accounts)?;
    let candidates: Vec<String> = req
        .partner_accounts
        .iter()
        .filter(|a| !frozen.contains(*a))
        .cloned()
        .collect();

    let rules = load_rules(conn, tenant, req.burn_merchant_id)?;

    if !rules.is_empty() {
        let mut out = Vec::new();
        for rule in &rules {
            if !candidates.contains(&rule.earn_merchant_account) {
                continue;
            }
            let bound = min_expiry_bound(req.expiry_days, rule.expiry_days_override);
            let filter = LotFilter {
                merchant_ids: Some(vec![rule.earn_merchant_id.clone()]),
                max_age_days: bound,
            };
            let amount = lots::sum_eligible(conn, req.scope, &filter, now)?;
            if amount > amount::zero() {
                out.push(AttributionItem {
                    account_id: rule.earn_merchant_account.clone(),
                    amount,
                    settlement_adjustment_bps: rule.settlement_adjustment_bps,
                });
            }
        }
        return Ok(out);
    }

    if req.burn_merchant_id.is_some() {
        // Rules exist for other burn merchants but none for this one.
        return Ok(Vec::new());
    }

    // Fallback: group remaining qty by merchant_id, map through partner_map,
    // or to the sole candidate if there is exactly one.
    let by_merchant = lots::sum_eligible_by_merchant(conn, req.scope, now)?;
    let mut out: HashMap<String, Amount> = HashMap::new();
    for (merchant_id, qty) in by_merchant {
        let partner = match &merchant_id {
            Some(id) => req.partner_map.get(id).cloned(),
            None => None,
        }
        .or_else(|| {
            if candidates.len() == 1 {
                Some(candidates[0].clone())
            } else {
                None
            }
        });
        let Some(partner) = partner else {
            continue; // cannot be mapped — dropped per spec.md §4.8 step 3.
        };
        *out.entry(partner).or_insert_with(amount::zero) += qty;
    }

    Ok(out
        .into_iter()
        .map(|(account_id, amount)| AttributionItem {
            account_id,
            amount,
            settlement_adjustment_bps: None,
        })
        .collect())
}
