//! Mutation application (spec.md §4.7, steps 1-3): append the ledger
//! entries a plugin produced, create point lots for earn entries, and
//! consume lots for redeem entries.

use crate::amount;
use crate::attribution;
use crate::error::LedgerError;
use crate::ids::IdGenerator;
use crate::ledger;
use crate::lots::{self, ConsumeScope, LotFilter};
use crate::plugins::Mutation;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub fn apply_mutations(
    tx: &rusqlite::Transaction<'_>,
    tenant: &str,
    ids: &dyn IdGenerator,
    now: DateTime<Utc>,
    mutation: &Mutation,
    program_config: &Option<serde_json::Value>,
    burn_merchant_id: Option<&str>,
) -> Result<(), LedgerError> {
    let entry_ids = ledger::append_entries(tx, tenant, &mutation.entries, now, ids)?;

    for (entry, entry_id) in mutation.entries.iter().zip(&entry_ids) {
        let Some(merchant_id) = entry.memo.as_deref().and_then(|m| m.strip_prefix("earn:")) else {
            continue;
        };
        for line in &entry.lines {
            if line.unit != "points" || line.credit <= amount::zero() {
                continue;
            }
            let expires_at = resolve_earn_expiry(program_config, merchant_id, now);
            lots::create_lot(
                tx,
                &lots::CreateLot {
                    tenant: tenant.to_string(),
                    program_id: entry.program_id.clone(),
                    unit: line.unit.clone(),
                    customer_account: line.account_id.clone(),
                    merchant_id: Some(merchant_id.to_string()),
                    earn_entry_id: entry_id.clone(),
                    qty: line.credit.clone(),
                    expires_at,
                },
                now,
                ids,
            )?;
        }
    }

    let Some(summary) = &mutation.summary else {
        return Ok(());
    };

    let Some(redeem_entry) = mutation.entries.first() else {
        return Ok(());
    };
    let Some(debit_line) = redeem_entry.lines.iter().find(|l| l.debit > amount::zero()) else {
        return Ok(());
    };
    let scope = ConsumeScope {
        tenant: tenant.to_string(),
        customer_account: debit_line.account_id.clone(),
        program_id: redeem_entry.program_id.clone(),
        unit: debit_line.unit.clone(),
    };

    match summary.get("allocation").and_then(|v| v.as_array()) {
        Some(allocations) if !allocations.is_empty() => {
            consume_allocated(tx, tenant, &scope, allocations, program_config, burn_merchant_id, now)?;
        }
        _ => {
            if let Some(points_redeemed) = summary.get("points_redeemed").and_then(|v| v.as_str()) {
                let total = amount::from_db(points_redeemed).map_err(LedgerError::Transient)?;
                lots::consume(tx, &scope, &total, &LotFilter::default(), now)?;
            }
        }
    }

    Ok(())
}

fn consume_allocated(
    tx: &rusqlite::Transaction<'_>,
    tenant: &str,
    scope: &ConsumeScope,
    allocations: &[serde_json::Value],
    program_config: &Option<serde_json::Value>,
    burn_merchant_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let cross_brand = program_config.as_ref().and_then(|c| c.get("cross_brand_allocation"));
    let global_expiry_days = cross_brand.and_then(|c| c.get("expiry_days")).and_then(|v| v.as_i64());
    let partner_map: HashMap<String, String> = cross_brand
        .and_then(|c| c.get("partner_map"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let mut reverse_partner_map: HashMap<String, Vec<String>> = HashMap::new();
    for (merchant_id, partner_account) in &partner_map {
        reverse_partner_map
            .entry(partner_account.clone())
            .or_default()
            .push(merchant_id.clone());
    }

    let rules = attribution::load_rules(tx, tenant, burn_merchant_id)?;

    for item in allocations {
        let Some(merchant_account) = item.get("merchant_account").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(amount_raw) = item.get("amount").and_then(|v| v.as_str()) else {
            continue;
        };
        let amount_redeemed = amount::from_db(amount_raw).map_err(LedgerError::Transient)?;
        if amount_redeemed <= amount::zero() {
            continue;
        }

        let filter = if let Some(rule) = rules.iter().find(|r| r.earn_merchant_account == merchant_account) {
            LotFilter {
                merchant_ids: Some(vec![rule.earn_merchant_id.clone()]),
                max_age_days: attribution::min_expiry_bound(global_expiry_days, rule.expiry_days_override),
            }
        } else if let Some(merchant_ids) = reverse_partner_map.get(merchant_account) {
            LotFilter {
                merchant_ids: Some(merchant_ids.clone()),
                max_age_days: global_expiry_days,
            }
        } else {
            LotFilter {
                merchant_ids: None,
                max_age_days: global_expiry_days,
            }
        };

        lots::consume(tx, scope, &amount_redeemed, &filter, now)?;
    }

    Ok(())
}

/// Expiry precedence for a freshly earned lot (first match wins):
/// (a) partner-specific `expiry_days` reachable via `partner_map[merchant_id]`,
/// (b) `earn_expiry_overrides[merchant_id]`, (c) `earn_expiry_days_default`.
/// Absent at every level means the lot never expires.
fn resolve_earn_expiry(
    program_config: &Option<serde_json::Value>,
    merchant_id: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let config = program_config.as_ref()?;

    if let Some(days) = partner_specific_expiry_days(config, merchant_id) {
        return Some(now + chrono::Duration::days(days));
    }
    if let Some(days) = config
        .get("earn_expiry_overrides")
        .and_then(|v| v.get(merchant_id))
        .and_then(|v| v.as_i64())
    {
        return Some(now + chrono::Duration::days(days));
    }
    if let Some(days) = config.get("earn_expiry_days_default").and_then(|v| v.as_i64()) {
        return Some(now + chrono::Duration::days(days));
    }
    None
}

fn partner_specific_expiry_days(config: &serde_json::Value, merchant_id: &str) -> Option<i64> {
    let cross_brand = config.get("cross_brand_allocation")?;
    let partner_account = cross_brand.get("partner_map")?.get(merchant_id)?.as_str()?;
    let partners = cross_brand.get("partners")?.as_array()?;
    partners
        .iter()
        .find(|p| p.get("merchant_account").and_then(|v| v.as_str()) == Some(partner_account))
        .and_then(|p| p.get("expiry_days"))
        .and_then(|v| v.as_i64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UuidGenerator;
    use crate::ledger::{LedgerEntry, LedgerLine};
    use crate::plugins::Mutation;
    use serde_json::json;

    #[tokio::test]
    async fn earn_entry_creates_a_lot_with_resolved_expiry() {
        let db = crate::db::Db::open_in_memory().unwrap();
        let mut conn = db.lock().await;
        let tx = conn.transaction().unwrap();
        let ids = UuidGenerator;
        let now = Utc::now();

        let mutation = Mutation {
            entries: vec![LedgerEntry {
                program_id: "prog".into(),
                receipt_id: Some("r1".into()),
                memo: Some("earn:m1".into()),
                lines: vec![
                    LedgerLine {
                        account_id: "t::m1::merchant_liability".into(),
                        debit: crate::amount::Amount::from(43),
                        credit: crate::amount::zero(),
                        unit: "points".into(),
                    },
                    LedgerLine {
                        account_id: "t::acct::cust-1".into(),
                        debit: crate::amount::zero(),
                        credit: crate::amount::Amount::from(43),
                        unit: "points".into(),
                    },
                ],
            }],
            summary: None,
        };

        let config = Some(json!({ "earn_expiry_days_default": 30 }));
        apply_mutations(&tx, "t", &ids, now, &mutation, &config, None).unwrap();

        let (qty_remaining, expires_at): (String, String) = tx
            .query_row(
                "SELECT qty_remaining, expires_at FROM point_lots WHERE customer_account = ?1",
                ["t::acct::cust-1"],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(qty_remaining, "43");
        let expires_at = DateTime::parse_from_rfc3339(&expires_at).unwrap();
        assert!(expires_at > now + chrono::Duration::days(29));
    }

    #[tokio::test]
    async fn redeem_allocation_consumes_matching_merchant_lots() {
        let db = crate::db::Db::open_in_memory().unwrap();
        let mut conn = db.lock().await;
        let ids = UuidGenerator;
        let now = Utc::now();

        let tx = conn.transaction().unwrap();
        lots::create_lot(
            &tx,
            &lots::CreateLot {
                tenant: "t".into(),
                program_id: "prog".into(),
                unit: "points".into(),
                customer_account: "t::acct::cust-1".into(),
                merchant_id: Some("m1".into()),
                earn_entry_id: "e1".into(),
                qty: crate::amount::Amount::from(50),
                expires_at: None,
            },
            now,
            &ids,
        )
        .unwrap();
        tx.commit().unwrap();

        let tx = conn.transaction().unwrap();
        let mutation = Mutation {
            entries: vec![LedgerEntry {
                program_id: "prog".into(),
                receipt_id: None,
                memo: Some("redeem:req-1".into()),
                lines: vec![
                    LedgerLine {
                        account_id: "t::acct::cust-1".into(),
                        debit: crate::amount::Amount::from(30),
                        credit: crate::amount::zero(),
                        unit: "points".into(),
                    },
                    LedgerLine {
                        account_id: "partner-a".into(),
                        debit: crate::amount::zero(),
                        credit: crate::amount::Amount::from(30),
                        unit: "points".into(),
                    },
                ],
            }],
            summary: Some(json!({
                "points_redeemed": "30",
                "allocation": [{"merchant_account": "partner-a", "amount": "30", "settlement_adjustment_bps": null}],
            })),
        };
        apply_mutations(&tx, "t", &ids, now, &mutation, &None, None).unwrap();

        let remaining: String = tx
            .query_row(
                "SELECT qty_remaining FROM point_lots WHERE customer_account = 't::acct::cust-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, "20");
    }
}
