use super::plugin_config;
use crate::amount::{self, Amount};
use crate::error::LedgerError;
use crate::ledger::{LedgerEntry, LedgerLine};
use crate::plugins::{Mutation, ReceiptContext, ReceiptHelpers, ReceiptPlugin};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct StampProgram {
    id: String,
    skus: Vec<String>,
    #[serde(default)]
    stamps_per_item: Option<i64>,
    #[serde(default)]
    threshold: Option<i64>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    coupon_unit: Option<String>,
    #[serde(default)]
    tier_overrides: Option<serde_json::Value>,
}

pub struct NthFreeStamps;

impl ReceiptPlugin for NthFreeStamps {
    fn name(&self) -> &'static str {
        "NthFreeStamps"
    }

    fn should_handle(&self, _ctx: &ReceiptContext<'_>, _helpers: &dyn ReceiptHelpers) -> bool {
        true
    }

    fn apply(
        &self,
        ctx: &ReceiptContext<'_>,
        helpers: &dyn ReceiptHelpers,
    ) -> Result<Option<Mutation>, LedgerError> {
        let Some(config) = plugin_config(ctx.receipt, helpers)? else {
            return Ok(None);
        };
        let Some(raw_programs) = config.get("stamp_programs") else {
            return Ok(None);
        };
        let programs: Vec<StampProgram> = match serde_json::from_value(raw_programs.clone()) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        if programs.is_empty() {
            return Ok(None);
        }

        let mut entries = Vec::new();
        let mut any_added = false;

        for program in &programs {
            let (stamps_per_item, threshold) = resolve_overrides(
                ctx,
                helpers,
                program,
            );
            let Some(threshold) = threshold else { continue };
            if stamps_per_item <= 0 || threshold <= 0 {
                continue;
            }

            let matching_skus: std::collections::HashSet<String> =
                program.skus.iter().map(|s| s.to_lowercase()).collect();
            let stamps_added: i64 = ctx
                .receipt
                .items
                .iter()
                .filter(|item| matching_skus.contains(&item.sku.to_lowercase()))
                .map(|item| item.qty * stamps_per_item)
                .sum();

            if stamps_added <= 0 {
                continue;
            }
            any_added = true;

            let stamps_unit = program
                .unit
                .clone()
                .unwrap_or_else(|| format!("stamps:{}", program.id));
            entries.push(LedgerEntry {
                program_id: ctx.receipt.program_id.clone(),
                receipt_id: Some(ctx.receipt.receipt_id.clone()),
                memo: Some(format!("stamps:{}:{}", program.id, ctx.receipt.merchant_id)),
                lines: vec![
                    LedgerLine {
                        account_id: ctx.merchant_liability_account.clone(),
                        debit: Amount::from(stamps_added),
                        credit: amount::zero(),
                        unit: stamps_unit.clone(),
                    },
                    LedgerLine {
                        account_id: ctx.customer_account.clone(),
                        debit: amount::zero(),
                        credit: Amount::from(stamps_added),
                        unit: stamps_unit,
                    },
                ],
            });

            let pre_balance = helpers.get_account_balance(
                &ctx.customer_account,
                &ctx.receipt.program_id,
                &program.unit.clone().unwrap_or_else(|| format!("stamps:{}", program.id)),
            )?;
            let n = Amount::from(threshold);
            let post_balance = &pre_balance + Amount::from(stamps_added);
            let coupons = (&post_balance / &n) - (&pre_balance / &n);

            if coupons > amount::zero() {
                let coupon_unit = program
                    .coupon_unit
                    .clone()
                    .unwrap_or_else(|| format!("coupon:{}", program.id));
                entries.push(LedgerEntry {
                    program_id: ctx.receipt.program_id.clone(),
                    receipt_id: Some(ctx.receipt.receipt_id.clone()),
                    memo: Some(format!("coupon:{}:{}", program.id, ctx.receipt.merchant_id)),
                    lines: vec![
                        LedgerLine {
                            account_id: ctx.merchant_liability_account.clone(),
                            debit: coupons.clone(),
                            credit: amount::zero(),
                            unit: coupon_unit.clone(),
                        },
                        LedgerLine {
                            account_id: ctx.customer_account.clone(),
                            debit: amount::zero(),
                            credit: coupons,
                            unit: coupon_unit,
                        },
                    ],
                });
            }
        }

        if !any_added {
            return Ok(None);
        }

        Ok(Some(Mutation {
            entries,
            summary: Some(json!({ "stamp_programs_applied": programs.len() })),
        }))
    }
}

/// Looks up a per-customer tier override for this program's stamp rate
/// and threshold, falling back to the program-level defaults.
fn resolve_overrides(
    ctx: &ReceiptContext<'_>,
    helpers: &dyn ReceiptHelpers,
    program: &StampProgram,
) -> (i64, Option<i64>) {
    let mut stamps_per_item = program.stamps_per_item.unwrap_or(1);
    let mut threshold = program.threshold;

    if let Some(overrides) = &program.tier_overrides {
        if let Ok(Some(tier)) =
            helpers.get_customer_tier(&ctx.receipt.merchant_id, &ctx.customer_account)
        {
            if let Some(entry) = overrides.get(&tier.tier_id) {
                if let Some(v) = entry.get("stamps_per_item").and_then(|v| v.as_i64()) {
                    stamps_per_item = v;
                }
                if let Some(v) = entry.get("threshold").and_then(|v| v.as_i64()) {
                    threshold = Some(v);
                }
            }
        }
    }

    (stamps_per_item, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::models::{Receipt, ReceiptItem};
    use crate::plugins::receipt::tests_support::FakeHelpers;
    use chrono::Utc;

    fn receipt_with_items(items: Vec<ReceiptItem>) -> Receipt {
        Receipt {
            receipt_id: "r1".into(),
            tenant: "t".into(),
            idempotency_key: None,
            merchant_id: "m1".into(),
            store_id: None,
            account_ref: "cust-1".into(),
            program_id: "prog".into(),
            grand_total_cents: Amount::from(1000),
            processor_txn_id: None,
            issued_at: Utc::now(),
            items,
        }
    }

    #[test]
    fn grants_coupon_on_threshold_crossing() {
        let receipt = receipt_with_items(vec![ReceiptItem { sku: "coffee".into(), qty: 10 }]);
        let helpers = FakeHelpers::with_config(
            "prog",
            json!({
                "stamp_programs": [{
                    "id": "coffee-card",
                    "skus": ["coffee"],
                    "stamps_per_item": 1,
                    "threshold": 10
                }]
            }),
        );
        let ctx = ReceiptContext {
            tenant: "t",
            receipt: &receipt,
            customer_account: "t::acct::cust-1".into(),
            merchant_liability_account: "t::merchant_liability".into(),
        };
        let mutation = NthFreeStamps.apply(&ctx, &helpers).unwrap().unwrap();
        assert_eq!(mutation.entries.len(), 2);
        assert_eq!(mutation.entries[1].lines[1].credit, Amount::from(1));
    }

    #[test]
    fn no_matching_skus_returns_none() {
        let receipt = receipt_with_items(vec![ReceiptItem { sku: "tea".into(), qty: 10 }]);
        let helpers = FakeHelpers::with_config(
            "prog",
            json!({
                "stamp_programs": [{"id": "coffee-card", "skus": ["coffee"], "threshold": 10}]
            }),
        );
        let ctx = ReceiptContext {
            tenant: "t",
            receipt: &receipt,
            customer_account: "t::acct::cust-1".into(),
            merchant_liability_account: "t::merchant_liability".into(),
        };
        assert!(NthFreeStamps.apply(&ctx, &helpers).unwrap().is_none());
    }
}
