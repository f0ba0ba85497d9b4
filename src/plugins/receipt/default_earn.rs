use super::plugin_config;
use crate::amount::{self, Amount};
use crate::error::LedgerError;
use crate::ledger::{LedgerEntry, LedgerLine};
use crate::plugins::{Mutation, ReceiptContext, ReceiptHelpers, ReceiptPlugin};
use serde_json::json;

pub struct DefaultEarn;

impl ReceiptPlugin for DefaultEarn {
    fn name(&self) -> &'static str {
        "DefaultEarn"
    }

    fn should_handle(&self, _ctx: &ReceiptContext<'_>, _helpers: &dyn ReceiptHelpers) -> bool {
        true
    }

    fn apply(
        &self,
        ctx: &ReceiptContext<'_>,
        helpers: &dyn ReceiptHelpers,
    ) -> Result<Option<Mutation>, LedgerError> {
        let config = plugin_config(ctx.receipt, helpers)?;
        let multiplier = config
            .as_ref()
            .and_then(|c| c.get("points_multiplier"))
            .map(|v| match v {
                serde_json::Value::Number(n) => amount::json_number_to_fraction(n)
                    .map_err(LedgerError::Transient),
                serde_json::Value::String(s) => {
                    amount::parse_decimal(s).map_err(LedgerError::Transient)
                }
                _ => Err(LedgerError::Plugin("points_multiplier must be a number".into())),
            })
            .transpose()?
            .unwrap_or((Amount::from(1u8), Amount::from(1u8)));

        let numerator = &ctx.receipt.grand_total_cents * &multiplier.0;
        let denominator = Amount::from(100u8) * &multiplier.1;
        let points = amount::round_half_away_from_zero(&numerator, &denominator);

        if points <= amount::zero() {
            return Ok(Some(Mutation {
                entries: Vec::new(),
                summary: Some(json!({ "points_earned": 0 })),
            }));
        }

        let entry = LedgerEntry {
            program_id: ctx.receipt.program_id.clone(),
            receipt_id: Some(ctx.receipt.receipt_id.clone()),
            memo: Some(format!("earn:{}", ctx.receipt.merchant_id)),
            lines: vec![
                LedgerLine {
                    account_id: ctx.merchant_liability_account.clone(),
                    debit: points.clone(),
                    credit: amount::zero(),
                    unit: "points".into(),
                },
                LedgerLine {
                    account_id: ctx.customer_account.clone(),
                    debit: amount::zero(),
                    credit: points.clone(),
                    unit: "points".into(),
                },
            ],
        };

        Ok(Some(Mutation {
            entries: vec![entry],
            summary: Some(json!({ "points_earned": amount::to_db(&points) })),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::receipt::tests_support::FakeHelpers;
    use crate::models::{Receipt, ReceiptItem};
    use chrono::Utc;

    fn receipt() -> Receipt {
        Receipt {
            receipt_id: "r1".into(),
            tenant: "t".into(),
            idempotency_key: None,
            merchant_id: "m1".into(),
            store_id: None,
            account_ref: "cust-1".into(),
            program_id: "prog".into(),
            grand_total_cents: Amount::from(4250),
            processor_txn_id: None,
            issued_at: Utc::now(),
            items: Vec::<ReceiptItem>::new(),
        }
    }

    #[test]
    fn rounds_half_away_from_zero() {
        let receipt = receipt();
        let helpers = FakeHelpers::with_config("prog", json!({ "points_multiplier": 1 }));
        let ctx = ReceiptContext {
            tenant: "t",
            receipt: &receipt,
            customer_account: "t::acct::cust-1".into(),
            merchant_liability_account: "t::merchant_liability".into(),
        };
        let mutation = DefaultEarn.apply(&ctx, &helpers).unwrap().unwrap();
        assert_eq!(mutation.summary.unwrap()["points_earned"], "43");
        assert_eq!(mutation.entries[0].lines[1].credit, Amount::from(43));
    }

    #[test]
    fn zero_points_emits_no_entries() {
        let mut receipt = receipt();
        receipt.grand_total_cents = Amount::from(0);
        let helpers = FakeHelpers::with_config("prog", json!({}));
        let ctx = ReceiptContext {
            tenant: "t",
            receipt: &receipt,
            customer_account: "t::acct::cust-1".into(),
            merchant_liability_account: "t::merchant_liability".into(),
        };
        let mutation = DefaultEarn.apply(&ctx, &helpers).unwrap().unwrap();
        assert!(mutation.entries.is_empty());
        assert_eq!(mutation.summary.unwrap()["points_earned"], 0);
    }
}
