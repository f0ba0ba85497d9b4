//! Composes the plugin chains (spec.md §4.6).

use crate::error::LedgerError;
use crate::plugins::{
    Mutation, ReceiptContext, ReceiptHelpers, ReceiptPlugin, RedeemContext, RedeemHelpers,
    RedeemOutcome, RedeemPlugin,
};

/// Runs every plugin whose `should_handle` accepts, preserving chain order.
/// `null` results (plugin declined at the `apply` stage) are filtered out.
pub fn run_receipt_plugins(
    chain: &[Box<dyn ReceiptPlugin>],
    ctx: &ReceiptContext<'_>,
    helpers: &dyn ReceiptHelpers,
) -> Result<Vec<Mutation>, LedgerError> {
    let mut mutations = Vec::new();
    for plugin in chain {
        if !plugin.should_handle(ctx, helpers) {
            continue;
        }
        if let Some(mutation) = plugin.apply(ctx, helpers)? {
            mutations.push(mutation);
        }
    }
    Ok(mutations)
}

/// Asks each plugin in order; returns the first one that accepts and
/// produces an outcome. `Ok(None)` means no plugin in the chain accepted —
/// the processor treats that as the retryable `NoRedeemPluginAccepted`.
pub fn run_redeem_plugins(
    chain: &[Box<dyn RedeemPlugin>],
    ctx: &RedeemContext<'_>,
    helpers: &dyn RedeemHelpers,
) -> Result<Option<RedeemOutcome>, LedgerError> {
    for plugin in chain {
        if !plugin.should_handle(ctx, helpers) {
            continue;
        }
        return Ok(Some(plugin.apply(ctx, helpers)?));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Receipt, ReceiptItem};
    use crate::plugins::receipt::tests_support::FakeHelpers;
    use crate::plugins::{default_receipt_chain, default_redeem_chain};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn receipt_chain_preserves_order_and_drops_nulls() {
        let receipt = Receipt {
            receipt_id: "r1".into(),
            tenant: "t".into(),
            idempotency_key: None,
            merchant_id: "m1".into(),
            store_id: None,
            account_ref: "cust-1".into(),
            program_id: "prog".into(),
            grand_total_cents: crate::amount::Amount::from(4250),
            processor_txn_id: None,
            issued_at: Utc::now(),
            items: Vec::<ReceiptItem>::new(),
        };
        let helpers = FakeHelpers::with_config("prog", json!({ "points_multiplier": 1 }));
        let ctx = ReceiptContext {
            tenant: "t",
            receipt: &receipt,
            customer_account: "t::acct::cust-1".into(),
            merchant_liability_account: "t::merchant_liability".into(),
        };
        let chain = default_receipt_chain();
        let mutations = run_receipt_plugins(&chain, &ctx, &helpers).unwrap();
        // DefaultEarn always returns Some; NthFreeStamps/RollingSpendTier
        // decline with no stamp/tier config present.
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].summary.as_ref().unwrap()["points_earned"], "43");
    }

    #[test]
    fn redeem_chain_is_present_and_non_empty() {
        assert_eq!(default_redeem_chain().len(), 1);
    }
}
