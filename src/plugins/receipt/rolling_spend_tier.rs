use super::plugin_config;
use crate::error::LedgerError;
use crate::models::CustomerTier;
use crate::plugins::{Mutation, ReceiptContext, ReceiptHelpers, ReceiptPlugin};
use chrono::Duration;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct TierDef {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    threshold_cents: i64,
}

#[derive(Debug, Deserialize)]
struct LoyaltyTiers {
    window_days: i64,
    tiers: Vec<TierDef>,
}

pub struct RollingSpendTier;

impl ReceiptPlugin for RollingSpendTier {
    fn name(&self) -> &'static str {
        "RollingSpendTier"
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
        let Some(raw) = config.get("loyalty_tiers") else {
            return Ok(None);
        };
        let mut loyalty: LoyaltyTiers = match serde_json::from_value(raw.clone()) {
            Ok(l) => l,
            Err(_) => return Ok(None),
        };
        if loyalty.tiers.is_empty() {
            return Ok(None);
        }
        loyalty.tiers.sort_by_key(|t| t.threshold_cents);

        let window_end = helpers.now();
        let window_start = window_end - Duration::hours(loyalty.window_days * 24);
        let rolling_spend = helpers.get_rolling_spend_cents(
            &ctx.receipt.merchant_id,
            &ctx.receipt.account_ref,
            window_start,
            window_end,
        )?;

        let selected = loyalty
            .tiers
            .iter()
            .rev()
            .find(|t| rolling_spend >= num_bigint::BigInt::from(t.threshold_cents));

        let Some(selected) = selected else {
            return Ok(None);
        };

        let tier = CustomerTier {
            tier_id: selected.id.clone(),
            tier_name: selected
                .display_name
                .clone()
                .unwrap_or_else(|| selected.id.clone()),
            window_days: loyalty.window_days,
            window_start,
            window_end,
            rolling_spend_cents: rolling_spend.clone(),
            updated_at: window_end,
        };
        helpers.upsert_customer_tier(&ctx.receipt.merchant_id, &ctx.customer_account, &tier)?;

        Ok(Some(Mutation {
            entries: Vec::new(),
            summary: Some(json!({
                "loyalty_tier": {
                    "tier_id": tier.tier_id,
                    "tier_name": tier.tier_name,
                    "rolling_spend_cents": crate::amount::to_db(&rolling_spend),
                }
            })),
        }))
    }
}
