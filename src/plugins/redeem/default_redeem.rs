use crate::amount::{self, Amount};
use crate::error::LedgerError;
use crate::ledger::{LedgerEntry, LedgerLine};
use crate::plugins::allocation::largest_remainder;
use crate::plugins::{AttributionParams, Mutation, RedeemContext, RedeemHelpers, RedeemOutcome, RedeemPlugin};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum Strategy {
    Priority,
    Proportional,
    SourceProportional,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Priority
    }
}

#[derive(Debug, Deserialize)]
struct PartnerConfig {
    merchant_account: String,
    #[serde(default)]
    weight: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CrossBrandAllocation {
    #[serde(default)]
    strategy: Strategy,
    partners: Vec<PartnerConfig>,
    #[serde(default)]
    partner_map: HashMap<String, String>,
    #[serde(default)]
    expiry_days: Option<i64>,
    #[serde(default)]
    partner_hint: Option<String>,
}

pub struct DefaultRedeem;

impl RedeemPlugin for DefaultRedeem {
    fn name(&self) -> &'static str {
        "DefaultRedeem"
    }

    fn should_handle(&self, _ctx: &RedeemContext<'_>, _helpers: &dyn RedeemHelpers) -> bool {
        true
    }

    fn apply(
        &self,
        ctx: &RedeemContext<'_>,
        helpers: &dyn RedeemHelpers,
    ) -> Result<RedeemOutcome, LedgerError> {
        let request = ctx.request;
        if request.qty <= amount::zero() {
            return Ok(RedeemOutcome::Failure {
                reason: "Redemption quantity must be positive".into(),
                retryable: false,
            });
        }

        let merchant_liability = match &request.burn_merchant_id {
            Some(merchant_id) => format!("{}::{}::merchant_liability", ctx.tenant, merchant_id),
            None => format!("{}::merchant_liability", ctx.tenant),
        };
        let config = helpers.get_program_config(&request.program_id)?;
        let allocation_config: CrossBrandAllocation = match config
            .as_ref()
            .and_then(|c| c.get("cross_brand_allocation"))
        {
            Some(raw) => match serde_json::from_value(raw.clone()) {
                Ok(c) => c,
                Err(_) => CrossBrandAllocation {
                    strategy: Strategy::Priority,
                    partners: vec![PartnerConfig {
                        merchant_account: merchant_liability.clone(),
                        weight: None,
                    }],
                    partner_map: HashMap::new(),
                    expiry_days: None,
                    partner_hint: None,
                },
            },
            None => CrossBrandAllocation {
                strategy: Strategy::Priority,
                partners: vec![PartnerConfig {
                    merchant_account: merchant_liability.clone(),
                    weight: None,
                }],
                partner_map: HashMap::new(),
                expiry_days: None,
                partner_hint: None,
            },
        };

        let partner_accounts: Vec<String> = allocation_config
            .partners
            .iter()
            .map(|p| p.merchant_account.clone())
            .collect();

        let frozen = helpers.get_frozen_merchants(&partner_accounts)?;
        let candidates: Vec<&PartnerConfig> = allocation_config
            .partners
            .iter()
            .filter(|p| !frozen.contains(&p.merchant_account))
            .collect();

        let candidate_accounts: Vec<String> = if candidates.is_empty() {
            vec![merchant_liability.clone()]
        } else {
            candidates.iter().map(|p| p.merchant_account.clone()).collect()
        };

        let attribution = helpers.get_outstanding_attribution(
            &ctx.customer_account,
            &AttributionParams {
                partner_accounts: candidate_accounts.clone(),
                partner_map: allocation_config.partner_map.clone(),
                expiry_days: allocation_config.expiry_days,
                burn_merchant_id: request.burn_merchant_id.clone(),
            },
        )?;

        let total_attributed: Amount = attribution.iter().fold(amount::zero(), |acc, a| acc + &a.amount);
        if total_attributed < request.qty {
            return Ok(RedeemOutcome::Failure {
                reason: "Insufficient balance".into(),
                retryable: false,
            });
        }

        let allocations: Vec<(String, Amount, Option<i64>)> = match allocation_config.strategy {
            Strategy::SourceProportional => {
                let weights: Vec<Amount> = attribution.iter().map(|a| a.amount.clone()).collect();
                let shares = largest_remainder(&request.qty, &weights);
                attribution
                    .iter()
                    .zip(shares)
                    .filter(|(_, share)| *share > amount::zero())
                    .map(|(item, share)| (item.account_id.clone(), share, item.settlement_adjustment_bps))
                    .collect()
            }
            Strategy::Proportional => {
                if !attribution.is_empty() {
                    let weights: Vec<Amount> = attribution.iter().map(|a| a.amount.clone()).collect();
                    let shares = largest_remainder(&request.qty, &weights);
                    attribution
                        .iter()
                        .zip(shares)
                        .filter(|(_, share)| *share > amount::zero())
                        .map(|(item, share)| (item.account_id.clone(), share, item.settlement_adjustment_bps))
                        .collect()
                } else {
                    let weights: Vec<Amount> = candidates
                        .iter()
                        .map(|p| Amount::from(p.weight.unwrap_or(1)))
                        .collect();
                    let shares = largest_remainder(&request.qty, &weights);
                    candidates
                        .iter()
                        .zip(shares)
                        .filter(|(_, share)| *share > amount::zero())
                        .map(|(p, share)| (p.merchant_account.clone(), share, None))
                        .collect()
                }
            }
            Strategy::Priority => {
                let mut ordered: Vec<String> = candidate_accounts.clone();
                if let Some(hint) = &allocation_config.partner_hint {
                    if let Some(pos) = ordered.iter().position(|a| a == hint) {
                        let hinted = ordered.remove(pos);
                        ordered.insert(0, hinted);
                    }
                }
                let first = ordered.first().cloned().unwrap_or(merchant_liability.clone());
                let adjustment = attribution
                    .iter()
                    .find(|a| a.account_id == first)
                    .and_then(|a| a.settlement_adjustment_bps);
                vec![(first, request.qty.clone(), adjustment)]
            }
        };

        let allocated_sum: Amount = allocations.iter().fold(amount::zero(), |acc, (_, a, _)| acc + a);
        let mut allocations = allocations;
        let residual = &request.qty - &allocated_sum;
        if residual != amount::zero() {
            if let Some(last) = allocations.last_mut() {
                last.1 += residual;
            }
        }

        let mut lines = vec![LedgerLine {
            account_id: ctx.customer_account.clone(),
            debit: request.qty.clone(),
            credit: amount::zero(),
            unit: request.unit.clone(),
        }];
        for (account_id, share, _) in &allocations {
            lines.push(LedgerLine {
                account_id: account_id.clone(),
                debit: amount::zero(),
                credit: share.clone(),
                unit: request.unit.clone(),
            });
        }

        let entry = LedgerEntry {
            program_id: request.program_id.clone(),
            receipt_id: None,
            memo: Some(format!("redeem:{}", request.request_id)),
            lines,
        };

        let summary = json!({
            "points_redeemed": amount::to_db(&request.qty),
            "allocation": allocations.iter().map(|(account_id, share, bps)| {
                json!({
                    "merchant_account": account_id,
                    "amount": amount::to_db(share),
                    "settlement_adjustment_bps": bps,
                })
            }).collect::<Vec<_>>(),
            "burn_merchant_id": request.burn_merchant_id,
        });

        Ok(RedeemOutcome::Success(Mutation {
            entries: vec![entry],
            summary: Some(summary),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::AttributionItem;
    use crate::models::RedeemRequest;
    use crate::plugins::redeem::tests_support::FakeRedeemHelpers;

    fn request(qty: i64) -> RedeemRequest {
        RedeemRequest {
            request_id: "req-1".into(),
            tenant: "t".into(),
            idempotency_key: None,
            account_id: "cust-1".into(),
            program_id: "prog".into(),
            unit: "points".into(),
            qty: Amount::from(qty),
            memo: None,
            burn_merchant_id: None,
        }
    }

    #[test]
    fn priority_allocates_entirely_to_first_candidate() {
        let request = request(30);
        let attribution = vec![AttributionItem {
            account_id: "t::merchant_liability".into(),
            amount: Amount::from(100),
            settlement_adjustment_bps: None,
        }];
        let helpers = FakeRedeemHelpers::new("prog", json!({}), attribution);
        let ctx = RedeemContext {
            tenant: "t",
            request: &request,
            customer_account: "t::acct::cust-1".into(),
        };
        let outcome = DefaultRedeem.apply(&ctx, &helpers).unwrap();
        match outcome {
            RedeemOutcome::Success(m) => {
                let alloc = &m.summary.unwrap()["allocation"][0];
                assert_eq!(alloc["amount"], "30");
            }
            RedeemOutcome::Failure { reason, .. } => panic!("unexpected failure: {reason}"),
        }
    }

    #[test]
    fn source_proportional_splits_by_attributed_amount() {
        let request = request(30);
        let attribution = vec![
            AttributionItem {
                account_id: "a".into(),
                amount: Amount::from(20),
                settlement_adjustment_bps: None,
            },
            AttributionItem {
                account_id: "b".into(),
                amount: Amount::from(10),
                settlement_adjustment_bps: None,
            },
        ];
        let helpers = FakeRedeemHelpers::new(
            "prog",
            json!({
                "cross_brand_allocation": {
                    "strategy": "source_proportional",
                    "partners": [
                        {"merchant_account": "a"},
                        {"merchant_account": "b"}
                    ]
                }
            }),
            attribution,
        );
        let ctx = RedeemContext {
            tenant: "t",
            request: &request,
            customer_account: "t::acct::cust-1".into(),
        };
        let outcome = DefaultRedeem.apply(&ctx, &helpers).unwrap();
        match outcome {
            RedeemOutcome::Success(m) => {
                let alloc = m.summary.unwrap()["allocation"].clone();
                assert_eq!(alloc[0]["amount"], "20");
                assert_eq!(alloc[1]["amount"], "10");
            }
            RedeemOutcome::Failure { reason, .. } => panic!("unexpected failure: {reason}"),
        }
    }

    #[test]
    fn insufficient_attribution_fails_nonretryable() {
        let request = request(30);
        let attribution = vec![AttributionItem {
            account_id: "a".into(),
            amount: Amount::from(10),
            settlement_adjustment_bps: None,
        }];
        let helpers = FakeRedeemHelpers::new("prog", json!({}), attribution);
        let ctx = RedeemContext {
            tenant: "t",
            request: &request,
            customer_account: "t::acct::cust-1".into(),
        };
        match DefaultRedeem.apply(&ctx, &helpers).unwrap() {
            RedeemOutcome::Failure { reason, retryable } => {
                assert_eq!(reason, "Insufficient balance");
                assert!(!retryable);
            }
            RedeemOutcome::Success(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn negative_qty_fails_validation() {
        let request = request(0);
        let helpers = FakeRedeemHelpers::new("prog", json!({}), vec![]);
        let ctx = RedeemContext {
            tenant: "t",
            request: &request,
            customer_account: "t::acct::cust-1".into(),
        };
        match DefaultRedeem.apply(&ctx, &helpers).unwrap() {
            RedeemOutcome::Failure { reason, retryable } => {
                assert_eq!(reason, "Redemption quantity must be positive");
                assert!(!retryable);
            }
            RedeemOutcome::Success(_) => panic!("expected failure"),
        }
    }
}
