//! Concrete `ReceiptHelpers`/`RedeemHelpers` wired to the relational store,
//! all operating inside the job processor's already-open transaction.

use super::{AttributionParams, ReceiptHelpers, RedeemHelpers};
use crate::amount::{self, Amount};
use crate::attribution::{self, AttributionItem, AttributionRequest};
use crate::clock::Clock;
use crate::error::LedgerError;
use crate::ids::IdGenerator;
use crate::ledger;
use crate::lots::ConsumeScope;
use crate::models::CustomerTier;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;

pub struct DbHelpers<'a> {
    pub tenant: &'a str,
    pub tx: &'a rusqlite::Transaction<'a>,
    pub clock: &'a dyn Clock,
    pub ids: &'a dyn IdGenerator,
    /// The (program, unit) scope of the job currently being processed.
    /// Redeem attribution queries lots within this scope only.
    pub scope: ConsumeScope,
}

impl<'a> ReceiptHelpers for DbHelpers<'a> {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn generate_id(&self) -> String {
        self.ids.generate_id()
    }

    fn get_program_config(&self, program_id: &str) -> Result<Option<serde_json::Value>, LedgerError> {
        crate::program_config::get_program_config(self.tx, self.tenant, program_id)
    }

    fn get_account_balance(
        &self,
        account_id: &str,
        program_id: &str,
        unit: &str,
    ) -> Result<Amount, LedgerError> {
        ledger::balance(self.tx, self.tenant, account_id, Some(program_id), Some(unit))
    }

    fn get_rolling_spend_cents(
        &self,
        merchant_id: &str,
        customer_account_ref: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Amount, LedgerError> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT grand_total_cents FROM receipts
                 WHERE tenant = ?1 AND merchant_id = ?2 AND account_ref = ?3
                   AND issued_at >= ?4 AND issued_at < ?5",
            )
            .map_err(|e| LedgerError::Transient(e.into()))?;
        let mut rows = stmt
            .query(params![
                self.tenant,
                merchant_id,
                customer_account_ref,
                window_start.to_rfc3339(),
                window_end.to_rfc3339(),
            ])
            .map_err(|e| LedgerError::Transient(e.into()))?;

        let mut total = amount::zero();
        while let Some(row) = rows.next().map_err(|e| LedgerError::Transient(e.into()))? {
            let raw: String = row.get(0).map_err(|e| LedgerError::Transient(e.into()))?;
            total += amount::from_db(&raw).map_err(LedgerError::Transient)?;
        }
        Ok(total)
    }

    fn upsert_customer_tier(
        &self,
        merchant_id: &str,
        customer_account: &str,
        tier: &CustomerTier,
    ) -> Result<(), LedgerError> {
        self.tx
            .execute(
                "INSERT INTO customer_tiers
                    (tenant, merchant_id, customer_account, tier_id, tier_name, window_days,
                     window_start, window_end, rolling_spend_cents, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(tenant, merchant_id, customer_account) DO UPDATE SET
                    tier_id = excluded.tier_id,
                    tier_name = excluded.tier_name,
                    window_days = excluded.window_days,
                    window_start = excluded.window_start,
                    window_end = excluded.window_end,
                    rolling_spend_cents = excluded.rolling_spend_cents,
                    updated_at = excluded.updated_at",
                params![
                    self.tenant,
                    merchant_id,
                    customer_account,
                    tier.tier_id,
                    tier.tier_name,
                    tier.window_days,
                    tier.window_start.to_rfc3339(),
                    tier.window_end.to_rfc3339(),
                    amount::to_db(&tier.rolling_spend_cents),
                    tier.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| LedgerError::Transient(e.into()))?;
        Ok(())
    }

    fn get_customer_tier(
        &self,
        merchant_id: &str,
        customer_account: &str,
    ) -> Result<Option<CustomerTier>, LedgerError> {
        self.tx
            .query_row(
                "SELECT tier_id, tier_name, window_days, window_start, window_end,
                        rolling_spend_cents, updated_at
                 FROM customer_tiers WHERE tenant = ?1 AND merchant_id = ?2 AND customer_account = ?3",
                params![self.tenant, merchant_id, customer_account],
                |row| {
                    let window_start: String = row.get(3)?;
                    let window_end: String = row.get(4)?;
                    let rolling_spend: String = row.get(5)?;
                    let updated_at: String = row.get(6)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        window_start,
                        window_end,
                        rolling_spend,
                        updated_at,
                    ))
                },
            )
            .optional()
            .map_err(|e| LedgerError::Transient(e.into()))?
            .map(
                |(tier_id, tier_name, window_days, window_start, window_end, rolling_spend, updated_at)| {
                    Ok(CustomerTier {
                        tier_id,
                        tier_name,
                        window_days,
                        window_start: DateTime::parse_from_rfc3339(&window_start)
                            .map_err(|e| LedgerError::Transient(e.into()))?
                            .with_timezone(&Utc),
                        window_end: DateTime::parse_from_rfc3339(&window_end)
                            .map_err(|e| LedgerError::Transient(e.into()))?
                            .with_timezone(&Utc),
                        rolling_spend_cents: amount::from_db(&rolling_spend)
                            .map_err(LedgerError::Transient)?,
                        updated_at: DateTime::parse_from_rfc3339(&updated_at)
                            .map_err(|e| LedgerError::Transient(e.into()))?
                            .with_timezone(&Utc),
                    })
                },
            )
            .transpose()
    }
}

impl<'a> RedeemHelpers for DbHelpers<'a> {
    fn get_outstanding_attribution(
        &self,
        _customer_account: &str,
        params: &AttributionParams,
    ) -> Result<Vec<AttributionItem>, LedgerError> {
        let req = AttributionRequest {
            scope: &self.scope,
            partner_accounts: &params.partner_accounts,
            partner_map: &params.partner_map,
            expiry_days: params.expiry_days,
            burn_merchant_id: params.burn_merchant_id.as_deref(),
        };
        attribution::get_outstanding_attribution(self.tx, self.tenant, &req, self.clock.now())
    }

    fn get_frozen_merchants(&self, accounts: &[String]) -> Result<HashSet<String>, LedgerError> {
        attribution::get_frozen_merchants(self.tx, self.tenant, accounts)
    }
}
