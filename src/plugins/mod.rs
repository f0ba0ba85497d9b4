//! Rule plugins (spec.md §4.4, §4.5) and the runner that composes them
//! (§4.6).

pub mod allocation;
pub mod helpers;
pub mod receipt;
pub mod redeem;
pub mod runner;

use crate::attribution::AttributionItem;
use crate::error::LedgerError;
use crate::ledger::LedgerEntry;
use crate::models::{CustomerTier, Receipt, RedeemRequest};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::collections::HashSet;

/// A plugin's declarative output: zero or more ledger entries plus an
/// optional summary, applied by the job processor in chain order.
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    pub entries: Vec<LedgerEntry>,
    pub summary: Option<serde_json::Value>,
}

pub enum RedeemOutcome {
    Success(Mutation),
    Failure { reason: String, retryable: bool },
}

pub struct ReceiptContext<'a> {
    pub tenant: &'a str,
    pub receipt: &'a Receipt,
    pub customer_account: String,
    pub merchant_liability_account: String,
}

pub struct RedeemContext<'a> {
    pub tenant: &'a str,
    pub request: &'a RedeemRequest,
    pub customer_account: String,
}

/// Helpers surfaced to receipt plugins (spec.md §4.4). `&dyn` so unit
/// tests can supply an in-memory fake without a database.
pub trait ReceiptHelpers: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn generate_id(&self) -> String;
    fn get_program_config(&self, program_id: &str) -> Result<Option<serde_json::Value>, LedgerError>;
    fn get_account_balance(
        &self,
        account_id: &str,
        program_id: &str,
        unit: &str,
    ) -> Result<crate::amount::Amount, LedgerError>;
    fn get_rolling_spend_cents(
        &self,
        merchant_id: &str,
        customer_account_ref: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<crate::amount::Amount, LedgerError>;
    fn upsert_customer_tier(
        &self,
        merchant_id: &str,
        customer_account: &str,
        tier: &CustomerTier,
    ) -> Result<(), LedgerError>;
    fn get_customer_tier(
        &self,
        merchant_id: &str,
        customer_account: &str,
    ) -> Result<Option<CustomerTier>, LedgerError>;
}

pub struct AttributionParams {
    pub partner_accounts: Vec<String>,
    pub partner_map: HashMap<String, String>,
    pub expiry_days: Option<i64>,
    pub burn_merchant_id: Option<String>,
}

/// Helpers surfaced to redeem plugins: everything a receipt plugin gets,
/// plus cross-brand attribution and freeze-state lookups (spec.md §4.5).
pub trait RedeemHelpers: ReceiptHelpers {
    fn get_outstanding_attribution(
        &self,
        customer_account: &str,
        params: &AttributionParams,
    ) -> Result<Vec<AttributionItem>, LedgerError>;
    fn get_frozen_merchants(&self, accounts: &[String]) -> Result<HashSet<String>, LedgerError>;
}

pub trait ReceiptPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn should_handle(&self, ctx: &ReceiptContext<'_>, helpers: &dyn ReceiptHelpers) -> bool;
    fn apply(
        &self,
        ctx: &ReceiptContext<'_>,
        helpers: &dyn ReceiptHelpers,
    ) -> Result<Option<Mutation>, LedgerError>;
}

pub trait RedeemPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn should_handle(&self, ctx: &RedeemContext<'_>, helpers: &dyn RedeemHelpers) -> bool;
    fn apply(
        &self,
        ctx: &RedeemContext<'_>,
        helpers: &dyn RedeemHelpers,
    ) -> Result<RedeemOutcome, LedgerError>;
}

/// The fixed, statically composed receipt chain (spec.md §4.4: runtime
/// plugin loading is an explicit Non-goal).
pub fn default_receipt_chain() -> Vec<Box<dyn ReceiptPlugin>> {
    vec![
        Box::new(receipt::DefaultEarn),
        Box::new(receipt::NthFreeStamps),
        Box::new(receipt::RollingSpendTier),
    ]
}

pub fn default_redeem_chain() -> Vec<Box<dyn RedeemPlugin>> {
    vec![Box::new(redeem::DefaultRedeem)]
}
