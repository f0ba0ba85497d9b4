//! Built-in redeem plugins (spec.md §4.5).

mod default_redeem;

pub use default_redeem::DefaultRedeem;

#[cfg(test)]
pub(crate) mod tests_support {
    use crate::amount::Amount;
    use crate::attribution::AttributionItem;
    use crate::error::LedgerError;
    use crate::models::CustomerTier;
    use crate::plugins::{AttributionParams, ReceiptHelpers, RedeemHelpers};
    use chrono::{DateTime, Utc};
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    pub struct FakeRedeemHelpers {
        pub now: DateTime<Utc>,
        pub configs: HashMap<String, serde_json::Value>,
        pub attribution: Vec<AttributionItem>,
        pub frozen: HashSet<String>,
        pub calls: RefCell<Vec<String>>,
    }

    impl FakeRedeemHelpers {
        pub fn new(program_id: &str, config: serde_json::Value, attribution: Vec<AttributionItem>) -> Self {
            let mut configs = HashMap::new();
            configs.insert(program_id.to_string(), config);
            FakeRedeemHelpers {
                now: Utc::now(),
                configs,
                attribution,
                frozen: HashSet::new(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ReceiptHelpers for FakeRedeemHelpers {
        fn now(&self) -> DateTime<Utc> {
            self.now
        }
        fn generate_id(&self) -> String {
            "fake-id".into()
        }
        fn get_program_config(&self, program_id: &str) -> Result<Option<serde_json::Value>, LedgerError> {
            Ok(self.configs.get(program_id).cloned())
        }
        fn get_account_balance(&self, _: &str, _: &str, _: &str) -> Result<Amount, LedgerError> {
            Ok(crate::amount::zero())
        }
        fn get_rolling_spend_cents(
            &self,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Amount, LedgerError> {
            Ok(crate::amount::zero())
        }
        fn upsert_customer_tier(&self, _: &str, _: &str, _: &CustomerTier) -> Result<(), LedgerError> {
            Ok(())
        }
        fn get_customer_tier(&self, _: &str, _: &str) -> Result<Option<CustomerTier>, LedgerError> {
            Ok(None)
        }
    }

    impl RedeemHelpers for FakeRedeemHelpers {
        fn get_outstanding_attribution(
            &self,
            _customer_account: &str,
            _params: &AttributionParams,
        ) -> Result<Vec<AttributionItem>, LedgerError> {
            self.calls.borrow_mut().push("get_outstanding_attribution".into());
            Ok(self.attribution.clone())
        }
        fn get_frozen_merchants(&self, accounts: &[String]) -> Result<HashSet<String>, LedgerError> {
            Ok(accounts.iter().filter(|a| self.frozen.contains(*a)).cloned().collect())
        }
    }
}
