//! Built-in receipt plugins (spec.md §4.4). Order in
//! [`crate::plugins::default_receipt_chain`] is significant.

mod default_earn;
mod nth_free_stamps;
mod rolling_spend_tier;

pub use default_earn::DefaultEarn;
pub use nth_free_stamps::NthFreeStamps;
pub use rolling_spend_tier::RollingSpendTier;

use crate::error::LedgerError;
use crate::models::Receipt;
use crate::plugins::{ReceiptContext, ReceiptHelpers, ReceiptPlugin};

/// Program config lookup shared by every receipt plugin; `None` when the
/// program has no config row at all.
fn plugin_config(
    receipt: &Receipt,
    helpers: &dyn ReceiptHelpers,
) -> Result<Option<serde_json::Value>, LedgerError> {
    helpers.get_program_config(&receipt.program_id)
}
