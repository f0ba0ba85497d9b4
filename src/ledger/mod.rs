//! Ledger primitives (spec.md §4.1): balanced-entry validation, the
//! append-only journal+lines writer, and balance queries.

mod primitives;

pub use primitives::{append_entries, balance, validate_entry, LedgerEntry, LedgerLine};
