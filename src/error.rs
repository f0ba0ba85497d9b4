//! Domain error kinds (spec.md §7).
//!
//! Kept as an explicit enum rather than ad hoc `anyhow::Error` because the
//! job processor must categorize failures into retryable vs. terminal, and
//! HTTP handlers must map them to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("idempotency conflict")]
    IdempotencyConflict,

    #[error("ledger entry has no lines")]
    EmptyEntry,

    #[error("ledger entry does not balance for unit {unit}: debits {debits} != credits {credits}")]
    UnbalancedEntry {
        unit: String,
        debits: String,
        credits: String,
    },

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("insufficient lots to cover amount")]
    InsufficientLots,

    #[error("no enabled redemption rule for burn merchant")]
    UnknownBurnMerchantRule,

    #[error("all candidate merchants are frozen")]
    FrozenMerchant,

    #[error("receipt payload missing")]
    ReceiptPayloadMissing,

    #[error("no redeem plugin accepted the request")]
    NoRedeemPluginAccepted,

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("transient store error: {0}")]
    Transient(#[from] anyhow::Error),

    #[error("not found")]
    NotFound,
}

impl LedgerError {
    /// Whether the job processor should reschedule (true) or finalize as
    /// `failed` immediately regardless of attempt count (false).
    ///
    /// `InsufficientLots` and `NoRedeemPluginAccepted` are retryable per
    /// spec: a concurrent writer may free up lots, or a rule-runner pass
    /// may still be warming the plugin chain. `ReceiptPayloadMissing` is
    /// explicitly terminal — no future attempt makes a deleted receipt
    /// reappear.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Transient(_)
                | LedgerError::Plugin(_)
                | LedgerError::InsufficientLots
                | LedgerError::NoRedeemPluginAccepted
        )
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match &self {
            LedgerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::IdempotencyConflict => StatusCode::CONFLICT,
            LedgerError::NotFound => StatusCode::NOT_FOUND,
            LedgerError::EmptyEntry
            | LedgerError::UnbalancedEntry { .. }
            | LedgerError::InsufficientBalance
            | LedgerError::InsufficientLots
            | LedgerError::UnknownBurnMerchantRule
            | LedgerError::FrozenMerchant
            | LedgerError::ReceiptPayloadMissing
            | LedgerError::NoRedeemPluginAccepted
            | LedgerError::Plugin(_) => StatusCode::BAD_REQUEST,
            LedgerError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
