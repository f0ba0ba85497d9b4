//! Program config store (spec.md §4.3): opaque per-(tenant, program) JSON.

use crate::error::LedgerError;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

pub fn get_program_config(
    conn: &rusqlite::Connection,
    tenant: &str,
    program_id: &str,
) -> Result<Option<Value>, LedgerError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT config FROM program_configs WHERE tenant = ?1 AND program_id = ?2",
            params![tenant, program_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| LedgerError::Transient(e.into()))?;

    match raw {
        None => Ok(None),
        Some(raw) => {
            let value = serde_json::from_str(&raw).map_err(|e| LedgerError::Transient(e.into()))?;
            Ok(Some(value))
        }
    }
}

pub fn put_program_config(
    conn: &rusqlite::Connection,
    tenant: &str,
    program_id: &str,
    config: &Value,
) -> Result<(), LedgerError> {
    let raw = serde_json::to_string(config).map_err(|e| LedgerError::Transient(e.into()))?;
    conn.execute(
        "INSERT INTO program_configs (tenant, program_id, config, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(tenant, program_id) DO UPDATE SET
            config = excluded.config,
            updated_at = excluded.updated_at",
        params![tenant, program_id, raw, Utc::now().to_rfc3339()],
    )
    .map_err(|e| LedgerError::Transient(e.into()))?;
    Ok(())
}
