use super::AppState;
use crate::amount::{self, Amount};
use crate::error::LedgerError;
use crate::ids::IdGenerator;
use crate::models::{JobKind, JobStatus, ReceiptItem};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn tenant_of(headers: &HeaderMap) -> Result<String, LedgerError> {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LedgerError::Validation("missing x-tenant-id header".into()))
}

#[derive(Debug, Deserialize)]
pub struct ReceiptBody {
    pub idempotency_key: Option<String>,
    pub merchant_id: String,
    pub store_id: Option<String>,
    pub account_ref: String,
    pub program_id: String,
    pub grand_total_cents: Amount,
    pub processor_txn_id: Option<String>,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<ReceiptItem>,
}

#[derive(Debug, Serialize)]
pub struct JobHandleResponse {
    pub receipt_id: Option<String>,
    pub redemption_id: Option<String>,
    pub processing_job_id: String,
    pub status: &'static str,
}

fn format_two_decimals(cents: &Amount) -> String {
    let hundred = Amount::from(100);
    let whole = cents / &hundred;
    let remainder = cents % &hundred;
    let remainder = if remainder < amount::zero() { -remainder } else { remainder };
    let remainder: u32 = remainder.try_into().unwrap_or(0);
    format!("{whole}.{remainder:02}")
}

fn fingerprint(tenant: &str, body: &ReceiptBody) -> String {
    let grand_total_2dp = format_two_decimals(&body.grand_total_cents);
    let raw = format!(
        "{tenant}|{}|{}|{}|{}|{grand_total_2dp}|{}|{}",
        body.idempotency_key.as_deref().unwrap_or(""),
        body.merchant_id,
        body.store_id.as_deref().unwrap_or(""),
        body.account_ref,
        body.processor_txn_id.as_deref().unwrap_or(""),
        body.issued_at.to_rfc3339(),
    );
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)
}

/// Queues a receipt for processing. Enforces idempotency on both the
/// client-supplied key and the content fingerprint (spec.md §3, §6).
pub async fn post_receipt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReceiptBody>,
) -> Result<impl IntoResponse, LedgerError> {
    let tenant = tenant_of(&headers)?;
    if body.grand_total_cents < amount::zero() {
        return Err(LedgerError::Validation("grand_total_cents must be non-negative".into()));
    }

    let fingerprint = fingerprint(&tenant, &body);
    let conn = state.db.lock().await;

    if let Some((receipt_id, job_id, status)) = find_existing_receipt_job(
        &conn,
        &tenant,
        body.idempotency_key.as_deref(),
        &fingerprint,
    )? {
        return Ok((
            StatusCode::CONFLICT,
            Json(JobHandleResponse {
                receipt_id: Some(receipt_id),
                redemption_id: None,
                processing_job_id: job_id,
                status,
            }),
        ));
    }

    let now = state.clock.now();
    let receipt_id = state.ids.generate_id();
    let job_id = state.ids.generate_id();
    let payload = serde_json::to_string(&body.items).map_err(|e| LedgerError::Transient(e.into()))?;

    conn.execute(
        "INSERT INTO receipts
            (tenant, receipt_id, idempotency_key, fingerprint, merchant_id, store_id, account_ref,
             program_id, grand_total_cents, processor_txn_id, issued_at, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            tenant,
            receipt_id,
            body.idempotency_key,
            fingerprint,
            body.merchant_id,
            body.store_id,
            body.account_ref,
            body.program_id,
            amount::to_db(&body.grand_total_cents),
            body.processor_txn_id,
            body.issued_at.to_rfc3339(),
            payload,
            now.to_rfc3339(),
        ],
    )
    .map_err(|e| LedgerError::Transient(e.into()))?;

    insert_job(&conn, &job_id, &tenant, JobKind::Receipt, &receipt_id, now)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JobHandleResponse {
            receipt_id: Some(receipt_id),
            redemption_id: None,
            processing_job_id: job_id,
            status: "queued",
        }),
    ))
}

fn find_existing_receipt_job(
    conn: &rusqlite::Connection,
    tenant: &str,
    idempotency_key: Option<&str>,
    fingerprint: &str,
) -> Result<Option<(String, String, &'static str)>, LedgerError> {
    let receipt_id: Option<String> = if let Some(key) = idempotency_key {
        conn.query_row(
            "SELECT receipt_id FROM receipts WHERE tenant = ?1 AND idempotency_key = ?2",
            params![tenant, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| LedgerError::Transient(e.into()))?
    } else {
        None
    };
    let receipt_id = match receipt_id {
        Some(r) => Some(r),
        None => conn
            .query_row(
                "SELECT receipt_id FROM receipts WHERE tenant = ?1 AND fingerprint = ?2",
                params![tenant, fingerprint],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LedgerError::Transient(e.into()))?,
    };

    let Some(receipt_id) = receipt_id else {
        return Ok(None);
    };

    let (job_id, status) = conn
        .query_row(
            "SELECT job_id, status FROM jobs WHERE tenant = ?1 AND job_type = 'receipt' AND reference_id = ?2",
            params![tenant, receipt_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .map_err(|e| LedgerError::Transient(e.into()))?;

    Ok(Some((receipt_id, job_id, job_status_label(&status))))
}

fn job_status_label(raw: &str) -> &'static str {
    match JobStatus::parse(raw) {
        JobStatus::Pending => "queued",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

fn insert_job(
    conn: &rusqlite::Connection,
    job_id: &str,
    tenant: &str,
    kind: JobKind,
    reference_id: &str,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO jobs (job_id, tenant, job_type, reference_id, status, attempts, available_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
        params![job_id, tenant, kind.as_str(), reference_id, now.to_rfc3339()],
    )
    .map_err(|e| LedgerError::Transient(e.into()))?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub receipt_id: Option<String>,
    pub redemption_id: Option<String>,
    pub processing_job_id: String,
    pub status: &'static str,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub summary: Option<serde_json::Value>,
    pub completed_at: Option<String>,
    pub available_at: String,
    pub created_at: String,
}

async fn job_status(
    state: &AppState,
    tenant: &str,
    job_type: &str,
    reference_id: &str,
) -> Result<Option<JobStatusResponse>, LedgerError> {
    let conn = state.db.lock().await;
    let row: Option<(String, String, i64, Option<String>, Option<String>, Option<String>, String, String)> = conn
        .query_row(
            "SELECT job_id, status, attempts, last_error, result_summary, completed_at, available_at, created_at
             FROM jobs WHERE tenant = ?1 AND job_type = ?2 AND reference_id = ?3",
            params![tenant, job_type, reference_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            },
        )
        .optional()
        .map_err(|e| LedgerError::Transient(e.into()))?;

    let Some((job_id, status, attempts, last_error, result_summary, completed_at, available_at, created_at)) = row
    else {
        return Ok(None);
    };

    let summary = result_summary
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| LedgerError::Transient(e.into()))?;

    Ok(Some(JobStatusResponse {
        receipt_id: (job_type == "receipt").then(|| reference_id.to_string()),
        redemption_id: (job_type == "redeem").then(|| reference_id.to_string()),
        processing_job_id: job_id,
        status: job_status_label(&status),
        attempts,
        last_error,
        summary,
        completed_at,
        available_at,
        created_at,
    }))
}

pub async fn get_receipt_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(receipt_id): Path<String>,
) -> Result<impl IntoResponse, LedgerError> {
    let tenant = tenant_of(&headers)?;
    match job_status(&state, &tenant, "receipt", &receipt_id).await? {
        Some(resp) => Ok(Json(resp)),
        None => Err(LedgerError::NotFound),
    }
}

#[derive(Debug, Deserialize)]
pub struct RedeemBody {
    pub account_id: String,
    pub program_id: String,
    pub unit: String,
    pub qty: Amount,
    pub memo: Option<String>,
    pub idempotency_key: Option<String>,
    pub burn_merchant_id: Option<String>,
}

pub async fn post_redeem(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RedeemBody>,
) -> Result<impl IntoResponse, LedgerError> {
    let tenant = tenant_of(&headers)?;
    if body.qty <= amount::zero() {
        return Err(LedgerError::Validation("qty must be positive".into()));
    }

    let conn = state.db.lock().await;

    if let Some(key) = &body.idempotency_key {
        let existing: Option<String> = conn
            .query_row(
                "SELECT request_id FROM redeem_requests WHERE tenant = ?1 AND idempotency_key = ?2",
                params![tenant, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LedgerError::Transient(e.into()))?;

        if let Some(request_id) = existing {
            let (job_id, status): (String, String) = conn
                .query_row(
                    "SELECT job_id, status FROM jobs WHERE tenant = ?1 AND job_type = 'redeem' AND reference_id = ?2",
                    params![tenant, request_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| LedgerError::Transient(e.into()))?;
            return Ok((
                StatusCode::CONFLICT,
                Json(JobHandleResponse {
                    receipt_id: None,
                    redemption_id: Some(request_id),
                    processing_job_id: job_id,
                    status: job_status_label(&status),
                }),
            ));
        }
    }

    let now = state.clock.now();
    let request_id = state.ids.generate_id();
    let job_id = state.ids.generate_id();

    conn.execute(
        "INSERT INTO redeem_requests
            (tenant, request_id, idempotency_key, account_id, program_id, unit, qty, memo, burn_merchant_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            tenant,
            request_id,
            body.idempotency_key,
            body.account_id,
            body.program_id,
            body.unit,
            amount::to_db(&body.qty),
            body.memo,
            body.burn_merchant_id,
            now.to_rfc3339(),
        ],
    )
    .map_err(|e| LedgerError::Transient(e.into()))?;

    insert_job(&conn, &job_id, &tenant, JobKind::Redeem, &request_id, now)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JobHandleResponse {
            receipt_id: None,
            redemption_id: Some(request_id),
            processing_job_id: job_id,
            status: "queued",
        }),
    ))
}

pub async fn get_redeem_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(redemption_id): Path<String>,
) -> Result<impl IntoResponse, LedgerError> {
    let tenant = tenant_of(&headers)?;
    match job_status(&state, &tenant, "redeem", &redemption_id).await? {
        Some(resp) => Ok(Json(resp)),
        None => Err(LedgerError::NotFound),
    }
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub program_id: Option<String>,
    pub merchant_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BalanceEntry {
    pub program_id: String,
    pub unit: String,
    pub qty: String,
}

/// `account_id` of `"merchant"` or `"merchant_liability"` maps to the
/// tenant's merchant liability account. Postings land per-merchant
/// (`{tenant}::{merchant_id}::merchant_liability`), so without a
/// `merchant_id` query parameter this pools every merchant's sub-account
/// for the tenant (matching `{tenant}::%merchant_liability`, which also
/// covers the flat `{tenant}::merchant_liability` untargeted-redeem
/// account); with `merchant_id` it resolves to that one merchant's
/// sub-account. Any other `account_id` maps to `{tenant}::acct::{value}`
/// (spec.md §6).
pub async fn get_balances(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Query(query): Query<BalanceQuery>,
) -> Result<impl IntoResponse, LedgerError> {
    let tenant = tenant_of(&headers)?;
    let (account_match, resolved_account) = match (account_id.as_str(), &query.merchant_id) {
        ("merchant" | "merchant_liability", Some(merchant_id)) => {
            ("=", format!("{tenant}::{merchant_id}::merchant_liability"))
        }
        ("merchant" | "merchant_liability", None) => ("LIKE", format!("{tenant}::%merchant_liability")),
        (other, _) => ("=", format!("{tenant}::acct::{other}")),
    };

    let conn = state.db.lock().await;
    let mut sql = format!(
        "SELECT j.program_id, l.unit, l.debit, l.credit
         FROM ledger_lines l
         JOIN ledger_journal j ON j.entry_id = l.entry_id
         WHERE j.tenant = ?1 AND l.account_id {account_match} ?2"
    );
    if query.program_id.is_some() {
        sql.push_str(" AND j.program_id = ?3");
    }

    let mut stmt = conn.prepare(&sql).map_err(|e| LedgerError::Transient(e.into()))?;
    let mut totals: std::collections::HashMap<(String, String), Amount> = std::collections::HashMap::new();

    let mut binds: Vec<&dyn rusqlite::ToSql> = vec![&tenant, &resolved_account];
    if let Some(p) = &query.program_id {
        binds.push(p);
    }
    let mut rows = stmt
        .query(rusqlite::params_from_iter(binds))
        .map_err(|e| LedgerError::Transient(e.into()))?;
    while let Some(row) = rows.next().map_err(|e| LedgerError::Transient(e.into()))? {
        let program_id: String = row.get(0).map_err(|e| LedgerError::Transient(e.into()))?;
        let unit: String = row.get(1).map_err(|e| LedgerError::Transient(e.into()))?;
        let debit = amount::from_db(&row.get::<_, String>(2).map_err(|e| LedgerError::Transient(e.into()))?)
            .map_err(LedgerError::Transient)?;
        let credit = amount::from_db(&row.get::<_, String>(3).map_err(|e| LedgerError::Transient(e.into()))?)
            .map_err(LedgerError::Transient)?;
        *totals.entry((program_id, unit)).or_insert_with(amount::zero) += credit - debit;
    }

    let balances: Vec<BalanceEntry> = totals
        .into_iter()
        .map(|((program_id, unit), qty)| BalanceEntry {
            program_id,
            unit,
            qty: amount::to_db(&qty),
        })
        .collect();

    Ok(Json(balances))
}

pub async fn put_program_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(program_id): Path<String>,
    Json(config): Json<serde_json::Value>,
) -> Result<impl IntoResponse, LedgerError> {
    let tenant = tenant_of(&headers)?;
    let conn = state.db.lock().await;
    crate::program_config::put_program_config(&conn, &tenant, &program_id, &config)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_program_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(program_id): Path<String>,
) -> Result<impl IntoResponse, LedgerError> {
    let tenant = tenant_of(&headers)?;
    let conn = state.db.lock().await;
    match crate::program_config::get_program_config(&conn, &tenant, &program_id)? {
        Some(config) => Ok(Json(json!({ "program_id": program_id, "config": config }))),
        None => Err(LedgerError::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::AppConfig;
    use crate::db::Db;
    use crate::ids::UuidGenerator;
    use axum::extract::State as AxumState;
    use axum::response::IntoResponse;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState {
            db: Db::open_in_memory().unwrap(),
            clock: Arc::new(FixedClock(Utc::now())),
            ids: Arc::new(UuidGenerator),
            config: Arc::new(AppConfig::default()),
        }
    }

    fn headers_for(tenant: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant-id", tenant.parse().unwrap());
        headers
    }

    fn receipt_body() -> ReceiptBody {
        ReceiptBody {
            idempotency_key: Some("idem-1".into()),
            merchant_id: "m1".into(),
            store_id: Some("s1".into()),
            account_ref: "cust-1".into(),
            program_id: "prog".into(),
            grand_total_cents: Amount::from(4350),
            processor_txn_id: Some("txn-1".into()),
            issued_at: Utc::now(),
            items: vec![],
        }
    }

    #[test]
    fn format_two_decimals_pads_single_digit_cents() {
        assert_eq!(format_two_decimals(&Amount::from(4305)), "43.05");
        assert_eq!(format_two_decimals(&Amount::from(4350)), "43.50");
        assert_eq!(format_two_decimals(&Amount::from(0)), "0.00");
    }

    #[test]
    fn format_two_decimals_handles_negative_amounts() {
        assert_eq!(format_two_decimals(&Amount::from(-105)), "-1.05");
    }

    #[test]
    fn fingerprint_is_stable_for_identical_input() {
        let body = receipt_body();
        let a = fingerprint("tenant-a", &body);
        let b = fingerprint("tenant-a", &body);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_across_tenants() {
        let body = receipt_body();
        assert_ne!(fingerprint("tenant-a", &body), fingerprint("tenant-b", &body));
    }

    #[tokio::test]
    async fn tenant_of_rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(matches!(tenant_of(&headers), Err(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn post_receipt_then_duplicate_idempotency_key_returns_409() {
        let state = state();
        let headers = headers_for("t1");

        let first = post_receipt(AxumState(state.clone()), headers.clone(), Json(receipt_body()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = post_receipt(AxumState(state.clone()), headers, Json(receipt_body()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn post_receipt_rejects_negative_grand_total() {
        let state = state();
        let headers = headers_for("t1");
        let mut body = receipt_body();
        body.grand_total_cents = Amount::from(-1);

        let err = post_receipt(AxumState(state), headers, Json(body)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn post_redeem_then_duplicate_idempotency_key_returns_409() {
        fn redeem_body() -> RedeemBody {
            RedeemBody {
                account_id: "cust-1".into(),
                program_id: "prog".into(),
                unit: "points".into(),
                qty: Amount::from(10),
                memo: None,
                idempotency_key: Some("idem-redeem-1".into()),
                burn_merchant_id: None,
            }
        }
        let state = state();
        let headers = headers_for("t1");

        let first = post_redeem(AxumState(state.clone()), headers.clone(), Json(redeem_body()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = post_redeem(AxumState(state), headers, Json(redeem_body()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn post_redeem_rejects_non_positive_qty() {
        let state = state();
        let headers = headers_for("t1");
        let body = RedeemBody {
            account_id: "cust-1".into(),
            program_id: "prog".into(),
            unit: "points".into(),
            qty: Amount::from(0),
            memo: None,
            idempotency_key: None,
            burn_merchant_id: None,
        };

        let err = post_redeem(AxumState(state), headers, Json(body)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn get_balances_resolves_merchant_literal_to_pooled_account() {
        let state = state();
        {
            let conn = state.db.lock().await;
            let tx = conn.unchecked_transaction().unwrap();
            crate::ledger::append_entries(
                &tx,
                "t1",
                &[crate::ledger::LedgerEntry {
                    program_id: "prog".into(),
                    receipt_id: None,
                    memo: Some("earn:m1".into()),
                    lines: vec![
                        crate::ledger::LedgerLine {
                            account_id: "t1::m1::merchant_liability".into(),
                            debit: Amount::from(20),
                            credit: amount::zero(),
                            unit: "points".into(),
                        },
                        crate::ledger::LedgerLine {
                            account_id: "t1::acct::cust-1".into(),
                            debit: amount::zero(),
                            credit: Amount::from(20),
                            unit: "points".into(),
                        },
                    ],
                }],
                Utc::now(),
                state.ids.as_ref(),
            )
            .unwrap();
            tx.commit().unwrap();
        }

        let headers = headers_for("t1");
        let response = get_balances(
            AxumState(state),
            headers,
            Path("merchant".to_string()),
            Query(BalanceQuery { program_id: None, merchant_id: None }),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_balances_with_merchant_id_resolves_to_that_merchants_sub_account() {
        let state = state();
        {
            let conn = state.db.lock().await;
            let tx = conn.unchecked_transaction().unwrap();
            crate::ledger::append_entries(
                &tx,
                "t1",
                &[crate::ledger::LedgerEntry {
                    program_id: "prog".into(),
                    receipt_id: None,
                    memo: Some("earn:m1".into()),
                    lines: vec![
                        crate::ledger::LedgerLine {
                            account_id: "t1::m1::merchant_liability".into(),
                            debit: Amount::from(20),
                            credit: amount::zero(),
                            unit: "points".into(),
                        },
                        crate::ledger::LedgerLine {
                            account_id: "t1::acct::cust-1".into(),
                            debit: amount::zero(),
                            credit: Amount::from(20),
                            unit: "points".into(),
                        },
                    ],
                }],
                Utc::now(),
                state.ids.as_ref(),
            )
            .unwrap();
            tx.commit().unwrap();
        }

        let headers = headers_for("t1");
        let body = get_balances(
            AxumState(state),
            headers,
            Path("merchant".to_string()),
            Query(BalanceQuery { program_id: None, merchant_id: Some("m1".to_string()) }),
        )
        .await
        .unwrap()
        .into_response()
        .into_body();
        let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
        let response: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let entries = response.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["qty"], "-20");
    }
}
