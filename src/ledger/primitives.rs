use crate::amount::{self, Amount};
use crate::error::LedgerError;
use crate::ids::IdGenerator;
use chrono::{DateTime, Utc};
use rusqlite::{params, Transaction};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct LedgerLine {
    pub account_id: String,
    pub debit: Amount,
    pub credit: Amount,
    pub unit: String,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub program_id: String,
    pub receipt_id: Option<String>,
    pub memo: Option<String>,
    pub lines: Vec<LedgerLine>,
}

/// Fails with `EmptyEntry` when there are no lines, or `UnbalancedEntry`
/// when, within any unit, `Σdebits != Σcredits`.
pub fn validate_entry(entry: &LedgerEntry) -> Result<(), LedgerError> {
    if entry.lines.is_empty() {
        return Err(LedgerError::EmptyEntry);
    }

    let mut totals: HashMap<&str, (Amount, Amount)> = HashMap::new();
    for line in &entry.lines {
        let slot = totals
            .entry(line.unit.as_str())
            .or_insert_with(|| (amount::zero(), amount::zero()));
        slot.0 += &line.debit;
        slot.1 += &line.credit;
    }

    for (unit, (debits, credits)) in totals {
        if debits != credits {
            return Err(LedgerError::UnbalancedEntry {
                unit: unit.to_string(),
                debits: debits.to_string(),
                credits: credits.to_string(),
            });
        }
    }

    Ok(())
}

/// Appends each entry's journal header and its lines (in input order,
/// `line_no` starting at 1) inside an already-open transaction. Returns
/// the fresh entry ids in input order. Caller owns idempotency.
pub fn append_entries(
    tx: &Transaction<'_>,
    tenant: &str,
    entries: &[LedgerEntry],
    now: DateTime<Utc>,
    ids: &dyn IdGenerator,
) -> Result<Vec<String>, LedgerError> {
    let mut entry_ids = Vec::with_capacity(entries.len());

    for entry in entries {
        validate_entry(entry)?;
        let entry_id = ids.generate_id();

        tx.execute(
            "INSERT INTO ledger_journal (entry_id, tenant, program_id, receipt_id, memo, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry_id,
                tenant,
                entry.program_id,
                entry.receipt_id,
                entry.memo,
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| LedgerError::Transient(e.into()))?;

        for (idx, line) in entry.lines.iter().enumerate() {
            let line_no = (idx + 1) as i64;
            tx.execute(
                "INSERT INTO ledger_lines (entry_id, line_no, account_id, debit, credit, unit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry_id,
                    line_no,
                    line.account_id,
                    amount::to_db(&line.debit),
                    amount::to_db(&line.credit),
                    line.unit,
                ],
            )
            .map_err(|e| LedgerError::Transient(e.into()))?;
        }

        entry_ids.push(entry_id);
    }

    Ok(entry_ids)
}

/// `Σcredits − Σdebits` over every line for `account_id`, optionally
/// narrowed by `program_id` and/or `unit`. Not guaranteed monotonic.
pub fn balance(
    conn: &rusqlite::Connection,
    tenant: &str,
    account_id: &str,
    program_id: Option<&str>,
    unit: Option<&str>,
) -> Result<Amount, LedgerError> {
    let mut sql = String::from(
        "SELECT l.debit, l.credit FROM ledger_lines l
         JOIN ledger_journal j ON j.entry_id = l.entry_id
         WHERE j.tenant = ?1 AND l.account_id = ?2",
    );
    let mut idx = 2;
    let mut param_program = None;
    let mut param_unit = None;
    if program_id.is_some() {
        idx += 1;
        sql.push_str(&format!(" AND j.program_id = ?{idx}"));
        param_program = program_id;
    }
    if unit.is_some() {
        idx += 1;
        sql.push_str(&format!(" AND l.unit = ?{idx}"));
        param_unit = unit;
    }

    let mut stmt = conn.prepare(&sql).map_err(|e| LedgerError::Transient(e.into()))?;

    let mut dyn_params: Vec<&dyn rusqlite::ToSql> = vec![&tenant, &account_id];
    if let Some(p) = &param_program {
        dyn_params.push(p);
    }
    if let Some(u) = &param_unit {
        dyn_params.push(u);
    }

    let mut total = amount::zero();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(dyn_params))
        .map_err(|e| LedgerError::Transient(e.into()))?;
    while let Some(row) = rows.next().map_err(|e| LedgerError::Transient(e.into()))? {
        let debit_raw: String = row.get(0).map_err(|e| LedgerError::Transient(e.into()))?;
        let credit_raw: String = row.get(1).map_err(|e| LedgerError::Transient(e.into()))?;
        let debit = amount::from_db(&debit_raw).map_err(LedgerError::Transient)?;
        let credit = amount::from_db(&credit_raw).map_err(LedgerError::Transient)?;
        total += credit - debit;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UuidGenerator;
    use num_bigint::BigInt;

    fn line(account: &str, debit: i64, credit: i64, unit: &str) -> LedgerLine {
        LedgerLine {
            account_id: account.to_string(),
            debit: BigInt::from(debit),
            credit: BigInt::from(credit),
            unit: unit.to_string(),
        }
    }

    #[test]
    fn rejects_empty_entry() {
        let entry = LedgerEntry {
            program_id: "p".into(),
            receipt_id: None,
            memo: None,
            lines: vec![],
        };
        assert!(matches!(validate_entry(&entry), Err(LedgerError::EmptyEntry)));
    }

    #[test]
    fn rejects_unbalanced_entry() {
        let entry = LedgerEntry {
            program_id: "p".into(),
            receipt_id: None,
            memo: None,
            lines: vec![line("a", 100, 0, "points"), line("b", 0, 50, "points")],
        };
        assert!(matches!(
            validate_entry(&entry),
            Err(LedgerError::UnbalancedEntry { .. })
        ));
    }

    #[test]
    fn accepts_balanced_multi_unit_entry() {
        let entry = LedgerEntry {
            program_id: "p".into(),
            receipt_id: None,
            memo: None,
            lines: vec![
                line("a", 100, 0, "points"),
                line("b", 0, 100, "points"),
                line("a", 5, 0, "stamps:x"),
                line("b", 0, 5, "stamps:x"),
            ],
        };
        assert!(validate_entry(&entry).is_ok());
    }

    #[tokio::test]
    async fn append_and_balance_round_trip() {
        let db = crate::db::Db::open_in_memory().unwrap();
        let mut conn = db.lock().await;
        let tx = conn.transaction().unwrap();
        let ids = UuidGenerator;
        let now = Utc::now();

        let entry = LedgerEntry {
            program_id: "prog".into(),
            receipt_id: None,
            memo: Some("earn:merchant-1".into()),
            lines: vec![
                line("t::merchant_liability", 100, 0, "points"),
                line("t::acct::cust-1", 0, 100, "points"),
            ],
        };
        let ids_out = append_entries(&tx, "t", std::slice::from_ref(&entry), now, &ids).unwrap();
        tx.commit().unwrap();
        assert_eq!(ids_out.len(), 1);

        let bal = balance(&conn, "t", "t::acct::cust-1", None, Some("points")).unwrap();
        assert_eq!(bal, BigInt::from(100));
    }
}
