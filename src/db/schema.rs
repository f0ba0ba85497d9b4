//! Schema DDL. Every table is part of the system's external ABI (spec.md §6).

pub const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS receipts (
        tenant TEXT NOT NULL,
        receipt_id TEXT NOT NULL,
        idempotency_key TEXT,
        fingerprint TEXT NOT NULL,
        merchant_id TEXT NOT NULL,
        store_id TEXT,
        account_ref TEXT NOT NULL,
        program_id TEXT NOT NULL,
        grand_total_cents TEXT NOT NULL,
        processor_txn_id TEXT,
        issued_at TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant, receipt_id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_receipts_idem
        ON receipts(tenant, idempotency_key) WHERE idempotency_key IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_receipts_fingerprint
        ON receipts(tenant, fingerprint)",
    "CREATE TABLE IF NOT EXISTS redeem_requests (
        tenant TEXT NOT NULL,
        request_id TEXT NOT NULL,
        idempotency_key TEXT,
        account_id TEXT NOT NULL,
        program_id TEXT NOT NULL,
        unit TEXT NOT NULL,
        qty TEXT NOT NULL,
        memo TEXT,
        burn_merchant_id TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant, request_id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_redeem_idem
        ON redeem_requests(tenant, idempotency_key) WHERE idempotency_key IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS jobs (
        job_id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        job_type TEXT NOT NULL,
        reference_id TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        result_summary TEXT,
        available_at TEXT NOT NULL,
        completed_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_reference
        ON jobs(tenant, job_type, reference_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_due
        ON jobs(status, available_at, created_at)",
    "CREATE TABLE IF NOT EXISTS ledger_journal (
        entry_id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        program_id TEXT NOT NULL,
        receipt_id TEXT,
        memo TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ledger_lines (
        entry_id TEXT NOT NULL,
        line_no INTEGER NOT NULL,
        account_id TEXT NOT NULL,
        debit TEXT NOT NULL,
        credit TEXT NOT NULL,
        unit TEXT NOT NULL,
        PRIMARY KEY (entry_id, line_no)
    )",
    "CREATE INDEX IF NOT EXISTS idx_ledger_lines_account
        ON ledger_lines(account_id, unit)",
    "CREATE TABLE IF NOT EXISTS point_lots (
        lot_id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        program_id TEXT NOT NULL,
        unit TEXT NOT NULL,
        customer_account TEXT NOT NULL,
        merchant_id TEXT,
        earn_entry_id TEXT NOT NULL,
        qty_total TEXT NOT NULL,
        qty_remaining TEXT NOT NULL,
        expires_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_point_lots_scope
        ON point_lots(tenant, customer_account, program_id, unit, expires_at, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_point_lots_merchant
        ON point_lots(tenant, merchant_id)",
    "CREATE TABLE IF NOT EXISTS merchant_redemption_rules (
        tenant TEXT NOT NULL,
        earn_merchant_id TEXT NOT NULL,
        burn_merchant_id TEXT NOT NULL,
        earn_merchant_account TEXT NOT NULL,
        expiry_days_override INTEGER,
        settlement_adjustment_bps INTEGER,
        enabled INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (tenant, earn_merchant_id, burn_merchant_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_rules_burn
        ON merchant_redemption_rules(tenant, burn_merchant_id, enabled)",
    "CREATE TABLE IF NOT EXISTS customer_tiers (
        tenant TEXT NOT NULL,
        merchant_id TEXT NOT NULL,
        customer_account TEXT NOT NULL,
        tier_id TEXT NOT NULL,
        tier_name TEXT NOT NULL,
        window_days INTEGER NOT NULL,
        window_start TEXT NOT NULL,
        window_end TEXT NOT NULL,
        rolling_spend_cents TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant, merchant_id, customer_account)
    )",
    "CREATE TABLE IF NOT EXISTS merchant_status (
        tenant TEXT NOT NULL,
        merchant_account TEXT NOT NULL,
        frozen INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (tenant, merchant_account)
    )",
    "CREATE TABLE IF NOT EXISTS program_configs (
        tenant TEXT NOT NULL,
        program_id TEXT NOT NULL,
        config TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant, program_id)
    )",
    "CREATE TABLE IF NOT EXISTS job_notifications (
        notification_id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        job_type TEXT NOT NULL,
        job_id TEXT NOT NULL,
        reference_id TEXT NOT NULL,
        status TEXT NOT NULL,
        summary TEXT,
        error TEXT,
        available_at TEXT NOT NULL,
        delivered_at TEXT,
        delivery_attempts INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_notifications_due
        ON job_notifications(delivered_at, available_at)",
    "CREATE TABLE IF NOT EXISTS settlement_reports (
        tenant TEXT NOT NULL,
        merchant_account TEXT NOT NULL,
        period_start TEXT NOT NULL,
        period_end TEXT NOT NULL,
        net_points TEXT NOT NULL,
        summary TEXT,
        PRIMARY KEY (tenant, merchant_account, period_start, period_end)
    )",
];
