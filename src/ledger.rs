use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::LedgerKind;
use crate::domain::WalletSummary;
use crate::errors::AppError;
use crate::tx::PgTransaction;

/// One append-only ledger row, as stored.
#[derive(Debug, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub registration_id: Option<Uuid>,
    pub idempotency_key: String,
    pub kind: String,
    pub amount_cents: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

const ENTRY_COLUMNS: &str =
    "id, user_id, session_id, registration_id, idempotency_key, kind, amount_cents, status, created_at";

/// Atomically create the wallet row if absent and take the row lock. Every
/// wallet mutation in the system happens under this lock, which also
/// serializes per-user money movement across sessions.
pub async fn ensure_and_lock_wallet(
    transaction: &mut PgTransaction,
    user_id: Uuid,
) -> Result<WalletSummary, AppError> {
    sqlx::query("INSERT INTO wallets (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(user_id)
        .execute(&mut **transaction)
        .await?;
    let row = sqlx::query("SELECT posted_cents, holds_cents FROM wallets WHERE user_id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_one(&mut **transaction)
        .await?;
    Ok(WalletSummary {
        posted_cents: row.try_get("posted_cents").context("wallet row shape")?,
        holds_cents: row.try_get("holds_cents").context("wallet row shape")?,
    })
}

/// Read wallet totals without locking. Callers that go on to mutate must use
/// `ensure_and_lock_wallet` instead; callers inside a transaction get a
/// snapshot consistent with that transaction.
pub async fn wallet_summary<'e, E>(
    executor: E,
    user_id: Uuid,
) -> Result<WalletSummary, AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query("SELECT posted_cents, holds_cents FROM wallets WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(executor)
        .await?;
    match row {
        None => Ok(WalletSummary::default()),
        Some(row) => Ok(WalletSummary {
            posted_cents: row.try_get("posted_cents").context("wallet row shape")?,
            holds_cents: row.try_get("holds_cents").context("wallet row shape")?,
        }),
    }
}

async fn find_by_key(
    transaction: &mut PgTransaction,
    idempotency_key: &str,
) -> Result<Option<LedgerEntry>, AppError> {
    let entry = sqlx::query_as::<_, LedgerEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE idempotency_key = $1"
    ))
    .bind(idempotency_key)
    .fetch_optional(&mut **transaction)
    .await?;
    Ok(entry)
}

/// Append a ledger row and mutate the wallet totals, idempotently.
///
/// - the kind's sign rule is validated up front;
/// - an existing row under the same `idempotency_key` is returned unchanged,
///   with no wallet mutation (this is how retried captures/holds/releases
///   become no-ops);
/// - the insert uses `ON CONFLICT DO NOTHING`, so losing a key race inside
///   the same statement degrades to the same return-existing path instead of
///   aborting the surrounding transaction.
#[tracing::instrument(skip(transaction), fields(kind = kind.as_str(), amount_cents))]
pub async fn apply_ledger_entry(
    transaction: &mut PgTransaction,
    user_id: Uuid,
    kind: LedgerKind,
    amount_cents: i64,
    session_id: Option<Uuid>,
    registration_id: Option<Uuid>,
    idempotency_key: &str,
) -> Result<LedgerEntry, AppError> {
    kind.validate_amount(amount_cents)
        .map_err(AppError::Validation)?;

    if let Some(existing) = find_by_key(transaction, idempotency_key).await? {
        return Ok(existing);
    }

    ensure_and_lock_wallet(transaction, user_id).await?;

    let inserted = sqlx::query_as::<_, LedgerEntry>(&format!(
        r#"
        INSERT INTO ledger_entries
            (user_id, session_id, registration_id, idempotency_key, kind, amount_cents, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING {ENTRY_COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(session_id)
    .bind(registration_id)
    .bind(idempotency_key)
    .bind(kind.as_str())
    .bind(amount_cents)
    .bind(kind.entry_status().as_str())
    .fetch_optional(&mut **transaction)
    .await?;

    let entry = match inserted {
        // a concurrent writer with the same key won; return their row and do
        // NOT apply deltas a second time
        None => {
            return find_by_key(transaction, idempotency_key)
                .await?
                .context("ledger entry vanished after conflicting insert")
                .map_err(AppError::Unexpected)
        }
        Some(entry) => entry,
    };

    let delta = kind.wallet_delta(amount_cents);
    sqlx::query(
        r#"
        UPDATE wallets
        SET posted_cents = posted_cents + $2,
            holds_cents = holds_cents + $3,
            updated_at = now()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(delta.posted_cents)
    .bind(delta.holds_cents)
    .execute(&mut **transaction)
    .await?;

    Ok(entry)
}

/// Newest-first page of a user's ledger; pass the previous page's smallest id
/// as `before_id` to continue.
pub async fn list_ledger_for_user(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
    before_id: Option<i64>,
) -> Result<Vec<LedgerEntry>, AppError> {
    let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
        r#"
        SELECT {ENTRY_COLUMNS}
        FROM ledger_entries
        WHERE user_id = $1 AND ($2::bigint IS NULL OR id < $2)
        ORDER BY id DESC
        LIMIT $3
        "#
    ))
    .bind(user_id)
    .bind(before_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}
