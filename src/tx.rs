use sqlx::PgPool;
use sqlx::Postgres;
use sqlx::Transaction;

pub type PgTransaction = Transaction<'static, Postgres>;

/// Begin a transaction whose first statement raises the isolation level to
/// SERIALIZABLE. Every allocation, promotion, cancellation and lifecycle
/// mutation runs inside one of these; partial writes never survive an error.
///
/// Callers must be prepared for SQLSTATE 40001 on commit and retry from the
/// top (see `errors::is_serialization_failure`).
pub async fn begin_serializable(pool: &PgPool) -> Result<PgTransaction, sqlx::Error> {
    let mut transaction = pool.begin().await?;
    // must be the first statement of the transaction
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *transaction)
        .await?;
    Ok(transaction)
}
