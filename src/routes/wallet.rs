use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::authentication::require_admin;
use crate::authentication::UserId;
use crate::domain::LedgerKind;
use crate::errors::AppError;
use crate::ledger;
use crate::ledger::apply_ledger_entry;

#[derive(Serialize)]
struct WalletOut {
    posted_cents: i64,
    holds_cents: i64,
    available_cents: i64,
}

/// `GET /wallet/me`
pub async fn my_wallet(
    pool: web::Data<PgPool>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    let summary = ledger::wallet_summary(pool.get_ref(), *user_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(WalletOut {
        posted_cents: summary.posted_cents,
        holds_cents: summary.holds_cents,
        available_cents: summary.available_cents(),
    }))
}

#[derive(Deserialize)]
pub struct LedgerQuery {
    limit: Option<i64>,
    before_id: Option<i64>,
}

#[derive(Serialize)]
struct LedgerOut {
    id: i64,
    kind: String,
    amount_cents: i64,
    status: String,
    session_id: Option<Uuid>,
    registration_id: Option<Uuid>,
    created_at: String,
}

/// `GET /wallet/me/ledger` — newest first; page with `before_id`.
pub async fn my_ledger(
    query: web::Query<LedgerQuery>,
    pool: web::Data<PgPool>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let entries = ledger::list_ledger_for_user(
        pool.get_ref(),
        *user_id.into_inner(),
        limit,
        query.before_id,
    )
    .await?;
    let out: Vec<LedgerOut> = entries
        .into_iter()
        .map(|e| LedgerOut {
            id: e.id,
            kind: e.kind,
            amount_cents: e.amount_cents,
            status: e.status,
            session_id: e.session_id,
            registration_id: e.registration_id,
            created_at: e.created_at.to_rfc3339(),
        })
        .collect();
    Ok(HttpResponse::Ok().json(out))
}

#[derive(Deserialize)]
pub struct DepositBody {
    user_id: Uuid,
    /// Non-zero; negative amounts are administrative corrections
    amount_cents: i64,
    idempotency_key: String,
}

/// `POST /admin/deposits` — post a `deposit_in` for a user. Deposit intake
/// itself (bank email parsing etc.) is an external collaborator; this is the
/// manual/admin path.
#[tracing::instrument(skip_all, fields(user_id = %**user_id))]
pub async fn admin_deposit(
    body: web::Json<DepositBody>,
    pool: web::Data<PgPool>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    require_admin(pool.get_ref(), *user_id.into_inner()).await?;

    let mut transaction = pool.get_ref().begin().await?;
    let entry = apply_ledger_entry(
        &mut transaction,
        body.user_id,
        LedgerKind::DepositIn,
        body.amount_cents,
        None,
        None,
        &body.idempotency_key,
    )
    .await?;
    transaction.commit().await?;

    Ok(HttpResponse::Created().json(serde_json::json!({
        "ledger_id": entry.id,
        "user_id": entry.user_id,
        "amount_cents": entry.amount_cents,
        "status": entry.status,
    })))
}
