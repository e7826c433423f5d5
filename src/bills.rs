use std::collections::HashMap;

use axum::extract::Path;
use axum::{Extension, Json};
use chrono::NaiveDate;
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::err::Page;
use crate::models::{BillData, BillStatus, ExpenseData, ExpenseType, Role};
use crate::users::Deleted;
use crate::{breaks, proceeds, Error, Payload};

#[derive(Debug, Clone, sqlx::FromRow)]
struct BillRow {
    #[sqlx(flatten)]
    bill: BillData,
    trainer_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillView {
    #[serde(flatten)]
    pub bill: BillData,
    pub trainer_name: String,
    pub expenses: Vec<ExpenseData>,
    pub total_cents: i64,
}

const BILL_SELECT: &str = "SELECT b.*, TRIM(u.first_name || ' ' || u.last_name) AS trainer_name \
     FROM bills b JOIN users u ON u.id = b.trainer_id";

/// `INV-` followed by eight upper-case hex digits.
pub fn generate_invoice_number() -> String {
    let mut bytes = [0u8; 4];
    thread_rng().fill_bytes(&mut bytes);
    format!("INV-{}", hex::encode_upper(bytes))
}

async fn views(pg: &PgPool, rows: Vec<BillRow>) -> Result<Vec<BillView>, Error> {
    let ids: Vec<Uuid> = rows.iter().map(|row| row.bill.id).collect();
    let mut expenses: HashMap<Uuid, Vec<ExpenseData>> = HashMap::new();
    for expense in sqlx::query_as::<_, ExpenseData>(
        "SELECT * FROM expenses WHERE bill_id = ANY($1) ORDER BY type, description",
    )
    .bind(&ids)
    .fetch_all(pg)
    .await?
    {
        expenses.entry(expense.bill_id).or_default().push(expense);
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let expenses = expenses.remove(&row.bill.id).unwrap_or_default();
            BillView {
                total_cents: expenses.iter().map(|e| e.amount_cents).sum(),
                bill: row.bill,
                trainer_name: row.trainer_name,
                expenses,
            }
        })
        .collect())
}

async fn fetch_view(pg: &PgPool, caller: &AuthUser, id: Uuid) -> Result<BillView, Error> {
    let row = sqlx::query_as::<_, BillRow>(&format!("{} WHERE b.id = $1", BILL_SELECT))
        .bind(id)
        .fetch_optional(pg)
        .await?
        .filter(|row| caller.is_admin() || row.bill.trainer_id == caller.id)
        .ok_or_else(|| Error::not_found(format!("Bill `{}` does not exist", id)))?;
    views(pg, vec![row])
        .await?
        .pop()
        .ok_or_else(|| Error::unknown("bill view went missing"))
}

pub async fn list_bills(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Page<BillView>> {
    caller.require(&[Role::Admin, Role::Trainer])?;
    let trainer = (caller.role == Role::Trainer).then(|| caller.id);
    let rows = sqlx::query_as::<_, BillRow>(&format!(
        "{} WHERE $1::uuid IS NULL OR b.trainer_id = $1 ORDER BY b.date DESC",
        BILL_SELECT
    ))
    .bind(trainer)
    .fetch_all(&pg)
    .await?;
    proceeds(views(&pg, rows).await?.into())
}

pub async fn get_bill(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<BillView> {
    caller.require(&[Role::Admin, Role::Trainer])?;
    proceeds(fetch_view(&pg, &caller, id).await?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewExpense {
    #[serde(rename = "type")]
    pub kind: ExpenseType,
    #[serde(default)]
    pub description: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBill {
    pub trainer: Option<Uuid>,
    pub date: NaiveDate,
    pub status: Option<BillStatus>,
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub expenses: Vec<NewExpense>,
}

pub fn validate_expenses(expenses: &[NewExpense]) -> Result<(), Error> {
    match expenses.iter().position(|e| e.amount_cents < 0) {
        Some(idx) => Err(Error::field(
            format!("expenses[{}].amount_cents", idx),
            "Ensure this value is greater than or equal to 0.",
        )),
        None => Ok(()),
    }
}

/// Trainers file bills for themselves; admins name the trainer.
pub async fn create_bill(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<CreateBill>,
) -> Payload<BillView> {
    caller.require(&[Role::Admin, Role::Trainer])?;
    let trainer = match (caller.role, body.trainer) {
        (Role::Admin, Some(trainer)) => trainer,
        (Role::Admin, None) => return breaks(Error::field("trainer", "This field is required.")),
        _ => caller.id,
    };
    validate_expenses(&body.expenses)?;
    let invoice_number = body
        .invoice_number
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_invoice_number);

    let id = Uuid::new_v4();
    let mut tx = pg.begin().await?;
    sqlx::query(
        "INSERT INTO bills (id, trainer_id, date, status, invoice_number) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(trainer)
    .bind(body.date)
    .bind(body.status.unwrap_or(BillStatus::Pending))
    .bind(&invoice_number)
    .execute(&mut tx)
    .await?;
    for expense in &body.expenses {
        sqlx::query(
            "INSERT INTO expenses (id, bill_id, type, description, amount_cents) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(expense.kind)
        .bind(&expense.description)
        .bind(expense.amount_cents)
        .execute(&mut tx)
        .await?;
    }
    tx.commit().await?;

    log::info!("bill {} filed for trainer {}", invoice_number, trainer);
    proceeds(fetch_view(&pg, &caller, id).await?)
}

pub async fn delete_bill(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<Deleted> {
    caller.require_admin()?;
    let res = sqlx::query("DELETE FROM bills WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!("Bill `{}` does not exist", id)));
    }
    proceeds(Deleted { id })
}

pub async fn mark_as_paid(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<BillView> {
    caller.require_admin()?;
    let res = sqlx::query("UPDATE bills SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(BillStatus::Paid)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!("Bill `{}` does not exist", id)));
    }
    proceeds(fetch_view(&pg, &caller, id).await?)
}
