use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub stock: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub product_id: Uuid,
    pub buyer_id: String,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payment transaction. The service only ever reads these; they are written
/// by the upstream payment processor (or the seeder, in tests).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub merchant_id: String,
    pub amount_cents: i64,
    pub fee_cents: i64,
    pub status: String,
    pub paid_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted settlement row, one per (merchant_id, date).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Settlement {
    pub merchant_id: String,
    pub date: NaiveDate,
    pub gross_cents: i64,
    pub fee_cents: i64,
    pub net_cents: i64,
    pub txn_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The aggregate shape produced by the settlement pipeline and fed to the
/// upsert. Totals are cumulative since job start, never increments, which is
/// what makes a retried flush idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementTotals {
    pub merchant_id: String,
    pub date: NaiveDate,
    pub gross_cents: i64,
    pub fee_cents: i64,
    pub net_cents: i64,
    pub txn_count: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: String,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub progress: i32,
    pub processed: i64,
    pub total: i64,
    pub result_path: String,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
