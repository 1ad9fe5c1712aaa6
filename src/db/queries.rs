use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Result, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::db::models::{Job, Order, Product, Settlement, SettlementTotals, Transaction};

// --- Product queries ---

pub async fn insert_product(pool: &PgPool, name: &str, stock: i32) -> Result<Product> {
    sqlx::query_as::<_, Product>(
        r#"
        INSERT INTO products (id, name, stock)
        VALUES ($1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(stock)
    .fetch_one(pool)
    .await
}

pub async fn get_product(pool: &PgPool, id: Uuid) -> Result<Product> {
    sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
}

pub async fn list_products(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Product>> {
    sqlx::query_as::<_, Product>(
        "SELECT * FROM products ORDER BY created_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

pub async fn update_product(pool: &PgPool, id: Uuid, name: &str, stock: i32) -> Result<Product> {
    sqlx::query_as::<_, Product>(
        r#"
        UPDATE products SET name = $2, stock = $3, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(stock)
    .fetch_one(pool)
    .await
}

pub async fn delete_product(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM products WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Conditionally decrement stock. The WHERE guard makes the check-and-update
/// a single atomic statement; callers must never read stock first and write
/// back. Returns true iff exactly one row was updated.
pub async fn decrement_stock(
    tx: &mut SqlxTransaction<'_, Postgres>,
    product_id: Uuid,
    qty: i32,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE products SET stock = stock - $2, updated_at = NOW()
        WHERE id = $1 AND stock >= $2
        "#,
    )
    .bind(product_id)
    .bind(qty)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

// --- Order queries ---

pub async fn insert_order(
    tx: &mut SqlxTransaction<'_, Postgres>,
    product_id: Uuid,
    buyer_id: &str,
    quantity: i32,
) -> Result<Order> {
    sqlx::query_as::<_, Order>(
        r#"
        INSERT INTO orders (id, product_id, buyer_id, quantity)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(product_id)
    .bind(buyer_id)
    .bind(quantity)
    .fetch_one(&mut **tx)
    .await
}

pub async fn get_order(pool: &PgPool, id: Uuid) -> Result<Order> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
}

pub async fn list_orders(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Order>> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders ORDER BY created_at DESC LIMIT $1 OFFSET $2")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
}

pub async fn delete_order(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM orders WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// --- Transaction queries ---

pub async fn count_transactions(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE paid_at >= $1 AND paid_at < $2")
        .bind(from)
        .bind(to)
        .fetch_one(pool)
        .await
}

/// Fetch one page of transactions in stable (paid_at, id) order. The cursor
/// is the last (paid_at, id) of the previous page; `None` starts from the
/// beginning of the range. Keyset pagination keeps page N stable even while
/// earlier pages are being consumed.
pub async fn fetch_transaction_page(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    cursor: Option<(DateTime<Utc>, Uuid)>,
    limit: i64,
) -> Result<Vec<Transaction>> {
    match cursor {
        Some((paid_at, id)) => {
            sqlx::query_as::<_, Transaction>(
                r#"
                SELECT * FROM transactions
                WHERE paid_at >= $1 AND paid_at < $2 AND (paid_at, id) > ($3, $4)
                ORDER BY paid_at ASC, id ASC
                LIMIT $5
                "#,
            )
            .bind(from)
            .bind(to)
            .bind(paid_at)
            .bind(id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Transaction>(
                r#"
                SELECT * FROM transactions
                WHERE paid_at >= $1 AND paid_at < $2
                ORDER BY paid_at ASC, id ASC
                LIMIT $3
                "#,
            )
            .bind(from)
            .bind(to)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}

// --- Settlement queries ---

/// Insert-or-update settlement rows against the unique (merchant_id, date)
/// key. Incoming totals are cumulative, so conflicting columns are replaced
/// outright. `run_id` is a trace tag only and is not persisted.
pub async fn upsert_settlements(
    pool: &PgPool,
    rows: &[SettlementTotals],
    run_id: &str,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut merchant_ids: Vec<String> = Vec::with_capacity(rows.len());
    let mut dates: Vec<NaiveDate> = Vec::with_capacity(rows.len());
    let mut gross: Vec<i64> = Vec::with_capacity(rows.len());
    let mut fees: Vec<i64> = Vec::with_capacity(rows.len());
    let mut nets: Vec<i64> = Vec::with_capacity(rows.len());
    let mut counts: Vec<i64> = Vec::with_capacity(rows.len());
    for row in rows {
        merchant_ids.push(row.merchant_id.clone());
        dates.push(row.date);
        gross.push(row.gross_cents);
        fees.push(row.fee_cents);
        nets.push(row.net_cents);
        counts.push(row.txn_count);
    }

    sqlx::query(
        r#"
        INSERT INTO settlements (merchant_id, date, gross_cents, fee_cents, net_cents, txn_count)
        SELECT * FROM UNNEST($1::text[], $2::date[], $3::bigint[], $4::bigint[], $5::bigint[], $6::bigint[])
        ON CONFLICT (merchant_id, date) DO UPDATE SET
            gross_cents = EXCLUDED.gross_cents,
            fee_cents = EXCLUDED.fee_cents,
            net_cents = EXCLUDED.net_cents,
            txn_count = EXCLUDED.txn_count,
            updated_at = NOW()
        "#,
    )
    .bind(&merchant_ids)
    .bind(&dates)
    .bind(&gross)
    .bind(&fees)
    .bind(&nets)
    .bind(&counts)
    .execute(pool)
    .await?;

    tracing::debug!(run_id, rows = rows.len(), "upserted settlement rows");
    Ok(())
}

pub async fn list_settlements(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Settlement>> {
    sqlx::query_as::<_, Settlement>(
        "SELECT * FROM settlements ORDER BY merchant_id ASC, date ASC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

// --- Job queries ---

pub async fn insert_job(
    pool: &PgPool,
    id: &str,
    status: &str,
    from_date: NaiveDate,
    to_date: NaiveDate,
    total: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, status, from_date, to_date, total)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(from_date)
    .bind(to_date)
    .bind(total)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_job(pool: &PgPool, id: &str) -> Result<Job> {
    sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
}

pub async fn set_job_status(pool: &PgPool, id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_job_progress(
    pool: &PgPool,
    id: &str,
    processed: i64,
    total: i64,
    progress: i32,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs SET processed = $2, total = $3, progress = $4, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(processed)
    .bind(total)
    .bind(progress)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move a RUNNING job to CANCELLING. The status guard keeps this write from
/// clobbering a terminal status the pipeline may have persisted concurrently.
pub async fn mark_job_cancelling(pool: &PgPool, id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs SET status = 'CANCELLING', updated_at = NOW()
        WHERE id = $1 AND status = 'RUNNING'
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_job_result_path(pool: &PgPool, id: &str, path: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET result_path = $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(path)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn request_job_cancel(pool: &PgPool, id: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET cancel_requested = TRUE, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn is_job_cancel_requested(pool: &PgPool, id: &str) -> Result<bool> {
    sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
}
