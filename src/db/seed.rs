use chrono::{DateTime, Duration, Utc};
use rand::{Rng, SeedableRng};
use sqlx::PgPool;
use uuid::Uuid;

/// Bulk-seed the transactions table: `rows` transactions spread over
/// `merchants` merchant ids and the last `days` days, inserted in chunks of
/// `chunk`. Fees follow the usual 2.9% + 30 card schedule so seeded data
/// aggregates to plausible settlement figures.
pub async fn seed_transactions(
    pool: &PgPool,
    rows: usize,
    merchants: usize,
    days: i64,
    chunk: usize,
) -> Result<u64, sqlx::Error> {
    if rows == 0 || merchants == 0 || days <= 0 || chunk == 0 {
        return Ok(0);
    }

    let merchant_ids: Vec<String> = (1..=merchants).map(|i| format!("merchant-{i}")).collect();
    let end = Utc::now();
    let start = end - Duration::days(days);
    let window_secs = (end - start).num_seconds().max(1);

    let mut rng = rand::rngs::StdRng::from_entropy();
    let mut inserted: u64 = 0;

    tracing::info!(rows, merchants, days, chunk, "seeding transactions");

    while (inserted as usize) < rows {
        let remaining = rows - inserted as usize;
        let cur = remaining.min(chunk);

        let mut ids: Vec<Uuid> = Vec::with_capacity(cur);
        let mut mids: Vec<String> = Vec::with_capacity(cur);
        let mut amounts: Vec<i64> = Vec::with_capacity(cur);
        let mut fees: Vec<i64> = Vec::with_capacity(cur);
        let mut paid_ats: Vec<DateTime<Utc>> = Vec::with_capacity(cur);

        for _ in 0..cur {
            let amount: i64 = 100 + rng.gen_range(0..200_000);
            let fee = (amount as f64 * 0.029).round() as i64 + 30;
            let paid_at = start + Duration::seconds(rng.gen_range(0..window_secs));
            ids.push(Uuid::new_v4());
            mids.push(merchant_ids[rng.gen_range(0..merchant_ids.len())].clone());
            amounts.push(amount);
            fees.push(fee);
            paid_ats.push(paid_at);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO transactions (id, merchant_id, amount_cents, fee_cents, status, paid_at)
            SELECT t.id, t.merchant_id, t.amount_cents, t.fee_cents, 'paid', t.paid_at
            FROM UNNEST($1::uuid[], $2::text[], $3::bigint[], $4::bigint[], $5::timestamptz[])
                AS t(id, merchant_id, amount_cents, fee_cents, paid_at)
            "#,
        )
        .bind(&ids)
        .bind(&mids)
        .bind(&amounts)
        .bind(&fees)
        .bind(&paid_ats)
        .execute(pool)
        .await?;

        inserted += result.rows_affected();
    }

    tracing::info!(inserted, "transaction seeding complete");
    Ok(inserted)
}
