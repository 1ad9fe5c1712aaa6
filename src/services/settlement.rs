use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::db::models::{SettlementTotals, Transaction};
use crate::db::queries;
use crate::error::{AppError, JobError};

pub const STATUS_QUEUED: &str = "QUEUED";
pub const STATUS_RUNNING: &str = "RUNNING";
pub const STATUS_CANCELLING: &str = "CANCELLING";
pub const STATUS_CANCELLED: &str = "CANCELLED";
pub const STATUS_COMPLETED: &str = "COMPLETED";
pub const STATUS_FAILED: &str = "FAILED";

pub const TERMINAL_STATUSES: [&str; 3] = [STATUS_COMPLETED, STATUS_CANCELLED, STATUS_FAILED];

/// Collector upsert + CSV cadence, in batches.
const FLUSH_EVERY_BATCHES: usize = 50;
const FALLBACK_BATCH_SIZE: usize = 1000;

const CSV_HEADER: [&str; 6] = [
    "merchant_id",
    "date",
    "gross_cents",
    "fee_cents",
    "net_cents",
    "txn_count",
];

/// Source of transactions for the settlement pipeline. The production
/// implementation reads Postgres; tests substitute a throttled source to
/// open deterministic cancellation windows.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Number of transactions with paid_at in [from, to).
    async fn count(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> sqlx::Result<i64>;

    /// Emit every transaction with paid_at in [from, to) exactly once, in
    /// batches of at most `batch_size`, in stable (paid_at ASC, id ASC)
    /// order. A short batch terminates the stream. The cancel token must be
    /// observed before each fetch and each send.
    async fn stream_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        batch_size: usize,
        out: mpsc::Sender<Vec<Transaction>>,
        cancel: CancellationToken,
    ) -> Result<(), JobError>;
}

pub struct PgTransactionSource {
    pool: PgPool,
}

impl PgTransactionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionSource for PgTransactionSource {
    async fn count(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> sqlx::Result<i64> {
        queries::count_transactions(&self.pool, from, to).await
    }

    async fn stream_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        batch_size: usize,
        out: mpsc::Sender<Vec<Transaction>>,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        let batch_size = if batch_size == 0 {
            FALLBACK_BATCH_SIZE
        } else {
            batch_size
        };
        let mut cursor: Option<(DateTime<Utc>, Uuid)> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let batch =
                queries::fetch_transaction_page(&self.pool, from, to, cursor, batch_size as i64)
                    .await?;
            if batch.is_empty() {
                return Ok(());
            }

            let len = batch.len();
            cursor = batch.last().map(|tx| (tx.paid_at, tx.id));

            tokio::select! {
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                sent = out.send(batch) => {
                    // A closed channel means the collector is gone; stop quietly.
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }

            if len < batch_size {
                return Ok(());
            }
        }
    }
}

/// Worker output: one folded batch plus how many transactions contributed,
/// so the collector can track progress accurately.
struct Partial {
    agg: HashMap<String, SettlementTotals>,
    count: usize,
}

/// Coordinates settlement jobs: lifecycle persistence, the in-memory
/// cancellation registry, and the producer/worker/collector pipeline that
/// each job runs in a detached task.
pub struct JobManager {
    pool: PgPool,
    source: Arc<dyn TransactionSource>,
    workers: usize,
    batch_size: usize,
    artifact_dir: PathBuf,
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl JobManager {
    pub fn new(pool: PgPool, source: Arc<dyn TransactionSource>, config: &Config) -> Self {
        Self {
            pool,
            source,
            workers: config.workers.max(1),
            batch_size: config.batch_size.max(1),
            artifact_dir: config.artifact_dir.clone(),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn artifact_path(&self, job_id: &str) -> PathBuf {
        self.artifact_dir.join(format!("{job_id}.csv"))
    }

    /// Persist a QUEUED job and launch its pipeline in the background,
    /// decoupled from the caller. Returns the job id immediately.
    pub async fn start_settlement_job(
        self: Arc<Self>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<String, AppError> {
        let from_ts = day_start_utc(from);
        let to_ts = day_start_utc(to);

        let total = self.source.count(from_ts, to_ts).await?;

        let job_id = Uuid::new_v4().to_string();
        queries::insert_job(&self.pool, &job_id, STATUS_QUEUED, from, to, total).await?;

        tracing::info!(%job_id, %from, %to, total, "settlement job queued");

        let manager = Arc::clone(&self);
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            manager.run_settlement_job(spawned_id, from_ts, to_ts).await;
        });

        Ok(job_id)
    }

    /// Trigger the in-memory cancel handle for a job, if its pipeline is
    /// currently running in this process. Returns whether a handle was found.
    pub fn cancel(&self, job_id: &str) -> bool {
        let cancels = self.cancels.lock().expect("cancel registry poisoned");
        match cancels.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_settlement_job(self: Arc<Self>, job_id: String, from: DateTime<Utc>, to: DateTime<Utc>) {
        // A cancel can land while the job is still QUEUED, before the handle
        // exists; the persisted flag covers that window.
        match queries::is_job_cancel_requested(&self.pool, &job_id).await {
            Ok(true) => {
                self.best_effort(
                    queries::set_job_status(&self.pool, &job_id, STATUS_CANCELLED).await,
                    &job_id,
                );
                return;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(%job_id, error = %err, "cancel flag check failed, continuing");
            }
        }

        if let Err(err) = queries::set_job_status(&self.pool, &job_id, STATUS_RUNNING).await {
            tracing::error!(%job_id, error = %err, "failed to mark job RUNNING");
        }

        let cancel = CancellationToken::new();
        self.cancels
            .lock()
            .expect("cancel registry poisoned")
            .insert(job_id.clone(), cancel.clone());

        let out_path = self.artifact_path(&job_id);
        let result = self
            .execute_pipeline(&job_id, from, to, &out_path, cancel.clone())
            .await;

        // Release anything still parked on a channel, then drop the handle.
        cancel.cancel();
        self.cancels
            .lock()
            .expect("cancel registry poisoned")
            .remove(&job_id);

        // Terminal writes run after the cancel signal has been observed and
        // are never short-circuited by it.
        let path = out_path.to_string_lossy();
        match result {
            Ok(total) => {
                self.best_effort(queries::update_job_progress(&self.pool, &job_id, total, total, 100).await, &job_id);
                self.best_effort(queries::set_job_result_path(&self.pool, &job_id, &path).await, &job_id);
                self.best_effort(queries::set_job_status(&self.pool, &job_id, STATUS_COMPLETED).await, &job_id);
                tracing::info!(%job_id, total, "settlement job completed");
            }
            Err(JobError::Cancelled) => {
                self.best_effort(queries::set_job_status(&self.pool, &job_id, STATUS_CANCELLED).await, &job_id);
                self.best_effort(queries::set_job_result_path(&self.pool, &job_id, &path).await, &job_id);
                tracing::info!(%job_id, "settlement job cancelled");
            }
            Err(err) => {
                tracing::error!(%job_id, error = %err, "settlement job failed");
                self.best_effort(queries::set_job_status(&self.pool, &job_id, STATUS_FAILED).await, &job_id);
                // Keep the would-be artifact path around for inspection.
                self.best_effort(queries::set_job_result_path(&self.pool, &job_id, &path).await, &job_id);
            }
        }
    }

    fn best_effort(&self, result: sqlx::Result<()>, job_id: &str) {
        if let Err(err) = result {
            tracing::warn!(%job_id, error = %err, "terminal job update failed");
        }
    }

    /// Run the producer/worker/collector pipeline for one job. Returns the
    /// job total on success; any error (including observed cancellation)
    /// unwinds the whole run.
    async fn execute_pipeline(
        &self,
        job_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        out_path: &Path,
        cancel: CancellationToken,
    ) -> Result<i64, JobError> {
        tokio::fs::create_dir_all(&self.artifact_dir).await?;

        let mut writer = csv::Writer::from_path(out_path)?;
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;

        // Total was computed at submission; re-read it with the job row.
        let job = queries::get_job(&self.pool, job_id).await?;
        let total = job.total;

        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Transaction>>(self.workers * 2);
        let (result_tx, mut result_rx) = mpsc::channel::<Partial>(self.workers * 2);
        let (producer_err_tx, mut producer_err_rx) = mpsc::channel::<JobError>(1);

        let source = Arc::clone(&self.source);
        let producer_cancel = cancel.clone();
        let batch_size = self.batch_size;
        tokio::spawn(async move {
            let result = source
                .stream_by_date_range(from, to, batch_size, batch_tx.clone(), producer_cancel)
                .await;
            if let Err(err) = result {
                // Cancellation is surfaced by the collector's own select.
                if !err.is_cancelled() {
                    let _ = producer_err_tx.try_send(err);
                }
            }
            // The error is recorded before the batch channel closes, so the
            // collector cannot drain past it.
            drop(batch_tx);
        });

        // Workers pull from a shared receiver; the mutex is only held while
        // waiting for the next batch, folding happens outside it.
        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
        for _ in 0..self.workers {
            let rx = Arc::clone(&batch_rx);
            let tx = result_tx.clone();
            let worker_cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let batch = tokio::select! {
                        _ = worker_cancel.cancelled() => return,
                        received = async { rx.lock().await.recv().await } => match received {
                            Some(batch) => batch,
                            None => return,
                        },
                    };

                    let count = batch.len();
                    let agg = fold_batch(&batch);

                    tokio::select! {
                        _ = worker_cancel.cancelled() => return,
                        sent = tx.send(Partial { agg, count }) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
        // Once every worker has exited, the result channel closes.
        drop(result_tx);

        let mut collector = Collector {
            pool: &self.pool,
            job_id,
            total,
            writer,
            global: HashMap::new(),
            changed: HashSet::new(),
            processed: 0,
            batches_since_flush: 0,
        };

        loop {
            if let Ok(err) = producer_err_rx.try_recv() {
                return Err(err);
            }

            let partial = tokio::select! {
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                partial = result_rx.recv() => partial,
            };

            let Some(partial) = partial else {
                // Drained. A producer error may have raced the channel close.
                if let Ok(err) = producer_err_rx.try_recv() {
                    return Err(err);
                }
                collector.flush(true).await?;
                return Ok(total);
            };

            collector.merge(partial);
            if collector.batches_since_flush >= FLUSH_EVERY_BATCHES {
                collector.flush(false).await?;
            }
        }
    }
}

/// Single-threaded owner of the global aggregate and the artifact writer.
struct Collector<'a> {
    pool: &'a PgPool,
    job_id: &'a str,
    total: i64,
    writer: csv::Writer<std::fs::File>,
    global: HashMap<String, SettlementTotals>,
    changed: HashSet<String>,
    processed: i64,
    batches_since_flush: usize,
}

impl Collector<'_> {
    fn merge(&mut self, partial: Partial) {
        for (key, cell) in partial.agg {
            self.global
                .entry(key.clone())
                .and_modify(|existing| {
                    existing.gross_cents += cell.gross_cents;
                    existing.fee_cents += cell.fee_cents;
                    existing.net_cents += cell.net_cents;
                    existing.txn_count += cell.txn_count;
                })
                .or_insert(cell);
            self.changed.insert(key);
        }
        self.processed += partial.count as i64;
        self.batches_since_flush += 1;
    }

    /// Write every changed key (cumulative totals) to the settlement store
    /// and the CSV, then record progress. Rows carry totals since job start,
    /// so replaying a flush lands on the same final state.
    async fn flush(&mut self, force: bool) -> Result<(), JobError> {
        if self.changed.is_empty() && !force {
            return Ok(());
        }

        let rows: Vec<SettlementTotals> = self
            .changed
            .iter()
            .filter_map(|key| self.global.get(key).cloned())
            .collect();

        if !rows.is_empty() {
            queries::upsert_settlements(self.pool, &rows, self.job_id).await?;

            for row in &rows {
                self.writer.write_record([
                    row.merchant_id.clone(),
                    row.date.format("%Y-%m-%d").to_string(),
                    row.gross_cents.to_string(),
                    row.fee_cents.to_string(),
                    row.net_cents.to_string(),
                    row.txn_count.to_string(),
                ])?;
            }
            self.writer.flush()?;
        }

        let progress = progress_for(self.processed, self.total);
        queries::update_job_progress(self.pool, self.job_id, self.processed, self.total, progress)
            .await?;

        self.changed.clear();
        self.batches_since_flush = 0;
        Ok(())
    }
}

/// Fold one batch into a per-batch aggregate keyed merchant_id|YYYY-MM-DD,
/// with the day taken at UTC midnight.
fn fold_batch(batch: &[Transaction]) -> HashMap<String, SettlementTotals> {
    let mut agg: HashMap<String, SettlementTotals> = HashMap::new();
    for tx in batch {
        let day = tx.paid_at.date_naive();
        let cell = agg
            .entry(day_key(&tx.merchant_id, day))
            .or_insert_with(|| SettlementTotals {
                merchant_id: tx.merchant_id.clone(),
                date: day,
                ..Default::default()
            });
        cell.gross_cents += tx.amount_cents;
        cell.fee_cents += tx.fee_cents;
        cell.net_cents += tx.amount_cents - tx.fee_cents;
        cell.txn_count += 1;
    }
    agg
}

fn day_key(merchant_id: &str, day: NaiveDate) -> String {
    format!("{merchant_id}|{}", day.format("%Y-%m-%d"))
}

fn progress_for(processed: i64, total: i64) -> i32 {
    if total > 0 {
        ((processed * 100) / total).clamp(0, 100) as i32
    } else {
        100
    }
}

pub fn day_start_utc(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tx(merchant: &str, paid_at: DateTime<Utc>, amount: i64, fee: i64) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: Uuid::new_v4(),
            merchant_id: merchant.to_string(),
            amount_cents: amount,
            fee_cents: fee,
            status: "paid".to_string(),
            paid_at,
            created_at: now,
            updated_at: now,
        }
    }

    fn at(date: &str, hms: (u32, u32, u32)) -> DateTime<Utc> {
        let d: NaiveDate = date.parse().unwrap();
        Utc.from_utc_datetime(&d.and_hms_opt(hms.0, hms.1, hms.2).unwrap())
    }

    #[test]
    fn test_fold_batch_aggregates_per_merchant_day() {
        let batch = vec![
            tx("m1", at("2024-01-01", (10, 0, 0)), 1000, 30),
            tx("m1", at("2024-01-01", (11, 0, 0)), 500, 15),
            tx("m2", at("2024-01-01", (12, 0, 0)), 200, 10),
        ];

        let agg = fold_batch(&batch);
        assert_eq!(agg.len(), 2);

        let m1 = &agg["m1|2024-01-01"];
        assert_eq!(m1.gross_cents, 1500);
        assert_eq!(m1.fee_cents, 45);
        assert_eq!(m1.net_cents, 1455);
        assert_eq!(m1.txn_count, 2);

        let m2 = &agg["m2|2024-01-01"];
        assert_eq!(m2.gross_cents, 200);
        assert_eq!(m2.fee_cents, 10);
        assert_eq!(m2.net_cents, 190);
        assert_eq!(m2.txn_count, 1);
    }

    #[test]
    fn test_fold_batch_splits_on_utc_day_boundary() {
        let batch = vec![
            tx("m1", at("2024-01-01", (23, 59, 59)), 100, 3),
            tx("m1", at("2024-01-02", (0, 0, 0)), 100, 3),
        ];

        let agg = fold_batch(&batch);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg["m1|2024-01-01"].txn_count, 1);
        assert_eq!(agg["m1|2024-01-02"].txn_count, 1);
    }

    #[test]
    fn test_fold_batch_empty() {
        assert!(fold_batch(&[]).is_empty());
    }

    #[test]
    fn test_merge_accumulates_and_marks_changed() {
        // Collector::merge without the database parts.
        let mut global: HashMap<String, SettlementTotals> = HashMap::new();
        let mut changed: HashSet<String> = HashSet::new();

        for _ in 0..2 {
            let partial = fold_batch(&[tx("m1", at("2024-01-01", (9, 0, 0)), 1000, 30)]);
            for (key, cell) in partial {
                global
                    .entry(key.clone())
                    .and_modify(|existing| {
                        existing.gross_cents += cell.gross_cents;
                        existing.fee_cents += cell.fee_cents;
                        existing.net_cents += cell.net_cents;
                        existing.txn_count += cell.txn_count;
                    })
                    .or_insert(cell);
                changed.insert(key);
            }
        }

        let cell = &global["m1|2024-01-01"];
        assert_eq!(cell.gross_cents, 2000);
        assert_eq!(cell.txn_count, 2);
        assert!(changed.contains("m1|2024-01-01"));
    }

    #[test]
    fn test_progress_clamps() {
        assert_eq!(progress_for(0, 100), 0);
        assert_eq!(progress_for(50, 100), 50);
        assert_eq!(progress_for(100, 100), 100);
        assert_eq!(progress_for(150, 100), 100);
        assert_eq!(progress_for(1, 3), 33);
    }

    #[test]
    fn test_progress_empty_total_is_complete() {
        assert_eq!(progress_for(0, 0), 100);
    }

    #[test]
    fn test_day_start_utc_is_midnight() {
        let day: NaiveDate = "2024-01-01".parse().unwrap();
        assert_eq!(day_start_utc(day), at("2024-01-01", (0, 0, 0)));
    }
}
