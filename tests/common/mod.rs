use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tempfile::TempDir;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ordersettle::config::Config;
use ordersettle::db::models::Transaction;
use ordersettle::db::queries;
use ordersettle::error::JobError;
use ordersettle::services::orders::OrderService;
use ordersettle::services::settlement::{JobManager, PgTransactionSource, TransactionSource};
use ordersettle::{create_app, AppState};

pub struct TestApp {
    pub base_url: String,
    pub pool: PgPool,
    pub artifact_dir: PathBuf,
    _artifacts: TempDir,
    _container: ContainerAsync<Postgres>,
}

#[derive(Clone, Copy)]
pub struct PipelineOptions {
    pub workers: usize,
    pub batch_size: usize,
    /// Delay injected between producer batches, to hold jobs open long
    /// enough for deterministic cancellation.
    pub throttle: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 1000,
            throttle: None,
        }
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(PipelineOptions::default()).await
}

pub async fn spawn_app_with(options: PipelineOptions) -> TestApp {
    let container = Postgres::default().start().await.unwrap();
    let host_port = container.get_host_port_ipv4(5432).await.unwrap();

    let config = Config {
        server_port: 0,
        db_host: "127.0.0.1".to_string(),
        db_user: "postgres".to_string(),
        db_pass: "postgres".to_string(),
        db_name: "postgres".to_string(),
        db_port: host_port,
        db_sslmode: "disable".to_string(),
        workers: options.workers,
        batch_size: options.batch_size,
        artifact_dir: PathBuf::new(),
    };

    let pool = PgPool::connect(&config.database_url()).await.unwrap();
    let migrator = sqlx::migrate::Migrator::new(Path::join(
        Path::new(env!("CARGO_MANIFEST_DIR")),
        "migrations",
    ))
    .await
    .unwrap();
    migrator.run(&pool).await.unwrap();

    let artifacts = TempDir::new().unwrap();
    let config = Config {
        artifact_dir: artifacts.path().to_path_buf(),
        ..config
    };

    let source: Arc<dyn TransactionSource> = match options.throttle {
        Some(delay) => Arc::new(ThrottledPgSource {
            pool: pool.clone(),
            delay,
        }),
        None => Arc::new(PgTransactionSource::new(pool.clone())),
    };

    let state = AppState {
        db: pool.clone(),
        orders: OrderService::new(pool.clone()),
        jobs: Arc::new(JobManager::new(pool.clone(), source, &config)),
    };
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        pool,
        artifact_dir: artifacts.path().to_path_buf(),
        _artifacts: artifacts,
        _container: container,
    }
}

/// Streams with a per-batch delay so cancellation windows are deterministic
/// in tests, the same pagination and ordering as the production source.
struct ThrottledPgSource {
    pool: PgPool,
    delay: Duration,
}

#[async_trait]
impl TransactionSource for ThrottledPgSource {
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
        let mut cursor = None;
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

            tokio::time::sleep(self.delay).await;

            let len = batch.len();
            cursor = batch.last().map(|tx| (tx.paid_at, tx.id));
            tokio::select! {
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                sent = out.send(batch) => {
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

/// Poll GET /jobs/:id until the job reaches `want` or the deadline passes.
/// Returns the last response body.
pub async fn wait_for_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    want: &str,
    timeout: Duration,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last = serde_json::Value::Null;
    while tokio::time::Instant::now() < deadline {
        let res = client
            .get(format!("{base_url}/jobs/{job_id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::OK);
        last = res.json().await.unwrap();
        if last["status"] == want {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} did not reach {want} in time, last: {last}");
}
