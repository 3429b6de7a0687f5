//! Ledger store contract and backend factory

use async_trait::async_trait;
use provider_common::config::DatabaseConfig;
use provider_common::{Error, Result};
use std::sync::Arc;
use tracing::info;

use crate::file_store::FileStore;
use crate::models::{
    ApiStat, CreditOutcome, Earning, EarningsRange, Job, JobStatus, JobUpdate, NewEarning,
    QueueCode, UsedTransaction,
};
use crate::redis_store::RedisStore;
use crate::sqlite_store::SqliteStore;

/// Durable record keeping for queue codes, jobs, used transactions, earnings
/// and per-API statistics.
///
/// Operations that may or may not take effect return `Ok(bool)`: `true` when
/// the record was written, `false` when it was a duplicate or missing.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Insert a queue code. Returns `false` if the code already exists.
    async fn create_queue_code(&self, code: &QueueCode) -> Result<bool>;

    async fn get_queue_code(&self, code: &str) -> Result<Option<QueueCode>>;

    async fn delete_queue_code(&self, code: &str) -> Result<bool>;

    /// Count of unexpired codes waiting for `api_id`. Pure read.
    async fn get_queue_position(&self, api_id: &str) -> Result<u64>;

    /// Purge expired codes, returning how many were removed
    async fn cleanup_expired_queue_codes(&self) -> Result<u64>;

    /// Insert a job. Returns `false` without touching the stored record if the
    /// id is already taken.
    async fn create_job(&self, job: &Job) -> Result<bool>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Apply a partial update and refresh `updated_at`. Returns `false` and
    /// creates nothing when the job does not exist.
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<bool>;

    /// Newest first
    async fn list_jobs_by_api(&self, api_id: &str, limit: usize) -> Result<Vec<Job>>;

    /// Newest first
    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>>;

    async fn is_transaction_used(&self, signature: &str) -> Result<bool>;

    /// Atomically record a transaction signature as consumed.
    ///
    /// Returns `true` if this call inserted it, `false` if the signature was
    /// already present. Concurrent callers racing on the same signature see
    /// exactly one `true`.
    async fn mark_transaction_used(&self, signature: &str, job_id: &str, amount: u64)
        -> Result<bool>;

    async fn get_used_transaction(&self, signature: &str) -> Result<Option<UsedTransaction>>;

    /// Claim `signature` for `earning.job_id`, append the earning and, when
    /// `job` is given, create it. All of it is written or none of it is.
    async fn credit_transaction(
        &self,
        signature: &str,
        earning: NewEarning,
        job: Option<&Job>,
    ) -> Result<CreditOutcome>;

    /// Append an earning, stamping `earned_at`
    async fn record_earning(&self, earning: NewEarning) -> Result<Earning>;

    /// Earnings in the range, oldest first
    async fn get_earnings(&self, range: EarningsRange) -> Result<Vec<Earning>>;

    /// Sum of every recorded earning
    async fn get_total_earnings(&self) -> Result<u64>;

    /// Count one call for `api_id`, creating its stat record on first use
    async fn record_api_call(&self, api_id: &str, success: bool, earned: u64) -> Result<ApiStat>;

    async fn get_api_stat(&self, api_id: &str) -> Result<Option<ApiStat>>;

    async fn get_all_api_stats(&self) -> Result<Vec<ApiStat>>;
}

/// Open the backend selected by `database.type`
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn LedgerStore>> {
    let store: Arc<dyn LedgerStore> = match config.kind.to_lowercase().as_str() {
        "json" | "file" => Arc::new(FileStore::open(&config.path).await?),
        "sqlite" => Arc::new(SqliteStore::open(&config.path).await?),
        "redis" => {
            let url = config.url.as_deref().ok_or_else(|| {
                Error::Config("provider.database.url is required for redis".to_string())
            })?;
            Arc::new(RedisStore::new(url).await?)
        }
        other => {
            return Err(Error::Config(format!("unknown database type: {}", other)));
        }
    };

    info!("Ledger store opened (backend: {})", store.backend());
    Ok(store)
}
