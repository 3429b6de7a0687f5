//! JSON file ledger for local and development use
//!
//! The whole dataset lives in memory and the file is rewritten wholesale on
//! every mutation (written to a sibling temp file, then renamed over the
//! original). Writes are serialised inside this process only.
//!
//! There is no cross-process locking: two processes pointing at the same file
//! will overwrite each other's changes. Production deployments must use the
//! SQLite or Redis backend, or funnel every writer through one process.

use async_trait::async_trait;
use chrono::Utc;
use provider_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{
    ApiStat, CreditOutcome, Earning, EarningsRange, Job, JobStatus, JobUpdate, NewEarning,
    QueueCode, UsedTransaction,
};
use crate::store::LedgerStore;

/// On-disk document layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerData {
    #[serde(default)]
    pub queue_codes: Vec<QueueCode>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub used_transactions: Vec<UsedTransaction>,
    #[serde(default)]
    pub earnings: Vec<Earning>,
    #[serde(default)]
    pub api_stats: Vec<ApiStat>,
}

/// Single-writer JSON file backend
pub struct FileStore {
    path: PathBuf,
    data: Mutex<LedgerData>,
}

impl FileStore {
    /// Load the ledger file, creating an empty one if it does not exist
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => LedgerData::default(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                Error::Storage(format!("corrupt ledger file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating new ledger file at {}", path.display());
                let data = LedgerData::default();
                write_document(&path, &data).await?;
                data
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Loaded ledger file {} ({} jobs, {} used transactions)",
            path.display(),
            data.jobs.len(),
            data.used_transactions.len()
        );

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T>(&self, f: impl FnOnce(&LedgerData) -> T) -> T {
        let data = self.data.lock().await;
        f(&data)
    }

    /// Run a mutation against a copy of the dataset.
    ///
    /// The closure returns its output plus whether anything changed; only
    /// changed copies are persisted and swapped in, so a failed write leaves
    /// memory and disk in agreement.
    async fn mutate<T>(&self, f: impl FnOnce(&mut LedgerData) -> (T, bool)) -> Result<T> {
        let mut guard = self.data.lock().await;
        let mut next = guard.clone();

        let (out, changed) = f(&mut next);
        if changed {
            write_document(&self.path, &next).await?;
            *guard = next;
        }

        Ok(out)
    }
}

async fn write_document(path: &Path, data: &LedgerData) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let json = serde_json::to_vec_pretty(data)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;

    debug!("Wrote ledger file {} ({} bytes)", path.display(), json.len());
    Ok(())
}

fn newest_first(mut jobs: Vec<Job>, limit: usize) -> Vec<Job> {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    jobs.truncate(limit);
    jobs
}

#[async_trait]
impl LedgerStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn create_queue_code(&self, code: &QueueCode) -> Result<bool> {
        self.mutate(|data| {
            if data.queue_codes.iter().any(|c| c.code == code.code) {
                return (false, false);
            }
            data.queue_codes.push(code.clone());
            (true, true)
        })
        .await
    }

    async fn get_queue_code(&self, code: &str) -> Result<Option<QueueCode>> {
        Ok(self
            .read(|data| data.queue_codes.iter().find(|c| c.code == code).cloned())
            .await)
    }

    async fn delete_queue_code(&self, code: &str) -> Result<bool> {
        self.mutate(|data| {
            let before = data.queue_codes.len();
            data.queue_codes.retain(|c| c.code != code);
            let removed = data.queue_codes.len() != before;
            (removed, removed)
        })
        .await
    }

    async fn get_queue_position(&self, api_id: &str) -> Result<u64> {
        let now = Utc::now();
        Ok(self
            .read(|data| {
                data.queue_codes
                    .iter()
                    .filter(|c| c.api_id == api_id && !c.is_expired_at(now))
                    .count() as u64
            })
            .await)
    }

    async fn cleanup_expired_queue_codes(&self) -> Result<u64> {
        let now = Utc::now();
        self.mutate(|data| {
            let before = data.queue_codes.len();
            data.queue_codes.retain(|c| !c.is_expired_at(now));
            let removed = (before - data.queue_codes.len()) as u64;
            (removed, removed > 0)
        })
        .await
    }

    async fn create_job(&self, job: &Job) -> Result<bool> {
        let created = self
            .mutate(|data| {
                if data.jobs.iter().any(|j| j.job_id == job.job_id) {
                    return (false, false);
                }
                data.jobs.push(job.clone());
                (true, true)
            })
            .await?;

        if !created {
            warn!("Job {} already exists, not overwriting", job.job_id);
        }
        Ok(created)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self
            .read(|data| data.jobs.iter().find(|j| j.job_id == job_id).cloned())
            .await)
    }

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<bool> {
        let now = Utc::now();
        self.mutate(|data| match data.jobs.iter_mut().find(|j| j.job_id == job_id) {
            Some(job) => {
                update.apply(job, now);
                (true, true)
            }
            None => (false, false),
        })
        .await
    }

    async fn list_jobs_by_api(&self, api_id: &str, limit: usize) -> Result<Vec<Job>> {
        let jobs = self
            .read(|data| {
                data.jobs
                    .iter()
                    .filter(|j| j.api_id == api_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await;
        Ok(newest_first(jobs, limit))
    }

    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        let jobs = self
            .read(|data| {
                data.jobs
                    .iter()
                    .filter(|j| j.status == status)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await;
        Ok(newest_first(jobs, limit))
    }

    async fn is_transaction_used(&self, signature: &str) -> Result<bool> {
        Ok(self
            .read(|data| data.used_transactions.iter().any(|t| t.signature == signature))
            .await)
    }

    async fn mark_transaction_used(
        &self,
        signature: &str,
        job_id: &str,
        amount: u64,
    ) -> Result<bool> {
        // Check and insert happen under the same lock.
        self.mutate(|data| {
            if data.used_transactions.iter().any(|t| t.signature == signature) {
                return (false, false);
            }
            data.used_transactions.push(UsedTransaction {
                signature: signature.to_string(),
                job_id: job_id.to_string(),
                amount,
                used_at: Utc::now(),
            });
            (true, true)
        })
        .await
    }

    async fn get_used_transaction(&self, signature: &str) -> Result<Option<UsedTransaction>> {
        Ok(self
            .read(|data| {
                data.used_transactions
                    .iter()
                    .find(|t| t.signature == signature)
                    .cloned()
            })
            .await)
    }

    async fn credit_transaction(
        &self,
        signature: &str,
        earning: NewEarning,
        job: Option<&Job>,
    ) -> Result<CreditOutcome> {
        let earning = Earning::from_new(earning, Utc::now());
        self.mutate(|data| {
            if data.used_transactions.iter().any(|t| t.signature == signature) {
                return (CreditOutcome::TransactionUsed, false);
            }
            if let Some(job) = job {
                if data.jobs.iter().any(|j| j.job_id == job.job_id) {
                    return (CreditOutcome::JobExists, false);
                }
                data.jobs.push(job.clone());
            }
            data.used_transactions.push(UsedTransaction {
                signature: signature.to_string(),
                job_id: earning.job_id.clone(),
                amount: earning.amount,
                used_at: earning.earned_at,
            });
            data.earnings.push(earning.clone());
            (CreditOutcome::Credited(earning), true)
        })
        .await
    }

    async fn record_earning(&self, earning: NewEarning) -> Result<Earning> {
        let earning = Earning::from_new(earning, Utc::now());
        self.mutate(|data| {
            data.earnings.push(earning.clone());
            (earning, true)
        })
        .await
    }

    async fn get_earnings(&self, range: EarningsRange) -> Result<Vec<Earning>> {
        let mut earnings = self
            .read(|data| {
                data.earnings
                    .iter()
                    .filter(|e| range.contains(e.earned_at))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await;
        earnings.sort_by(|a, b| a.earned_at.cmp(&b.earned_at));
        Ok(earnings)
    }

    async fn get_total_earnings(&self) -> Result<u64> {
        Ok(self
            .read(|data| data.earnings.iter().map(|e| e.amount).sum())
            .await)
    }

    async fn record_api_call(&self, api_id: &str, success: bool, earned: u64) -> Result<ApiStat> {
        let now = Utc::now();
        self.mutate(|data| {
            let index = match data.api_stats.iter().position(|s| s.api_id == api_id) {
                Some(index) => index,
                None => {
                    data.api_stats.push(ApiStat::new(api_id));
                    data.api_stats.len() - 1
                }
            };
            let stat = &mut data.api_stats[index];
            stat.record(success, earned, now);
            (stat.clone(), true)
        })
        .await
    }

    async fn get_api_stat(&self, api_id: &str) -> Result<Option<ApiStat>> {
        Ok(self
            .read(|data| data.api_stats.iter().find(|s| s.api_id == api_id).cloned())
            .await)
    }

    async fn get_all_api_stats(&self) -> Result<Vec<ApiStat>> {
        let mut stats = self.read(|data| data.api_stats.clone()).await;
        stats.sort_by(|a, b| a.api_id.cmp(&b.api_id));
        Ok(stats)
    }
}
