//! Redis ledger backend
//!
//! Data model:
//! - ledger:queue:code:{code} → QueueCode JSON
//! - ledger:queue:api:{api_id} → Sorted set (score=expires_at ms, member=code)
//! - ledger:queue:apis → Set of api ids with queue codes
//! - ledger:job:{job_id} → Job JSON
//! - ledger:jobs:api:{api_id} / ledger:jobs:status:{status} → Sorted sets (score=created_at ms)
//! - ledger:tx:{signature} → UsedTransaction JSON, written with SET NX
//! - ledger:earnings → Sorted set (score=earned_at ms, member=Earning JSON)
//! - ledger:earnings:total → Running total
//! - ledger:stats:{api_id} → Hash of counters
//! - ledger:stats:apis → Set of api ids with stats

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provider_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::models::{
    ApiStat, CreditOutcome, Earning, EarningsRange, Job, JobStatus, JobUpdate, NewEarning,
    QueueCode, UsedTransaction,
};
use crate::store::LedgerStore;

const QUEUE_APIS_KEY: &str = "ledger:queue:apis";
const EARNINGS_KEY: &str = "ledger:earnings";
const EARNINGS_TOTAL_KEY: &str = "ledger:earnings:total";
const STATS_APIS_KEY: &str = "ledger:stats:apis";

/// Compare-and-set a job document, moving its status index entry.
/// Returns -1 when the job is gone, 0 when it changed underneath, 1 on write.
const UPDATE_JOB_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return -1 end
if current ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
if KEYS[2] ~= KEYS[3] then
  redis.call('ZREM', KEYS[2], ARGV[3])
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[3])
end
return 1
"#;

/// Claim a signature, append the earning and optionally create the job.
/// Returns 0 when credited, 1 when the signature is used, 2 when the job exists.
const CREDIT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 1 end
local with_job = ARGV[2] ~= ''
if with_job and redis.call('EXISTS', KEYS[2]) == 1 then return 2 end
redis.call('SET', KEYS[1], ARGV[1])
if with_job then
  redis.call('SET', KEYS[2], ARGV[2])
  redis.call('ZADD', KEYS[5], ARGV[7], ARGV[6])
  redis.call('ZADD', KEYS[6], ARGV[7], ARGV[6])
end
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[3])
redis.call('INCRBY', KEYS[4], ARGV[5])
return 0
"#;

/// Compare-and-set attempts before an update gives up
const UPDATE_RETRIES: usize = 128;

fn queue_code_key(code: &str) -> String {
    format!("ledger:queue:code:{}", code)
}

fn queue_api_key(api_id: &str) -> String {
    format!("ledger:queue:api:{}", api_id)
}

fn job_key(job_id: &str) -> String {
    format!("ledger:job:{}", job_id)
}

fn jobs_by_api_key(api_id: &str) -> String {
    format!("ledger:jobs:api:{}", api_id)
}

fn jobs_by_status_key(status: JobStatus) -> String {
    format!("ledger:jobs:status:{}", status.as_str())
}

fn tx_key(signature: &str) -> String {
    format!("ledger:tx:{}", signature)
}

fn stats_key(api_id: &str) -> String {
    format!("ledger:stats:{}", api_id)
}

fn redis_err(e: redis::RedisError) -> Error {
    Error::Redis(e.to_string())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Redis backend
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Create a new storage instance
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(redis_err)?;

        let conn = ConnectionManager::new(client).await.map_err(redis_err)?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Health check - verify Redis connection
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn jobs_from_index(&self, index_key: &str, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // -1 is the end of the set
        let stop = isize::try_from(limit).map(|l| l - 1).unwrap_or(-1);
        let mut conn = self.conn.clone();
        let job_ids: Vec<String> = conn
            .zrevrange(index_key, 0, stop)
            .await
            .map_err(redis_err)?;

        let mut jobs = Vec::new();
        for job_id in job_ids {
            if let Some(job) = self.get_job(&job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn stat_from_hash(api_id: &str, fields: &HashMap<String, i64>) -> ApiStat {
        let get = |name: &str| fields.get(name).copied().unwrap_or(0).max(0) as u64;
        ApiStat {
            api_id: api_id.to_string(),
            total_calls: get("total_calls"),
            successful_calls: get("successful_calls"),
            failed_calls: get("failed_calls"),
            total_earned: get("total_earned"),
            last_call_at: fields.get("last_call_at").copied().map(from_millis),
        }
    }
}

#[async_trait]
impl LedgerStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn create_queue_code(&self, code: &QueueCode) -> Result<bool> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(code)?;

        let created: bool = conn
            .set_nx(queue_code_key(&code.code), json)
            .await
            .map_err(redis_err)?;
        if !created {
            debug!("Queue code {} already exists", code.code);
            return Ok(false);
        }

        let _: () = redis::pipe()
            .atomic()
            .zadd(
                queue_api_key(&code.api_id),
                &code.code,
                code.expires_at.timestamp_millis(),
            )
            .ignore()
            .sadd(QUEUE_APIS_KEY, &code.api_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(true)
    }

    async fn get_queue_code(&self, code: &str) -> Result<Option<QueueCode>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(queue_code_key(code)).await.map_err(redis_err)?;
        Ok(json.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn delete_queue_code(&self, code: &str) -> Result<bool> {
        let existing = match self.get_queue_code(code).await? {
            Some(existing) => existing,
            None => return Ok(false),
        };

        let mut conn = self.conn.clone();
        let (deleted,): (i64,) = redis::pipe()
            .atomic()
            .del(queue_code_key(code))
            .zrem(queue_api_key(&existing.api_id), code)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(deleted > 0)
    }

    async fn get_queue_position(&self, api_id: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let count: u64 = conn
            .zcount(queue_api_key(api_id), format!("({}", now), "+inf")
            .await
            .map_err(redis_err)?;
        Ok(count)
    }

    async fn cleanup_expired_queue_codes(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let api_ids: Vec<String> = conn.smembers(QUEUE_APIS_KEY).await.map_err(redis_err)?;

        let mut removed = 0u64;
        for api_id in api_ids {
            let index = queue_api_key(&api_id);
            let expired: Vec<String> = conn
                .zrangebyscore(&index, "-inf", now)
                .await
                .map_err(redis_err)?;
            if expired.is_empty() {
                continue;
            }

            let keys: Vec<String> = expired.iter().map(|c| queue_code_key(c)).collect();
            let _: () = redis::pipe()
                .atomic()
                .del(keys)
                .ignore()
                .zrembyscore(&index, "-inf", now)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;

            removed += expired.len() as u64;
        }

        Ok(removed)
    }

    async fn create_job(&self, job: &Job) -> Result<bool> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;

        let created: bool = conn
            .set_nx(job_key(&job.job_id), json)
            .await
            .map_err(redis_err)?;
        if !created {
            warn!("Job {} already exists, not overwriting", job.job_id);
            return Ok(false);
        }

        let score = job.created_at.timestamp_millis();
        let _: () = redis::pipe()
            .atomic()
            .zadd(jobs_by_api_key(&job.api_id), &job.job_id, score)
            .ignore()
            .zadd(jobs_by_status_key(job.status), &job.job_id, score)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(true)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(job_key(job_id)).await.map_err(redis_err)?;
        Ok(json.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = job_key(job_id);

        for _ in 0..UPDATE_RETRIES {
            let current: Option<String> = conn.get(&key).await.map_err(redis_err)?;
            let current = match current {
                Some(raw) => raw,
                None => return Ok(false),
            };

            let mut job: Job = serde_json::from_str(&current)?;
            let previous_status = job.status;
            update.clone().apply(&mut job, Utc::now());

            let written: i64 = redis::cmd("EVAL")
                .arg(UPDATE_JOB_SCRIPT)
                .arg(3)
                .arg(&key)
                .arg(jobs_by_status_key(previous_status))
                .arg(jobs_by_status_key(job.status))
                .arg(&current)
                .arg(serde_json::to_string(&job)?)
                .arg(job_id)
                .arg(job.created_at.timestamp_millis())
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;

            match written {
                1 => {
                    debug!("Updated job {} (status: {})", job_id, job.status);
                    return Ok(true);
                }
                -1 => return Ok(false),
                _ => debug!("Job {} changed during update, retrying", job_id),
            }
        }

        Err(Error::Storage(format!(
            "job {} is too contended to update",
            job_id
        )))
    }

    async fn list_jobs_by_api(&self, api_id: &str, limit: usize) -> Result<Vec<Job>> {
        self.jobs_from_index(&jobs_by_api_key(api_id), limit).await
    }

    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        self.jobs_from_index(&jobs_by_status_key(status), limit).await
    }

    async fn is_transaction_used(&self, signature: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(tx_key(signature)).await.map_err(redis_err)
    }

    async fn mark_transaction_used(
        &self,
        signature: &str,
        job_id: &str,
        amount: u64,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let record = UsedTransaction {
            signature: signature.to_string(),
            job_id: job_id.to_string(),
            amount,
            used_at: Utc::now(),
        };

        // SET NX - the first writer wins, every later one gets false
        let inserted: bool = conn
            .set_nx(tx_key(signature), serde_json::to_string(&record)?)
            .await
            .map_err(redis_err)?;

        if inserted {
            info!("Marked transaction used: {} (job {})", signature, job_id);
        } else {
            warn!("Transaction already used: {}", signature);
        }
        Ok(inserted)
    }

    async fn get_used_transaction(&self, signature: &str) -> Result<Option<UsedTransaction>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(tx_key(signature)).await.map_err(redis_err)?;
        Ok(json.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn credit_transaction(
        &self,
        signature: &str,
        earning: NewEarning,
        job: Option<&Job>,
    ) -> Result<CreditOutcome> {
        let earning = Earning::from_new(earning, Utc::now());
        let record = UsedTransaction {
            signature: signature.to_string(),
            job_id: earning.job_id.clone(),
            amount: earning.amount,
            used_at: earning.earned_at,
        };
        let (job_json, job_status, job_created) = match job {
            Some(job) => (
                serde_json::to_string(job)?,
                job.status,
                job.created_at.timestamp_millis(),
            ),
            None => (String::new(), JobStatus::Pending, 0),
        };

        let mut conn = self.conn.clone();
        let code: i64 = redis::cmd("EVAL")
            .arg(CREDIT_SCRIPT)
            .arg(6)
            .arg(tx_key(signature))
            .arg(job_key(&earning.job_id))
            .arg(EARNINGS_KEY)
            .arg(EARNINGS_TOTAL_KEY)
            .arg(jobs_by_api_key(&earning.api_id))
            .arg(jobs_by_status_key(job_status))
            .arg(serde_json::to_string(&record)?)
            .arg(job_json)
            .arg(serde_json::to_string(&earning)?)
            .arg(earning.earned_at.timestamp_millis())
            .arg(earning.amount)
            .arg(&earning.job_id)
            .arg(job_created)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        match code {
            0 => {
                info!("Credited {} to job {}", signature, earning.job_id);
                Ok(CreditOutcome::Credited(earning))
            }
            1 => Ok(CreditOutcome::TransactionUsed),
            _ => Ok(CreditOutcome::JobExists),
        }
    }

    async fn record_earning(&self, earning: NewEarning) -> Result<Earning> {
        let earning = Earning::from_new(earning, Utc::now());
        let json = serde_json::to_string(&earning)?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zadd(EARNINGS_KEY, json, earning.earned_at.timestamp_millis())
            .ignore()
            .incr(EARNINGS_TOTAL_KEY, earning.amount)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(earning)
    }

    async fn get_earnings(&self, range: EarningsRange) -> Result<Vec<Earning>> {
        let min = range
            .from
            .map(|from| from.timestamp_millis().to_string())
            .unwrap_or_else(|| "-inf".to_string());
        let max = range
            .to
            .map(|to| format!("({}", to.timestamp_millis()))
            .unwrap_or_else(|| "+inf".to_string());

        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore(EARNINGS_KEY, min, max)
            .await
            .map_err(redis_err)?;

        members
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(Error::from))
            .collect()
    }

    async fn get_total_earnings(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let total: Option<u64> = conn.get(EARNINGS_TOTAL_KEY).await.map_err(redis_err)?;
        Ok(total.unwrap_or(0))
    }

    async fn record_api_call(&self, api_id: &str, success: bool, earned: u64) -> Result<ApiStat> {
        let key = stats_key(api_id);
        let outcome_field = if success {
            "successful_calls"
        } else {
            "failed_calls"
        };

        let mut conn = self.conn.clone();
        let (fields,): (HashMap<String, i64>,) = redis::pipe()
            .atomic()
            .hincr(&key, "total_calls", 1)
            .ignore()
            .hincr(&key, outcome_field, 1)
            .ignore()
            .hincr(&key, "total_earned", earned)
            .ignore()
            .hset(&key, "last_call_at", Utc::now().timestamp_millis())
            .ignore()
            .sadd(STATS_APIS_KEY, api_id)
            .ignore()
            .hgetall(&key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(Self::stat_from_hash(api_id, &fields))
    }

    async fn get_api_stat(&self, api_id: &str) -> Result<Option<ApiStat>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, i64> = conn.hgetall(stats_key(api_id)).await.map_err(redis_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::stat_from_hash(api_id, &fields)))
    }

    async fn get_all_api_stats(&self) -> Result<Vec<ApiStat>> {
        let mut conn = self.conn.clone();
        let mut api_ids: Vec<String> = conn.smembers(STATS_APIS_KEY).await.map_err(redis_err)?;
        api_ids.sort();

        let mut stats = Vec::new();
        for api_id in api_ids {
            if let Some(stat) = self.get_api_stat(&api_id).await? {
                stats.push(stat);
            }
        }
        Ok(stats)
    }
}
