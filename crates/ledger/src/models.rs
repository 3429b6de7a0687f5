//! Ledger record families

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A consumer's place in a rate-limited queue for one API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueCode {
    /// Unique token handed to the consumer
    pub code: String,

    pub api_id: String,

    pub created_at: DateTime<Utc>,

    /// After this instant the code no longer counts toward queue positions
    pub expires_at: DateTime<Utc>,
}

impl QueueCode {
    /// Mint a fresh code valid for `ttl`
    pub fn new(api_id: impl Into<String>, ttl: chrono::Duration) -> Self {
        let created_at = Utc::now();
        Self {
            code: Uuid::new_v4().to_string(),
            api_id: api_id.into(),
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not started
    Pending,
    /// Handler is executing
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// A job accepted into execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied, globally unique, never changes
    pub job_id: String,

    pub api_id: String,

    pub status: JobStatus,

    /// Progress percentage (0-100)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Free-form fields attached by handlers and callers
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job
    pub fn new(job_id: impl Into<String>, api_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            api_id: api_id.into(),
            status: JobStatus::Pending,
            progress: None,
            progress_message: None,
            result: None,
            error: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial mutation of a job. Unset fields are left alone; metadata keys are
/// merged over the existing map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(pct: u8, message: impl Into<String>) -> Self {
        Self {
            progress: Some(pct.min(100)),
            progress_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn completed(result: Value) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Apply onto a job. `updated_at` is always refreshed.
    pub fn apply(self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(progress) = self.progress {
            job.progress = Some(progress.min(100));
        }
        if let Some(message) = self.progress_message {
            job.progress_message = Some(message);
        }
        if let Some(result) = self.result {
            job.result = Some(result);
        }
        if let Some(error) = self.error {
            job.error = Some(error);
        }
        for (key, value) in self.metadata {
            job.metadata.insert(key, value);
        }
        job.updated_at = now;
    }
}

/// A payment-chain transaction already credited to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsedTransaction {
    /// Transaction signature, the dedup key
    pub signature: String,

    pub job_id: String,

    /// Amount in token base units
    pub amount: u64,

    pub used_at: DateTime<Utc>,
}

/// Result of an atomic payment credit
#[derive(Debug, Clone, PartialEq)]
pub enum CreditOutcome {
    /// Signature claimed, earning recorded and the job (if any) created
    Credited(Earning),
    /// Signature was consumed before; nothing written
    TransactionUsed,
    /// Job id is taken; nothing written
    JobExists,
}

/// Earning as supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEarning {
    pub job_id: String,
    pub api_id: String,
    pub amount: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_signature: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Append-only earning record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Earning {
    pub id: String,
    pub job_id: String,
    pub api_id: String,
    pub amount: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_signature: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    pub earned_at: DateTime<Utc>,
}

impl Earning {
    pub fn from_new(new: NewEarning, earned_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: new.job_id,
            api_id: new.api_id,
            amount: new.amount,
            tx_signature: new.tx_signature,
            metadata: new.metadata,
            earned_at,
        }
    }
}

/// Optional half-open time window `[from, to)` for earnings queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EarningsRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl EarningsRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }
}

/// Per-API call counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiStat {
    pub api_id: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_earned: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_call_at: Option<DateTime<Utc>>,
}

impl ApiStat {
    pub fn new(api_id: impl Into<String>) -> Self {
        Self {
            api_id: api_id.into(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            total_earned: 0,
            last_call_at: None,
        }
    }

    /// Count one call; keeps `total_calls == successful_calls + failed_calls`
    pub fn record(&mut self, success: bool, earned: u64, at: DateTime<Utc>) {
        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        self.total_earned = self.total_earned.saturating_add(earned);
        self.last_call_at = Some(at);
    }
}
