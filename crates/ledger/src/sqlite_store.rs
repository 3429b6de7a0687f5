//! SQLite ledger backend
//!
//! Transactional and safe for several writers: the used-transaction guard is a
//! primary key, so a duplicate signature is rejected by the database itself.
//! Read-modify-write paths open IMMEDIATE transactions so they take the write
//! lock up front and wait on `busy_timeout` instead of failing on upgrade.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provider_common::{Error, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{
    params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use std::path::Path;
use tracing::{debug, info};

use crate::models::{
    ApiStat, CreditOutcome, Earning, EarningsRange, Job, JobStatus, JobUpdate, NewEarning,
    QueueCode, UsedTransaction,
};
use crate::store::LedgerStore;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_codes (
    code TEXT PRIMARY KEY,
    api_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_codes_api ON queue_codes(api_id, expires_at);

CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    api_id TEXT NOT NULL,
    status TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_api ON jobs(api_id, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at);

CREATE TABLE IF NOT EXISTS used_transactions (
    signature TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    amount INTEGER NOT NULL,
    used_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS earnings (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    api_id TEXT NOT NULL,
    amount INTEGER NOT NULL,
    tx_signature TEXT,
    metadata TEXT NOT NULL,
    earned_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_earnings_earned_at ON earnings(earned_at);

CREATE TABLE IF NOT EXISTS api_stats (
    api_id TEXT PRIMARY KEY,
    total_calls INTEGER NOT NULL DEFAULT 0,
    successful_calls INTEGER NOT NULL DEFAULT 0,
    failed_calls INTEGER NOT NULL DEFAULT 0,
    total_earned INTEGER NOT NULL DEFAULT 0,
    last_call_at INTEGER
);
";

/// Pooled SQLite backend
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let manager = SqliteConnectionManager::file(&path)
            .with_init(|conn| conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;"));

        let pool = tokio::task::spawn_blocking(move || {
            let pool = Pool::builder()
                .max_size(8)
                .build(manager)
                .map_err(|e| Error::Sqlite(e.to_string()))?;
            pool.get()
                .map_err(|e| Error::Sqlite(e.to_string()))?
                .execute_batch(SCHEMA)
                .map_err(sql_err)?;
            Ok::<_, Error>(pool)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite open task failed: {}", e)))??;

        info!("Opened SQLite ledger at {}", path.display());
        Ok(Self { pool })
    }

    /// Run blocking database work off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| Error::Sqlite(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite task failed: {}", e)))?
    }
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Sqlite(e.to_string())
}

fn write_tx(conn: &mut Connection) -> Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(sql_err)
}

fn insert_job(conn: &Connection, job: &Job) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO jobs (job_id, api_id, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.job_id,
                job.api_id,
                job.status.as_str(),
                serde_json::to_string(job)?,
                to_millis(job.created_at),
                to_millis(job.updated_at)
            ],
        )
        .map_err(sql_err)?;
    Ok(inserted == 1)
}

fn insert_earning(conn: &Connection, earning: &Earning) -> Result<()> {
    conn.execute(
        "INSERT INTO earnings (id, job_id, api_id, amount, tx_signature, metadata, earned_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            earning.id,
            earning.job_id,
            earning.api_id,
            earning.amount as i64,
            earning.tx_signature,
            serde_json::to_string(&earning.metadata)?,
            to_millis(earning.earned_at)
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn queue_code_from_row(row: &Row<'_>) -> rusqlite::Result<QueueCode> {
    Ok(QueueCode {
        code: row.get(0)?,
        api_id: row.get(1)?,
        created_at: from_millis(row.get(2)?),
        expires_at: from_millis(row.get(3)?),
    })
}

fn api_stat_from_row(row: &Row<'_>) -> rusqlite::Result<ApiStat> {
    Ok(ApiStat {
        api_id: row.get(0)?,
        total_calls: row.get::<_, i64>(1)? as u64,
        successful_calls: row.get::<_, i64>(2)? as u64,
        failed_calls: row.get::<_, i64>(3)? as u64,
        total_earned: row.get::<_, i64>(4)? as u64,
        last_call_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
    })
}

fn earning_from_row(row: &Row<'_>) -> rusqlite::Result<(Earning, String)> {
    let earning = Earning {
        id: row.get(0)?,
        job_id: row.get(1)?,
        api_id: row.get(2)?,
        amount: row.get::<_, i64>(3)? as u64,
        tx_signature: row.get(4)?,
        metadata: Default::default(),
        earned_at: from_millis(row.get(6)?),
    };
    Ok((earning, row.get(5)?))
}

fn load_job(conn: &Connection, job_id: &str) -> Result<Option<Job>> {
    let data: Option<String> = conn
        .query_row("SELECT data FROM jobs WHERE job_id = ?1", params![job_id], |row| {
            row.get(0)
        })
        .optional()
        .map_err(sql_err)?;

    data.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
        .transpose()
}

fn query_jobs(conn: &Connection, sql: &str, key: &str, limit: usize) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(sql).map_err(sql_err)?;
    let rows = stmt
        .query_map(params![key, i64::try_from(limit).unwrap_or(i64::MAX)], |row| row.get::<_, String>(0))
        .map_err(sql_err)?;

    let mut jobs = Vec::new();
    for raw in rows {
        let raw = raw.map_err(sql_err)?;
        jobs.push(serde_json::from_str(&raw)?);
    }
    Ok(jobs)
}

#[async_trait]
impl LedgerStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn create_queue_code(&self, code: &QueueCode) -> Result<bool> {
        let code = code.clone();
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO queue_codes (code, api_id, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        code.code,
                        code.api_id,
                        to_millis(code.created_at),
                        to_millis(code.expires_at)
                    ],
                )
                .map_err(sql_err)?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn get_queue_code(&self, code: &str) -> Result<Option<QueueCode>> {
        let code = code.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT code, api_id, created_at, expires_at FROM queue_codes WHERE code = ?1",
                params![code],
                queue_code_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
        .await
    }

    async fn delete_queue_code(&self, code: &str) -> Result<bool> {
        let code = code.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM queue_codes WHERE code = ?1", params![code])
                .map_err(sql_err)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn get_queue_position(&self, api_id: &str) -> Result<u64> {
        let api_id = api_id.to_string();
        let now = to_millis(Utc::now());
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM queue_codes WHERE api_id = ?1 AND expires_at > ?2",
                    params![api_id, now],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            Ok(count as u64)
        })
        .await
    }

    async fn cleanup_expired_queue_codes(&self) -> Result<u64> {
        let now = to_millis(Utc::now());
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM queue_codes WHERE expires_at <= ?1", params![now])
                .map_err(sql_err)?;
            Ok(removed as u64)
        })
        .await
    }

    async fn create_job(&self, job: &Job) -> Result<bool> {
        let job = job.clone();
        self.with_conn(move |conn| insert_job(conn, &job)).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| load_job(conn, &job_id)).await
    }

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<bool> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;

            let mut job = match load_job(&tx, &job_id)? {
                Some(job) => job,
                None => return Ok(false),
            };
            update.apply(&mut job, Utc::now());

            tx.execute(
                "UPDATE jobs SET status = ?2, data = ?3, updated_at = ?4 WHERE job_id = ?1",
                params![
                    job.job_id,
                    job.status.as_str(),
                    serde_json::to_string(&job)?,
                    to_millis(job.updated_at)
                ],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;

            debug!("Updated job {} (status: {})", job.job_id, job.status);
            Ok(true)
        })
        .await
    }

    async fn list_jobs_by_api(&self, api_id: &str, limit: usize) -> Result<Vec<Job>> {
        let api_id = api_id.to_string();
        self.with_conn(move |conn| {
            query_jobs(
                conn,
                "SELECT data FROM jobs WHERE api_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                &api_id,
                limit,
            )
        })
        .await
    }

    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        self.with_conn(move |conn| {
            query_jobs(
                conn,
                "SELECT data FROM jobs WHERE status = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                status.as_str(),
                limit,
            )
        })
        .await
    }

    async fn is_transaction_used(&self, signature: &str) -> Result<bool> {
        let signature = signature.to_string();
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM used_transactions WHERE signature = ?1",
                    params![signature],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            Ok(found.is_some())
        })
        .await
    }

    async fn mark_transaction_used(
        &self,
        signature: &str,
        job_id: &str,
        amount: u64,
    ) -> Result<bool> {
        let signature = signature.to_string();
        let job_id = job_id.to_string();
        let now = to_millis(Utc::now());
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO used_transactions (signature, job_id, amount, used_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![signature, job_id, amount as i64, now],
                )
                .map_err(sql_err)?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn get_used_transaction(&self, signature: &str) -> Result<Option<UsedTransaction>> {
        let signature = signature.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT signature, job_id, amount, used_at FROM used_transactions WHERE signature = ?1",
                params![signature],
                |row| {
                    Ok(UsedTransaction {
                        signature: row.get(0)?,
                        job_id: row.get(1)?,
                        amount: row.get::<_, i64>(2)? as u64,
                        used_at: from_millis(row.get(3)?),
                    })
                },
            )
            .optional()
            .map_err(sql_err)
        })
        .await
    }

    async fn credit_transaction(
        &self,
        signature: &str,
        earning: NewEarning,
        job: Option<&Job>,
    ) -> Result<CreditOutcome> {
        let signature = signature.to_string();
        let earning = Earning::from_new(earning, Utc::now());
        let job = job.cloned();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;

            // Dropping `tx` without commit rolls everything back
            let claimed = tx
                .execute(
                    "INSERT OR IGNORE INTO used_transactions (signature, job_id, amount, used_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        signature,
                        earning.job_id,
                        earning.amount as i64,
                        to_millis(earning.earned_at)
                    ],
                )
                .map_err(sql_err)?;
            if claimed == 0 {
                return Ok(CreditOutcome::TransactionUsed);
            }

            if let Some(job) = &job {
                if !insert_job(&tx, job)? {
                    return Ok(CreditOutcome::JobExists);
                }
            }

            insert_earning(&tx, &earning)?;
            tx.commit().map_err(sql_err)?;

            debug!("Credited {} to job {}", signature, earning.job_id);
            Ok(CreditOutcome::Credited(earning))
        })
        .await
    }

    async fn record_earning(&self, earning: NewEarning) -> Result<Earning> {
        let earning = Earning::from_new(earning, Utc::now());
        self.with_conn(move |conn| {
            insert_earning(conn, &earning)?;
            Ok(earning)
        })
        .await
    }

    async fn get_earnings(&self, range: EarningsRange) -> Result<Vec<Earning>> {
        let from = range.from.map(to_millis).unwrap_or(i64::MIN);
        let to = range.to.map(to_millis).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, job_id, api_id, amount, tx_signature, metadata, earned_at
                     FROM earnings WHERE earned_at >= ?1 AND earned_at < ?2
                     ORDER BY earned_at ASC, rowid ASC",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![from, to], earning_from_row)
                .map_err(sql_err)?;

            let mut earnings = Vec::new();
            for row in rows {
                let (mut earning, metadata) = row.map_err(sql_err)?;
                earning.metadata = serde_json::from_str(&metadata)?;
                earnings.push(earning);
            }
            Ok(earnings)
        })
        .await
    }

    async fn get_total_earnings(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let total: i64 = conn
                .query_row("SELECT COALESCE(SUM(amount), 0) FROM earnings", [], |row| {
                    row.get(0)
                })
                .map_err(sql_err)?;
            Ok(total as u64)
        })
        .await
    }

    async fn record_api_call(&self, api_id: &str, success: bool, earned: u64) -> Result<ApiStat> {
        let api_id = api_id.to_string();
        let now = to_millis(Utc::now());
        let (ok, failed) = if success { (1i64, 0i64) } else { (0, 1) };
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            tx.execute(
                "INSERT INTO api_stats (api_id, total_calls, successful_calls, failed_calls, total_earned, last_call_at)
                 VALUES (?1, 1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(api_id) DO UPDATE SET
                    total_calls = total_calls + 1,
                    successful_calls = successful_calls + excluded.successful_calls,
                    failed_calls = failed_calls + excluded.failed_calls,
                    total_earned = total_earned + excluded.total_earned,
                    last_call_at = excluded.last_call_at",
                params![api_id, ok, failed, earned as i64, now],
            )
            .map_err(sql_err)?;

            let stat = tx
                .query_row(
                    "SELECT api_id, total_calls, successful_calls, failed_calls, total_earned, last_call_at
                     FROM api_stats WHERE api_id = ?1",
                    params![api_id],
                    api_stat_from_row,
                )
                .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
            Ok(stat)
        })
        .await
    }

    async fn get_api_stat(&self, api_id: &str) -> Result<Option<ApiStat>> {
        let api_id = api_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT api_id, total_calls, successful_calls, failed_calls, total_earned, last_call_at
                 FROM api_stats WHERE api_id = ?1",
                params![api_id],
                api_stat_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
        .await
    }

    async fn get_all_api_stats(&self) -> Result<Vec<ApiStat>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT api_id, total_calls, successful_calls, failed_calls, total_earned, last_call_at
                     FROM api_stats ORDER BY api_id",
                )
                .map_err(sql_err)?;
            let rows = stmt.query_map([], api_stat_from_row).map_err(sql_err)?;
            let stats = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)?;
            Ok(stats)
        })
        .await
    }
}
