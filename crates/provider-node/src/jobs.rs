//! Job execution against local API handlers
//!
//! A handler is invoked as `handler(params, context)`. The runner owns the
//! bookkeeping around it: payment crediting, job lifecycle, queue codes and
//! per-API stats.

use anyhow::{Context, Result};
use async_trait::async_trait;
use provider_common::{ApiDefinition, ProviderConfig};
use provider_ledger::{
    accept_paid_job, Job, JobStatus, JobUpdate, LedgerStore, PaymentCredit, QueueCode,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Business logic behind one advertised API
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn call(&self, params: Value, ctx: JobContext) -> Result<Value>;
}

/// Returns its params unchanged
pub struct EchoHandler;

/// API id served by [`EchoHandler`] when it is configured
pub const ECHO_API_ID: &str = "echo";

#[async_trait]
impl ApiHandler for EchoHandler {
    async fn call(&self, params: Value, ctx: JobContext) -> Result<Value> {
        ctx.update_progress(50, "echoing").await?;
        Ok(json!({ "echo": params }))
    }
}

/// Where handlers drop result files and the URL they are served under
#[derive(Debug, Clone)]
pub struct ResultStore {
    storage_path: PathBuf,
    base_url: String,
}

impl ResultStore {
    /// `base_url` defaults to the node's own `/results` route
    pub fn new(storage_path: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            storage_path: storage_path.into(),
            base_url: base_url
                .unwrap_or_else(|| "/results".to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Copy `local_path` to `{storage}/{job_id}/{name}` and return its URL
    pub async fn save(&self, job_id: &str, local_path: &Path, suggested_name: &str) -> Result<String> {
        let name = sanitize_file_name(suggested_name);
        let job_dir = self.storage_path.join(sanitize_file_name(job_id));

        tokio::fs::create_dir_all(&job_dir)
            .await
            .with_context(|| format!("Failed to create result directory: {}", job_dir.display()))?;

        let target = job_dir.join(&name);
        tokio::fs::copy(local_path, &target)
            .await
            .with_context(|| format!("Failed to save result: {}", local_path.display()))?;

        debug!("Saved result for job {} to {}", job_id, target.display());
        Ok(format!(
            "{}/{}/{}",
            self.base_url,
            sanitize_file_name(job_id),
            name
        ))
    }
}

/// Keep file names inside the result directory
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "result".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Capabilities handed to a handler for one job
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    store: Arc<dyn LedgerStore>,
    results: ResultStore,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Record progress (0-100) on the job
    pub async fn update_progress(&self, pct: u8, message: &str) -> Result<()> {
        let updated = self
            .store
            .update_job(&self.job_id, JobUpdate::progress(pct, message))
            .await?;
        if !updated {
            warn!("Progress update for unknown job {}", self.job_id);
        }
        Ok(())
    }

    /// Publish a file produced by the handler, returning its URL
    pub async fn save_result(&self, local_path: &Path, suggested_name: &str) -> Result<String> {
        self.results.save(&self.job_id, local_path, suggested_name).await
    }
}

/// Payment accompanying a job request
#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub signature: String,
    pub amount: u64,
}

/// Place handed to a consumer waiting on a busy API
#[derive(Debug, Clone, Serialize)]
pub struct QueueTicket {
    pub code: String,
    pub api_id: String,
    pub position: u64,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Runs jobs through registered handlers
pub struct JobRunner {
    store: Arc<dyn LedgerStore>,
    results: ResultStore,
    handlers: HashMap<String, Arc<dyn ApiHandler>>,
    timeouts: HashMap<String, Duration>,
    code_ttl: Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        results: ResultStore,
        apis: &[ApiDefinition],
        code_ttl: Duration,
    ) -> Self {
        let timeouts = apis
            .iter()
            .map(|api| (api.id.clone(), Duration::from_millis(api.execution.timeout_ms)))
            .collect();

        Self {
            store,
            results,
            handlers: HashMap::new(),
            timeouts,
            code_ttl,
        }
    }

    /// Runner for a configured provider, with the built-in handlers attached.
    ///
    /// Results are saved under `results.storagePath` and linked through
    /// [`ProviderConfig::results_base_url`].
    pub fn for_provider(provider: &ProviderConfig, store: Arc<dyn LedgerStore>) -> Self {
        let results = ResultStore::new(
            provider.results.storage_path.clone(),
            provider.results_base_url(),
        );
        let mut runner = Self::new(store, results, &provider.apis, provider.queue.code_ttl());

        if provider.apis.iter().any(|api| api.id == ECHO_API_ID) {
            runner.register(ECHO_API_ID, Arc::new(EchoHandler));
        }
        for api in &provider.apis {
            if !runner.has_handler(&api.id) {
                warn!("No handler registered for API {}; calls to it will fail", api.id);
            }
        }

        runner
    }

    pub fn register(&mut self, api_id: impl Into<String>, handler: Arc<dyn ApiHandler>) {
        self.handlers.insert(api_id.into(), handler);
    }

    pub fn has_handler(&self, api_id: &str) -> bool {
        self.handlers.contains_key(api_id)
    }

    /// Ids of the APIs this runner can execute, sorted
    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Hand out a queue code for `api_id` and report how many are waiting
    pub async fn enter_queue(&self, api_id: &str) -> Result<QueueTicket> {
        let ttl = chrono::Duration::from_std(self.code_ttl).context("Invalid queue code TTL")?;
        let code = QueueCode::new(api_id, ttl);

        if !self.store.create_queue_code(&code).await? {
            anyhow::bail!("Queue code collision for {}", api_id);
        }
        let position = self.store.get_queue_position(api_id).await?;

        debug!("Queued {} for {} at position {}", code.code, api_id, position);
        Ok(QueueTicket {
            code: code.code,
            api_id: code.api_id,
            position,
            expires_at: code.expires_at,
        })
    }

    /// Run one job to completion.
    ///
    /// A paid job is created and credited in one ledger write: a replayed
    /// transaction never produces a job, and a taken job id never consumes
    /// the payment. A fulfilled queue code is removed.
    pub async fn execute(
        &self,
        api_id: &str,
        job_id: &str,
        params: Value,
        payment: Option<Payment>,
        queue_code: Option<&str>,
    ) -> Result<Job> {
        let handler = self
            .handlers
            .get(api_id)
            .cloned()
            .with_context(|| format!("No handler for API {}", api_id))?;

        let job = Job::new(job_id, api_id);
        let earned = match &payment {
            Some(payment) => {
                let credit = PaymentCredit {
                    signature: payment.signature.clone(),
                    job_id: job_id.to_string(),
                    api_id: api_id.to_string(),
                    amount: payment.amount,
                };
                if accept_paid_job(self.store.as_ref(), &credit, &job)
                    .await?
                    .is_none()
                {
                    anyhow::bail!("Job {} already exists", job_id);
                }
                payment.amount
            }
            None => {
                if !self.store.create_job(&job).await? {
                    anyhow::bail!("Job {} already exists", job_id);
                }
                0
            }
        };

        if let Some(code) = queue_code {
            if !self.store.delete_queue_code(code).await? {
                debug!("Queue code {} already gone", code);
            }
        }

        self.update(job_id, JobUpdate::status(JobStatus::Running))
            .await?;
        info!("Running job {} ({})", job_id, api_id);

        let ctx = JobContext {
            job_id: job_id.to_string(),
            store: self.store.clone(),
            results: self.results.clone(),
        };

        let outcome = match self.timeouts.get(api_id) {
            Some(limit) => match tokio::time::timeout(*limit, handler.call(params, ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!("Handler timed out after {:?}", limit)),
            },
            None => handler.call(params, ctx).await,
        };

        match outcome {
            Ok(result) => {
                self.update(job_id, JobUpdate::completed(result)).await?;
                self.store.record_api_call(api_id, true, earned).await?;
                info!("Job {} completed", job_id);
            }
            Err(e) => {
                error!("Job {} failed: {:#}", job_id, e);
                self.update(job_id, JobUpdate::failed(format!("{:#}", e)))
                    .await?;
                self.store.record_api_call(api_id, false, 0).await?;
            }
        }

        self.store
            .get_job(job_id)
            .await?
            .with_context(|| format!("Job {} vanished", job_id))
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<()> {
        if !self.store.update_job(job_id, update).await? {
            // Usually a bookkeeping bug upstream
            warn!("Update for unknown job {}", job_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provider_ledger::{EarningsRange, FileStore};

    struct FailingHandler;

    #[async_trait]
    impl ApiHandler for FailingHandler {
        async fn call(&self, _params: Value, _ctx: JobContext) -> Result<Value> {
            anyhow::bail!("model not loaded")
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl ApiHandler for SlowHandler {
        async fn call(&self, _params: Value, _ctx: JobContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    /// Writes a file and publishes it
    struct FileHandler {
        scratch: PathBuf,
    }

    #[async_trait]
    impl ApiHandler for FileHandler {
        async fn call(&self, _params: Value, ctx: JobContext) -> Result<Value> {
            let local = self.scratch.join("out.txt");
            tokio::fs::write(&local, b"hello").await?;
            let url = ctx.save_result(&local, "../out.txt").await?;
            Ok(json!({ "url": url }))
        }
    }

    async fn runner(dir: &Path, apis: Vec<ApiDefinition>) -> (JobRunner, Arc<dyn LedgerStore>) {
        let store: Arc<dyn LedgerStore> =
            Arc::new(FileStore::open(dir.join("ledger.json")).await.unwrap());
        let results = ResultStore::new(dir.join("results"), Some("https://node.example/results/".to_string()));
        let mut runner = JobRunner::new(store.clone(), results, &apis, Duration::from_secs(300));
        runner.register("echo", Arc::new(EchoHandler));
        runner.register("broken", Arc::new(FailingHandler));
        (runner, store)
    }

    fn api(id: &str, timeout_ms: u64) -> ApiDefinition {
        serde_json::from_value(json!({
            "id": id,
            "pricing": { "amount": 10 },
            "execution": { "timeoutMs": timeout_ms }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_success_records_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, store) = runner(dir.path(), vec![]).await;

        let job = runner
            .execute(
                "echo",
                "job-1",
                json!({"msg": "hi"}),
                Some(Payment {
                    signature: "SIG1".to_string(),
                    amount: 10,
                }),
                None,
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"echo": {"msg": "hi"}})));
        assert_eq!(job.progress, Some(100));
        assert!(store.is_transaction_used("SIG1").await.unwrap());
        assert_eq!(store.get_total_earnings().await.unwrap(), 10);

        let stat = store.get_api_stat("echo").await.unwrap().unwrap();
        assert_eq!(stat.successful_calls, 1);
        assert_eq!(stat.total_earned, 10);
    }

    #[tokio::test]
    async fn test_replayed_payment_creates_no_job() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, store) = runner(dir.path(), vec![]).await;
        let payment = Payment {
            signature: "SIG1".to_string(),
            amount: 10,
        };

        runner
            .execute("echo", "job-A", json!({}), Some(payment.clone()), None)
            .await
            .unwrap();
        assert!(runner
            .execute("echo", "job-B", json!({}), Some(payment), None)
            .await
            .is_err());

        assert!(store.get_job("job-B").await.unwrap().is_none());
        assert_eq!(
            store.get_earnings(EarningsRange::all()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_handler_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, store) = runner(dir.path(), vec![]).await;

        let job = runner
            .execute("broken", "job-1", json!({}), None, None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("model not loaded"));

        let stat = store.get_api_stat("broken").await.unwrap().unwrap();
        assert_eq!(stat.failed_calls, 1);
        assert_eq!(stat.total_calls, 1);
    }

    #[tokio::test]
    async fn test_unknown_api_and_duplicate_job() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _store) = runner(dir.path(), vec![]).await;

        assert!(runner
            .execute("missing", "job-1", json!({}), None, None)
            .await
            .is_err());

        runner
            .execute("echo", "job-1", json!({}), None, None)
            .await
            .unwrap();
        assert!(runner
            .execute("echo", "job-1", json!({}), None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_paid_job_keeps_payment() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, store) = runner(dir.path(), vec![]).await;
        let pay = |signature: &str, amount| Payment {
            signature: signature.to_string(),
            amount,
        };

        runner
            .execute("echo", "job-1", json!({}), Some(pay("SIG1", 10)), None)
            .await
            .unwrap();
        let err = runner
            .execute("echo", "job-1", json!({}), Some(pay("SIG2", 99)), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        // The rejected payment can still be spent on a fresh job
        assert!(!store.is_transaction_used("SIG2").await.unwrap());
        assert_eq!(store.get_total_earnings().await.unwrap(), 10);
        runner
            .execute("echo", "job-2", json!({}), Some(pay("SIG2", 99)), None)
            .await
            .unwrap();
        assert_eq!(store.get_total_earnings().await.unwrap(), 109);
    }

    #[tokio::test]
    async fn test_for_provider_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LedgerStore> =
            Arc::new(FileStore::open(dir.path().join("ledger.json")).await.unwrap());
        let provider: ProviderConfig = serde_json::from_value(json!({
            "port": 3000,
            "publicEndpoint": "https://node.example/",
            "results": { "storagePath": dir.path().join("results") },
            "queue": { "codeTtlSecs": 30 },
            "apis": [
                { "id": "echo", "pricing": { "amount": 10 } },
                { "id": "image-gen", "pricing": { "amount": 500 } }
            ]
        }))
        .unwrap();

        let runner = JobRunner::for_provider(&provider, store);
        assert_eq!(runner.handler_ids(), vec!["echo".to_string()]);
        assert!(!runner.has_handler("image-gen"));
        assert_eq!(runner.results().storage_path(), dir.path().join("results"));

        let source = dir.path().join("out.txt");
        std::fs::write(&source, b"done").unwrap();
        let url = runner.results().save("job-1", &source, "out.txt").await.unwrap();
        assert_eq!(url, "https://node.example/results/job-1/out.txt");

        let ticket = runner.enter_queue("echo").await.unwrap();
        let ttl = ticket.expires_at - chrono::Utc::now();
        assert!(ttl <= chrono::Duration::seconds(30));
        assert!(ttl > chrono::Duration::seconds(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, _store) = runner(dir.path(), vec![api("slow", 1_000)]).await;
        runner.register("slow", Arc::new(SlowHandler));

        let job = runner
            .execute("slow", "job-1", json!({}), None, None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_queue_code_consumed_on_fulfillment() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, store) = runner(dir.path(), vec![]).await;

        let first = runner.enter_queue("echo").await.unwrap();
        let second = runner.enter_queue("echo").await.unwrap();
        assert_eq!(first.position, 1);
        assert_eq!(second.position, 2);

        runner
            .execute("echo", "job-1", json!({}), None, Some(&first.code))
            .await
            .unwrap();
        assert!(store.get_queue_code(&first.code).await.unwrap().is_none());
        assert_eq!(store.get_queue_position("echo").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_result_stays_in_storage() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let (mut runner, _store) = runner(dir.path(), vec![]).await;
        runner.register(
            "files",
            Arc::new(FileHandler {
                scratch: scratch.path().to_path_buf(),
            }),
        );

        let job = runner
            .execute("files", "job-1", json!({}), None, None)
            .await
            .unwrap();

        assert_eq!(
            job.result.unwrap()["url"],
            "https://node.example/results/job-1/_out.txt"
        );
        let saved = dir.path().join("results/job-1/_out.txt");
        assert_eq!(std::fs::read(saved).unwrap(), b"hello");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("image 1.png"), "image_1.png");
        assert_eq!(sanitize_file_name(""), "result");
    }
}
