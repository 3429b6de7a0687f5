//! Payment crediting
//!
//! Credits a consumed payment-chain transaction to a job. Claiming the
//! signature and recording the earning happen in one ledger write, so a
//! replayed transaction is never counted twice and a failed write never burns
//! a payment without its earning.

use provider_common::{Error, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::models::{CreditOutcome, Earning, Job, NewEarning};
use crate::store::LedgerStore;

/// A verified payment about to be credited
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentCredit {
    /// Transaction signature on the payment chain
    pub signature: String,
    pub job_id: String,
    pub api_id: String,
    /// Amount in token base units
    pub amount: u64,
}

impl PaymentCredit {
    fn earning(&self) -> NewEarning {
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), Value::from("payment"));

        NewEarning {
            job_id: self.job_id.clone(),
            api_id: self.api_id.clone(),
            amount: self.amount,
            tx_signature: Some(self.signature.clone()),
            metadata,
        }
    }
}

/// Claim the transaction and record the earning.
///
/// # Returns
/// * `Ok(Earning)` - Transaction was unused and is now credited
/// * `Err(Error::TransactionAlreadyUsed)` - Signature was consumed before; nothing recorded
pub async fn credit_payment(store: &dyn LedgerStore, credit: &PaymentCredit) -> Result<Earning> {
    match store
        .credit_transaction(&credit.signature, credit.earning(), None)
        .await?
    {
        CreditOutcome::Credited(earning) => {
            info!(
                "Credited {} to job {} ({})",
                credit.amount, credit.job_id, credit.api_id
            );
            Ok(earning)
        }
        CreditOutcome::TransactionUsed | CreditOutcome::JobExists => {
            warn!("Payment already used: {}", credit.signature);
            Err(Error::TransactionAlreadyUsed(credit.signature.clone()))
        }
    }
}

/// Create `job` and credit the payment to it in one step.
///
/// # Returns
/// * `Ok(Some(Earning))` - Job created and payment credited
/// * `Ok(None)` - Job id already taken; the payment is left unclaimed
/// * `Err(Error::TransactionAlreadyUsed)` - Signature was consumed before; no job created
pub async fn accept_paid_job(
    store: &dyn LedgerStore,
    credit: &PaymentCredit,
    job: &Job,
) -> Result<Option<Earning>> {
    match store
        .credit_transaction(&credit.signature, credit.earning(), Some(job))
        .await?
    {
        CreditOutcome::Credited(earning) => {
            info!(
                "Accepted job {} ({}) paid with {}",
                job.job_id, job.api_id, credit.signature
            );
            Ok(Some(earning))
        }
        CreditOutcome::TransactionUsed => {
            warn!("Payment already used: {}", credit.signature);
            Err(Error::TransactionAlreadyUsed(credit.signature.clone()))
        }
        CreditOutcome::JobExists => {
            warn!(
                "Job {} already exists, payment {} left unclaimed",
                job.job_id, credit.signature
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::FileStore;
    use crate::models::EarningsRange;

    fn credit(signature: &str, job_id: &str, amount: u64) -> PaymentCredit {
        PaymentCredit {
            signature: signature.to_string(),
            job_id: job_id.to_string(),
            api_id: "echo".to_string(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_credit_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("ledger.json")).await.unwrap();

        let earning = credit_payment(&store, &credit("SIG1", "job-A", 10))
            .await
            .unwrap();
        assert_eq!(earning.tx_signature.as_deref(), Some("SIG1"));
        assert_eq!(earning.metadata["source"], "payment");

        let err = credit_payment(&store, &credit("SIG1", "job-B", 99))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransactionAlreadyUsed(ref s) if s == "SIG1"));

        assert_eq!(store.get_total_earnings().await.unwrap(), 10);
        assert_eq!(store.get_earnings(EarningsRange::all()).await.unwrap().len(), 1);
        let used = store.get_used_transaction("SIG1").await.unwrap().unwrap();
        assert_eq!(used.job_id, "job-A");
    }

    #[tokio::test]
    async fn test_failed_write_keeps_payment_unclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("ledger.json")).await.unwrap();

        let blocker = dir.path().join("ledger.json.tmp");
        std::fs::create_dir(&blocker).unwrap();
        assert!(credit_payment(&store, &credit("SIG1", "job-A", 10))
            .await
            .is_err());
        assert!(!store.is_transaction_used("SIG1").await.unwrap());
        assert!(store.get_earnings(EarningsRange::all()).await.unwrap().is_empty());

        // The same payment can be credited once the ledger is writable again
        std::fs::remove_dir(&blocker).unwrap();
        credit_payment(&store, &credit("SIG1", "job-A", 10))
            .await
            .unwrap();
        assert_eq!(store.get_total_earnings().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_duplicate_job_leaves_payment_unclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("ledger.json")).await.unwrap();
        let job = Job::new("job-1", "echo");

        let first = accept_paid_job(&store, &credit("SIG1", "job-1", 10), &job)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = accept_paid_job(&store, &credit("SIG2", "job-1", 99), &job)
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(!store.is_transaction_used("SIG2").await.unwrap());
        assert_eq!(store.get_total_earnings().await.unwrap(), 10);
        assert_eq!(store.get_earnings(EarningsRange::all()).await.unwrap().len(), 1);
    }
}
