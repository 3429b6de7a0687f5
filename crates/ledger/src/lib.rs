//! Provider ledger
//!
//! Durable record keeping for the provider node:
//! - Queue codes for rate-limited APIs
//! - Job lifecycle
//! - Used payment transactions (the double-spend guard)
//! - Earnings and per-API call statistics
//!
//! Three interchangeable backends implement [`LedgerStore`]; [`open_store`]
//! picks one from `provider.database.type`.

pub mod file_store;
pub mod models;
pub mod payments;
pub mod redis_store;
pub mod sqlite_store;
pub mod store;
pub mod sweeper;

pub use file_store::FileStore;
pub use models::{
    ApiStat, CreditOutcome, Earning, EarningsRange, Job, JobStatus, JobUpdate, NewEarning,
    QueueCode, UsedTransaction,
};
pub use payments::{accept_paid_job, credit_payment, PaymentCredit};
pub use redis_store::RedisStore;
pub use sqlite_store::SqliteStore;
pub use store::{open_store, LedgerStore};
pub use sweeper::{QueueSweeper, SweeperHandle};
