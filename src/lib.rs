//! Persisted single-flight release scheduler.
//!
//! At most one release runs at any time; every trigger is claimed atomically
//! in a SQLite ledger, overflow is queued by priority, the release command
//! runs under supervision with a two-phase timeout kill, and interrupted
//! releases are repaired at startup. A small JSON HTTP surface drives it.

pub mod api_errors;
pub mod api_handlers;
pub mod api_models;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod models;
pub mod recovery;
pub mod scheduler;

pub use api_errors::ApiError;
pub use api_handlers::{build_router, AppState};
pub use config::Config;
pub use error::StoreError;
pub use executor::Executor;
pub use ledger::SqliteLedger;
pub use models::{
    is_valid_commit_sha, CancelOutcome, ClaimOutcome, QueueEntry, ReleaseRecord, ReleaseState,
    StateMetrics,
};
pub use scheduler::{DrainOutcome, Scheduler};
