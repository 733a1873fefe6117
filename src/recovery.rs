//! Startup repair for unclean shutdowns.

use chrono::Utc;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::ledger::SqliteLedger;
use crate::scheduler::Scheduler;

/// Fails any release left `running` by a previous process, then runs one
/// drain so a surviving queue resumes without waiting for the first tick.
///
/// Must run before the first executor starts; after that point a `running`
/// row is live, not orphaned.
pub async fn recover(ledger: &SqliteLedger, scheduler: &Scheduler) -> Result<(), StoreError> {
    let repaired = ledger.recover_interrupted(Utc::now())?;
    if repaired > 0 {
        warn!(repaired, "failed releases interrupted by an unclean shutdown");
    } else {
        info!("no interrupted releases found");
    }
    scheduler.drain_once().await?;
    Ok(())
}
