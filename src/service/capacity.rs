//! Capacity ledger: spot accounting and compare-and-swap acquisition.
//!
//! Capacity is counted from registrations in occupying statuses — there
//! is no counter column to drift out of sync. Acquisition linearizes
//! through the conditional bump of the event's `version`: of any number
//! of transactions racing on the same token, exactly one wins; the
//! losers see [`AcquireOutcome::Lost`] and must retry on fresh state.

use crate::domain::Event;
use crate::error::EngineError;
use crate::store::StoreTx;

/// Result of one capacity acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Spot acquired; the event version was bumped.
    Acquired,
    /// Capacity is exhausted. Not an error — the caller waitlists.
    Full,
    /// Lost the version race to a concurrent transaction. No mutation;
    /// the caller retries against fresh state.
    Lost,
}

/// Attempts to acquire one spot for the event's occurrence.
///
/// `event` must be the copy read inside the current transaction; its
/// `version` field is the CAS token. The version is bumped on every
/// successful acquisition, unlimited-capacity events included, so the
/// token stays a pure monotone counter.
///
/// # Errors
///
/// Returns [`EngineError::Persistence`] on storage failure.
pub async fn try_acquire(
    tx: &mut dyn StoreTx,
    event: &Event,
) -> Result<AcquireOutcome, EngineError> {
    if let Some(capacity) = event.capacity {
        let occupying = tx
            .occupying_count(event.id, event.occurrence_date())
            .await?;
        if occupying >= i64::from(capacity) {
            return Ok(AcquireOutcome::Full);
        }
    }
    if tx.bump_event_version(event.id, event.version).await? {
        Ok(AcquireOutcome::Acquired)
    } else {
        tracing::debug!(event_id = %event.id, version = event.version, "lost capacity race");
        Ok(AcquireOutcome::Lost)
    }
}
