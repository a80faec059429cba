//! Waitlist promotion engine.
//!
//! Runs synchronously inside the transaction that frees a spot — never
//! as a background job. At most one registration is promoted per freed
//! spot, FIFO by creation time with the row id as tie-break.

use chrono::{DateTime, Utc};

use super::capacity::{self, AcquireOutcome};
use crate::domain::{Event, Registration, RegistrationStatus};
use crate::error::EngineError;
use crate::ports::{MembershipPort, NotifyPort};
use crate::store::StoreTx;

/// Attempts to promote the oldest waitlisted registration for the
/// event's occurrence. Returns the promoted registration, or `None`
/// when there is no spot, no candidate, or the candidate's price
/// requires an explicit online checkout.
///
/// Promotion policy:
/// - free → `Confirmed`, points and calendar sync fired best-effort;
/// - paid + manual mode → `ManualPaymentRequired` with a fresh
///   declaration deadline;
/// - paid + online mode → left on the waitlist. Auto-charging a stored
///   card the user never offered is not an option; they must check out
///   themselves.
///
/// The freed spot is re-acquired through the capacity ledger; losing
/// that race to a concurrent registrant aborts the promotion silently.
///
/// # Errors
///
/// Returns [`EngineError::Persistence`] on storage failure, or an
/// error from the membership port when the candidate's price tier
/// cannot be resolved.
pub async fn promote_next(
    tx: &mut dyn StoreTx,
    event: &Event,
    membership: &dyn MembershipPort,
    notify: &dyn NotifyPort,
    now: DateTime<Utc>,
) -> Result<Option<Registration>, EngineError> {
    let occurrence = event.occurrence_date();

    if let Some(capacity) = event.capacity {
        let occupying = tx.occupying_count(event.id, occurrence).await?;
        if occupying >= i64::from(capacity) {
            return Ok(None);
        }
    }

    let Some(mut candidate) = tx.oldest_waitlisted(event.id, occurrence).await? else {
        return Ok(None);
    };

    let is_subscriber = membership
        .is_active_subscriber(candidate.user_id, now)
        .await?;
    let price = event.price_cents(is_subscriber);

    let (status, due_at) = if price > 0 {
        if !event.manual_payment_enabled {
            // Deliberate policy: paid promotions without manual mode
            // wait for the user's own checkout.
            tracing::debug!(
                registration_id = %candidate.id,
                event_id = %event.id,
                "paid candidate left on waitlist (online checkout required)"
            );
            return Ok(None);
        }
        (
            RegistrationStatus::ManualPaymentRequired,
            Some(event.manual_payment_due_from(now)),
        )
    } else {
        (RegistrationStatus::Confirmed, None)
    };

    match capacity::try_acquire(tx, event).await? {
        AcquireOutcome::Acquired => {}
        AcquireOutcome::Full | AcquireOutcome::Lost => {
            tracing::debug!(event_id = %event.id, "freed spot taken before promotion");
            return Ok(None);
        }
    }

    candidate.promote(status, due_at, now)?;

    if notify
        .notify_waitlist_promotion(candidate.user_id, event)
        .await
        .is_ok()
    {
        candidate.mark_waitlist_notified(now);
    } else {
        tracing::warn!(
            registration_id = %candidate.id,
            "promotion notification failed; will not retry"
        );
    }

    tx.upsert_registration(&candidate).await?;

    if status == RegistrationStatus::Confirmed {
        if event.points_awarded > 0
            && let Err(err) = membership
                .award_points(candidate.user_id, event.points_awarded)
                .await
        {
            tracing::warn!(user_id = %candidate.user_id, %err, "points award failed");
        }
        if let Err(err) = notify.sync_calendar(candidate.user_id, event).await {
            tracing::warn!(user_id = %candidate.user_id, %err, "calendar sync failed");
        }
    }

    tracing::info!(
        registration_id = %candidate.id,
        event_id = %event.id,
        status = %candidate.status,
        "waitlist promotion"
    );
    Ok(Some(candidate))
}
