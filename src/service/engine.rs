//! Registration orchestrator.
//!
//! [`RegistrationEngine`] is the façade composing the capacity ledger,
//! the state machine, the promotion engine and the refund protocol
//! under one retrying transaction per attempt. It is the only
//! component that talks to the external payment, membership and
//! notification ports, all of which are injected at construction time.

use std::sync::Arc;

use chrono::Utc;

use super::capacity::{self, AcquireOutcome};
use super::promotion;
use crate::config::EngineConfig;
use crate::domain::{
    Availability, CancellationOutcome, Event, EventId, RefundTask, RefundTaskId, RefundTaskPatch,
    RefundUpdateEffect, Registration, RegistrationId, RegistrationOutcome, RegistrationSignal,
    RegistrationStatus, SignalBus, UserId,
};
use crate::error::EngineError;
use crate::ports::{MembershipPort, NotifyPort, PaymentPort, PaymentStatus};
use crate::store::Store;

/// Orchestration layer for all registration operations.
///
/// Every mutation method follows the pattern: begin transaction → load
/// and validate → transition → commit → publish signal → fire
/// best-effort side effects. The bounded retry loop around
/// registration attempts is the only retry in the engine; business
/// failures are never retried.
#[derive(Debug, Clone)]
pub struct RegistrationEngine {
    store: Arc<dyn Store>,
    payments: Arc<dyn PaymentPort>,
    membership: Arc<dyn MembershipPort>,
    notify: Arc<dyn NotifyPort>,
    signals: SignalBus,
    config: EngineConfig,
}

impl RegistrationEngine {
    /// Creates a new engine with explicitly injected collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        payments: Arc<dyn PaymentPort>,
        membership: Arc<dyn MembershipPort>,
        notify: Arc<dyn NotifyPort>,
        config: EngineConfig,
    ) -> Self {
        let signals = SignalBus::new(config.signal_bus_capacity);
        Self {
            store,
            payments,
            membership,
            notify,
            signals,
            config,
        }
    }

    /// Returns a reference to the signal bus for subscribers.
    #[must_use]
    pub const fn signals(&self) -> &SignalBus {
        &self.signals
    }

    /// Registers a user for an event occurrence.
    ///
    /// Resolves to a definitive outcome: confirmed, waitlisted,
    /// manual-payment-required, or payment-pending with a checkout
    /// redirect. A full event is a waitlist placement, never an error.
    /// The whole attempt is retried after a lost capacity race, up to
    /// the configured bound.
    ///
    /// # Errors
    ///
    /// - [`EngineError::EventNotFound`] — unknown event.
    /// - [`EngineError::PastEvent`] — the event already started.
    /// - [`EngineError::SubscriptionRequired`] — subscriber-gated event.
    /// - [`EngineError::AlreadyRegistered`] — active row for the tuple.
    /// - [`EngineError::ConcurrencyConflict`] — retry budget exhausted.
    /// - [`EngineError::Payment`] / [`EngineError::Persistence`] on
    ///   collaborator failure.
    pub async fn register(
        &self,
        user_id: UserId,
        event_id: EventId,
        return_url: &str,
        cancel_url: &str,
    ) -> Result<RegistrationOutcome, EngineError> {
        let attempts = self.config.capacity_retry_limit.max(1);
        for attempt in 1..=attempts {
            let now = Utc::now();
            let mut tx = self.store.begin().await?;

            let event = tx
                .event_by_id(event_id)
                .await?
                .ok_or(EngineError::EventNotFound(*event_id.as_uuid()))?;
            event.validate()?;
            if event.has_started(now) {
                return Err(EngineError::PastEvent);
            }

            let is_subscriber = self.membership.is_active_subscriber(user_id, now).await?;
            if event.requires_active_subscription && !is_subscriber {
                return Err(EngineError::SubscriptionRequired);
            }
            let price = event.price_cents(is_subscriber);
            let occurrence = event.occurrence_date();

            let mut registration =
                match tx.registration_for_user(user_id, event_id, occurrence).await? {
                    Some(row) if row.status.is_terminal() => {
                        let mut row = row;
                        row.reactivate(now)?;
                        row
                    }
                    Some(_) => return Err(EngineError::AlreadyRegistered),
                    None => Registration::new(
                        user_id,
                        event_id,
                        occurrence,
                        RegistrationStatus::Waitlist,
                        now,
                    ),
                };

            match capacity::try_acquire(tx.as_mut(), &event).await? {
                AcquireOutcome::Lost => {
                    drop(tx);
                    tracing::debug!(%event_id, attempt, "registration attempt lost the race");
                    continue;
                }
                AcquireOutcome::Full => {
                    registration.place(RegistrationStatus::Waitlist, now);
                    tx.upsert_registration(&registration).await?;
                    let position = tx
                        .status_count(event_id, occurrence, RegistrationStatus::Waitlist)
                        .await?;
                    tx.commit().await?;
                    let _ = self.signals.publish(RegistrationSignal::RegistrationWaitlisted {
                        registration_id: registration.id,
                        event_id,
                        position,
                        timestamp: now,
                    });
                    tracing::info!(registration_id = %registration.id, %event_id, position, "waitlisted");
                    return Ok(RegistrationOutcome::Waitlisted {
                        registration,
                        position,
                    });
                }
                AcquireOutcome::Acquired => {}
            }

            // Spot acquired: pick the initial occupying status.
            if price == 0 {
                registration.place(RegistrationStatus::Confirmed, now);
                tx.upsert_registration(&registration).await?;
                tx.commit().await?;
                self.after_confirmation(&event, &registration).await;
                let _ = self.signals.publish(RegistrationSignal::RegistrationConfirmed {
                    registration_id: registration.id,
                    event_id,
                    via_promotion: false,
                    timestamp: now,
                });
                tracing::info!(registration_id = %registration.id, %event_id, "confirmed (free)");
                return Ok(RegistrationOutcome::Confirmed { registration });
            }

            if event.manual_payment_enabled {
                let due_at = event.manual_payment_due_from(now);
                registration.place(RegistrationStatus::ManualPaymentRequired, now);
                registration.manual_payment_due_at = Some(due_at);
                tx.upsert_registration(&registration).await?;
                tx.commit().await?;
                let _ = self.signals.publish(RegistrationSignal::ManualPaymentRequested {
                    registration_id: registration.id,
                    event_id,
                    due_at,
                    timestamp: now,
                });
                tracing::info!(registration_id = %registration.id, %event_id, %due_at, "manual payment required");
                return Ok(RegistrationOutcome::ManualPaymentRequired {
                    registration,
                    amount_cents: price,
                    currency: event.currency.clone(),
                    transfer_reference: event.transfer_reference(),
                    instructions: event.manual_payment_instructions.clone(),
                    due_at,
                });
            }

            // Online gateway path.
            let created = self
                .payments
                .create_payment(
                    price,
                    &event.currency,
                    &user_id.to_string(),
                    return_url,
                    cancel_url,
                )
                .await?;
            registration.place(RegistrationStatus::PendingPayment, now);
            registration.payment_reference = Some(created.id.clone());
            tx.upsert_registration(&registration).await?;
            tx.commit().await?;
            tracing::info!(registration_id = %registration.id, %event_id, payment_id = %created.id, "awaiting online payment");
            return Ok(RegistrationOutcome::PaymentPending {
                registration,
                payment_id: created.id,
                redirect_url: created.redirect_url,
            });
        }

        Err(EngineError::ConcurrencyConflict { attempts })
    }

    /// Cancels a user's own registration, gated by the cutoff window.
    ///
    /// # Errors
    ///
    /// - [`EngineError::RegistrationNotFound`] — unknown row, a row
    ///   owned by someone else, or a row already terminal.
    /// - [`EngineError::CancellationWindowClosed`] — inside the cutoff;
    ///   nothing is mutated.
    pub async fn cancel(
        &self,
        registration_id: RegistrationId,
        user_id: UserId,
    ) -> Result<CancellationOutcome, EngineError> {
        self.cancel_inner(registration_id, Some(user_id), true).await
    }

    /// Cancels any registration with admin authority, bypassing the
    /// cutoff window. A post-cutoff admin cancellation yields a refund
    /// task that is not refund-eligible.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RegistrationNotFound`] for an unknown or
    /// already-terminal row.
    pub async fn cancel_admin(
        &self,
        registration_id: RegistrationId,
    ) -> Result<CancellationOutcome, EngineError> {
        self.cancel_inner(registration_id, None, false).await
    }

    async fn cancel_inner(
        &self,
        registration_id: RegistrationId,
        requester: Option<UserId>,
        enforce_cutoff: bool,
    ) -> Result<CancellationOutcome, EngineError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut registration = tx
            .registration_by_id(registration_id)
            .await?
            .ok_or(EngineError::RegistrationNotFound(*registration_id.as_uuid()))?;
        if let Some(user_id) = requester
            && registration.user_id != user_id
        {
            // Ownership mismatch reads as not-found; no existence leak.
            return Err(EngineError::RegistrationNotFound(*registration_id.as_uuid()));
        }

        let event = tx
            .event_by_id(registration.event_id)
            .await?
            .ok_or(EngineError::EventNotFound(*registration.event_id.as_uuid()))?;

        let previous_status = registration.status;
        let was_occupying = previous_status.occupies_capacity();

        if was_occupying && enforce_cutoff && !event.cancellation_window_open(now) {
            return Err(EngineError::CancellationWindowClosed {
                cutoff_hours: event.cancellation_cutoff_hours,
            });
        }

        registration.cancel(now)?;
        tx.upsert_registration(&registration).await?;

        let mut refund_task = None;
        let mut promoted = None;
        if was_occupying {
            let refund_eligible = event.cancellation_window_open(now);
            let has_payment = registration.payment_reference.is_some();
            let task = match tx.refund_task_for_registration(registration.id).await? {
                Some(mut existing) => {
                    existing.reevaluate(refund_eligible, has_payment, now);
                    existing
                }
                None => RefundTask::evaluate(registration.id, refund_eligible, has_payment, now),
            };
            tx.upsert_refund_task(&task).await?;
            refund_task = Some(task);

            promoted = promotion::promote_next(
                tx.as_mut(),
                &event,
                self.membership.as_ref(),
                self.notify.as_ref(),
                now,
            )
            .await?;
        }

        tx.commit().await?;

        let _ = self.signals.publish(RegistrationSignal::RegistrationCancelled {
            registration_id: registration.id,
            event_id: registration.event_id,
            previous_status,
            timestamp: now,
        });
        if let Some(promoted) = &promoted {
            let _ = self.signals.publish(RegistrationSignal::WaitlistPromoted {
                registration_id: promoted.id,
                event_id: promoted.event_id,
                new_status: promoted.status,
                timestamp: now,
            });
            if promoted.status == RegistrationStatus::Confirmed {
                let _ = self.signals.publish(RegistrationSignal::RegistrationConfirmed {
                    registration_id: promoted.id,
                    event_id: promoted.event_id,
                    via_promotion: true,
                    timestamp: now,
                });
            }
        }

        tracing::info!(
            registration_id = %registration.id,
            previous_status = %previous_status,
            promoted = promoted.is_some(),
            "registration cancelled"
        );
        Ok(CancellationOutcome {
            registration,
            refund_task,
            promoted: promoted.map(|r| r.id),
        })
    }

    /// User declares their bank transfer for a manual-payment
    /// registration.
    ///
    /// # Errors
    ///
    /// - [`EngineError::RegistrationNotFound`] — unknown row or wrong
    ///   owner.
    /// - [`EngineError::NotAwaitingPayment`] — row is not in
    ///   `manual_payment_required`.
    /// - [`EngineError::InvalidAmount`] — computed price is not
    ///   positive.
    /// - [`EngineError::DeadlineExceeded`] — declared after the due
    ///   time; the row is left untouched.
    pub async fn confirm_manual_payment(
        &self,
        registration_id: RegistrationId,
        user_id: UserId,
    ) -> Result<RegistrationOutcome, EngineError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut registration = tx
            .registration_by_id(registration_id)
            .await?
            .ok_or(EngineError::RegistrationNotFound(*registration_id.as_uuid()))?;
        if registration.user_id != user_id {
            return Err(EngineError::RegistrationNotFound(*registration_id.as_uuid()));
        }
        let event = tx
            .event_by_id(registration.event_id)
            .await?
            .ok_or(EngineError::EventNotFound(*registration.event_id.as_uuid()))?;

        if registration.status != RegistrationStatus::ManualPaymentRequired {
            return Err(EngineError::NotAwaitingPayment {
                status: registration.status.to_string(),
            });
        }
        let is_subscriber = self.membership.is_active_subscriber(user_id, now).await?;
        let price = event.price_cents(is_subscriber);
        if price <= 0 {
            return Err(EngineError::InvalidAmount);
        }

        registration.declare_manual_payment(now)?;

        // Reuse an existing payment record; otherwise open one in a
        // processing state awaiting the admin's verification.
        let payment_reference = match registration.payment_reference.clone() {
            Some(reference) => reference,
            None => {
                let created = self
                    .payments
                    .create_payment(price, &event.currency, &user_id.to_string(), "", "")
                    .await?;
                registration.payment_reference = Some(created.id.clone());
                created.id
            }
        };

        tx.upsert_registration(&registration).await?;
        tx.commit().await?;

        let _ = self.signals.publish(RegistrationSignal::ManualPaymentDeclared {
            registration_id: registration.id,
            event_id: registration.event_id,
            payment_reference,
            timestamp: now,
        });
        tracing::info!(registration_id = %registration.id, "manual payment declared");
        Ok(RegistrationOutcome::AwaitingVerification { registration })
    }

    /// Admin approves a declared bank transfer: settles the linked
    /// payment and confirms the registration.
    ///
    /// # Errors
    ///
    /// - [`EngineError::RegistrationNotFound`] — unknown row.
    /// - [`EngineError::NotAwaitingVerification`] — row not awaiting
    ///   verification; a second approval lands here every time.
    /// - [`EngineError::Payment`] — the payment could not be settled.
    pub async fn approve_manual_payment(
        &self,
        registration_id: RegistrationId,
    ) -> Result<Registration, EngineError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut registration = tx
            .registration_by_id(registration_id)
            .await?
            .ok_or(EngineError::RegistrationNotFound(*registration_id.as_uuid()))?;
        let event = tx
            .event_by_id(registration.event_id)
            .await?
            .ok_or(EngineError::EventNotFound(*registration.event_id.as_uuid()))?;

        registration.approve_manual_payment(now)?;
        if let Some(reference) = &registration.payment_reference {
            self.payments.complete_payment(reference).await?;
        }

        tx.upsert_registration(&registration).await?;
        tx.commit().await?;

        self.after_confirmation(&event, &registration).await;
        let _ = self.signals.publish(RegistrationSignal::RegistrationConfirmed {
            registration_id: registration.id,
            event_id: registration.event_id,
            via_promotion: false,
            timestamp: now,
        });
        tracing::info!(registration_id = %registration.id, "manual payment approved");
        Ok(registration)
    }

    /// Confirms a pending online registration after the gateway
    /// reports the payment completed (the return-URL path).
    ///
    /// # Errors
    ///
    /// - [`EngineError::RegistrationNotFound`] — unknown row.
    /// - [`EngineError::NotAwaitingPayment`] — row is not pending an
    ///   online payment.
    /// - [`EngineError::Payment`] — reference mismatch or the gateway
    ///   does not report the payment as completed.
    pub async fn complete_online_payment(
        &self,
        registration_id: RegistrationId,
        payment_id: &str,
    ) -> Result<RegistrationOutcome, EngineError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut registration = tx
            .registration_by_id(registration_id)
            .await?
            .ok_or(EngineError::RegistrationNotFound(*registration_id.as_uuid()))?;
        if registration.status != RegistrationStatus::PendingPayment {
            return Err(EngineError::NotAwaitingPayment {
                status: registration.status.to_string(),
            });
        }
        if registration.payment_reference.as_deref() != Some(payment_id) {
            return Err(EngineError::Payment(format!(
                "payment {payment_id} does not belong to registration {registration_id}"
            )));
        }
        let status = self.payments.verify_payment(payment_id).await?;
        if status != PaymentStatus::Completed {
            return Err(EngineError::Payment(format!(
                "payment {payment_id} is not completed ({status:?})"
            )));
        }
        let event = tx
            .event_by_id(registration.event_id)
            .await?
            .ok_or(EngineError::EventNotFound(*registration.event_id.as_uuid()))?;

        registration.confirm(now);
        tx.upsert_registration(&registration).await?;
        tx.commit().await?;

        self.after_confirmation(&event, &registration).await;
        let _ = self.signals.publish(RegistrationSignal::RegistrationConfirmed {
            registration_id: registration.id,
            event_id: registration.event_id,
            via_promotion: false,
            timestamp: now,
        });
        tracing::info!(registration_id = %registration.id, payment_id, "online payment completed");
        Ok(RegistrationOutcome::Confirmed { registration })
    }

    /// Ingests a gateway webhook. A completed payment confirms its
    /// pending registration; a failed payment moves the row to
    /// `failed` and frees the spot, promoting the next in line.
    ///
    /// Returns the updated registration, or `None` when the webhook
    /// matched no pending row (already processed, or not ours).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Payment`] on a bad signature or payload,
    /// [`EngineError::Persistence`] on storage failure.
    pub async fn handle_payment_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<Option<Registration>, EngineError> {
        let now = Utc::now();
        let webhook = self.payments.process_webhook(payload, signature).await?;

        let mut tx = self.store.begin().await?;
        let Some(mut registration) = tx
            .registration_by_payment_reference(&webhook.payment_id)
            .await?
        else {
            tracing::debug!(payment_id = %webhook.payment_id, "webhook matched no registration");
            return Ok(None);
        };
        if registration.status != RegistrationStatus::PendingPayment {
            return Ok(None);
        }
        let event = tx
            .event_by_id(registration.event_id)
            .await?
            .ok_or(EngineError::EventNotFound(*registration.event_id.as_uuid()))?;

        match webhook.status {
            PaymentStatus::Completed => {
                registration.confirm(now);
                tx.upsert_registration(&registration).await?;
                tx.commit().await?;
                self.after_confirmation(&event, &registration).await;
                let _ = self.signals.publish(RegistrationSignal::RegistrationConfirmed {
                    registration_id: registration.id,
                    event_id: registration.event_id,
                    via_promotion: false,
                    timestamp: now,
                });
                Ok(Some(registration))
            }
            PaymentStatus::Failed => {
                registration.fail(now);
                tx.upsert_registration(&registration).await?;
                // The failed row freed a spot; promote inline, same as
                // a cancellation would.
                let promoted = promotion::promote_next(
                    tx.as_mut(),
                    &event,
                    self.membership.as_ref(),
                    self.notify.as_ref(),
                    now,
                )
                .await?;
                tx.commit().await?;
                if let Some(promoted) = promoted {
                    let _ = self.signals.publish(RegistrationSignal::WaitlistPromoted {
                        registration_id: promoted.id,
                        event_id: promoted.event_id,
                        new_status: promoted.status,
                        timestamp: now,
                    });
                }
                tracing::info!(registration_id = %registration.id, "online payment failed");
                Ok(Some(registration))
            }
            PaymentStatus::Created | PaymentStatus::Processing | PaymentStatus::Refunded => {
                Ok(None)
            }
        }
    }

    /// Admin reviews a refund task: follow the recommendation,
    /// override it with a justification, or mark the refund paid.
    /// Marking paid executes the refund against the linked payment and
    /// moves the registration to `refunded`; repeating it is
    /// idempotent.
    ///
    /// # Errors
    ///
    /// - [`EngineError::RefundTaskNotFound`] — unknown task.
    /// - [`EngineError::OverrideReasonRequired`] — divergence from the
    ///   recommendation without an adequate reason.
    /// - [`EngineError::InvalidRefundState`] — payout invariant
    ///   violations.
    /// - [`EngineError::Payment`] — the gateway rejected the refund.
    pub async fn update_refund_task(
        &self,
        task_id: RefundTaskId,
        reviewer: &str,
        patch: RefundTaskPatch,
    ) -> Result<RefundTask, EngineError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut task = tx
            .refund_task_by_id(task_id)
            .await?
            .ok_or(EngineError::RefundTaskNotFound(*task_id.as_uuid()))?;

        let effect = task.apply_patch(&patch, reviewer, self.config.override_reason_min_len, now)?;
        match effect {
            RefundUpdateEffect::AlreadyPaid => {
                // Idempotent repeat: report the resolved state, touch
                // nothing.
                return Ok(task);
            }
            RefundUpdateEffect::None => {
                tx.upsert_refund_task(&task).await?;
                tx.commit().await?;
            }
            RefundUpdateEffect::ExecuteRefund => {
                let mut registration = tx
                    .registration_by_id(task.registration_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Internal(format!(
                            "refund task {task_id} references missing registration"
                        ))
                    })?;
                if let Some(reference) = &registration.payment_reference {
                    let result = self.payments.refund(reference, "refund approved").await?;
                    if !result.success {
                        return Err(EngineError::Payment(format!(
                            "gateway declined refund for payment {reference}"
                        )));
                    }
                }
                registration.mark_refunded(now)?;
                tx.upsert_registration(&registration).await?;
                tx.upsert_refund_task(&task).await?;
                tx.commit().await?;
                let _ = self.signals.publish(RegistrationSignal::RefundExecuted {
                    task_id: task.id,
                    registration_id: task.registration_id,
                    timestamp: now,
                });
            }
        }

        let _ = self.signals.publish(RegistrationSignal::RefundTaskReviewed {
            task_id: task.id,
            registration_id: task.registration_id,
            resolved: task.is_resolved(),
            timestamp: now,
        });
        tracing::info!(%task_id, reviewer, resolved = task.is_resolved(), "refund task updated");
        Ok(task)
    }

    /// Returns a point-in-time availability snapshot for an event.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::EventNotFound`] for an unknown event,
    /// [`EngineError::Persistence`] on storage failure.
    pub async fn availability(&self, event_id: EventId) -> Result<Availability, EngineError> {
        let mut tx = self.store.begin().await?;
        let event = tx
            .event_by_id(event_id)
            .await?
            .ok_or(EngineError::EventNotFound(*event_id.as_uuid()))?;
        let occurrence = event.occurrence_date();

        let occupying = tx.occupying_count(event_id, occurrence).await?;
        let confirmed_count = tx
            .status_count(event_id, occurrence, RegistrationStatus::Confirmed)
            .await?;
        let waitlist_count = tx
            .status_count(event_id, occurrence, RegistrationStatus::Waitlist)
            .await?;
        // Read-only: the transaction is dropped, not committed.

        let available_spots = event
            .capacity
            .map(|capacity| (i64::from(capacity) - occupying).max(0));
        let is_available = available_spots.is_none_or(|spots| spots > 0);

        Ok(Availability {
            confirmed_count,
            waitlist_count,
            available_spots,
            is_available,
        })
    }

    /// Best-effort side effects after a confirmation: attendance
    /// points and calendar sync. Failures are logged and swallowed;
    /// they never roll back the confirmation.
    async fn after_confirmation(&self, event: &Event, registration: &Registration) {
        if event.points_awarded > 0
            && let Err(err) = self
                .membership
                .award_points(registration.user_id, event.points_awarded)
                .await
        {
            tracing::warn!(user_id = %registration.user_id, %err, "points award failed");
        }
        if let Err(err) = self.notify.sync_calendar(registration.user_id, event).await {
            tracing::warn!(user_id = %registration.user_id, %err, "calendar sync failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate};

    use super::*;
    use crate::domain::RefundRecommendation;
    use crate::ports::{FakePaymentGateway, NoopNotifier, StaticMembership};
    use crate::store::{MemoryStore, StoreTx};

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: Arc<FakePaymentGateway>,
        membership: Arc<StaticMembership>,
        engine: RegistrationEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakePaymentGateway::new());
        let membership = Arc::new(StaticMembership::new());
        let engine = RegistrationEngine::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&gateway) as Arc<dyn PaymentPort>,
            Arc::clone(&membership) as Arc<dyn MembershipPort>,
            Arc::new(NoopNotifier),
            EngineConfig::default(),
        );
        Harness {
            store,
            gateway,
            membership,
            engine,
        }
    }

    fn free_event(capacity: Option<i32>) -> Event {
        let mut event = Event::new(
            EventId::new(),
            "weekly training",
            Utc::now() + Duration::hours(72),
        );
        event.capacity = capacity;
        event
    }

    fn manual_event(capacity: Option<i32>, price: i64) -> Event {
        let mut event = free_event(capacity);
        event.price_subscriber_cents = price;
        event.price_guest_cents = price;
        event.manual_payment_enabled = true;
        event.manual_payment_instructions = Some("IBAN DE02 1234 5678".to_string());
        event
    }

    fn online_event(capacity: Option<i32>, guest_price: i64) -> Event {
        let mut event = free_event(capacity);
        event.price_guest_cents = guest_price;
        event
    }

    #[tokio::test]
    async fn free_registration_confirms_and_bumps_version() {
        let h = harness();
        let event = free_event(Some(5));
        h.store.seed_event(event.clone()).await;

        let outcome = h
            .engine
            .register(UserId::new(), event.id, "http://r", "http://c")
            .await;
        let Ok(RegistrationOutcome::Confirmed { registration }) = outcome else {
            panic!("expected a confirmation");
        };
        assert_eq!(registration.status, RegistrationStatus::Confirmed);

        let Some(stored) = h.store.event(event.id).await else {
            panic!("event vanished");
        };
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn full_event_waitlists_instead_of_failing() {
        let h = harness();
        let event = free_event(Some(1));
        h.store.seed_event(event.clone()).await;

        let first = h
            .engine
            .register(UserId::new(), event.id, "", "")
            .await;
        assert!(matches!(first, Ok(RegistrationOutcome::Confirmed { .. })));

        let second = h
            .engine
            .register(UserId::new(), event.id, "", "")
            .await;
        let Ok(RegistrationOutcome::Waitlisted { registration, position }) = second else {
            panic!("expected a waitlist placement");
        };
        assert_eq!(position, 1);
        assert_eq!(registration.status, RegistrationStatus::Waitlist);

        // Waitlist placements do not touch the version token.
        let Some(stored) = h.store.event(event.id).await else {
            panic!("event vanished");
        };
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let h = harness();
        let event = free_event(Some(5));
        h.store.seed_event(event.clone()).await;
        let user = UserId::new();

        assert!(h.engine.register(user, event.id, "", "").await.is_ok());
        let second = h.engine.register(user, event.id, "", "").await;
        assert!(matches!(second, Err(EngineError::AlreadyRegistered)));
    }

    #[tokio::test]
    async fn started_event_is_rejected() {
        let h = harness();
        let mut event = free_event(Some(5));
        event.start_at = Utc::now() - Duration::hours(1);
        h.store.seed_event(event.clone()).await;

        let outcome = h.engine.register(UserId::new(), event.id, "", "").await;
        assert!(matches!(outcome, Err(EngineError::PastEvent)));
    }

    #[tokio::test]
    async fn subscriber_gate_blocks_guests_only() {
        let h = harness();
        let mut event = free_event(Some(5));
        event.requires_active_subscription = true;
        h.store.seed_event(event.clone()).await;

        let guest = UserId::new();
        let outcome = h.engine.register(guest, event.id, "", "").await;
        assert!(matches!(outcome, Err(EngineError::SubscriptionRequired)));

        let subscriber = UserId::new();
        h.membership.add_subscriber(subscriber);
        let outcome = h.engine.register(subscriber, event.id, "", "").await;
        assert!(matches!(outcome, Ok(RegistrationOutcome::Confirmed { .. })));
    }

    #[tokio::test]
    async fn price_tier_follows_subscription() {
        let h = harness();
        // Free for subscribers, paid checkout for guests.
        let event = online_event(Some(5), 5000);
        h.store.seed_event(event.clone()).await;

        let subscriber = UserId::new();
        h.membership.add_subscriber(subscriber);
        let outcome = h.engine.register(subscriber, event.id, "", "").await;
        assert!(matches!(outcome, Ok(RegistrationOutcome::Confirmed { .. })));

        let guest = UserId::new();
        let outcome = h
            .engine
            .register(guest, event.id, "http://r", "http://c")
            .await;
        let Ok(RegistrationOutcome::PaymentPending { payment_id, redirect_url, .. }) = outcome
        else {
            panic!("expected a pending online payment");
        };
        assert_eq!(payment_id, "pay-1");
        assert!(redirect_url.contains("pay-1"));
    }

    #[tokio::test]
    async fn cancellation_promotes_oldest_waitlisted() {
        let h = harness();
        let event = free_event(Some(1));
        h.store.seed_event(event.clone()).await;

        let Ok(RegistrationOutcome::Confirmed { registration: holder }) =
            h.engine.register(UserId::new(), event.id, "", "").await
        else {
            panic!("first registration failed");
        };
        let Ok(RegistrationOutcome::Waitlisted { registration: second, .. }) =
            h.engine.register(UserId::new(), event.id, "", "").await
        else {
            panic!("second registration failed");
        };
        let Ok(RegistrationOutcome::Waitlisted { registration: third, .. }) =
            h.engine.register(UserId::new(), event.id, "", "").await
        else {
            panic!("third registration failed");
        };

        let outcome = h.engine.cancel(holder.id, holder.user_id).await;
        let Ok(outcome) = outcome else {
            panic!("cancellation failed");
        };
        assert_eq!(outcome.registration.status, RegistrationStatus::Cancelled);
        assert_eq!(outcome.promoted, Some(second.id));

        // Free cancellation with no payment on file.
        let Some(task) = outcome.refund_task else {
            panic!("expected a refund task");
        };
        assert_eq!(task.recommendation(), RefundRecommendation::NoRefundNoPayment);

        let Some(promoted) = h.store.registration(second.id).await else {
            panic!("promoted row vanished");
        };
        assert_eq!(promoted.status, RegistrationStatus::Confirmed);
        let Some(still_queued) = h.store.registration(third.id).await else {
            panic!("third row vanished");
        };
        assert_eq!(still_queued.status, RegistrationStatus::Waitlist);
    }

    #[tokio::test]
    async fn cancellation_inside_cutoff_is_rejected() {
        let h = harness();
        // Starts in 10h with the default 24h cutoff: window closed.
        let mut event = free_event(Some(5));
        event.start_at = Utc::now() + Duration::hours(10);
        h.store.seed_event(event.clone()).await;

        let Ok(RegistrationOutcome::Confirmed { registration }) =
            h.engine.register(UserId::new(), event.id, "", "").await
        else {
            panic!("registration failed");
        };

        let outcome = h.engine.cancel(registration.id, registration.user_id).await;
        assert!(matches!(
            outcome,
            Err(EngineError::CancellationWindowClosed { cutoff_hours: 24 })
        ));
        let Some(stored) = h.store.registration(registration.id).await else {
            panic!("row vanished");
        };
        assert_eq!(stored.status, RegistrationStatus::Confirmed);
    }

    #[tokio::test]
    async fn admin_cancellation_bypasses_cutoff_without_refund() {
        let h = harness();
        let mut event = free_event(Some(5));
        event.start_at = Utc::now() + Duration::hours(10);
        h.store.seed_event(event.clone()).await;

        let Ok(RegistrationOutcome::Confirmed { registration }) =
            h.engine.register(UserId::new(), event.id, "", "").await
        else {
            panic!("registration failed");
        };

        let outcome = h.engine.cancel_admin(registration.id).await;
        let Ok(outcome) = outcome else {
            panic!("admin cancellation failed");
        };
        assert_eq!(outcome.registration.status, RegistrationStatus::Cancelled);
        let Some(task) = outcome.refund_task else {
            panic!("expected a refund task");
        };
        assert!(!task.refund_eligible);
        assert_eq!(
            task.recommendation(),
            RefundRecommendation::NoRefundCancelledAfterCutoff
        );
    }

    #[tokio::test]
    async fn waitlist_cancellation_skips_cutoff_and_refund() {
        let h = harness();
        let mut event = free_event(Some(1));
        event.start_at = Utc::now() + Duration::hours(10);
        h.store.seed_event(event.clone()).await;

        let Ok(RegistrationOutcome::Confirmed { .. }) =
            h.engine.register(UserId::new(), event.id, "", "").await
        else {
            panic!("first registration failed");
        };
        let Ok(RegistrationOutcome::Waitlisted { registration, .. }) =
            h.engine.register(UserId::new(), event.id, "", "").await
        else {
            panic!("second registration failed");
        };

        // Leaving the queue never touches capacity, so the closed
        // window does not apply.
        let outcome = h.engine.cancel(registration.id, registration.user_id).await;
        let Ok(outcome) = outcome else {
            panic!("waitlist cancellation failed");
        };
        assert!(outcome.refund_task.is_none());
        assert!(outcome.promoted.is_none());
    }

    #[tokio::test]
    async fn reactivation_reuses_the_row() {
        let h = harness();
        let event = free_event(Some(5));
        h.store.seed_event(event.clone()).await;
        let user = UserId::new();

        let Ok(RegistrationOutcome::Confirmed { registration: first }) =
            h.engine.register(user, event.id, "", "").await
        else {
            panic!("registration failed");
        };
        assert!(h.engine.cancel(first.id, user).await.is_ok());

        let Ok(RegistrationOutcome::Confirmed { registration: second }) =
            h.engine.register(user, event.id, "", "").await
        else {
            panic!("re-registration failed");
        };
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, RegistrationStatus::Confirmed);
    }

    #[tokio::test]
    async fn manual_payment_flow_declares_then_approves() {
        let h = harness();
        let event = manual_event(Some(5), 5000);
        h.store.seed_event(event.clone()).await;
        let user = UserId::new();

        let outcome = h.engine.register(user, event.id, "", "").await;
        let Ok(RegistrationOutcome::ManualPaymentRequired {
            registration,
            amount_cents,
            transfer_reference,
            due_at,
            ..
        }) = outcome
        else {
            panic!("expected a manual payment requirement");
        };
        assert_eq!(amount_cents, 5000);
        assert_eq!(transfer_reference, event.id.to_string());
        assert!(due_at > Utc::now());

        let declared = h.engine.confirm_manual_payment(registration.id, user).await;
        let Ok(RegistrationOutcome::AwaitingVerification { registration }) = declared else {
            panic!("expected awaiting-verification");
        };
        assert_eq!(
            registration.status,
            RegistrationStatus::ManualPaymentVerification
        );
        assert_eq!(registration.payment_reference.as_deref(), Some("pay-1"));

        let approved = h.engine.approve_manual_payment(registration.id).await;
        let Ok(approved) = approved else {
            panic!("approval failed");
        };
        assert_eq!(approved.status, RegistrationStatus::Confirmed);
        assert_eq!(
            h.gateway.status_of("pay-1"),
            Some(crate::ports::PaymentStatus::Completed)
        );
    }

    #[tokio::test]
    async fn declaration_after_deadline_is_rejected_without_mutation() {
        let h = harness();
        let event = manual_event(Some(5), 5000);
        h.store.seed_event(event.clone()).await;
        let user = UserId::new();

        let Ok(RegistrationOutcome::ManualPaymentRequired { registration, .. }) =
            h.engine.register(user, event.id, "", "").await
        else {
            panic!("registration failed");
        };

        // Push the deadline into the past.
        {
            let Ok(mut tx) = h.store.begin().await else {
                panic!("begin failed");
            };
            let Ok(Some(mut row)) = tx.registration_by_id(registration.id).await else {
                panic!("row vanished");
            };
            row.manual_payment_due_at = Some(Utc::now() - Duration::hours(1));
            let _ = tx.upsert_registration(&row).await;
            let _ = tx.commit().await;
        }

        let declared = h.engine.confirm_manual_payment(registration.id, user).await;
        assert!(matches!(declared, Err(EngineError::DeadlineExceeded { .. })));
        let Some(stored) = h.store.registration(registration.id).await else {
            panic!("row vanished");
        };
        assert_eq!(stored.status, RegistrationStatus::ManualPaymentRequired);
        assert!(stored.manual_payment_declared_at.is_none());
    }

    #[tokio::test]
    async fn declaration_against_zero_price_is_rejected() {
        let h = harness();
        // Paid for guests, free for subscribers.
        let mut event = manual_event(Some(5), 5000);
        event.price_subscriber_cents = 0;
        h.store.seed_event(event.clone()).await;
        let user = UserId::new();

        let Ok(RegistrationOutcome::ManualPaymentRequired { registration, .. }) =
            h.engine.register(user, event.id, "", "").await
        else {
            panic!("registration failed");
        };

        // The tier changed between the hold and the declaration: there
        // is nothing left to pay.
        h.membership.add_subscriber(user);

        let declared = h.engine.confirm_manual_payment(registration.id, user).await;
        assert!(matches!(declared, Err(EngineError::InvalidAmount)));

        let Some(stored) = h.store.registration(registration.id).await else {
            panic!("row vanished");
        };
        assert_eq!(stored.status, RegistrationStatus::ManualPaymentRequired);
        assert!(stored.payment_reference.is_none());
        assert!(stored.manual_payment_declared_at.is_none());
    }

    #[tokio::test]
    async fn second_cancellation_reuses_the_refund_task() {
        let h = harness();
        let event = free_event(Some(5));
        h.store.seed_event(event.clone()).await;
        let user = UserId::new();

        let Ok(RegistrationOutcome::Confirmed { registration }) =
            h.engine.register(user, event.id, "", "").await
        else {
            panic!("registration failed");
        };
        let Ok(first) = h.engine.cancel(registration.id, user).await else {
            panic!("first cancellation failed");
        };
        let Some(first_task) = first.refund_task else {
            panic!("expected a refund task");
        };

        // Review the task so the later reset is observable.
        let reviewed = h
            .engine
            .update_refund_task(first_task.id, "admin", RefundTaskPatch::default())
            .await;
        let Ok(reviewed) = reviewed else {
            panic!("review failed");
        };
        assert!(reviewed.reviewed_at.is_some());

        let Ok(RegistrationOutcome::Confirmed { registration }) =
            h.engine.register(user, event.id, "", "").await
        else {
            panic!("re-registration failed");
        };
        let Ok(second) = h.engine.cancel(registration.id, user).await else {
            panic!("second cancellation failed");
        };
        let Some(second_task) = second.refund_task else {
            panic!("expected a refund task");
        };

        // The task is 1:1 with the row: reset in place, never duplicated.
        assert_eq!(second_task.id, first_task.id);
        assert!(second_task.reviewed_at.is_none());
        assert!(second_task.reviewed_by.is_none());
        assert!(!second_task.marked_paid);
    }

    #[tokio::test]
    async fn second_approval_is_a_stable_conflict() {
        let h = harness();
        let event = manual_event(Some(5), 5000);
        h.store.seed_event(event.clone()).await;
        let user = UserId::new();

        let Ok(RegistrationOutcome::ManualPaymentRequired { registration, .. }) =
            h.engine.register(user, event.id, "", "").await
        else {
            panic!("registration failed");
        };
        let _ = h.engine.confirm_manual_payment(registration.id, user).await;
        assert!(h.engine.approve_manual_payment(registration.id).await.is_ok());

        let second = h.engine.approve_manual_payment(registration.id).await;
        assert!(matches!(
            second,
            Err(EngineError::NotAwaitingVerification { .. })
        ));
        let third = h.engine.approve_manual_payment(registration.id).await;
        assert!(matches!(
            third,
            Err(EngineError::NotAwaitingVerification { .. })
        ));
    }

    #[tokio::test]
    async fn online_payment_confirms_only_when_settled() {
        let h = harness();
        let event = online_event(Some(5), 5000);
        h.store.seed_event(event.clone()).await;
        let user = UserId::new();

        let Ok(RegistrationOutcome::PaymentPending { registration, payment_id, .. }) = h
            .engine
            .register(user, event.id, "http://r", "http://c")
            .await
        else {
            panic!("expected a pending payment");
        };

        // Gateway still reports the payment in flight.
        let early = h
            .engine
            .complete_online_payment(registration.id, &payment_id)
            .await;
        assert!(matches!(early, Err(EngineError::Payment(_))));

        assert!(h.gateway.settle(&payment_id).is_ok());
        let done = h
            .engine
            .complete_online_payment(registration.id, &payment_id)
            .await;
        assert!(matches!(done, Ok(RegistrationOutcome::Confirmed { .. })));
    }

    #[tokio::test]
    async fn webhook_completion_confirms_pending_registration() {
        let h = harness();
        let event = online_event(Some(5), 5000);
        h.store.seed_event(event.clone()).await;

        let Ok(RegistrationOutcome::PaymentPending { registration, payment_id, .. }) =
            h.engine.register(UserId::new(), event.id, "", "").await
        else {
            panic!("expected a pending payment");
        };

        let payload = format!(r#"{{"payment_id":"{payment_id}","status":"completed"}}"#);
        let result = h
            .engine
            .handle_payment_webhook(payload.as_bytes(), FakePaymentGateway::WEBHOOK_SIGNATURE)
            .await;
        let Ok(Some(updated)) = result else {
            panic!("webhook did not match");
        };
        assert_eq!(updated.id, registration.id);
        assert_eq!(updated.status, RegistrationStatus::Confirmed);
    }

    #[tokio::test]
    async fn failed_payment_frees_the_spot_and_promotes() {
        let h = harness();
        // Guests pay online, subscribers go free.
        let event = online_event(Some(1), 5000);
        h.store.seed_event(event.clone()).await;

        let guest = UserId::new();
        let Ok(RegistrationOutcome::PaymentPending { registration: pending, payment_id, .. }) =
            h.engine.register(guest, event.id, "", "").await
        else {
            panic!("expected a pending payment");
        };

        let subscriber = UserId::new();
        h.membership.add_subscriber(subscriber);
        let Ok(RegistrationOutcome::Waitlisted { registration: queued, .. }) =
            h.engine.register(subscriber, event.id, "", "").await
        else {
            panic!("expected a waitlist placement");
        };

        let payload = format!(r#"{{"payment_id":"{payment_id}","status":"failed"}}"#);
        let result = h
            .engine
            .handle_payment_webhook(payload.as_bytes(), FakePaymentGateway::WEBHOOK_SIGNATURE)
            .await;
        let Ok(Some(failed)) = result else {
            panic!("webhook did not match");
        };
        assert_eq!(failed.status, RegistrationStatus::Failed);

        let Some(pending_row) = h.store.registration(pending.id).await else {
            panic!("pending row vanished");
        };
        assert_eq!(pending_row.status, RegistrationStatus::Failed);
        let Some(promoted) = h.store.registration(queued.id).await else {
            panic!("queued row vanished");
        };
        assert_eq!(promoted.status, RegistrationStatus::Confirmed);
    }

    #[tokio::test]
    async fn webhook_for_unknown_payment_is_ignored() {
        let h = harness();
        let payload = br#"{"payment_id":"pay-404","status":"completed"}"#;
        let result = h
            .engine
            .handle_payment_webhook(payload, FakePaymentGateway::WEBHOOK_SIGNATURE)
            .await;
        assert!(matches!(result, Ok(None)));
    }

    async fn cancelled_paid_registration(h: &Harness, event: &Event) -> (RegistrationId, RefundTask) {
        let user = UserId::new();
        let Ok(RegistrationOutcome::ManualPaymentRequired { registration, .. }) =
            h.engine.register(user, event.id, "", "").await
        else {
            panic!("registration failed");
        };
        let _ = h.engine.confirm_manual_payment(registration.id, user).await;
        let Ok(confirmed) = h.engine.approve_manual_payment(registration.id).await else {
            panic!("approval failed");
        };

        let Ok(outcome) = h.engine.cancel(confirmed.id, user).await else {
            panic!("cancellation failed");
        };
        let Some(task) = outcome.refund_task else {
            panic!("expected a refund task");
        };
        (confirmed.id, task)
    }

    #[tokio::test]
    async fn marking_paid_executes_the_refund_once() {
        let h = harness();
        let event = manual_event(Some(5), 5000);
        h.store.seed_event(event.clone()).await;
        let (registration_id, task) = cancelled_paid_registration(&h, &event).await;
        assert_eq!(
            task.recommendation(),
            RefundRecommendation::RefundCancelledBeforeCutoff
        );

        let patch = RefundTaskPatch {
            marked_paid: Some(true),
            ..RefundTaskPatch::default()
        };
        let updated = h.engine.update_refund_task(task.id, "admin", patch.clone()).await;
        let Ok(updated) = updated else {
            panic!("refund update failed");
        };
        assert!(updated.marked_paid);
        assert!(updated.is_resolved());
        assert_eq!(updated.recommendation(), RefundRecommendation::RefundCompleted);

        let Some(row) = h.store.registration(registration_id).await else {
            panic!("row vanished");
        };
        assert_eq!(row.status, RegistrationStatus::Refunded);
        assert_eq!(h.gateway.refund_count(), 1);

        // Repeating the patch reports the same state without a second
        // payout.
        let repeat = h.engine.update_refund_task(task.id, "admin", patch).await;
        assert!(matches!(repeat, Ok(t) if t.marked_paid));
        assert_eq!(h.gateway.refund_count(), 1);
        let Some(row) = h.store.registration(registration_id).await else {
            panic!("row vanished");
        };
        assert_eq!(row.status, RegistrationStatus::Refunded);
    }

    #[tokio::test]
    async fn override_requires_a_substantive_reason() {
        let h = harness();
        let event = manual_event(Some(5), 5000);
        h.store.seed_event(event.clone()).await;
        let (_, task) = cancelled_paid_registration(&h, &event).await;

        let bare = RefundTaskPatch {
            should_refund: Some(false),
            ..RefundTaskPatch::default()
        };
        let result = h.engine.update_refund_task(task.id, "admin", bare).await;
        assert!(matches!(
            result,
            Err(EngineError::OverrideReasonRequired { min_len: 8 })
        ));

        let justified = RefundTaskPatch {
            should_refund: Some(false),
            override_reason: Some("user asked to keep it as a donation".to_string()),
            ..RefundTaskPatch::default()
        };
        let result = h.engine.update_refund_task(task.id, "admin", justified).await;
        let Ok(updated) = result else {
            panic!("override failed");
        };
        assert!(updated.is_resolved());
        assert_eq!(
            updated.recommendation(),
            RefundRecommendation::NoRefundAdminOverride
        );
        assert_eq!(h.gateway.refund_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_registrations_never_oversell() {
        let h = harness();
        let event = free_event(Some(3));
        h.store.seed_event(event.clone()).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = h.engine.clone();
            let event_id = event.id;
            handles.push(tokio::spawn(async move {
                engine.register(UserId::new(), event_id, "", "").await
            }));
        }

        let mut confirmed = 0;
        let mut waitlisted = 0;
        for handle in handles {
            let Ok(outcome) = handle.await else {
                panic!("task panicked");
            };
            match outcome {
                Ok(RegistrationOutcome::Confirmed { .. }) => confirmed += 1,
                Ok(RegistrationOutcome::Waitlisted { .. }) => waitlisted += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(confirmed, 3);
        assert_eq!(waitlisted, 7);

        let Ok(availability) = h.engine.availability(event.id).await else {
            panic!("availability failed");
        };
        assert_eq!(availability.confirmed_count, 3);
        assert_eq!(availability.waitlist_count, 7);
        assert_eq!(availability.available_spots, Some(0));
        assert!(!availability.is_available);
    }

    #[tokio::test]
    async fn unlimited_capacity_is_always_available() {
        let h = harness();
        let event = free_event(None);
        h.store.seed_event(event.clone()).await;
        assert!(h.engine.register(UserId::new(), event.id, "", "").await.is_ok());

        let Ok(availability) = h.engine.availability(event.id).await else {
            panic!("availability failed");
        };
        assert_eq!(availability.available_spots, None);
        assert!(availability.is_available);
    }

    /// Store decorator that makes the next N version bumps fail, to
    /// simulate lost capacity races deterministically.
    #[derive(Debug)]
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn begin(&self) -> Result<Box<dyn StoreTx>, EngineError> {
            Ok(Box::new(FlakyTx {
                inner: self.inner.begin().await?,
                failures_left: Arc::clone(&self.failures_left),
            }))
        }
    }

    struct FlakyTx {
        inner: Box<dyn StoreTx>,
        failures_left: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StoreTx for FlakyTx {
        async fn event_by_id(&mut self, id: EventId) -> Result<Option<Event>, EngineError> {
            self.inner.event_by_id(id).await
        }

        async fn bump_event_version(
            &mut self,
            id: EventId,
            expected_version: i64,
        ) -> Result<bool, EngineError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Ok(false);
            }
            self.inner.bump_event_version(id, expected_version).await
        }

        async fn registration_by_id(
            &mut self,
            id: RegistrationId,
        ) -> Result<Option<Registration>, EngineError> {
            self.inner.registration_by_id(id).await
        }

        async fn registration_by_payment_reference(
            &mut self,
            payment_reference: &str,
        ) -> Result<Option<Registration>, EngineError> {
            self.inner
                .registration_by_payment_reference(payment_reference)
                .await
        }

        async fn registration_for_user(
            &mut self,
            user_id: UserId,
            event_id: EventId,
            occurrence_date: NaiveDate,
        ) -> Result<Option<Registration>, EngineError> {
            self.inner
                .registration_for_user(user_id, event_id, occurrence_date)
                .await
        }

        async fn occupying_count(
            &mut self,
            event_id: EventId,
            occurrence_date: NaiveDate,
        ) -> Result<i64, EngineError> {
            self.inner.occupying_count(event_id, occurrence_date).await
        }

        async fn status_count(
            &mut self,
            event_id: EventId,
            occurrence_date: NaiveDate,
            status: RegistrationStatus,
        ) -> Result<i64, EngineError> {
            self.inner
                .status_count(event_id, occurrence_date, status)
                .await
        }

        async fn oldest_waitlisted(
            &mut self,
            event_id: EventId,
            occurrence_date: NaiveDate,
        ) -> Result<Option<Registration>, EngineError> {
            self.inner.oldest_waitlisted(event_id, occurrence_date).await
        }

        async fn upsert_registration(
            &mut self,
            registration: &Registration,
        ) -> Result<(), EngineError> {
            self.inner.upsert_registration(registration).await
        }

        async fn refund_task_by_id(
            &mut self,
            id: RefundTaskId,
        ) -> Result<Option<RefundTask>, EngineError> {
            self.inner.refund_task_by_id(id).await
        }

        async fn refund_task_for_registration(
            &mut self,
            registration_id: RegistrationId,
        ) -> Result<Option<RefundTask>, EngineError> {
            self.inner.refund_task_for_registration(registration_id).await
        }

        async fn upsert_refund_task(&mut self, task: &RefundTask) -> Result<(), EngineError> {
            self.inner.upsert_refund_task(task).await
        }

        async fn commit(self: Box<Self>) -> Result<(), EngineError> {
            self.inner.commit().await
        }
    }

    fn flaky_harness(failures: u32) -> (Harness, Arc<AtomicU32>) {
        let memory = MemoryStore::new();
        let failures_left = Arc::new(AtomicU32::new(failures));
        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            failures_left: Arc::clone(&failures_left),
        });
        let gateway = Arc::new(FakePaymentGateway::new());
        let membership = Arc::new(StaticMembership::new());
        let engine = RegistrationEngine::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&gateway) as Arc<dyn PaymentPort>,
            Arc::clone(&membership) as Arc<dyn MembershipPort>,
            Arc::new(NoopNotifier),
            EngineConfig::default(),
        );
        (
            Harness {
                store: Arc::new(memory),
                gateway,
                membership,
                engine,
            },
            failures_left,
        )
    }

    #[tokio::test]
    async fn lost_races_are_retried_within_the_budget() {
        let (h, _) = flaky_harness(2);
        let event = free_event(Some(5));
        h.store.seed_event(event.clone()).await;

        // Two lost races, success on the third and final attempt.
        let outcome = h.engine.register(UserId::new(), event.id, "", "").await;
        assert!(matches!(outcome, Ok(RegistrationOutcome::Confirmed { .. })));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_a_conflict() {
        let (h, _) = flaky_harness(10);
        let event = free_event(Some(5));
        h.store.seed_event(event.clone()).await;

        let outcome = h.engine.register(UserId::new(), event.id, "", "").await;
        assert!(matches!(
            outcome,
            Err(EngineError::ConcurrencyConflict { attempts: 3 })
        ));

        // Nothing was written.
        let Some(stored) = h.store.event(event.id).await else {
            panic!("event vanished");
        };
        assert_eq!(stored.version, 0);
    }
}
