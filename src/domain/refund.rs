//! Refund review tasks and the recommendation protocol.
//!
//! Every cancellation of a capacity-occupying registration produces
//! exactly one [`RefundTask`]. The engine computes eligibility and a
//! recommendation; an admin may follow it, override it with a written
//! justification, or mark the refund as executed. The recommendation
//! code is always derived from the task's current fields, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RefundTaskId, RegistrationId};
use crate::error::EngineError;

/// Derived classification of a refund task, shown to admins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundRecommendation {
    /// Cancelled before the cutoff with a payment on file: refund it.
    RefundCancelledBeforeCutoff,
    /// Cancelled after the cutoff: no refund.
    NoRefundCancelledAfterCutoff,
    /// Eligible, but there is no payment to refund.
    NoRefundNoPayment,
    /// Refund executed; task resolved.
    RefundCompleted,
    /// Admin overrode the recommendation towards refunding.
    RefundAdminOverride,
    /// Admin overrode the recommendation towards not refunding.
    NoRefundAdminOverride,
}

/// Admin-supplied partial update to a refund task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundTaskPatch {
    /// New refund decision, if the admin is changing it.
    pub should_refund: Option<bool>,
    /// Mark the refund as executed.
    pub marked_paid: Option<bool>,
    /// Justification, required when diverging from the recommendation.
    pub override_reason: Option<String>,
}

/// Side effect the orchestrator must perform after a task update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundUpdateEffect {
    /// Pure field update, nothing external to do.
    None,
    /// First transition to `marked_paid`: execute the refund against
    /// the linked payment and move the registration to `refunded`.
    ExecuteRefund,
    /// Idempotent repeat of `marked_paid`: return current state, no
    /// duplicate side effects.
    AlreadyPaid,
}

/// Decision record for one cancelled registration (1:1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundTask {
    /// Task identifier.
    pub id: RefundTaskId,
    /// The cancelled registration this task reviews.
    pub registration_id: RegistrationId,
    /// Whether the cancellation happened before the cutoff.
    pub refund_eligible: bool,
    /// System recommendation: eligible and a payment exists.
    pub recommended_refund: bool,
    /// Admin decision; defaults to the recommendation.
    pub should_refund: bool,
    /// Whether the refund has been executed.
    pub marked_paid: bool,
    /// Justification for diverging from the recommendation.
    pub override_reason: Option<String>,
    /// When an admin last reviewed the task.
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Which admin last reviewed the task.
    pub reviewed_by: Option<String>,
    /// Task creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl RefundTask {
    /// Evaluates a fresh task at cancellation time.
    #[must_use]
    pub fn evaluate(
        registration_id: RegistrationId,
        refund_eligible: bool,
        has_payment: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let recommended_refund = refund_eligible && has_payment;
        Self {
            id: RefundTaskId::new(),
            registration_id,
            refund_eligible,
            recommended_refund,
            should_refund: recommended_refund,
            marked_paid: false,
            override_reason: None,
            reviewed_at: None,
            reviewed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-evaluates the existing task when its registration is
    /// cancelled again after a reactivation. The task is 1:1 with the
    /// row, so it is reset rather than recreated.
    pub fn reevaluate(&mut self, refund_eligible: bool, has_payment: bool, now: DateTime<Utc>) {
        let recommended_refund = refund_eligible && has_payment;
        self.refund_eligible = refund_eligible;
        self.recommended_refund = recommended_refund;
        self.should_refund = recommended_refund;
        self.marked_paid = false;
        self.override_reason = None;
        self.reviewed_at = None;
        self.reviewed_by = None;
        self.updated_at = now;
    }

    /// Returns `true` once no further admin action is expected.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.marked_paid || (self.reviewed_at.is_some() && !self.should_refund)
    }

    /// Derives the recommendation code from the current fields.
    #[must_use]
    pub fn recommendation(&self) -> RefundRecommendation {
        if self.marked_paid {
            return RefundRecommendation::RefundCompleted;
        }
        if self.reviewed_at.is_some() && self.should_refund != self.recommended_refund {
            return if self.should_refund {
                RefundRecommendation::RefundAdminOverride
            } else {
                RefundRecommendation::NoRefundAdminOverride
            };
        }
        if !self.refund_eligible {
            RefundRecommendation::NoRefundCancelledAfterCutoff
        } else if self.recommended_refund {
            RefundRecommendation::RefundCancelledBeforeCutoff
        } else {
            RefundRecommendation::NoRefundNoPayment
        }
    }

    /// Applies an admin patch, enforcing the override and payout
    /// invariants. Returns the side effect the orchestrator owes.
    ///
    /// # Errors
    ///
    /// - [`EngineError::OverrideReasonRequired`] when `should_refund`
    ///   diverges from the recommendation without a justification of at
    ///   least `reason_min_len` characters.
    /// - [`EngineError::InvalidRefundState`] when marking paid with
    ///   `should_refund` false, un-marking a paid task, or flipping the
    ///   decision on an already-paid task.
    pub fn apply_patch(
        &mut self,
        patch: &RefundTaskPatch,
        reviewer: &str,
        reason_min_len: usize,
        now: DateTime<Utc>,
    ) -> Result<RefundUpdateEffect, EngineError> {
        let next_should_refund = patch.should_refund.unwrap_or(self.should_refund);
        let next_marked_paid = patch.marked_paid.unwrap_or(self.marked_paid);

        if self.marked_paid && !next_marked_paid {
            return Err(EngineError::InvalidRefundState(
                "a paid task cannot be un-marked".to_string(),
            ));
        }
        if self.marked_paid && next_should_refund != self.should_refund {
            return Err(EngineError::InvalidRefundState(
                "decision on a paid task is final".to_string(),
            ));
        }
        if next_marked_paid && !next_should_refund {
            return Err(EngineError::InvalidRefundState(
                "marked_paid requires should_refund".to_string(),
            ));
        }

        if next_should_refund != self.recommended_refund {
            let reason = patch
                .override_reason
                .as_deref()
                .or(self.override_reason.as_deref())
                .unwrap_or("");
            if reason.trim().chars().count() < reason_min_len {
                return Err(EngineError::OverrideReasonRequired {
                    min_len: reason_min_len,
                });
            }
        }

        // Idempotent repeat: the task is already paid and the patch
        // changes nothing that survived the checks above.
        if self.marked_paid && next_marked_paid {
            return Ok(RefundUpdateEffect::AlreadyPaid);
        }

        self.should_refund = next_should_refund;
        if let Some(reason) = &patch.override_reason {
            self.override_reason = Some(reason.clone());
        }
        self.reviewed_at = Some(now);
        self.reviewed_by = Some(reviewer.to_string());
        self.updated_at = now;

        if next_marked_paid {
            self.marked_paid = true;
            Ok(RefundUpdateEffect::ExecuteRefund)
        } else {
            Ok(RefundUpdateEffect::None)
        }
    }
}
