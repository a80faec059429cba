//! Database row models and their domain conversions.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::domain::{Event, RefundTask, Registration, RegistrationStatus};
use crate::error::EngineError;

/// A row from the `events` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    /// Event identifier.
    pub id: Uuid,
    /// Human-readable title.
    pub title: String,
    /// Capacity, NULL = unlimited.
    pub capacity: Option<i32>,
    /// Optimistic lock token.
    pub version: i64,
    /// Subscriber price, minor units.
    pub price_subscriber_cents: i64,
    /// Guest price, minor units.
    pub price_guest_cents: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Subscriber-only gate.
    pub requires_active_subscription: bool,
    /// Bank-transfer mode flag.
    pub manual_payment_enabled: bool,
    /// Transfer instructions.
    pub manual_payment_instructions: Option<String>,
    /// Transfer declaration window, hours.
    pub manual_payment_deadline_hours: i64,
    /// Cancellation cutoff before start, hours.
    pub cancellation_cutoff_hours: i64,
    /// Attendance points.
    pub points_awarded: i32,
    /// Event start, UTC.
    pub start_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id.into(),
            title: row.title,
            capacity: row.capacity,
            version: row.version,
            price_subscriber_cents: row.price_subscriber_cents,
            price_guest_cents: row.price_guest_cents,
            currency: row.currency,
            requires_active_subscription: row.requires_active_subscription,
            manual_payment_enabled: row.manual_payment_enabled,
            manual_payment_instructions: row.manual_payment_instructions,
            manual_payment_deadline_hours: row.manual_payment_deadline_hours,
            cancellation_cutoff_hours: row.cancellation_cutoff_hours,
            points_awarded: row.points_awarded,
            start_at: row.start_at,
        }
    }
}

/// A row from the `registrations` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegistrationRow {
    /// Row identifier.
    pub id: Uuid,
    /// Registering user.
    pub user_id: Uuid,
    /// Target event.
    pub event_id: Uuid,
    /// Occurrence date key.
    pub occurrence_date: NaiveDate,
    /// Status string (see [`RegistrationStatus::as_str`]).
    pub status: String,
    /// Linked payment reference.
    pub payment_reference: Option<String>,
    /// Bank-transfer declaration time.
    pub manual_payment_declared_at: Option<DateTime<Utc>>,
    /// Bank-transfer deadline.
    pub manual_payment_due_at: Option<DateTime<Utc>>,
    /// Promotion timestamp.
    pub promoted_from_waitlist_at: Option<DateTime<Utc>>,
    /// Promotion notification flag.
    pub waitlist_notification_sent: bool,
    /// Promotion notification time.
    pub waitlist_notified_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RegistrationRow> for Registration {
    type Error = EngineError;

    fn try_from(row: RegistrationRow) -> Result<Self, Self::Error> {
        let status: RegistrationStatus = row.status.parse()?;
        Ok(Self {
            id: row.id.into(),
            user_id: row.user_id.into(),
            event_id: row.event_id.into(),
            occurrence_date: row.occurrence_date,
            status,
            payment_reference: row.payment_reference,
            manual_payment_declared_at: row.manual_payment_declared_at,
            manual_payment_due_at: row.manual_payment_due_at,
            promoted_from_waitlist_at: row.promoted_from_waitlist_at,
            waitlist_notification_sent: row.waitlist_notification_sent,
            waitlist_notified_at: row.waitlist_notified_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// A row from the `refund_tasks` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefundTaskRow {
    /// Task identifier.
    pub id: Uuid,
    /// Reviewed registration (unique).
    pub registration_id: Uuid,
    /// Cutoff eligibility at cancellation time.
    pub refund_eligible: bool,
    /// System recommendation.
    pub recommended_refund: bool,
    /// Admin decision.
    pub should_refund: bool,
    /// Refund executed flag.
    pub marked_paid: bool,
    /// Override justification.
    pub override_reason: Option<String>,
    /// Last review time.
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Last reviewer.
    pub reviewed_by: Option<String>,
    /// Task creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl From<RefundTaskRow> for RefundTask {
    fn from(row: RefundTaskRow) -> Self {
        Self {
            id: row.id.into(),
            registration_id: row.registration_id.into(),
            refund_eligible: row.refund_eligible,
            recommended_refund: row.recommended_refund,
            should_refund: row.should_refund,
            marked_paid: row.marked_paid,
            override_reason: row.override_reason,
            reviewed_at: row.reviewed_at,
            reviewed_by: row.reviewed_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
