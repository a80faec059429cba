//! Payment port: the engine's only window onto payment processing.
//!
//! The engine never talks to a gateway directly. Production wires a
//! real gateway adapter; tests and local runs wire the deterministic
//! [`FakePaymentGateway`]. Either way the adapter is constructed by the
//! embedding application and injected into the engine — never held as
//! process-wide state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Gateway-side status of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Created, checkout not yet started.
    Created,
    /// In flight: checkout started or bank transfer awaited.
    Processing,
    /// Settled.
    Completed,
    /// Failed or abandoned.
    Failed,
    /// Refunded after settlement.
    Refunded,
}

/// Result of creating a payment.
#[derive(Debug, Clone)]
pub struct CreatedPayment {
    /// Gateway payment identifier; stored on the registration as its
    /// opaque payment reference.
    pub id: String,
    /// Initial status.
    pub status: PaymentStatus,
    /// Checkout URL to redirect the user to (empty for manual
    /// transfers, which have no checkout).
    pub redirect_url: String,
}

/// Result of executing a refund.
#[derive(Debug, Clone)]
pub struct RefundResult {
    /// Whether the gateway accepted the refund.
    pub success: bool,
    /// Gateway refund identifier.
    pub refund_id: String,
}

/// Parsed result of a gateway webhook.
#[derive(Debug, Clone)]
pub struct WebhookResult {
    /// The payment the webhook concerns.
    pub payment_id: String,
    /// Its reported status.
    pub status: PaymentStatus,
}

/// Narrow port to the payment collaborator.
#[async_trait]
pub trait PaymentPort: Send + Sync + std::fmt::Debug {
    /// Creates a payment, returning its identifier and checkout URL.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Payment`] on gateway failure.
    async fn create_payment(
        &self,
        amount_cents: i64,
        currency: &str,
        payer_ref: &str,
        return_url: &str,
        cancel_url: &str,
    ) -> Result<CreatedPayment, EngineError>;

    /// Fetches the current status of a payment.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Payment`] when the payment is unknown or
    /// the gateway fails.
    async fn verify_payment(&self, payment_id: &str) -> Result<PaymentStatus, EngineError>;

    /// Settles a payment out of band. Used by the manual-payment
    /// approval step, where an admin — not the gateway — attests that
    /// the money arrived.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Payment`] when the payment is unknown or
    /// cannot be settled from its current status.
    async fn complete_payment(&self, payment_id: &str) -> Result<(), EngineError>;

    /// Refunds a settled payment.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Payment`] when the payment is unknown or
    /// not refundable.
    async fn refund(&self, payment_id: &str, reason: &str) -> Result<RefundResult, EngineError>;

    /// Validates and parses an incoming gateway webhook.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Payment`] on a bad signature or an
    /// unparseable payload.
    async fn process_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookResult, EngineError>;
}

/// Stored state of one fake payment.
#[derive(Debug, Clone)]
struct FakePayment {
    status: PaymentStatus,
    amount_cents: i64,
    currency: String,
    refund_id: Option<String>,
}

/// Deterministic in-process payment gateway for tests and local runs.
///
/// Payment IDs are sequential (`pay-1`, `pay-2`, …) so tests can assert
/// on them. All transitions are explicit; nothing settles on its own.
#[derive(Debug, Default)]
pub struct FakePaymentGateway {
    payments: Mutex<HashMap<String, FakePayment>>,
    next_id: AtomicU64,
}

impl FakePaymentGateway {
    /// Signature every fake webhook must carry.
    pub const WEBHOOK_SIGNATURE: &'static str = "fake-signature";

    /// Creates an empty fake gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the user completing an online checkout, as the real
    /// gateway would report via webhook.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Payment`] for an unknown payment.
    pub fn settle(&self, payment_id: &str) -> Result<(), EngineError> {
        let mut payments = self.lock();
        let payment = payments
            .get_mut(payment_id)
            .ok_or_else(|| EngineError::Payment(format!("unknown payment {payment_id}")))?;
        payment.status = PaymentStatus::Completed;
        Ok(())
    }

    /// Returns the recorded status of a payment, for test assertions.
    #[must_use]
    pub fn status_of(&self, payment_id: &str) -> Option<PaymentStatus> {
        self.lock().get(payment_id).map(|p| p.status)
    }

    /// Returns how many refunds have been executed, for test assertions.
    #[must_use]
    pub fn refund_count(&self) -> usize {
        self.lock().values().filter(|p| p.refund_id.is_some()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FakePayment>> {
        // A poisoned mutex means a panicking test thread; carry on with
        // the inner state.
        match self.payments.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PaymentPort for FakePaymentGateway {
    async fn create_payment(
        &self,
        amount_cents: i64,
        currency: &str,
        payer_ref: &str,
        _return_url: &str,
        _cancel_url: &str,
    ) -> Result<CreatedPayment, EngineError> {
        if amount_cents <= 0 {
            return Err(EngineError::Payment(format!(
                "non-positive amount {amount_cents} for payer {payer_ref}"
            )));
        }
        let id = format!("pay-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().insert(
            id.clone(),
            FakePayment {
                status: PaymentStatus::Processing,
                amount_cents,
                currency: currency.to_string(),
                refund_id: None,
            },
        );
        Ok(CreatedPayment {
            redirect_url: format!("https://fake.gateway/checkout/{id}"),
            id,
            status: PaymentStatus::Processing,
        })
    }

    async fn verify_payment(&self, payment_id: &str) -> Result<PaymentStatus, EngineError> {
        self.lock()
            .get(payment_id)
            .map(|p| p.status)
            .ok_or_else(|| EngineError::Payment(format!("unknown payment {payment_id}")))
    }

    async fn complete_payment(&self, payment_id: &str) -> Result<(), EngineError> {
        let mut payments = self.lock();
        let payment = payments
            .get_mut(payment_id)
            .ok_or_else(|| EngineError::Payment(format!("unknown payment {payment_id}")))?;
        match payment.status {
            PaymentStatus::Created | PaymentStatus::Processing => {
                payment.status = PaymentStatus::Completed;
                Ok(())
            }
            other => Err(EngineError::Payment(format!(
                "payment {payment_id} cannot be completed from {other:?}"
            ))),
        }
    }

    async fn refund(&self, payment_id: &str, _reason: &str) -> Result<RefundResult, EngineError> {
        let mut payments = self.lock();
        let payment = payments
            .get_mut(payment_id)
            .ok_or_else(|| EngineError::Payment(format!("unknown payment {payment_id}")))?;
        match payment.status {
            PaymentStatus::Completed => {
                let refund_id = format!("re-{payment_id}");
                payment.status = PaymentStatus::Refunded;
                payment.refund_id = Some(refund_id.clone());
                Ok(RefundResult {
                    success: true,
                    refund_id,
                })
            }
            // Refunding twice returns the original refund, no new one.
            PaymentStatus::Refunded => Ok(RefundResult {
                success: true,
                refund_id: payment
                    .refund_id
                    .clone()
                    .unwrap_or_else(|| format!("re-{payment_id}")),
            }),
            other => Err(EngineError::Payment(format!(
                "payment {payment_id} not refundable from {other:?} ({} {})",
                payment.amount_cents, payment.currency
            ))),
        }
    }

    async fn process_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookResult, EngineError> {
        if signature != Self::WEBHOOK_SIGNATURE {
            return Err(EngineError::Payment("bad webhook signature".to_string()));
        }
        #[derive(Deserialize)]
        struct WebhookPayload {
            payment_id: String,
            status: PaymentStatus,
        }
        let parsed: WebhookPayload = serde_json::from_slice(payload)
            .map_err(|e| EngineError::Payment(format!("unparseable webhook: {e}")))?;
        let mut payments = self.lock();
        if let Some(payment) = payments.get_mut(&parsed.payment_id) {
            payment.status = parsed.status;
        }
        Ok(WebhookResult {
            payment_id: parsed.payment_id,
            status: parsed.status,
        })
    }
}
