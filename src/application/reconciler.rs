//! Turns parsed provider callbacks into payment and order state.
//!
//! The reconciler is the only place that marks an order paid. Each callback
//! is matched to exactly one payment through the provider's correlation
//! value, and the payment moves to a terminal state at most once no matter
//! how often the provider retries.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};

use super::blocking;
use crate::domain::errors::DomainError;
use crate::domain::order::{Order, OrderStatus};
use crate::domain::payment::{
    CallbackOutcome, CallbackResult, Payment, SettleResult, Settlement, SettlementKind,
};
use crate::domain::ports::{Notifier, OrderRepository, PaymentRepository};

pub const AMOUNT_MISMATCH: &str = "amount mismatch";

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// No payment carries the callback's correlation value.
    Unmatched,
    /// The payment had already settled; nothing changed.
    Duplicate(Payment),
    Completed(Payment),
    Failed(Payment),
}

pub struct Reconciler {
    orders: Arc<dyn OrderRepository>,
    payments: Arc<dyn PaymentRepository>,
    notifier: Arc<dyn Notifier>,
}

impl Reconciler {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        payments: Arc<dyn PaymentRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            orders,
            payments,
            notifier,
        }
    }

    pub async fn reconcile(&self, outcome: CallbackOutcome) -> Result<Reconciliation, DomainError> {
        let payments = self.payments.clone();
        let provider = outcome.provider;
        let reference = outcome.reference.clone();
        let attempt_id = outcome.attempt_id;
        let found = blocking(move || {
            if let Some(payment) = payments.find_by_reference(provider, &reference)? {
                return Ok(Some(payment));
            }
            // The callback beat the provider's response to initiation.
            match attempt_id {
                Some(id) => Ok(payments.find_by_id(id)?.filter(|p| p.provider == provider)),
                None => Ok(None),
            }
        })
        .await?;
        let Some(payment) = found else {
            debug!(
                "No {} payment carries reference {}",
                outcome.provider, outcome.reference
            );
            return Ok(Reconciliation::Unmatched);
        };

        let kind = match outcome.result {
            CallbackResult::Succeeded { amount, .. }
                if amount.as_ref().is_some_and(|paid| *paid < payment.amount) =>
            {
                warn!(
                    "{} payment {} reported {:?} against {} expected",
                    payment.provider, payment.provider_reference, amount, payment.amount
                );
                SettlementKind::Failed {
                    reason: AMOUNT_MISMATCH.to_string(),
                }
            }
            CallbackResult::Succeeded { receipt, .. } => SettlementKind::Completed { receipt },
            CallbackResult::Failed { reason } => SettlementKind::Failed { reason },
        };

        if !kind.applies_to(payment.status) {
            info!(
                "Duplicate {} callback for {} ignored, payment already {}",
                payment.provider, payment.provider_reference, payment.status
            );
            return Ok(Reconciliation::Duplicate(payment));
        }

        let completed = matches!(kind, SettlementKind::Completed { .. });
        let settlement = Settlement {
            payment_id: payment.id,
            kind,
            raw_payload: outcome.raw,
            at: Utc::now(),
        };
        let payments = self.payments.clone();
        let settled = match blocking(move || payments.settle(settlement)).await? {
            SettleResult::Applied(settled) => settled,
            SettleResult::AlreadyTerminal(settled) => {
                info!(
                    "{} payment {} was settled concurrently, ignoring",
                    settled.provider, settled.provider_reference
                );
                return Ok(Reconciliation::Duplicate(settled));
            }
        };

        if !completed {
            info!(
                "{} payment {} failed: {}",
                settled.provider,
                settled.provider_reference,
                settled.failure_reason.as_deref().unwrap_or("unknown")
            );
            return Ok(Reconciliation::Failed(settled));
        }

        info!(
            "{} payment {} completed ({} {})",
            settled.provider, settled.provider_reference, settled.amount, settled.currency
        );
        if let Some(order) = self.load_order(&settled).await? {
            if order.status == OrderStatus::Cancelled {
                error!(
                    "Order {} was cancelled but {} payment {} succeeded; refund required",
                    order.order_number, settled.provider, settled.provider_reference
                );
            } else {
                self.notify_paid(order);
            }
        }
        Ok(Reconciliation::Completed(settled))
    }

    async fn load_order(&self, payment: &Payment) -> Result<Option<Order>, DomainError> {
        let Some(order_id) = payment.order_id else {
            return Ok(None);
        };
        let orders = self.orders.clone();
        blocking(move || orders.find_by_id(order_id)).await
    }

    fn notify_paid(&self, order: Order) {
        let notifier = self.notifier.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = notifier.payment_received(&order) {
                warn!("Could not send payment receipt for {}: {e}", order.order_number);
            }
        });
    }
}
