//! In-process implementation of the storage ports.
//!
//! All state sits behind one mutex, so each port call is atomic just like a
//! database transaction in the diesel adapter. Used by tests and local demos.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::domain::errors::DomainError;
use crate::domain::order::{
    page_offset, ListResult, NewOrder, Order, OrderLine, OrderPaymentStatus, OrderStatus, StatusChange,
    StatusHistoryEntry,
};
use crate::domain::payment::{
    AttemptOutcome, AttemptUpdate, NewPayment, Payment, PaymentMethod, PaymentStatus,
    SettleResult, Settlement, SettlementKind,
};
use crate::domain::ports::{OrderRepository, PaymentRepository, ProductCatalog};
use crate::domain::product::{Product, StockLevel};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
}

#[derive(Default)]
struct State {
    products: HashMap<Uuid, Product>,
    orders: HashMap<Uuid, Order>,
    payments: HashMap<Uuid, Payment>,
    outbox: Vec<RecordedEvent>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, DomainError> {
        self.state
            .lock()
            .map_err(|_| DomainError::Internal("in-memory store poisoned".to_string()))
    }

    pub fn add_product(&self, product: Product) {
        if let Ok(mut state) = self.lock() {
            state.products.insert(product.id, product);
        }
    }

    pub fn stock_of(&self, product_id: Uuid) -> Option<i32> {
        self.lock()
            .ok()
            .and_then(|s| s.products.get(&product_id).map(|p| p.stock))
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().map(|s| s.outbox.clone()).unwrap_or_default()
    }

    pub fn payments_for(&self, order_id: Uuid) -> Vec<Payment> {
        self.lock()
            .map(|s| {
                s.payments
                    .values()
                    .filter(|p| p.order_id == Some(order_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rewrites an order's creation time; lets tests age orders.
    pub fn backdate_order(&self, id: Uuid, created_at: DateTime<Utc>) {
        if let Ok(mut state) = self.lock() {
            if let Some(order) = state.orders.get_mut(&id) {
                order.created_at = created_at;
            }
        }
    }
}

fn record(state: &mut State, order_id: Uuid, event_type: &str, payload: Value) {
    state.outbox.push(RecordedEvent {
        aggregate_id: order_id.to_string(),
        event_type: event_type.to_string(),
        payload,
    });
}

impl ProductCatalog for InMemoryStore {
    fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Product>, DomainError> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.products.get(id).cloned())
            .collect())
    }
}

impl OrderRepository for InMemoryStore {
    fn create(&self, order: NewOrder) -> Result<(Order, Vec<StockLevel>), DomainError> {
        let mut state = self.lock()?;
        if state
            .orders
            .values()
            .any(|o| o.order_number == order.order_number)
        {
            return Err(DomainError::Conflict(format!(
                "order number {} already exists",
                order.order_number
            )));
        }

        // Check every line before touching any counter.
        for line in &order.lines {
            let product = state
                .products
                .get(&line.product_id)
                .ok_or(DomainError::ProductNotFound(line.product_id))?;
            if !product.is_active {
                return Err(DomainError::ProductInactive(product.name.clone()));
            }
            if product.stock < line.quantity {
                return Err(DomainError::OutOfStock {
                    product: product.name.clone(),
                    requested: line.quantity,
                    available: product.stock,
                });
            }
        }
        let mut levels = Vec::with_capacity(order.lines.len());
        for line in &order.lines {
            if let Some(product) = state.products.get_mut(&line.product_id) {
                product.stock -= line.quantity;
                levels.push(StockLevel {
                    product_id: product.id,
                    stock: product.stock,
                    low_stock_alert: product.low_stock_alert,
                });
            }
        }

        let now = Utc::now();
        let stored = Order {
            id: order.id,
            order_number: order.order_number,
            customer_id: order.customer_id,
            status: order.status,
            payment_status: OrderPaymentStatus::Pending,
            payment_method: order.payment_method,
            payment_reference: None,
            lines: order
                .lines
                .into_iter()
                .map(|l| OrderLine {
                    id: Uuid::new_v4(),
                    product_id: l.product_id,
                    product_name: l.product_name,
                    unit_price: l.unit_price,
                    quantity: l.quantity,
                    line_total: l.line_total,
                })
                .collect(),
            shipping_address: order.shipping_address,
            subtotal: order.totals.subtotal,
            shipping_cost: order.totals.shipping_cost,
            tax: order.totals.tax,
            total: order.totals.total,
            currency: order.currency,
            tracking_number: None,
            paid_at: None,
            history: vec![StatusHistoryEntry {
                status: order.status,
                note: Some("order placed".to_string()),
                created_at: now,
            }],
            created_at: now,
            updated_at: now,
        };
        record(
            &mut state,
            stored.id,
            "OrderCreated",
            json!({
                "order_id": stored.id,
                "order_number": stored.order_number,
                "status": stored.status.as_str(),
                "total": stored.total.to_string(),
            }),
        );
        state.orders.insert(stored.id, stored.clone());
        Ok((stored, levels))
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, DomainError> {
        Ok(self.lock()?.orders.get(&id).cloned())
    }

    fn list(&self, customer_id: Option<Uuid>, page: i64, limit: i64) -> Result<ListResult, DomainError> {
        let state = self.lock()?;
        let mut matching: Vec<&Order> = state
            .orders
            .values()
            .filter(|o| customer_id.map_or(true, |c| o.customer_id == c))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as i64;
        let offset = page_offset(page, limit)? as usize;
        let items = matching
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(ListResult { items, total })
    }

    fn change_status(&self, id: Uuid, change: StatusChange) -> Result<Order, DomainError> {
        let mut state = self.lock()?;
        let order = state.orders.get(&id).cloned().ok_or(DomainError::NotFound)?;
        if order.status != change.from {
            return Err(DomainError::Conflict(format!(
                "order {} is {} not {}",
                order.order_number, order.status, change.from
            )));
        }
        if change.only_if_unpaid && order.is_paid() {
            return Err(DomainError::Conflict(format!(
                "order {} has already been paid",
                order.order_number
            )));
        }
        if change.release_stock {
            for line in &order.lines {
                if let Some(product) = state.products.get_mut(&line.product_id) {
                    product.stock += line.quantity;
                }
            }
        }
        let now = Utc::now();
        let mut payments_cancelled = 0;
        if change.to == OrderStatus::Cancelled {
            for payment in state.payments.values_mut() {
                if payment.order_id == Some(id)
                    && matches!(payment.status, PaymentStatus::Pending | PaymentStatus::Processing)
                {
                    payment.status = PaymentStatus::Cancelled;
                    payment.updated_at = now;
                    payments_cancelled += 1;
                }
            }
        }
        let updated = {
            let entry = state.orders.get_mut(&id).ok_or(DomainError::NotFound)?;
            entry.status = change.to;
            if change.tracking_number.is_some() {
                entry.tracking_number = change.tracking_number.clone();
            }
            entry.updated_at = now;
            entry.history.push(StatusHistoryEntry {
                status: change.to,
                note: change.note.clone(),
                created_at: now,
            });
            entry.clone()
        };
        let event_type = if change.to == OrderStatus::Cancelled {
            "OrderCancelled"
        } else {
            "OrderStatusChanged"
        };
        record(
            &mut state,
            id,
            event_type,
            json!({
                "order_id": id,
                "from": change.from.as_str(),
                "to": change.to.as_str(),
                "note": change.note,
                "stock_released": change.release_stock,
                "payments_cancelled": payments_cancelled,
            }),
        );
        Ok(updated)
    }

    fn set_payment_reference(&self, id: Uuid, reference: &str) -> Result<(), DomainError> {
        let mut state = self.lock()?;
        let order = state.orders.get_mut(&id).ok_or(DomainError::NotFound)?;
        order.payment_reference = Some(reference.to_string());
        order.updated_at = Utc::now();
        Ok(())
    }

    fn find_unpaid_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, DomainError> {
        let state = self.lock()?;
        Ok(state
            .orders
            .values()
            .filter(|o| {
                o.payment_method.is_pay_now()
                    && o.payment_status == OrderPaymentStatus::Pending
                    && o.status == OrderStatus::Pending
                    && o.created_at < cutoff
            })
            .cloned()
            .collect())
    }
}

impl PaymentRepository for InMemoryStore {
    fn insert(&self, payment: NewPayment) -> Result<Payment, DomainError> {
        let mut state = self.lock()?;
        if state.payments.values().any(|p| {
            p.provider == payment.provider && p.provider_reference == payment.provider_reference
        }) {
            return Err(DomainError::Conflict(format!(
                "{} payment {} already recorded",
                payment.provider, payment.provider_reference
            )));
        }
        let now = Utc::now();
        let stored = Payment {
            id: payment.id,
            order_id: payment.order_id,
            provider: payment.provider,
            provider_reference: payment.provider_reference,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            payer_contact: payment.payer_contact,
            receipt: None,
            failure_reason: payment.failure_reason,
            raw_payload: payment.raw_payload,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        state.payments.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DomainError> {
        Ok(self.lock()?.payments.get(&id).cloned())
    }

    fn find_by_reference(
        &self,
        provider: PaymentMethod,
        reference: &str,
    ) -> Result<Option<Payment>, DomainError> {
        Ok(self
            .lock()?
            .payments
            .values()
            .find(|p| p.provider == provider && p.provider_reference == reference)
            .cloned())
    }

    fn update_attempt(&self, id: Uuid, update: AttemptUpdate) -> Result<Payment, DomainError> {
        let mut state = self.lock()?;
        let entry = state.payments.get_mut(&id).ok_or(DomainError::NotFound)?;
        entry.provider_reference = update.reference;
        if update.contact.is_some() {
            entry.payer_contact = update.contact;
        }
        if entry.status == PaymentStatus::Processing {
            match update.outcome {
                AttemptOutcome::Accepted { raw } => {
                    entry.status = PaymentStatus::Pending;
                    entry.raw_payload = Some(raw);
                }
                AttemptOutcome::Rejected { reason } => {
                    entry.status = PaymentStatus::Failed;
                    entry.failure_reason = Some(reason);
                }
            }
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    fn settle(&self, settlement: Settlement) -> Result<SettleResult, DomainError> {
        let mut state = self.lock()?;
        let payment = state
            .payments
            .get(&settlement.payment_id)
            .cloned()
            .ok_or(DomainError::NotFound)?;
        if !settlement.kind.applies_to(payment.status) {
            return Ok(SettleResult::AlreadyTerminal(payment));
        }

        let updated = {
            let entry = state
                .payments
                .get_mut(&settlement.payment_id)
                .ok_or(DomainError::NotFound)?;
            match &settlement.kind {
                SettlementKind::Completed { receipt } => {
                    entry.status = PaymentStatus::Completed;
                    entry.receipt = receipt.clone();
                    entry.completed_at = Some(settlement.at);
                }
                SettlementKind::Failed { reason } => {
                    entry.status = PaymentStatus::Failed;
                    entry.failure_reason = Some(reason.clone());
                }
            }
            entry.raw_payload = Some(settlement.raw_payload.clone());
            entry.updated_at = settlement.at;
            entry.clone()
        };

        let Some(order_id) = updated.order_id else {
            return Ok(SettleResult::Applied(updated));
        };
        match &settlement.kind {
            SettlementKind::Completed { receipt } => {
                if let Some(order) = state.orders.get_mut(&order_id) {
                    order.payment_status = OrderPaymentStatus::Paid;
                    order.paid_at = Some(settlement.at);
                    order.payment_reference = Some(updated.provider_reference.clone());
                    order.updated_at = settlement.at;
                    if order.status == OrderStatus::Pending {
                        order.status = OrderStatus::Confirmed;
                        order.history.push(StatusHistoryEntry {
                            status: OrderStatus::Confirmed,
                            note: Some(format!("payment received via {}", updated.provider)),
                            created_at: settlement.at,
                        });
                    }
                }
                record(
                    &mut state,
                    order_id,
                    "OrderPaid",
                    json!({
                        "order_id": order_id,
                        "payment_id": updated.id,
                        "provider": updated.provider.as_str(),
                        "receipt": receipt,
                        "amount": updated.amount.to_string(),
                    }),
                );
            }
            SettlementKind::Failed { reason } => {
                record(
                    &mut state,
                    order_id,
                    "PaymentFailed",
                    json!({
                        "order_id": order_id,
                        "payment_id": updated.id,
                        "provider": updated.provider.as_str(),
                        "reason": reason,
                    }),
                );
            }
        }
        Ok(SettleResult::Applied(updated))
    }
}
