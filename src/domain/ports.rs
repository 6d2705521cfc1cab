use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::errors::DomainError;
use super::order::{ListResult, NewOrder, Order, StatusChange};
use super::payment::{AttemptUpdate, NewPayment, Payment, PaymentMethod, SettleResult, Settlement};
use super::product::{Product, StockLevel};

pub trait ProductCatalog: Send + Sync + 'static {
    fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Product>, DomainError>;
}

pub trait OrderRepository: Send + Sync + 'static {
    /// Stores the order, decrements stock for every line and records an
    /// `OrderCreated` event as one unit. Fails with `Conflict` if the order
    /// number is taken and with a stock error if any decrement would go below
    /// zero; in both cases nothing is written.
    fn create(&self, order: NewOrder) -> Result<(Order, Vec<StockLevel>), DomainError>;
    fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, DomainError>;
    fn list(&self, customer_id: Option<Uuid>, page: i64, limit: i64) -> Result<ListResult, DomainError>;
    /// Applies `change` only if the order is still in `change.from`; returns
    /// `Conflict` otherwise. Cancelling also cancels the order's open payments.
    fn change_status(&self, id: Uuid, change: StatusChange) -> Result<Order, DomainError>;
    fn set_payment_reference(&self, id: Uuid, reference: &str) -> Result<(), DomainError>;
    /// Pay-now orders still awaiting payment that were created before `cutoff`.
    fn find_unpaid_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, DomainError>;
}

pub trait PaymentRepository: Send + Sync + 'static {
    fn insert(&self, payment: NewPayment) -> Result<Payment, DomainError>;
    fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DomainError>;
    fn find_by_reference(
        &self,
        provider: PaymentMethod,
        reference: &str,
    ) -> Result<Option<Payment>, DomainError>;
    /// Stores the provider's answer for an attempt recorded before the
    /// provider was called. The reference and contact are always written; the
    /// status only moves if the attempt is still `processing`, so an early
    /// callback's settlement is kept.
    fn update_attempt(&self, id: Uuid, update: AttemptUpdate) -> Result<Payment, DomainError>;
    /// Moves a payment into its terminal state and, for a completed payment,
    /// marks the owning order paid, all in one unit. A payment the settlement
    /// does not apply to is returned untouched as `AlreadyTerminal`.
    fn settle(&self, settlement: Settlement) -> Result<SettleResult, DomainError>;
}

/// Outbound customer notifications. Delivery is best-effort.
pub trait Notifier: Send + Sync + 'static {
    fn order_placed(&self, order: &Order) -> Result<(), DomainError>;
    fn payment_received(&self, order: &Order) -> Result<(), DomainError>;
}
