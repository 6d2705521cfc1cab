use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use uuid::Uuid;

use super::Caller;
use crate::domain::errors::DomainError;
use crate::domain::inventory::{merge_lines, plan_reservation};
use crate::domain::order::{
    generate_order_number, page_offset, ListResult, NewOrder, Order, OrderLineInput, OrderStatus,
    ShippingAddress, StatusChange,
};
use crate::domain::payment::PaymentMethod;
use crate::domain::ports::{Notifier, OrderRepository, ProductCatalog};
use crate::domain::pricing::PricingPolicy;

const ORDER_NUMBER_ATTEMPTS: usize = 3;
const EXPIRY_NOTE: &str = "payment not received";

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub items: Vec<OrderLineInput>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub client_total: BigDecimal,
}

pub struct OrderService {
    catalog: Arc<dyn ProductCatalog>,
    orders: Arc<dyn OrderRepository>,
    notifier: Arc<dyn Notifier>,
    pricing: PricingPolicy,
    accepted_methods: Vec<PaymentMethod>,
}

impl OrderService {
    pub fn new(
        catalog: Arc<dyn ProductCatalog>,
        orders: Arc<dyn OrderRepository>,
        notifier: Arc<dyn Notifier>,
        pricing: PricingPolicy,
        accepted_methods: Vec<PaymentMethod>,
    ) -> Self {
        Self {
            catalog,
            orders,
            notifier,
            pricing,
            accepted_methods,
        }
    }

    /// Prices the order from the catalog, checks the client's total and
    /// stores the order together with its stock reservation.
    ///
    /// Cash-on-delivery orders are confirmed straight away; pay-now orders
    /// wait in `pending` until their payment is reconciled.
    pub fn create_order(&self, caller: &Caller, cmd: CreateOrder) -> Result<Order, DomainError> {
        if !self.accepted_methods.contains(&cmd.payment_method) {
            return Err(DomainError::InvalidInput(format!(
                "payment method {} is not available",
                cmd.payment_method
            )));
        }
        cmd.shipping_address.validate()?;

        let items = merge_lines(&cmd.items)?;
        let ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let products: HashMap<Uuid, _> = self
            .catalog
            .find_by_ids(&ids)?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let lines = plan_reservation(&products, &items)?;
        let totals = self.pricing.quote(&lines);
        if let Err(e) = self.pricing.check_client_total(&totals, &cmd.client_total) {
            warn!(
                "Rejecting order for {}: client total {} but computed {}",
                caller.user_id, cmd.client_total, totals.total
            );
            return Err(e);
        }

        let status = if cmd.payment_method.is_pay_now() {
            OrderStatus::Pending
        } else {
            OrderStatus::Confirmed
        };

        let mut attempt = 0;
        let (order, levels) = loop {
            attempt += 1;
            let new_order = NewOrder {
                id: Uuid::new_v4(),
                order_number: generate_order_number(Utc::now()),
                customer_id: caller.user_id,
                status,
                payment_method: cmd.payment_method,
                lines: lines.clone(),
                shipping_address: cmd.shipping_address.clone(),
                totals: totals.clone(),
                currency: self.pricing.currency.clone(),
            };
            match self.orders.create(new_order) {
                Err(DomainError::Conflict(msg)) if attempt < ORDER_NUMBER_ATTEMPTS => {
                    debug!("Order number collision ({msg}), retrying");
                }
                other => break other?,
            }
        };

        info!(
            "Order {} created for {} ({} {}, {})",
            order.order_number, order.customer_id, order.total, order.currency, order.payment_method
        );
        for level in levels.iter().filter(|l| l.is_low()) {
            warn!(
                "Product {} is low on stock: {} left (alert at {})",
                level.product_id, level.stock, level.low_stock_alert
            );
        }
        if let Err(e) = self.notifier.order_placed(&order) {
            warn!("Could not send order confirmation for {}: {e}", order.order_number);
        }
        Ok(order)
    }

    pub fn get_order(&self, caller: &Caller, id: Uuid) -> Result<Order, DomainError> {
        let order = self.orders.find_by_id(id)?.ok_or(DomainError::NotFound)?;
        if !caller.can_see(&order) {
            return Err(DomainError::Forbidden);
        }
        Ok(order)
    }

    /// Admins see every order; customers see their own.
    pub fn list_orders(&self, caller: &Caller, page: i64, limit: i64) -> Result<ListResult, DomainError> {
        let owner = if caller.admin { None } else { Some(caller.user_id) };
        let (page, limit) = (page.max(1), limit.clamp(1, 100));
        page_offset(page, limit)?;
        self.orders.list(owner, page, limit)
    }

    /// Admin lifecycle update. Cancelling through here restores stock too.
    pub fn update_status(
        &self,
        caller: &Caller,
        id: Uuid,
        to: OrderStatus,
        note: Option<String>,
        tracking_number: Option<String>,
    ) -> Result<Order, DomainError> {
        caller.require_admin()?;
        let order = self.orders.find_by_id(id)?.ok_or(DomainError::NotFound)?;
        if !order.status.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                from: order.status.to_string(),
                to: to.to_string(),
            });
        }
        let updated = self.orders.change_status(
            id,
            StatusChange {
                from: order.status,
                to,
                note,
                tracking_number: tracking_number.filter(|_| to == OrderStatus::Shipped),
                release_stock: to == OrderStatus::Cancelled,
                only_if_unpaid: false,
            },
        )?;
        info!("Order {} moved from {} to {}", updated.order_number, order.status, to);
        Ok(updated)
    }

    /// Customers may cancel their own unpaid orders; admins may cancel any
    /// order that has not shipped. Reserved stock goes back to the catalog.
    pub fn cancel_order(
        &self,
        caller: &Caller,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<Order, DomainError> {
        let order = self.get_order(caller, id)?;
        if !order.status.can_transition_to(OrderStatus::Cancelled) {
            return Err(DomainError::InvalidTransition {
                from: order.status.to_string(),
                to: OrderStatus::Cancelled.to_string(),
            });
        }
        if order.is_paid() && !caller.admin {
            return Err(DomainError::Conflict(
                "paid orders can only be cancelled by support".to_string(),
            ));
        }
        let updated = self.orders.change_status(
            id,
            StatusChange {
                from: order.status,
                to: OrderStatus::Cancelled,
                note: reason.or_else(|| {
                    let by = if caller.admin { "support" } else { "customer" };
                    Some(format!("cancelled by {by}"))
                }),
                tracking_number: None,
                release_stock: true,
                only_if_unpaid: !caller.admin,
            },
        )?;
        info!("Order {} cancelled, stock released", updated.order_number);
        Ok(updated)
    }

    /// Cancels pay-now orders that have waited longer than `timeout` for
    /// their payment, returning their stock. Orders paid in the meantime are
    /// skipped. Returns the number of orders cancelled.
    pub fn expire_unpaid_orders(&self, now: DateTime<Utc>, timeout: Duration) -> Result<usize, DomainError> {
        let stale = self.orders.find_unpaid_before(now - timeout)?;
        let mut expired = 0;
        for order in stale {
            let change = StatusChange {
                from: order.status,
                to: OrderStatus::Cancelled,
                note: Some(EXPIRY_NOTE.to_string()),
                tracking_number: None,
                release_stock: true,
                only_if_unpaid: true,
            };
            match self.orders.change_status(order.id, change) {
                Ok(_) => {
                    expired += 1;
                    info!("Order {} expired without payment", order.order_number);
                }
                Err(DomainError::Conflict(msg)) => {
                    debug!("Skipping expiry of {}: {msg}", order.order_number);
                }
                Err(e) => return Err(e),
            }
        }
        if expired > 0 {
            info!("Expired {expired} unpaid orders");
        }
        Ok(expired)
    }
}
