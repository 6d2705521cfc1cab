use log::info;

use crate::domain::errors::DomainError;
use crate::domain::order::Order;
use crate::domain::ports::Notifier;

/// Writes customer notifications to the log instead of sending them.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn order_placed(&self, order: &Order) -> Result<(), DomainError> {
        info!(
            "Notify {}: order {} placed, total {} {}",
            order.customer_id, order.order_number, order.total, order.currency
        );
        Ok(())
    }

    fn payment_received(&self, order: &Order) -> Result<(), DomainError> {
        info!(
            "Notify {}: payment for order {} received",
            order.customer_id, order.order_number
        );
        Ok(())
    }
}
