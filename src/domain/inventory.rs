//! Stock reservation rules.
//!
//! Validation happens in full before anything is written: an order either
//! reserves every line or nothing. Stores repeat the floor check inside their
//! own transaction (`stock >= quantity`) so a concurrent order that drained a
//! product in between still rolls the whole order back.

use std::collections::HashMap;

use uuid::Uuid;

use super::errors::DomainError;
use super::order::{OrderLineInput, PricedLine};
use super::pricing::PricingPolicy;
use super::product::Product;

/// Folds repeated products into a single line, keeping first-seen order.
pub fn merge_lines(lines: &[OrderLineInput]) -> Result<Vec<OrderLineInput>, DomainError> {
    if lines.is_empty() {
        return Err(DomainError::InvalidInput("an order needs at least one item".to_string()));
    }
    let mut merged: Vec<OrderLineInput> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.quantity <= 0 {
            return Err(DomainError::InvalidInput(format!(
                "quantity for product {} must be positive",
                line.product_id
            )));
        }
        match merged.iter_mut().find(|m| m.product_id == line.product_id) {
            Some(existing) => {
                existing.quantity = existing.quantity.checked_add(line.quantity).ok_or_else(|| {
                    DomainError::InvalidInput("quantity is too large".to_string())
                })?
            }
            None => merged.push(line.clone()),
        }
    }
    Ok(merged)
}

/// Checks every line against the catalog and snapshots name and price.
pub fn plan_reservation(
    products: &HashMap<Uuid, Product>,
    lines: &[OrderLineInput],
) -> Result<Vec<PricedLine>, DomainError> {
    let lines = merge_lines(lines)?;
    lines
        .iter()
        .map(|line| {
            let product = products
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
            Ok(PricingPolicy::price_line(product, line.quantity))
        })
        .collect()
}
