use bigdecimal::{BigDecimal, Zero};

use super::errors::DomainError;
use super::order::PricedLine;
use super::product::Product;

#[derive(Debug, Clone, PartialEq)]
pub struct Totals {
    pub subtotal: BigDecimal,
    pub shipping_cost: BigDecimal,
    pub tax: BigDecimal,
    pub total: BigDecimal,
}

/// Server-side pricing rules. Client-submitted prices are never used; only the
/// client's grand total is compared against the recomputed one.
#[derive(Debug, Clone)]
pub struct PricingPolicy {
    pub currency: String,
    pub shipping_fee: BigDecimal,
    pub free_shipping_threshold: Option<BigDecimal>,
    pub tax_rate: BigDecimal,
    pub total_tolerance: BigDecimal,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            currency: "KES".to_string(),
            shipping_fee: BigDecimal::from(350),
            free_shipping_threshold: None,
            tax_rate: BigDecimal::zero(),
            total_tolerance: BigDecimal::new(1.into(), 2),
        }
    }
}

impl PricingPolicy {
    pub fn price_line(product: &Product, quantity: i32) -> PricedLine {
        PricedLine {
            product_id: product.id,
            product_name: product.name.clone(),
            unit_price: product.price.clone(),
            quantity,
            line_total: &product.price * BigDecimal::from(quantity),
        }
    }

    pub fn quote(&self, lines: &[PricedLine]) -> Totals {
        let subtotal = lines
            .iter()
            .fold(BigDecimal::zero(), |acc, l| acc + &l.line_total);
        let shipping_cost = match &self.free_shipping_threshold {
            Some(threshold) if subtotal >= *threshold => BigDecimal::zero(),
            _ => self.shipping_fee.clone(),
        };
        let tax = (&subtotal * &self.tax_rate).round(2);
        let total = &subtotal + &shipping_cost + &tax;
        Totals {
            subtotal,
            shipping_cost,
            tax,
            total,
        }
    }

    pub fn check_client_total(
        &self,
        totals: &Totals,
        client_total: &BigDecimal,
    ) -> Result<(), DomainError> {
        if (&totals.total - client_total).abs() > self.total_tolerance {
            return Err(DomainError::TotalMismatch);
        }
        Ok(())
    }
}
