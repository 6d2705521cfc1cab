use bigdecimal::BigDecimal;
use uuid::Uuid;

/// The catalog fields the checkout flow consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub price: BigDecimal,
    pub stock: i32,
    pub low_stock_alert: i32,
    pub is_active: bool,
}

/// Stock left on a product after a reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct StockLevel {
    pub product_id: Uuid,
    pub stock: i32,
    pub low_stock_alert: i32,
}

impl StockLevel {
    pub fn is_low(&self) -> bool {
        self.stock <= self.low_stock_alert
    }
}
