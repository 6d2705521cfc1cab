pub mod errors;
pub mod inventory;
pub mod order;
pub mod payment;
pub mod phone;
pub mod ports;
pub mod pricing;
pub mod product;
