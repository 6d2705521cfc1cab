use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Not found")]
    NotFound,
    #[error("Product {0} does not exist")]
    ProductNotFound(Uuid),
    #[error("Product '{0}' is no longer available")]
    ProductInactive(String),
    #[error("Insufficient stock for '{product}': requested {requested}, available {available}")]
    OutOfStock {
        product: String,
        requested: i32,
        available: i32,
    },
    #[error("Order total does not match")]
    TotalMismatch,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid phone number: {0}")]
    InvalidPhoneNumber(String),
    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Forbidden")]
    Forbidden,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Payment provider error: {0}")]
    Provider(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    /// Errors the caller can fix by changing the request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DomainError::ProductNotFound(_)
                | DomainError::ProductInactive(_)
                | DomainError::OutOfStock { .. }
                | DomainError::TotalMismatch
                | DomainError::InvalidInput(_)
                | DomainError::InvalidPhoneNumber(_)
        )
    }
}
