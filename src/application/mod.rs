pub mod callbacks;
pub mod order_service;
pub mod payment_service;
pub mod reconciler;

use uuid::Uuid;

use crate::domain::errors::DomainError;
use crate::domain::order::Order;

/// The authenticated caller, as established upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub admin: bool,
}

impl Caller {
    pub fn customer(user_id: Uuid) -> Self {
        Self {
            user_id,
            admin: false,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            admin: true,
        }
    }

    pub fn can_see(&self, order: &Order) -> bool {
        self.admin || order.customer_id == self.user_id
    }

    pub fn require_admin(&self) -> Result<(), DomainError> {
        if self.admin {
            Ok(())
        } else {
            Err(DomainError::Forbidden)
        }
    }
}

/// Runs synchronous repository work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, DomainError>
where
    F: FnOnce() -> Result<T, DomainError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DomainError::Internal(e.to_string()))?
}
