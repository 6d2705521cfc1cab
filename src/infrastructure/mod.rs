pub mod memory;
pub mod models;
pub mod notifier;
pub mod order_repo;
pub mod payment_repo;

#[cfg(test)]
pub(crate) mod test_db;
