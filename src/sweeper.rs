use std::time::Duration;

use actix_web::web;
use chrono::Utc;
use log::{error, info};

use crate::application::order_service::OrderService;

/// Periodically cancels pay-now orders whose payment never arrived.
pub async fn run_expiry_sweep(
    orders: web::Data<OrderService>,
    every: Duration,
    timeout: chrono::Duration,
) {
    info!("Unpaid order sweep every {every:?}, timeout {} min", timeout.num_minutes());
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let service = orders.clone();
        match web::block(move || service.expire_unpaid_orders(Utc::now(), timeout)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!("Sweep cancelled {n} unpaid orders"),
            Ok(Err(e)) => error!("Unpaid order sweep failed: {e}"),
            Err(e) => error!("Unpaid order sweep could not run: {e}"),
        }
    }
}
