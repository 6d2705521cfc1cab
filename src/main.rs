use std::sync::Arc;

use coffee_checkout::config::AppConfig;
use coffee_checkout::infrastructure::notifier::LogNotifier;
use coffee_checkout::infrastructure::order_repo::DieselOrderRepository;
use coffee_checkout::infrastructure::payment_repo::DieselPaymentRepository;
use coffee_checkout::providers::ProviderRegistry;
use coffee_checkout::sweeper::run_expiry_sweep;
use coffee_checkout::{build_server, create_pool, run_migrations, AppState, Ports};
use dotenvy::dotenv;
use log::{error, info};

fn startup_error(e: impl std::fmt::Display) -> std::io::Error {
    error!("Startup failed: {e}");
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = AppConfig::from_env().map_err(startup_error)?;

    let pool = create_pool(&config.database_url).map_err(startup_error)?;
    run_migrations(&pool).map_err(startup_error)?;

    let registry = ProviderRegistry::from_config(&config).map_err(startup_error)?;
    let methods: Vec<String> = registry.methods().iter().map(|m| m.to_string()).collect();
    info!("Payment methods enabled: {}", methods.join(", "));

    let orders = Arc::new(DieselOrderRepository::new(pool.clone()));
    let ports = Ports {
        catalog: orders.clone(),
        orders,
        payments: Arc::new(DieselPaymentRepository::new(pool)),
        notifier: Arc::new(LogNotifier),
    };
    let state = AppState::new(ports, config.pricing.clone(), registry);

    actix_web::rt::spawn(run_expiry_sweep(
        state.orders.clone(),
        config.expiry_sweep_interval,
        config.unpaid_order_timeout,
    ));

    info!("Starting server at http://{}:{}", config.host, config.port);

    build_server(state, &config.host, config.port)?.await
}
