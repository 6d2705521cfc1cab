pub mod application;
pub mod config;
pub mod db;
pub mod domain;
pub mod errors;
pub mod handlers;
pub mod infrastructure;
pub mod providers;
pub mod schema;
pub mod sweeper;

use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use application::callbacks::CallbackReceiver;
use application::order_service::OrderService;
use application::payment_service::PaymentService;
use application::reconciler::Reconciler;
use domain::errors::DomainError;
use domain::ports::{Notifier, OrderRepository, PaymentRepository, ProductCatalog};
use domain::pricing::PricingPolicy;
use providers::ProviderRegistry;

pub use db::{create_pool, DbPool};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Run any pending Diesel migrations against the pool's database.
pub fn run_migrations(pool: &DbPool) -> Result<(), DomainError> {
    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| DomainError::Internal(format!("migrations failed: {e}")))?;
    Ok(())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::orders::create_order,
        handlers::orders::list_orders,
        handlers::orders::get_order,
        handlers::orders::cancel_order,
        handlers::orders::update_status,
        handlers::payments::initiate_payment,
        handlers::payments::payment_callback,
        handlers::payments::payment_status,
    ),
    components(schemas(
        handlers::orders::CreateOrderRequest,
        handlers::orders::OrderItemRequest,
        handlers::orders::ShippingAddressBody,
        handlers::orders::OrderResponse,
        handlers::orders::OrderLineResponse,
        handlers::orders::StatusHistoryResponse,
        handlers::orders::ListOrdersResponse,
        handlers::orders::CancelOrderRequest,
        handlers::orders::UpdateStatusRequest,
        handlers::payments::InitiatePaymentRequest,
        handlers::payments::InitiatePaymentResponse,
        handlers::payments::PaymentStatusResponse,
    )),
    tags(
        (name = "orders", description = "Checkout and order lifecycle"),
        (name = "payments", description = "Payment initiation and provider callbacks"),
    )
)]
pub struct ApiDoc;

/// The storage and notification ports the services are built on.
#[derive(Clone)]
pub struct Ports {
    pub catalog: Arc<dyn ProductCatalog>,
    pub orders: Arc<dyn OrderRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub notifier: Arc<dyn Notifier>,
}

/// Services shared by every worker.
#[derive(Clone)]
pub struct AppState {
    pub orders: web::Data<OrderService>,
    pub payments: web::Data<PaymentService>,
    pub callbacks: web::Data<CallbackReceiver>,
}

impl AppState {
    pub fn new(ports: Ports, pricing: PricingPolicy, registry: ProviderRegistry) -> Self {
        let orders = OrderService::new(
            ports.catalog,
            ports.orders.clone(),
            ports.notifier.clone(),
            pricing,
            registry.methods(),
        );
        let reconciler = Reconciler::new(ports.orders.clone(), ports.payments.clone(), ports.notifier);
        let callbacks = CallbackReceiver::new(registry.clone(), Arc::new(reconciler));
        let payments = PaymentService::new(ports.orders, ports.payments, registry);
        Self {
            orders: web::Data::new(orders),
            payments: web::Data::new(payments),
            callbacks: web::Data::new(callbacks),
        }
    }

    /// Registers app data and routes.
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(self.orders.clone())
            .app_data(self.payments.clone())
            .app_data(self.callbacks.clone())
            .service(
                web::scope("/orders")
                    .route("", web::post().to(handlers::orders::create_order))
                    .route("", web::get().to(handlers::orders::list_orders))
                    .route("/{id}", web::get().to(handlers::orders::get_order))
                    .route("/{id}/cancel", web::post().to(handlers::orders::cancel_order))
                    .route("/{id}/status", web::patch().to(handlers::orders::update_status)),
            )
            .service(
                web::scope("/payments")
                    .route(
                        "/{provider}/initiate",
                        web::post().to(handlers::payments::initiate_payment),
                    )
                    .route(
                        "/{provider}/callback",
                        web::post().to(handlers::payments::payment_callback),
                    )
                    .route(
                        "/{paymentId}/status",
                        web::get().to(handlers::payments::payment_status),
                    ),
            );
    }
}

/// Build and return an actix-web `Server` bound to `host:port`.
///
/// The caller is responsible for `.await`-ing (or `tokio::spawn`-ing) the
/// returned server.
pub fn build_server(
    state: AppState,
    host: &str,
    port: u16,
) -> std::io::Result<actix_web::dev::Server> {
    let openapi = ApiDoc::openapi();
    Ok(HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .configure(|cfg| state.configure(cfg))
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()),
            )
    })
    .bind((host.to_string(), port))?
    .run())
}
