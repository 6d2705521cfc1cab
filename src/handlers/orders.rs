use actix_web::{web, HttpResponse};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::application::order_service::{CreateOrder, OrderService};
use crate::application::Caller;
use crate::domain::order::{Order, OrderLineInput, OrderStatus, ShippingAddress};
use crate::errors::AppError;

// ── Request / response DTOs ──────────────────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddressBody {
    pub full_name: String,
    pub phone: String,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    pub country: String,
}

impl From<ShippingAddressBody> for ShippingAddress {
    fn from(b: ShippingAddressBody) -> Self {
        ShippingAddress {
            full_name: b.full_name,
            phone: b.phone,
            line1: b.line1,
            line2: b.line2,
            city: b.city,
            region: b.region,
            postal_code: b.postal_code,
            country: b.country,
        }
    }
}

impl From<ShippingAddress> for ShippingAddressBody {
    fn from(a: ShippingAddress) -> Self {
        ShippingAddressBody {
            full_name: a.full_name,
            phone: a.phone,
            line1: a.line1,
            line2: a.line2,
            city: a.city,
            region: a.region,
            postal_code: a.postal_code,
            country: a.country,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemRequest>,
    pub shipping_address: ShippingAddressBody,
    /// One of `mpesa`, `airtel`, `stripe`, `cod`.
    pub payment_method: String,
    /// Total the client displayed; must match the server-side price.
    #[schema(value_type = String, example = "2050.00")]
    pub total: BigDecimal,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: String,
    pub quantity: i32,
    pub line_total: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryResponse {
    pub status: String,
    pub note: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub status: String,
    pub payment_status: String,
    pub payment_method: String,
    pub payment_reference: Option<String>,
    pub items: Vec<OrderLineResponse>,
    pub shipping_address: ShippingAddressBody,
    pub subtotal: String,
    pub shipping_cost: String,
    pub tax: String,
    pub total: String,
    pub currency: String,
    pub tracking_number: Option<String>,
    pub paid_at: Option<String>,
    pub status_history: Vec<StatusHistoryResponse>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Order> for OrderResponse {
    fn from(o: Order) -> Self {
        OrderResponse {
            id: o.id,
            order_number: o.order_number,
            status: o.status.to_string(),
            payment_status: o.payment_status.to_string(),
            payment_method: o.payment_method.to_string(),
            payment_reference: o.payment_reference,
            items: o
                .lines
                .into_iter()
                .map(|l| OrderLineResponse {
                    id: l.id,
                    product_id: l.product_id,
                    product_name: l.product_name,
                    unit_price: l.unit_price.to_string(),
                    quantity: l.quantity,
                    line_total: l.line_total.to_string(),
                })
                .collect(),
            shipping_address: o.shipping_address.into(),
            subtotal: o.subtotal.to_string(),
            shipping_cost: o.shipping_cost.to_string(),
            tax: o.tax.to_string(),
            total: o.total.to_string(),
            currency: o.currency,
            tracking_number: o.tracking_number,
            paid_at: o.paid_at.map(|t| t.to_rfc3339()),
            status_history: o
                .history
                .into_iter()
                .map(|h| StatusHistoryResponse {
                    status: h.status.to_string(),
                    note: h.note,
                    created_at: h.created_at.to_rfc3339(),
                })
                .collect(),
            created_at: o.created_at.to_rfc3339(),
            updated_at: o.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub status: String,
    pub note: Option<String>,
    pub tracking_number: Option<String>,
}

// ── Pagination ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListOrdersParams {
    /// Page number (1-based). Defaults to 1.
    #[serde(default = "default_page")]
    pub page: i64,
    /// Number of items per page. Defaults to 20, maximum 100.
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListOrdersResponse {
    pub items: Vec<OrderResponse>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// POST /orders
///
/// Prices the cart from the catalog, reserves stock and stores the order in
/// one transaction. Pay-now orders start `pending`; cash-on-delivery orders
/// start `confirmed`.
#[utoipa::path(
    post,
    path = "/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = OrderResponse),
        (status = 400, description = "Invalid cart, insufficient stock or total mismatch"),
        (status = 401, description = "Missing user identity"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "orders"
)]
pub async fn create_order(
    service: web::Data<OrderService>,
    caller: Caller,
    body: web::Json<CreateOrderRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let cmd = CreateOrder {
        items: body
            .items
            .into_iter()
            .map(|i| OrderLineInput {
                product_id: i.product_id,
                quantity: i.quantity,
            })
            .collect(),
        shipping_address: body.shipping_address.into(),
        payment_method: body.payment_method.parse()?,
        client_total: body.total,
    };

    let order = web::block(move || service.create_order(&caller, cmd)).await??;

    Ok(HttpResponse::Created().json(OrderResponse::from(order)))
}

/// GET /orders/{id}
#[utoipa::path(
    get,
    path = "/orders/{id}",
    params(
        ("id" = Uuid, Path, description = "Order UUID"),
    ),
    responses(
        (status = 200, description = "Order found", body = OrderResponse),
        (status = 403, description = "Order belongs to someone else"),
        (status = 404, description = "Order not found"),
    ),
    tag = "orders"
)]
pub async fn get_order(
    service: web::Data<OrderService>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let order_id = path.into_inner();
    let order = web::block(move || service.get_order(&caller, order_id)).await??;
    Ok(HttpResponse::Ok().json(OrderResponse::from(order)))
}

/// GET /orders
///
/// Customers see their own orders, newest first. Admins see everyone's.
#[utoipa::path(
    get,
    path = "/orders",
    params(
        ("page" = Option<i64>, Query, description = "Page number (1-based, default 1)"),
        ("limit" = Option<i64>, Query, description = "Items per page (default 20, max 100)"),
    ),
    responses(
        (status = 200, description = "Paginated list of orders", body = ListOrdersResponse),
        (status = 400, description = "Page out of range"),
        (status = 401, description = "Missing user identity"),
    ),
    tag = "orders"
)]
pub async fn list_orders(
    service: web::Data<OrderService>,
    caller: Caller,
    query: web::Query<ListOrdersParams>,
) -> Result<HttpResponse, AppError> {
    let params = query.into_inner();
    let page = params.page.max(1);
    let limit = params.limit.clamp(1, 100);

    let result = web::block(move || service.list_orders(&caller, page, limit)).await??;

    Ok(HttpResponse::Ok().json(ListOrdersResponse {
        items: result.items.into_iter().map(OrderResponse::from).collect(),
        total: result.total,
        page,
        limit,
    }))
}

/// POST /orders/{id}/cancel
#[utoipa::path(
    post,
    path = "/orders/{id}/cancel",
    params(
        ("id" = Uuid, Path, description = "Order UUID"),
    ),
    request_body(content = Option<CancelOrderRequest>),
    responses(
        (status = 200, description = "Order cancelled and stock released", body = OrderResponse),
        (status = 403, description = "Order belongs to someone else"),
        (status = 409, description = "Order can no longer be cancelled"),
    ),
    tag = "orders"
)]
pub async fn cancel_order(
    service: web::Data<OrderService>,
    caller: Caller,
    path: web::Path<Uuid>,
    body: Option<web::Json<CancelOrderRequest>>,
) -> Result<HttpResponse, AppError> {
    let order_id = path.into_inner();
    let reason = body.and_then(|b| b.into_inner().reason);
    let order = web::block(move || service.cancel_order(&caller, order_id, reason)).await??;
    Ok(HttpResponse::Ok().json(OrderResponse::from(order)))
}

/// PATCH /orders/{id}/status
///
/// Admin-only lifecycle update.
#[utoipa::path(
    patch,
    path = "/orders/{id}/status",
    params(
        ("id" = Uuid, Path, description = "Order UUID"),
    ),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = OrderResponse),
        (status = 403, description = "Caller is not an admin"),
        (status = 409, description = "Transition not allowed"),
    ),
    tag = "orders"
)]
pub async fn update_status(
    service: web::Data<OrderService>,
    caller: Caller,
    path: web::Path<Uuid>,
    body: web::Json<UpdateStatusRequest>,
) -> Result<HttpResponse, AppError> {
    let order_id = path.into_inner();
    let body = body.into_inner();
    let to: OrderStatus = body.status.parse()?;
    let order = web::block(move || {
        service.update_status(&caller, order_id, to, body.note, body.tracking_number)
    })
    .await??;
    Ok(HttpResponse::Ok().json(OrderResponse::from(order)))
}
