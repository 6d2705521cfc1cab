use actix_web::{web, HttpRequest, HttpResponse};
use log::debug;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::application::callbacks::{AcceptedCallback, CallbackReceiver};
use crate::application::payment_service::{InitiatedPayment, PaymentService, PaymentStatusView};
use crate::application::Caller;
use crate::domain::payment::PaymentMethod;
use crate::errors::AppError;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    pub order_id: Uuid,
    /// Mobile-money number. Defaults to the shipping phone.
    pub phone: Option<String>,
    /// Card payment method token, e.g. `pm_...`.
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub payment_id: Uuid,
    pub provider_reference: String,
    pub message: Option<String>,
    pub client_secret: Option<String>,
}

impl From<InitiatedPayment> for InitiatePaymentResponse {
    fn from(p: InitiatedPayment) -> Self {
        InitiatePaymentResponse {
            payment_id: p.payment_id,
            provider_reference: p.provider_reference,
            message: p.customer_message,
            client_secret: p.client_secret,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    pub payment_id: Uuid,
    pub provider: String,
    pub status: String,
    pub order_id: Option<Uuid>,
    pub order_status: Option<String>,
    pub payment_status: Option<String>,
}

impl From<PaymentStatusView> for PaymentStatusResponse {
    fn from(v: PaymentStatusView) -> Self {
        PaymentStatusResponse {
            payment_id: v.payment_id,
            provider: v.provider.to_string(),
            status: v.status.to_string(),
            order_id: v.order_id,
            order_status: v.order_status.map(|s| s.to_string()),
            payment_status: v.order_payment_status.map(|s| s.to_string()),
        }
    }
}

/// POST /payments/{provider}/initiate
///
/// Asks the provider to collect the order total. Success means the request
/// was accepted, not that money has moved; poll the status endpoint.
#[utoipa::path(
    post,
    path = "/payments/{provider}/initiate",
    params(
        ("provider" = String, Path, description = "mpesa, airtel, stripe or cod"),
    ),
    request_body = InitiatePaymentRequest,
    responses(
        (status = 200, description = "Provider accepted the request", body = InitiatePaymentResponse),
        (status = 400, description = "Invalid phone number or payment method"),
        (status = 403, description = "Order belongs to someone else"),
        (status = 409, description = "Order is cancelled or already paid"),
        (status = 502, description = "Provider failed, please retry"),
    ),
    tag = "payments"
)]
pub async fn initiate_payment(
    service: web::Data<PaymentService>,
    caller: Caller,
    path: web::Path<String>,
    body: web::Json<InitiatePaymentRequest>,
) -> Result<HttpResponse, AppError> {
    let method: PaymentMethod = path.into_inner().parse()?;
    let body = body.into_inner();
    let contact = match method {
        PaymentMethod::Stripe => body.payment_method_id,
        _ => body.phone,
    };

    let initiated = service.initiate(&caller, method, body.order_id, contact).await?;

    Ok(HttpResponse::Ok().json(InitiatePaymentResponse::from(initiated)))
}

/// POST /payments/{provider}/callback
///
/// Provider-facing. Verified callbacks are acknowledged immediately and
/// reconciled in the background.
#[utoipa::path(
    post,
    path = "/payments/{provider}/callback",
    params(
        ("provider" = String, Path, description = "mpesa, airtel or stripe"),
    ),
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Provider-specific acknowledgement"),
        (status = 401, description = "Signature missing or invalid"),
        (status = 404, description = "Unknown provider"),
    ),
    tag = "payments"
)]
pub async fn payment_callback(
    receiver: web::Data<CallbackReceiver>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let provider = path.into_inner();
    let AcceptedCallback { acknowledgement, job } = receiver.accept(&provider, body.to_vec(), |name| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })?;

    actix_web::rt::spawn(async move {
        if let Some(result) = job.run().await {
            debug!("Callback processed: {result:?}");
        }
    });

    Ok(HttpResponse::Ok().json(acknowledgement))
}

/// GET /payments/{paymentId}/status
#[utoipa::path(
    get,
    path = "/payments/{paymentId}/status",
    params(
        ("paymentId" = Uuid, Path, description = "Payment UUID"),
    ),
    responses(
        (status = 200, description = "Payment and order state", body = PaymentStatusResponse),
        (status = 403, description = "Payment belongs to someone else"),
        (status = 404, description = "Payment not found"),
    ),
    tag = "payments"
)]
pub async fn payment_status(
    service: web::Data<PaymentService>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let view = service.status(&caller, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(PaymentStatusResponse::from(view)))
}
