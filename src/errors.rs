use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use thiserror::Error;

use crate::application::callbacks::CallbackRejection;
use crate::domain::errors::DomainError;

const PAYMENT_RETRY_MESSAGE: &str = "payment failed, please retry";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Missing or invalid user identity")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("Payment provider error: {0}")]
    PaymentFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DomainError> for AppError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::NotFound => AppError::NotFound,
            DomainError::Forbidden => AppError::Forbidden,
            ref v if v.is_validation() => AppError::BadRequest(v.to_string()),
            DomainError::InvalidTransition { .. } => AppError::Conflict(e.to_string()),
            DomainError::Conflict(msg) => AppError::Conflict(msg),
            DomainError::Provider(msg) => AppError::PaymentFailed(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<CallbackRejection> for AppError {
    fn from(e: CallbackRejection) -> Self {
        match e {
            CallbackRejection::UnknownProvider(_) => AppError::NotFound,
            CallbackRejection::Rejected(_) => AppError::Unauthorized,
        }
    }
}

impl From<actix_web::error::BlockingError> for AppError {
    fn from(e: actix_web::error::BlockingError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl actix_web::ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PaymentFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            AppError::PaymentFailed(_) => PAYMENT_RETRY_MESSAGE.to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(serde_json::json!({ "error": message }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::ResponseError;
    use uuid::Uuid;

    async fn body_of(err: AppError) -> serde_json::Value {
        let bytes = to_bytes(err.error_response().into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn not_found_returns_404() {
        let resp = AppError::NotFound.error_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn stock_errors_are_bad_requests_naming_the_product() {
        let err: AppError = DomainError::OutOfStock {
            product: "Kenya AA".to_string(),
            requested: 4,
            available: 3,
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("Kenya AA"));
    }

    #[test]
    fn unknown_product_is_a_bad_request() {
        let err: AppError = DomainError::ProductNotFound(Uuid::nil()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn total_mismatch_is_generic() {
        let err: AppError = DomainError::TotalMismatch.into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Order total does not match");
    }

    #[test]
    fn ownership_and_transition_errors() {
        let forbidden: AppError = DomainError::Forbidden.into();
        assert_eq!(forbidden.status_code(), StatusCode::FORBIDDEN);
        let transition: AppError = DomainError::InvalidTransition {
            from: "shipped".to_string(),
            to: "cancelled".to_string(),
        }
        .into();
        assert_eq!(transition.status_code(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn provider_failures_hide_their_detail() {
        let err: AppError = DomainError::Provider("Invalid Access Token".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            body_of(err).await,
            serde_json::json!({ "error": "payment failed, please retry" })
        );
    }

    #[actix_web::test]
    async fn internal_error_returns_generic_500() {
        let err: AppError = DomainError::Internal("connection refused".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_of(err).await,
            serde_json::json!({ "error": "Internal server error" })
        );
    }
}
