pub mod orders;
pub mod payments;

use std::future::{ready, Ready};

use actix_web::{dev::Payload, FromRequest, HttpRequest};
use uuid::Uuid;

use crate::application::Caller;
use crate::errors::AppError;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

/// Identity is established by the gateway in front of this service and
/// forwarded as headers.
impl FromRequest for Caller {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let header = |name: &'static str| req.headers().get(name).and_then(|v| v.to_str().ok());
        let caller = header(USER_ID_HEADER)
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .map(|user_id| Caller {
                user_id,
                admin: header(USER_ROLE_HEADER).is_some_and(|r| r.eq_ignore_ascii_case("admin")),
            })
            .ok_or(AppError::Unauthorized);
        ready(caller)
    }
}
