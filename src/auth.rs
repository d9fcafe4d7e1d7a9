use rand::Rng;
use rocket::http::Status;
use rocket::request::{self, FromRequest, Outcome, Request};
use crate::AppConfig;
use crate::error::ApiError;

pub const FD_ADMIN_TOKEN_HEADER: &str = "fd-admin-token";

/// Opaque bearer token presented by administrative callers.
#[derive(PartialEq, Clone, Debug)]
pub struct FdAdminToken(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for FdAdminToken {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> request::Outcome<FdAdminToken, ()> {
        if let Some(token) = request.headers().get_one(FD_ADMIN_TOKEN_HEADER) {
            return Outcome::Success(FdAdminToken(token.to_string()));
        }
        Outcome::Error((Status::Unauthorized, ()))
    }
}

/// The "is this caller authorized" predicate consulted by admin operations.
pub fn authorize_admin(cfg: &AppConfig, token: &FdAdminToken) -> Result<(), ApiError> {
    if token.0 == cfg.admin_token {
        Ok(())
    } else {
        Err(ApiError::authorization("Invalid admin token"))
    }
}

pub fn generate_random_string(len: usize) -> String {
    const WOWELS: &str = "aeiouy";
    const CONSONANTS: &str = "bcdfghjklmnopqrstvwxz";
    let mut rng = rand::rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS } else { WOWELS };
            let idx = rng.random_range(0..charset.len());
            charset.chars().nth(idx).unwrap()
        })
        .collect()
}
