use rocket::Request;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tracing::Instrument;

use super::User;
use super::token::{bearer_token, verify_token};
use crate::config::AppConfig;
use crate::db::get_user;
use crate::error::AppError;

/// An authenticated, approved user with a recognised role.
///
/// Missing or bad tokens fail with 401, unknown roles and unapproved accounts
/// with 403.
pub struct AuthUser(pub User);

impl std::ops::Deref for AuthUser {
    type Target = User;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        authenticate(request)
            .instrument(tracing::info_span!("user_auth_guard"))
            .await
    }
}

async fn authenticate(request: &Request<'_>) -> Outcome<AuthUser, ()> {
    let token = match request
        .headers()
        .get_one("Authorization")
        .and_then(bearer_token)
    {
        Some(token) => token,
        None => {
            tracing::debug!("No bearer token on request");
            return Outcome::Error((Status::Unauthorized, ()));
        }
    };

    let (db, config) = match (
        request.rocket().state::<SqlitePool>(),
        request.rocket().state::<AppConfig>(),
    ) {
        (Some(pool), Some(config)) => (pool, config),
        _ => {
            tracing::error!("Database pool or config not found in managed state");
            return Outcome::Error((Status::InternalServerError, ()));
        }
    };

    let claims = match verify_token(token, &config.jwt_secret) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::warn!(error = %err, "Rejected bearer token");
            return Outcome::Error((Status::Unauthorized, ()));
        }
    };

    match get_user(db, claims.sub).await {
        Ok(user) => {
            if !user.is_approved() {
                tracing::warn!(
                    username = %user.username,
                    approval_status = %user.approval_status,
                    "Account not approved"
                );
                return Outcome::Error((Status::Forbidden, ()));
            }

            tracing::info!(username = %user.username, role = %user.role.as_str(), "User authenticated via bearer token");
            Outcome::Success(AuthUser(user))
        }
        Err(AppError::NotFound(_)) => {
            tracing::warn!(user_id = %claims.sub, "Token subject no longer exists");
            Outcome::Error((Status::Unauthorized, ()))
        }
        Err(AppError::Authorization(msg)) => {
            tracing::warn!(user_id = %claims.sub, message = %msg, "User has unrecognised role");
            Outcome::Error((Status::Forbidden, ()))
        }
        Err(err) => {
            tracing::error!(user_id = %claims.sub, error = ?err, "Failed to fetch user for token");
            Outcome::Error((Status::InternalServerError, ()))
        }
    }
}

#[catch(401)]
pub fn unauthorized_api(_req: &Request) -> Custom<Json<Value>> {
    let error_json = json!({
        "error": "Unauthorized",
        "message": "Authentication required"
    });

    Custom(Status::Unauthorized, Json(error_json))
}

#[catch(403)]
pub fn forbidden_api(_req: &Request) -> Custom<Json<Value>> {
    tracing::warn!("Forbidden access attempt");
    let error_json = json!({
        "error": "Forbidden",
        "message": "You don't have permission to perform this action"
    });

    Custom(Status::Forbidden, Json(error_json))
}
