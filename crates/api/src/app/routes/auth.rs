use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;

use billflow_auth::verify_password;
use billflow_core::DomainError;

use crate::app::routes::common::record_activity;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::middleware::client_addr;

pub async fn login(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(body): Json<dto::LoginRequest>,
) -> axum::response::Response {
    let addr = client_addr(&headers);
    let now = Utc::now();

    // Fail closed while the cooldown is active, with a remaining-time hint.
    if let Err(DomainError::RateLimited { retry_after_secs }) =
        services.login_throttle.check(&addr, now)
    {
        record_activity(
            &services,
            None,
            Some(&headers),
            "login_blocked",
            "auth",
            "login attempt while address is blocked",
            None,
            serde_json::json!({ "retry_after_secs": retry_after_secs }),
        );
        return errors::rate_limited(retry_after_secs);
    }

    let account = services.staff().find_active_by_email(&body.email);
    let verified = account
        .as_ref()
        .is_some_and(|a| verify_password(&body.password, &a.password_hash));

    if !verified {
        services.login_throttle.record_failure(&addr, now);
        record_activity(
            &services,
            None,
            Some(&headers),
            "login_failed",
            "auth",
            "failed staff login",
            None,
            serde_json::json!({ "email": body.email }),
        );
        return errors::json_error(
            StatusCode::UNAUTHORIZED,
            "authentication_failed",
            "invalid email or password",
        );
    }

    let account = account.expect("verified implies account");
    services.login_throttle.record_success(&addr);

    let token = match services
        .tokens
        .issue(account.user_id, &account.email, account.role, now)
    {
        Ok(token) => token,
        Err(e) => {
            return errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "token_error",
                e.to_string(),
            );
        }
    };

    record_activity(
        &services,
        Some(account.user_id),
        Some(&headers),
        "login",
        "auth",
        "staff login",
        Some(account.user_id.to_string()),
        serde_json::Value::Null,
    );

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "token": token,
            "user": dto::staff_to_json(&account),
        })),
    )
        .into_response()
}
