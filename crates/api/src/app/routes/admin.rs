use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, post},
};
use chrono::Utc;

use billflow_auth::{
    CreateAccount, DeactivateAccount, StaffAccountCommand, StaffRole, hash_password,
};
use billflow_billing::{InvoiceCommand, MarkOverdue};
use billflow_core::UserId;

use crate::app::routes::common::record_activity;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/users", post(create_user).get(list_users))
        .route("/users/:id", delete(delete_user))
        .route("/sweeps/overdue", post(run_overdue_sweep))
}

fn require_admin(principal: &PrincipalContext) -> Result<(), axum::response::Response> {
    if principal.role() == StaffRole::Employee {
        return Err(errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "administrative role required",
        ));
    }
    Ok(())
}

pub async fn create_user(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    Json(body): Json<dto::CreateUserRequest>,
) -> axum::response::Response {
    let role: StaffRole = match body.role.parse() {
        Ok(role) => role,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "role must be super_admin, admin or employee",
            );
        }
    };

    // Role policy is enforced before anything is created.
    if !principal.role().can_create(role) {
        return errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            format!(
                "a {} may not create {} accounts",
                principal.role(),
                role
            ),
        );
    }

    if services
        .staff()
        .find_active_by_email(&body.email)
        .is_some()
    {
        return errors::json_error(
            StatusCode::CONFLICT,
            "DUPLICATE_EMAIL",
            "an account with this email already exists",
        );
    }

    let password_hash = match hash_password(&body.password) {
        Ok(hash) => hash,
        Err(e) => {
            return errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                e.to_string(),
            );
        }
    };

    let user_id = UserId::new();
    let cmd = StaffAccountCommand::Create(CreateAccount {
        user_id,
        email: body.email.clone(),
        display_name: body.display_name,
        role,
        password_hash,
        occurred_at: Utc::now(),
    });
    if let Err(e) = services.dispatch_account(user_id, cmd).await {
        return errors::dispatch_error_to_response(e);
    }

    record_activity(
        &services,
        Some(principal.user_id()),
        Some(&headers),
        "user_created",
        "admin",
        format!("staff account created with role {role}"),
        Some(user_id.to_string()),
        serde_json::json!({ "email": body.email, "role": role.as_str() }),
    );

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": user_id.to_string(),
            "email": body.email,
            "role": role.as_str(),
        })),
    )
        .into_response()
}

pub async fn delete_user(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let user_id: UserId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid user id");
        }
    };

    let Some(target) = services.staff().get(&user_id) else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "user not found");
    };

    if !principal.role().can_delete(target.role) {
        return errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            format!(
                "a {} may not delete {} accounts",
                principal.role(),
                target.role
            ),
        );
    }

    let cmd = StaffAccountCommand::Deactivate(DeactivateAccount {
        user_id,
        occurred_at: Utc::now(),
    });
    if let Err(e) = services.dispatch_account(user_id, cmd).await {
        return errors::dispatch_error_to_response(e);
    }

    record_activity(
        &services,
        Some(principal.user_id()),
        Some(&headers),
        "user_deleted",
        "admin",
        format!("staff account {} deactivated", target.email),
        Some(user_id.to_string()),
        serde_json::Value::Null,
    );

    (
        StatusCode::OK,
        Json(serde_json::json!({ "success": true })),
    )
        .into_response()
}

pub async fn list_users(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&principal) {
        return resp;
    }
    let items = services
        .staff()
        .list()
        .iter()
        .map(dto::staff_to_json)
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

/// Mark sent/pending invoices overdue once their due date has elapsed
/// beyond the configured grace. Idempotent: repeated runs converge, and
/// invoices settled between the scan and the dispatch fall out as
/// aggregate-level no-ops.
pub async fn run_overdue_sweep(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&principal) {
        return resp;
    }

    let now = Utc::now();
    let cutoff = now - services.config.overdue_grace();

    let mut marked = Vec::new();
    for rm in services.invoices().overdue_candidates(cutoff) {
        let cmd = InvoiceCommand::MarkOverdue(MarkOverdue {
            invoice_id: rm.invoice_id,
            cutoff,
            occurred_at: now,
        });
        match services.dispatch_invoice(rm.invoice_id.0, cmd).await {
            Ok(committed) if !committed.is_empty() => {
                marked.push((rm.invoice_id, rm.invoice_number));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(invoice_id = %rm.invoice_id, "overdue sweep dispatch failed: {e:?}");
            }
        }
    }

    record_activity(
        &services,
        Some(principal.user_id()),
        Some(&headers),
        "overdue_sweep",
        "billing",
        format!("{} invoices marked overdue", marked.len()),
        None,
        serde_json::Value::Null,
    );

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "marked_overdue": marked.len(),
            "invoices": marked
                .iter()
                .map(|(id, number)| serde_json::json!({
                    "id": id.to_string(),
                    "invoice_number": number,
                }))
                .collect::<Vec<_>>(),
        })),
    )
        .into_response()
}
