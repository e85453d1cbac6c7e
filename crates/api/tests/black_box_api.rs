//! Black-box API tests: the real router on an ephemeral port, recording
//! fakes for the external collaborators, and HTTP as the only interface.

use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::json;
use sha2::Sha256;

use billflow_api::app::services::ExternalAdapters;
use billflow_api::app::build_app_with;
use billflow_api::config::AppConfig;
use billflow_auth::{Claims, StaffRole};
use billflow_core::UserId;
use billflow_infra::gateway::RecordingCheckoutGateway;
use billflow_infra::mailer::RecordingMailer;
use billflow_infra::stock_api::InMemoryStockGateway;

const JWT_SECRET: &str = "test-secret";
const WEBHOOK_SECRET: &str = "whsec_black_box";

fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        token_ttl_secs: 600,
        public_base_url: "http://billflow.test".to_string(),
        stripe_secret_key: None,
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        webhook_tolerance_secs: 300,
        stock_api_base: None,
        stock_api_key: None,
        smtp: None,
        overdue_grace_secs: 0,
        email_cooldown_secs: 300,
        login_max_failures: 3,
        login_cooldown_secs: 900,
        database_url: None,
        seed_admin: Some(("root@billflow.test".to_string(), "root-password".to_string())),
    }
}

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    checkout: Arc<RecordingCheckoutGateway>,
    stock: Arc<InMemoryStockGateway>,
    mailer: Arc<RecordingMailer>,
}

impl TestServer {
    async fn spawn(config: AppConfig) -> Self {
        let (adapters, checkout, stock, mailer) = ExternalAdapters::recording();
        let app = build_app_with(config, adapters).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            checkout,
            stock,
            mailer,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(role: StaffRole) -> String {
    let now = Utc::now();
    let claims = Claims {
        sub: UserId::new(),
        email: format!("{}@billflow.test", role.as_str()),
        role,
        iat: now.timestamp(),
        exp: now.timestamp() + 600,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn sign_webhook(body: &str) -> String {
    let timestamp = Utc::now().timestamp();
    let mut mac =
        Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).expect("hmac accepts any key");
    mac.update(format!("{timestamp}.{body}").as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={signature}")
}

fn checkout_completed_body(invoice_id: &str) -> String {
    json!({
        "id": "evt_1",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_live_1",
            "metadata": { "invoice_id": invoice_id },
            "payment_intent": "pi_live_1"
        }}
    })
    .to_string()
}

async fn create_invoice(
    client: &reqwest::Client,
    server: &TestServer,
    token: &str,
    body: serde_json::Value,
) -> serde_json::Value {
    let res = client
        .post(format!("{}/billing/invoices", server.base_url))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

fn two_item_invoice() -> serde_json::Value {
    json!({
        "invoice_number": "INV-1001",
        "customer": { "name": "Ada GmbH", "email": "billing@ada.example" },
        "lines": [
            { "product_ref": "prod_a", "description": "Widget", "quantity": 2, "unit_price": 1000 },
            { "product_ref": "prod_b", "description": "Gadget", "quantity": 1, "unit_price": 500 }
        ]
    })
}

/// The API is eventually consistent (command path vs projection update):
/// poll briefly until the read model satisfies `pred`.
async fn get_invoice_eventually(
    client: &reqwest::Client,
    server: &TestServer,
    token: &str,
    id: &str,
    pred: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    for _ in 0..100 {
        let res = client
            .get(format!("{}/billing/invoices/{}", server.base_url, id))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        if res.status() == StatusCode::OK {
            let body: serde_json::Value = res.json().await.unwrap();
            if pred(&body) {
                return body;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("invoice did not reach the expected state within the timeout");
}

async fn send_invoice_email(
    client: &reqwest::Client,
    server: &TestServer,
    token: &str,
    id: &str,
) -> reqwest::Response {
    client
        .post(format!("{}/billing/invoices/{}/email", server.base_url, id))
        .bearer_auth(token)
        .json(&json!({ "recipient_email": "billing@ada.example" }))
        .send()
        .await
        .unwrap()
}

async fn post_webhook(
    client: &reqwest::Client,
    server: &TestServer,
    body: &str,
    signature: &str,
) -> reqwest::Response {
    client
        .post(format!("{}/webhooks/payments", server.base_url))
        .header("stripe-signature", signature)
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protected_routes_require_a_token() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/billing/invoices", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paid_webhook_reconciles_invoice_and_syncs_stock() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    server.stock.set_level("prod_a", Some(10));
    server.stock.set_level("prod_b", Some(5));

    // Scenario: 2 items (10.00 × 2, 5.00 × 1) totaling 25.00, sent, then
    // the gateway confirms the checkout.
    let created = create_invoice(&client, &server, &token, two_item_invoice()).await;
    let id = created["id"].as_str().unwrap().to_string();

    let res = send_invoice_email(&client, &server, &token, &id).await;
    assert_eq!(res.status(), StatusCode::OK);
    let invoice =
        get_invoice_eventually(&client, &server, &token, &id, |v| v["status"] == "sent").await;
    assert_eq!(invoice["total"], 2500);
    assert!(invoice["sent_at"].is_string());
    assert_eq!(server.mailer.sent().len(), 1);

    let body = checkout_completed_body(&id);
    let res = post_webhook(&client, &server, &body, &sign_webhook(&body)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let ack: serde_json::Value = res.json().await.unwrap();
    assert_eq!(ack["received"], true);

    let invoice =
        get_invoice_eventually(&client, &server, &token, &id, |v| v["status"] == "paid").await;
    assert!(invoice["paid_date"].is_string());
    assert_eq!(invoice["payment_method"], "stripe");
    assert_eq!(invoice["stock_update_status"], "completed");
    assert!(invoice["stock_updated_at"].is_string());

    // Both product refs decremented by the quantities sold.
    assert_eq!(server.stock.level("prod_a"), Some(Some(8)));
    assert_eq!(server.stock.level("prod_b"), Some(Some(4)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replayed_webhook_deliveries_do_not_double_decrement() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    server.stock.set_level("prod_a", Some(10));
    server.stock.set_level("prod_b", Some(5));

    let created = create_invoice(&client, &server, &token, two_item_invoice()).await;
    let id = created["id"].as_str().unwrap().to_string();
    send_invoice_email(&client, &server, &token, &id).await;

    let body = checkout_completed_body(&id);
    let res = post_webhook(&client, &server, &body, &sign_webhook(&body)).await;
    assert_eq!(res.status(), StatusCode::OK);

    let paid =
        get_invoice_eventually(&client, &server, &token, &id, |v| v["status"] == "paid").await;
    let first_paid_date = paid["paid_date"].clone();

    // Gateway retry: same event again (fresh signature, same payload).
    let res = post_webhook(&client, &server, &body, &sign_webhook(&body)).await;
    assert_eq!(res.status(), StatusCode::OK);

    let replayed = get_invoice_eventually(&client, &server, &token, &id, |v| {
        v["stock_update_status"] == "completed"
    })
    .await;
    assert_eq!(replayed["paid_date"], first_paid_date);
    assert_eq!(server.stock.level("prod_a"), Some(Some(8)));
    assert_eq!(server.stock.level("prod_b"), Some(Some(4)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webhook_with_a_bad_signature_changes_nothing() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    let created = create_invoice(&client, &server, &token, two_item_invoice()).await;
    let id = created["id"].as_str().unwrap().to_string();
    send_invoice_email(&client, &server, &token, &id).await;
    get_invoice_eventually(&client, &server, &token, &id, |v| v["status"] == "sent").await;

    let body = checkout_completed_body(&id);
    let timestamp = Utc::now().timestamp();
    let res = post_webhook(
        &client,
        &server,
        &body,
        &format!("t={timestamp},v1=deadbeef"),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Still sent, nothing reconciled.
    let invoice =
        get_invoice_eventually(&client, &server, &token, &id, |v| v["status"] == "sent").await;
    assert!(invoice["paid_date"].is_null());
    assert_eq!(invoice["stock_update_status"], "none");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unhandled_event_types_are_acknowledged() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();

    let body = json!({
        "type": "customer.subscription.updated",
        "data": { "object": { "id": "sub_1" } }
    })
    .to_string();
    let res = post_webhook(&client, &server, &body, &sign_webhook(&body)).await;
    assert_eq!(res.status(), StatusCode::OK);

    // Missing metadata is a dropped event, not a failure.
    let body = json!({
        "type": "checkout.session.completed",
        "data": { "object": { "id": "cs_nometa" } }
    })
    .to_string();
    let res = post_webhook(&client, &server, &body, &sign_webhook(&body)).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_stock_sync_reports_207_with_per_item_details() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    // prod_b is unknown to the platform: its decrement fails, prod_a's
    // succeeds.
    server.stock.set_level("prod_a", Some(10));

    let created = create_invoice(&client, &server, &token, two_item_invoice()).await;
    let id = created["id"].as_str().unwrap().to_string();
    send_invoice_email(&client, &server, &token, &id).await;

    let body = checkout_completed_body(&id);
    post_webhook(&client, &server, &body, &sign_webhook(&body)).await;
    get_invoice_eventually(&client, &server, &token, &id, |v| {
        v["stock_update_status"] == "partial"
    })
    .await;

    // Manual retry through the sync endpoint: still partial, 207, with
    // per-item success flags.
    let res = client
        .post(format!(
            "{}/billing/invoices/{}/stock-sync",
            server.base_url, id
        ))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::MULTI_STATUS);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["success"], false);
    assert_eq!(report["updated_items"], 1);
    let details = report["details"].as_array().unwrap();
    assert_eq!(details.len(), 2);
    assert_eq!(details[0]["product_id"], "prod_a");
    assert_eq!(details[0]["success"], true);
    assert_eq!(details[1]["product_id"], "prod_b");
    assert_eq!(details[1]["success"], false);
    assert!(details[1]["error"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkout_session_mirrors_invoice_amounts() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    let created = create_invoice(&client, &server, &token, two_item_invoice()).await;
    let id = created["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!(
            "{}/billing/invoices/{}/checkout-session",
            server.base_url, id
        ))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["payment_url"].as_str().unwrap().starts_with("https://checkout.test/"));
    assert!(body["payment_link_id"].is_string());

    let specs = server.checkout.requests();
    assert_eq!(specs.len(), 1);
    let session_total: u64 = specs[0]
        .line_items
        .iter()
        .map(|l| l.quantity as u64 * l.unit_amount)
        .sum();
    assert_eq!(session_total, 2500);
    assert_eq!(specs[0].customer_email, "billing@ada.example");

    // The link lands on the read model, and the public view serves it.
    let invoice = get_invoice_eventually(&client, &server, &token, &id, |v| {
        v["payment_url"].is_string()
    })
    .await;
    assert_eq!(invoice["payment_link_id"], body["payment_link_id"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_invoices_cannot_create_checkout_sessions() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    let created = create_invoice(
        &client,
        &server,
        &token,
        json!({
            "invoice_number": "INV-EMPTY",
            "customer": { "name": "Ada GmbH", "email": "billing@ada.example" },
            "lines": []
        }),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!(
            "{}/billing/invoices/{}/checkout-session",
            server.base_url, id
        ))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    assert!(server.checkout.requests().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn public_token_grants_view_and_checkout_without_a_session() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    let created = create_invoice(&client, &server, &token, two_item_invoice()).await;
    let id = created["id"].as_str().unwrap().to_string();
    send_invoice_email(&client, &server, &token, &id).await;

    // The email issues the public token; pick it off the mail body.
    let sent = server.mailer.sent();
    assert_eq!(sent.len(), 1);
    let public_token = sent[0]
        .body
        .split("/public/invoices/")
        .nth(1)
        .unwrap()
        .trim()
        .to_string();

    // Unauthenticated view: view-only until a payment link exists.
    let res = client
        .get(format!(
            "{}/public/invoices/{}",
            server.base_url, public_token
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let view: serde_json::Value = res.json().await.unwrap();
    assert_eq!(view["invoice_number"], "INV-1001");
    assert!(view["payment_url"].is_null());

    // Unauthenticated checkout via the token.
    let res = client
        .post(format!(
            "{}/public/invoices/{}/checkout-session",
            server.base_url, public_token
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // A made-up token stays locked out.
    let res = client
        .get(format!(
            "{}/public/invoices/not-a-real-token",
            server.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn email_resend_within_cooldown_is_rejected_without_side_effects() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    let created = create_invoice(&client, &server, &token, two_item_invoice()).await;
    let id = created["id"].as_str().unwrap().to_string();

    let res = send_invoice_email(&client, &server, &token, &id).await;
    assert_eq!(res.status(), StatusCode::OK);
    let invoice =
        get_invoice_eventually(&client, &server, &token, &id, |v| v["status"] == "sent").await;
    let first_stamp = invoice["last_invoice_email_sent"].clone();

    let res = send_invoice_email(&client, &server, &token, &id).await;
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["retry_after_secs"].as_i64().unwrap() > 0);

    // The rejected call changed nothing and sent nothing.
    let invoice =
        get_invoice_eventually(&client, &server, &token, &id, |v| v["status"] == "sent").await;
    assert_eq!(invoice["last_invoice_email_sent"], first_stamp);
    assert_eq!(server.mailer.sent().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn email_recipient_must_match_the_invoice_customer() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    let created = create_invoice(&client, &server, &token, two_item_invoice()).await;
    let id = created["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("{}/billing/invoices/{}/email", server.base_url, id))
        .bearer_auth(&token)
        .json(&json!({ "recipient_email": "somebody@else.example" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(server.mailer.sent().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overdue_sweep_respects_the_boundary_and_terminal_states() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(StaffRole::Admin);

    let past_due = json!({
        "invoice_number": "INV-PAST",
        "customer": { "name": "Ada GmbH", "email": "billing@ada.example" },
        "lines": [{ "description": "Widget", "quantity": 1, "unit_price": 100 }],
        "due_date": (Utc::now() - chrono::Duration::days(3)).to_rfc3339()
    });
    let future_due = json!({
        "invoice_number": "INV-FUTURE",
        "customer": { "name": "Ada GmbH", "email": "billing@ada.example" },
        "lines": [{ "description": "Widget", "quantity": 1, "unit_price": 100 }],
        "due_date": (Utc::now() + chrono::Duration::days(3)).to_rfc3339()
    });

    let past = create_invoice(&client, &server, &token, past_due).await;
    let past_id = past["id"].as_str().unwrap().to_string();
    let future = create_invoice(&client, &server, &token, future_due).await;
    let future_id = future["id"].as_str().unwrap().to_string();

    for id in [&past_id, &future_id] {
        send_invoice_email(&client, &server, &token, id).await;
        get_invoice_eventually(&client, &server, &token, id, |v| v["status"] == "sent").await;
    }

    let res = client
        .post(format!("{}/admin/sweeps/overdue", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["marked_overdue"], 1);
    assert_eq!(body["invoices"][0]["invoice_number"], "INV-PAST");

    get_invoice_eventually(&client, &server, &token, &past_id, |v| {
        v["status"] == "overdue"
    })
    .await;
    let future_invoice =
        get_invoice_eventually(&client, &server, &token, &future_id, |v| {
            v["status"] == "sent"
        })
        .await;
    assert_eq!(future_invoice["status"], "sent");

    // Idempotent: the second run finds nothing new.
    let res = client
        .post(format!("{}/admin/sweeps/overdue", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["marked_overdue"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admins_cannot_create_privileged_accounts() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let admin = mint_jwt(StaffRole::Admin);

    // Scenario: an admin (not super_admin) tries to mint another admin.
    let res = client
        .post(format!("{}/admin/users", server.base_url))
        .bearer_auth(&admin)
        .json(&json!({
            "email": "newadmin@billflow.test",
            "password": "hunter2hunter2",
            "display_name": "New Admin",
            "role": "admin"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // No account came into existence.
    let super_admin = mint_jwt(StaffRole::SuperAdmin);
    let res = client
        .get(format!("{}/admin/users", server.base_url))
        .bearer_auth(&super_admin)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    let emails: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|u| u["email"].as_str())
        .collect();
    assert!(!emails.contains(&"newadmin@billflow.test"));

    // Employees cannot manage accounts at all.
    let employee = mint_jwt(StaffRole::Employee);
    let res = client
        .post(format!("{}/admin/users", server.base_url))
        .bearer_auth(&employee)
        .json(&json!({
            "email": "x@billflow.test",
            "password": "hunter2hunter2",
            "display_name": "X",
            "role": "employee"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_emails_are_rejected_with_a_distinct_code() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();
    let admin = mint_jwt(StaffRole::Admin);

    let request = json!({
        "email": "kim@billflow.test",
        "password": "hunter2hunter2",
        "display_name": "Kim",
        "role": "employee"
    });

    let res = client
        .post(format!("{}/admin/users", server.base_url))
        .bearer_auth(&admin)
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    // Wait until the directory sees the first account, then collide.
    for _ in 0..100 {
        let res = client
            .get(format!("{}/admin/users", server.base_url))
            .bearer_auth(&admin)
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = res.json().await.unwrap();
        if body["items"]
            .as_array()
            .unwrap()
            .iter()
            .any(|u| u["email"] == "kim@billflow.test")
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let res = client
        .post(format!("{}/admin/users", server.base_url))
        .bearer_auth(&admin)
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "DUPLICATE_EMAIL");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_is_throttled_per_source_address() {
    let server = TestServer::spawn(test_config()).await;
    let client = reqwest::Client::new();

    // Wait for the seeded super admin to land in the directory before
    // touching the login endpoint (failed polls would count as failures).
    let probe = mint_jwt(StaffRole::SuperAdmin);
    let mut seeded = false;
    for _ in 0..200 {
        let res = client
            .get(format!("{}/admin/users", server.base_url))
            .bearer_auth(&probe)
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = res.json().await.unwrap();
        if body["items"]
            .as_array()
            .is_some_and(|items| items.iter().any(|u| u["email"] == "root@billflow.test"))
        {
            seeded = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    assert!(seeded, "seed admin never appeared in the directory");

    let res = client
        .post(format!("{}/auth/login", server.base_url))
        .header("x-forwarded-for", "198.51.100.7")
        .json(&json!({ "email": "root@billflow.test", "password": "root-password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let login: serde_json::Value = res.json().await.unwrap();
    assert_eq!(login["user"]["role"], "super_admin");
    let session_token = login["token"].as_str().unwrap();

    // The minted session works against protected routes.
    let res = client
        .get(format!("{}/whoami", server.base_url))
        .bearer_auth(session_token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Three failures from one address trip the block.
    for _ in 0..3 {
        let res = client
            .post(format!("{}/auth/login", server.base_url))
            .header("x-forwarded-for", "203.0.113.50")
            .json(&json!({ "email": "root@billflow.test", "password": "wrong" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
    let res = client
        .post(format!("{}/auth/login", server.base_url))
        .header("x-forwarded-for", "203.0.113.50")
        .json(&json!({ "email": "root@billflow.test", "password": "root-password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["retry_after_secs"].as_i64().unwrap() > 0);

    // A different address is unaffected.
    let res = client
        .post(format!("{}/auth/login", server.base_url))
        .header("x-forwarded-for", "198.51.100.8")
        .json(&json!({ "email": "root@billflow.test", "password": "root-password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}
