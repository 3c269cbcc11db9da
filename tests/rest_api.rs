//! REST API tests: spins the axum router up on a random loopback port and
//! exercises the envelope contract over real HTTP.

mod common;

use common::{make_ctx, signup};
use provisiond::{jobs, rest, AppContext};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

async fn spawn_server(ctx: Arc<AppContext>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, rest::build_router(ctx)).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn signup_then_status_roundtrip() {
    let dir = TempDir::new().unwrap();
    let (ctx, _state) = make_ctx(&dir).await;
    let base = spawn_server(ctx).await;

    let response = client()
        .post(format!("{base}/api/v1/instances"))
        .json(&signup("acme"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(true));
    let request_id = body["data"]["request_id"].as_str().unwrap().to_string();
    assert!(request_id.starts_with("REQ-"));
    assert_eq!(body["data"]["state"], json!("completed"));
    assert_eq!(body["data"]["estimated_minutes"], json!(30));

    let body: Value = client()
        .get(format!("{base}/api/v1/requests/{request_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["subdomain"], json!("acme"));
    assert_eq!(body["data"]["plan_name"], json!("Basic"));
}

#[tokio::test]
async fn missing_fields_are_rejected_with_their_names() {
    let dir = TempDir::new().unwrap();
    let (ctx, _state) = make_ctx(&dir).await;
    let base = spawn_server(ctx).await;

    let response = client()
        .post(format!("{base}/api/v1/instances"))
        .json(&json!({ "customer_email": "a@b.co" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error_code"], json!("MISSING_FIELDS"));
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("company_name"));
    assert!(message.contains("subdomain"));
}

#[tokio::test]
async fn unknown_request_id_maps_to_not_found_code() {
    let dir = TempDir::new().unwrap();
    let (ctx, _state) = make_ctx(&dir).await;
    let base = spawn_server(ctx).await;

    let response = client()
        .get(format!("{base}/api/v1/requests/REQ-99999999999999-dead"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], json!("REQUEST_NOT_FOUND"));
}

#[tokio::test]
async fn subdomain_validation_covers_format_length_and_availability() {
    let dir = TempDir::new().unwrap();
    let (ctx, _state) = make_ctx(&dir).await;
    let base = spawn_server(ctx.clone()).await;
    let url = format!("{base}/api/v1/subdomains/validate");

    let body: Value = client()
        .post(&url)
        .json(&json!({ "subdomain": "acme" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["available"], json!(true));

    let response = client()
        .post(&url)
        .json(&json!({ "subdomain": "Bad.Name" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], json!("INVALID_FORMAT"));

    let response = client()
        .post(&url)
        .json(&json!({ "subdomain": "ab" }))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], json!("INVALID_LENGTH"));

    let response = client().post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], json!("MISSING_SUBDOMAIN"));

    // Take the subdomain, then ask again.
    provisiond::request::create_from_signup(&ctx.storage, &ctx.config, &signup("acme"))
        .await
        .unwrap();
    let body: Value = client()
        .post(&url)
        .json(&json!({ "subdomain": "acme" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["available"], json!(false));
    assert_eq!(body["data"]["message"], json!("Subdomain is already taken"));
}

#[tokio::test]
async fn instance_info_actions_and_logs() {
    let dir = TempDir::new().unwrap();
    let (ctx, _state) = make_ctx(&dir).await;
    let base = spawn_server(ctx.clone()).await;

    provisiond::request::create_from_signup(&ctx.storage, &ctx.config, &signup("acme"))
        .await
        .unwrap();
    jobs::provision_sweep(&ctx).await;

    let body: Value = client()
        .get(format!("{base}/api/v1/instances/acme"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["state"], json!("active"));
    assert_eq!(body["data"]["url"], json!("https://acme.apps.example.com"));
    assert_eq!(body["data"]["plan_name"], json!("Basic"));

    // Unknown action is rejected before anything runs.
    let response = client()
        .post(format!("{base}/api/v1/instances/acme/actions"))
        .json(&json!({ "action": "explode" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], json!("UNKNOWN_ACTION"));

    // Stop, then stopping again is a lifecycle error surfaced as USER_ERROR.
    let body: Value = client()
        .post(format!("{base}/api/v1/instances/acme/actions"))
        .json(&json!({ "action": "stop" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["state"], json!("suspended"));

    let response = client()
        .post(format!("{base}/api/v1/instances/acme/actions"))
        .json(&json!({ "action": "stop" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], json!("USER_ERROR"));

    // Logs carry the provisioning timeline and a level summary.
    let body: Value = client()
        .get(format!("{base}/api/v1/instances/acme/logs?hours=1&limit=100"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], json!(true));
    let messages: Vec<&str> = body["data"]["logs"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|l| l["message"].as_str())
        .collect();
    assert!(messages.contains(&"Provisioning completed successfully"));
    assert!(body["data"]["summary"]["by_level"]["info"].as_i64().unwrap() > 0);

    let response = client()
        .get(format!("{base}/api/v1/instances/ghost/logs"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], json!("INSTANCE_NOT_FOUND"));
}

#[tokio::test]
async fn plans_and_health_endpoints() {
    let dir = TempDir::new().unwrap();
    let (ctx, _state) = make_ctx(&dir).await;
    let base = spawn_server(ctx).await;

    let body: Value = client()
        .get(format!("{base}/api/v1/plans"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], json!(true));
    let plans = body["data"].as_array().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0]["code"], json!("basic"));
    assert_eq!(plans[0]["features"], json!(["crm", "sale"]));

    let body: Value = client()
        .get(format!("{base}/api/v1/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], json!(true));
    assert!(body["data"]["status"].is_string());
    assert!(body["data"]["checks"].as_array().unwrap().len() >= 3);
}
