#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use actix_web::{test, App};
use campus_connect::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use campus_connect::repo::inmem::InMemRepo;
use campus_connect::routes::{config, AppState};
use campus_connect::storage::LocalDiskStore;
use serial_test::serial;

fn setup_env() -> tempfile::TempDir {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("CAMPUS_DATA_DIR", tmp.path().to_str().unwrap());
    tmp
}

fn state(tmp: &tempfile::TempDir) -> AppState {
    AppState {
        repo: Arc::new(InMemRepo::new()),
        files: Arc::new(LocalDiskStore::new(tmp.path().join("uploads"), "")),
        rate: RateLimiterFacade::new(InMemoryRateLimiter::new(false), RateLimitConfig::from_env()),
    }
}

macro_rules! register {
    ($app:expr, $name:expr, $email:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/auth/register")
            .set_json(serde_json::json!({"name": $name, "email": $email, "password": "hunter22"}))
            .to_request();
        let resp = test::call_service($app, req).await;
        assert_eq!(resp.status(), 201);
        let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        (
            v["token"].as_str().unwrap().to_string(),
            v["user"]["id"].as_i64().unwrap(),
        )
    }};
}

macro_rules! send {
    ($app:expr, $token:expr, $to:expr, $content:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/messages")
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .set_json(serde_json::json!({"to": $to, "content": $content}))
            .to_request();
        let resp = test::call_service($app, req).await;
        assert_eq!(resp.status(), 201);
    }};
}

#[actix_web::test]
#[serial]
async fn message_validation() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;

    let (token, _) = register!(&app, "Ada", "ada@campus.test");

    // recipient does not exist
    let req = test::TestRequest::post()
        .uri("/api/messages")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .set_json(serde_json::json!({"to": 9999, "content": "hello?"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    // empty content
    let (_, other) = register!(&app, "Grace", "grace@campus.test");
    let req = test::TestRequest::post()
        .uri("/api/messages")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .set_json(serde_json::json!({"to": other, "content": "   "}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
#[serial]
async fn conversation_marks_incoming_read() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;

    let (token_a, id_a) = register!(&app, "Ada", "ada@campus.test");
    let (token_b, id_b) = register!(&app, "Grace", "grace@campus.test");

    send!(&app, token_a, id_b, "are you coming to the lab?");
    send!(&app, token_a, id_b, "bring the oscilloscope");

    // Grace has two unread from Ada
    let req = test::TestRequest::get()
        .uri("/api/messages/unread-summary")
        .insert_header(("Authorization", format!("Bearer {token_b}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let unread = v["unread"].as_array().unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0]["from"].as_i64().unwrap(), id_a);
    assert_eq!(unread[0]["count"].as_i64().unwrap(), 2);

    // fetching the conversation returns both, already marked read
    let req = test::TestRequest::get()
        .uri(&format!("/api/messages/with/{id_a}"))
        .insert_header(("Authorization", format!("Bearer {token_b}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let messages = v["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "are you coming to the lab?");
    assert!(messages.iter().all(|m| m["read"].as_bool().unwrap()));

    // the unread summary is now empty
    let req = test::TestRequest::get()
        .uri("/api/messages/unread-summary")
        .insert_header(("Authorization", format!("Bearer {token_b}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(v["unread"].as_array().unwrap().is_empty());
}

#[actix_web::test]
#[serial]
async fn conversation_is_two_way_and_one_sided_on_read_state() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;

    let (token_a, id_a) = register!(&app, "Ada", "ada@campus.test");
    let (token_b, id_b) = register!(&app, "Grace", "grace@campus.test");

    send!(&app, token_a, id_b, "ping");
    send!(&app, token_b, id_a, "pong");

    // Ada opens the thread: both directions, oldest first
    let req = test::TestRequest::get()
        .uri(&format!("/api/messages/with/{id_b}"))
        .insert_header(("Authorization", format!("Bearer {token_a}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let messages = v["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "ping");
    assert_eq!(messages[1]["content"], "pong");
    // Ada's own outgoing message stays unread until Grace opens the thread
    assert!(!messages[0]["read"].as_bool().unwrap());
    assert!(messages[1]["read"].as_bool().unwrap());

    // Grace still has Ada's message pending
    let req = test::TestRequest::get()
        .uri("/api/messages/unread-summary")
        .insert_header(("Authorization", format!("Bearer {token_b}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let unread = v["unread"].as_array().unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0]["count"].as_i64().unwrap(), 1);
}
