#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use actix_web::{test, App};
use campus_connect::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use campus_connect::repo::inmem::InMemRepo;
use campus_connect::routes::{config, AppState};
use campus_connect::storage::LocalDiskStore;
use serial_test::serial;

// JWT secret plus a unique snapshot dir per test
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
    ($app:expr, $name:expr, $email:expr, $pass:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/auth/register")
            .set_json(serde_json::json!({"name": $name, "email": $email, "password": $pass}))
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

#[actix_web::test]
#[serial]
async fn register_login_me_flow() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;

    let (token, id) = register!(&app, "Ada", "ada@campus.test", "hunter22");

    // me with the fresh token
    let req = test::TestRequest::get()
        .uri("/api/auth/me")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["user"]["id"].as_i64().unwrap(), id);
    assert_eq!(me["user"]["email"], "ada@campus.test");
    assert_eq!(me["user"]["role"], "student");

    // me without a token
    let req = test::TestRequest::get().uri("/api/auth/me").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    // wrong password
    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .set_json(serde_json::json!({"email": "ada@campus.test", "password": "nope"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    let err: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(err["message"], "Invalid credentials");

    // correct password, email case-insensitive
    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .set_json(serde_json::json!({"email": "ADA@Campus.Test", "password": "hunter22"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(v["token"].as_str().unwrap().len() > 10);
}

#[actix_web::test]
#[serial]
async fn duplicate_email_is_conflict() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;

    let _ = register!(&app, "Ada", "ada@campus.test", "hunter22");

    // same address, different case
    let req = test::TestRequest::post()
        .uri("/api/auth/register")
        .set_json(serde_json::json!({"name": "Imposter", "email": "Ada@Campus.Test", "password": "secret99"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let err: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(err["message"], "Email already registered");
}

#[actix_web::test]
#[serial]
async fn register_rejects_missing_fields() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/auth/register")
        .set_json(serde_json::json!({"name": "", "email": "a@b.c", "password": "secret99"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
#[serial]
async fn change_password_flow() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;

    let (token, _) = register!(&app, "Ada", "ada@campus.test", "hunter22");

    // wrong current password
    let req = test::TestRequest::patch()
        .uri("/api/auth/change-password")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .set_json(serde_json::json!({"currentPassword": "wrong", "newPassword": "brandnew1"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    // new password too short
    let req = test::TestRequest::patch()
        .uri("/api/auth/change-password")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .set_json(serde_json::json!({"currentPassword": "hunter22", "newPassword": "abc"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // valid change
    let req = test::TestRequest::patch()
        .uri("/api/auth/change-password")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .set_json(serde_json::json!({"currentPassword": "hunter22", "newPassword": "brandnew1"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // old password no longer works
    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .set_json(serde_json::json!({"email": "ada@campus.test", "password": "hunter22"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    // new one does
    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .set_json(serde_json::json!({"email": "ada@campus.test", "password": "brandnew1"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}

#[actix_web::test]
#[serial]
async fn profile_update_and_email_conflict() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;

    let (token_a, _) = register!(&app, "Ada", "ada@campus.test", "hunter22");
    let _ = register!(&app, "Grace", "grace@campus.test", "hunter22");

    // bio and name update
    let req = test::TestRequest::patch()
        .uri("/api/auth/profile")
        .insert_header(("Authorization", format!("Bearer {token_a}")))
        .set_json(serde_json::json!({"name": "Ada L.", "bio": "CS dept"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["user"]["name"], "Ada L.");
    assert_eq!(v["user"]["bio"], "CS dept");

    // taking Grace's email is a conflict
    let req = test::TestRequest::patch()
        .uri("/api/auth/profile")
        .insert_header(("Authorization", format!("Bearer {token_a}")))
        .set_json(serde_json::json!({"email": "GRACE@campus.test"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
}
