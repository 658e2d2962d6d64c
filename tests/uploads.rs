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
    ($app:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/auth/register")
            .set_json(serde_json::json!({"name": "Ada", "email": "ada@campus.test", "password": "hunter22"}))
            .to_request();
        let resp = test::call_service($app, req).await;
        assert_eq!(resp.status(), 201);
        let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        v["token"].as_str().unwrap().to_string()
    }};
}

const BOUNDARY: &str = "XBOUNDARYX";

fn multipart_body(filename: &str, content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body: Vec<u8> = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn tiny_png() -> Vec<u8> {
    vec![
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A,
        0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R',
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00,
        0x1F, 0x15, 0xC4, 0x89,
        0x00, 0x00, 0x00, 0x0A, b'I', b'D', b'A', b'T', 0x78, 0x9C, 0x63, 0x00, 0x01,
        0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4,
        0x00, 0x00, 0x00, 0x00, b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82,
    ]
}

macro_rules! upload {
    ($app:expr, $token:expr, $body:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/upload")
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .insert_header((
                "Content-Type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload($body)
            .to_request();
        test::call_service($app, req).await
    }};
}

#[actix_web::test]
#[serial]
async fn upload_requires_auth() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/upload")
        .insert_header((
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart_body("a.png", "image/png", &tiny_png()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
#[serial]
async fn rejects_disallowed_content() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;
    let token = register!(&app);

    let resp = upload!(
        &app,
        token,
        multipart_body("notes.txt", "text/plain", b"plain text")
    );
    assert_eq!(resp.status(), 415);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(v["message"].as_str().unwrap().contains("PDF"));

    // a field with the wrong name is ignored entirely
    let mut body: Vec<u8> = Vec::new();
    body.extend_from_slice(
        format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nx\r\n--{BOUNDARY}--\r\n")
            .as_bytes(),
    );
    let resp = upload!(&app, token, body);
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
#[serial]
async fn image_upload_roundtrip() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;
    let token = register!(&app);

    // declared type is deliberately vague; sniffing identifies the PNG
    let resp = upload!(
        &app,
        token,
        multipart_body("photo.png", "application/octet-stream", &tiny_png())
    );
    assert_eq!(resp.status(), 201);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["type"], "image/png");
    assert_eq!(v["resourceClass"], "image");
    assert_eq!(v["filename"], "photo.png");
    let url = v["url"].as_str().unwrap();
    assert!(url.starts_with("/uploads/"));
    assert!(url.ends_with(".png"));

    // the stored object is served back with its MIME type, inline
    let req = test::TestRequest::get()
        .uri(url)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "image/png"
    );
    assert!(resp.headers().get("content-disposition").is_none());
    let served = test::read_body(resp).await;
    assert_eq!(served.as_ref(), tiny_png().as_slice());
}

#[actix_web::test]
#[serial]
async fn pdf_upload_is_raw_and_downloads_as_attachment() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;
    let token = register!(&app);

    let pdf = b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\ntrailer\n<<>>\n%%EOF\n".to_vec();
    let resp = upload!(
        &app,
        token,
        multipart_body("syllabus.pdf", "application/pdf", &pdf)
    );
    assert_eq!(resp.status(), 201);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["type"], "application/pdf");
    assert_eq!(v["resourceClass"], "raw");
    let url = v["url"].as_str().unwrap();
    // canonical extension comes from the verified MIME type
    assert!(url.ends_with(".pdf"), "url was {url}");

    let req = test::TestRequest::get().uri(url).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/pdf"
    );
    let cd = resp
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cd.starts_with("attachment"));
}

#[actix_web::test]
#[serial]
async fn oversized_upload_is_rejected() {
    let tmp = setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(&tmp)))
            .configure(config),
    )
    .await;
    let token = register!(&app);

    let mut pdf = b"%PDF-1.4\n".to_vec();
    pdf.resize(10 * 1024 * 1024 + 1, 0u8);
    let resp = upload!(
        &app,
        token,
        multipart_body("huge.pdf", "application/pdf", &pdf)
    );
    assert_eq!(resp.status(), 413);
}
