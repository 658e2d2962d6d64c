use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Compress, App, HttpServer};
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod error;
mod models;
mod openapi;
mod policy;
mod rate_limit;
mod repo;
mod routes;
mod security;
mod storage;

use auth::hash_password;
use models::Role;
use openapi::ApiDoc;
use rate_limit::RateLimiterFacade;
use repo::{CreateUser, Repo, RepoError};
use routes::{config, AppState};
use security::SecurityHeaders;
use storage::build_file_store;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Environment must be configured externally in production; load .env
    // only in debug builds to ease local setup.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    validate_env_vars();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping campus-connect server");

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo = {
        info!("Using in-memory repository backend");
        repo::inmem::InMemRepo::new()
    };

    #[cfg(feature = "postgres-store")]
    let repo = {
        use sqlx::postgres::PgPoolOptions;
        let db_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres-store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .expect("Failed to create Pg pool");
        let r = repo::pg::PgRepo::new(pool);
        r.migrate().await.expect("Failed to run migrations");
        info!("Using Postgres repository backend");
        r
    };

    let repo: Arc<dyn Repo> = Arc::new(repo);
    seed_admin(repo.as_ref()).await;

    let files = build_file_store()
        .await
        .expect("Failed to initialise file storage");
    let rate = RateLimiterFacade::from_env();
    let openapi = ApiDoc::openapi();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);

    let state = AppState { repo, files, rate };

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                .allowed_origin("http://localhost:5173")
                .allowed_origin("http://127.0.0.1:5173")
                .allowed_origin("http://localhost:3000")
                .allowed_origin("http://127.0.0.1:3000")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
                .supports_credentials()
                .max_age(3600);
            if let Ok(client) = std::env::var("CLIENT_URL") {
                c = c.allowed_origin(&client);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(SecurityHeaders::from_env())
            .wrap(cors)
            .app_data(actix_web::web::Data::new(state.clone()))
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind(("0.0.0.0", port))?;

    info!("Listening on http://0.0.0.0:{port}");

    server.run().await
}

/// Create the bootstrap admin account on first start when ADMIN_EMAIL and
/// ADMIN_PASSWORD are configured. A Conflict means it already exists.
async fn seed_admin(repo: &dyn Repo) {
    let (email, password) = match (
        std::env::var("ADMIN_EMAIL"),
        std::env::var("ADMIN_PASSWORD"),
    ) {
        (Ok(e), Ok(p)) if !e.is_empty() && !p.is_empty() => (e.to_lowercase(), p),
        _ => return,
    };
    let name = std::env::var("ADMIN_NAME").unwrap_or_else(|_| "Administrator".into());
    let password_hash = match hash_password(&password) {
        Ok(h) => h,
        Err(e) => {
            warn!("Could not hash bootstrap admin password: {e}");
            return;
        }
    };
    match repo
        .create_user(CreateUser {
            name,
            email: email.clone(),
            password_hash,
            role: Role::Admin,
        })
        .await
    {
        Ok(u) => info!("Seeded bootstrap admin account {} (id {})", email, u.id),
        Err(RepoError::Conflict) => {}
        Err(e) => warn!("Could not seed bootstrap admin account: {e}"),
    }
}

/// Validate that required environment variables are set.
fn validate_env_vars() {
    use std::env;

    if env::var("JWT_SECRET").is_err() {
        eprintln!("Missing required environment variable JWT_SECRET");
        eprintln!("Please copy .env.example to .env and configure it");
        std::process::exit(1);
    }

    if let Ok(secret) = env::var("JWT_SECRET") {
        if secret.len() < 32 {
            eprintln!("JWT_SECRET must be at least 32 characters long");
            std::process::exit(1);
        }
    }

    if env::var("S3_ENDPOINT").is_err() {
        eprintln!("Note: S3_ENDPOINT not set, uploads will be stored on local disk");
    }
}
