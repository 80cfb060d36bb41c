use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use tower_governor::{
    governor::GovernorConfigBuilder,
    GovernorLayer,
};

mod auth;
mod codec;
mod config;
mod constants;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;
mod storage;
mod viewer;

use auth::{AuthEvent, AuthProvider, SessionAuth};
use config::Config;
use constants::{MULTIPART_OVERHEAD_BYTES, PANOVIEW_EMOJI};
use handlers::AppState;
use services::LinkService;
use storage::LocalObjectStore;
use viewer::PhotoSphereViewer;

fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        // Viewer routes
        .route("/view", get(handlers::view_missing))
        .route("/view/", get(handlers::view_missing))
        .route("/view/:token", get(handlers::view))
        .route("/viewer.js", get(handlers::viewer_js))
        // Storage proxy
        .route("/3d/*path", get(handlers::proxy_object))
        // API routes
        .route("/api/health", get(handlers::health))
        .route("/api/auth/sign-in", post(handlers::sign_in))
        .route("/api/auth/sign-out", post(handlers::sign_out))
        .route("/api/auth/me", get(handlers::me))
        .route("/api/upload", post(handlers::upload))
        .route("/api/links/:token", get(handlers::resolve_link))
        // API docs
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", handlers::ApiDoc::openapi()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::origin_check,
        ))
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "panoview=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; missing secrets stop the process here
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let store = LocalObjectStore::new(&config.storage_dir, &config.storage_public_url).await?;

    let auth = SessionAuth::new(&config.auth_users);
    if auth.user_count() == 0 {
        tracing::warn!("AUTH_USERS is empty: nobody can sign in to upload");
    }
    let _auth_log = auth.subscribe(Box::new(|event: &AuthEvent| match event {
        AuthEvent::SignedIn(principal) => tracing::info!(uid = %principal.uid, "Signed in"),
        AuthEvent::SignedOut(principal) => tracing::info!(uid = %principal.uid, "Signed out"),
    }));

    let links = LinkService::new(&config, Arc::new(store), Arc::new(PhotoSphereViewer));

    let port = config.port;
    let app_state = Arc::new(AppState {
        config,
        links,
        auth,
    });

    // SECURITY: Rate limiting per client IP
    let rate_limit_config = GovernorConfigBuilder::default()
        .per_second(2) // 2 requests per second
        .burst_size(10) // Allow burst of 10
        .finish()
        .ok_or_else(|| anyhow::anyhow!("Failed to build rate limit config"))?;

    let rate_limit_layer = GovernorLayer {
        config: Arc::new(rate_limit_config),
    };

    let app = app(app_state).layer(rate_limit_layer);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("{} panoview listening on {}", PANOVIEW_EMOJI, addr);
    tracing::info!("📖 API docs available at http://{}/docs", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
