use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    services::ServeDir,
    trace::TraceLayer,
};

use crate::config::Config;
use crate::handlers::{admin, health_check, live, storage, uploads};
use crate::middleware::{add_security_headers, no_store};
use crate::state::AppState;
use crate::utils::shutdown_signal;

// json bodies on the api listener are tiny
const JSON_BODY_LIMIT: usize = 64 * 1024;

// build public router
pub fn build_public_router(files_dir: &Path) -> Router {
    tracing::debug!("Building public router for directory: {:?}", files_dir);
    Router::new()
        .fallback_service(ServeDir::new(files_dir).append_index_html_on_directories(false))
        .layer(axum::middleware::from_fn(add_security_headers))
        .layer(CompressionLayer::new().gzip(true).br(true).zstd(true))
        .layer(TraceLayer::new_for_http())
}

fn build_cors(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// admin routes, rate limited per peer ip
fn build_admin_routes(config: &Config) -> Router<Arc<AppState>> {
    let routes = Router::new()
        .route("/admin/cleanup_chunks", post(admin::cleanup_all_chunks))
        .route("/admin/chunk_stats", get(admin::chunk_stats));

    let governor_conf = GovernorConfigBuilder::default()
        .per_second(config.admin_rate_limit_per_second.max(1))
        .burst_size(5)
        .finish();
    match governor_conf {
        Some(conf) => routes.layer(GovernorLayer {
            config: Arc::new(conf),
        }),
        None => {
            tracing::warn!("Invalid admin rate limit, admin routes are not rate limited");
            routes
        }
    }
}

/// build api router
pub fn build_api_router(state: Arc<AppState>, config: &Config) -> Router {
    tracing::debug!(
        "Building api router with max chunk size: {} bytes",
        config.max_chunk_size
    );

    let chunk_routes = Router::new()
        .route("/upload-chunk", post(uploads::upload_chunk))
        .layer(DefaultBodyLimit::max(config.chunk_body_limit()))
        .layer(RequestBodyLimitLayer::new(config.chunk_body_limit()));

    let routes = Router::new()
        .route("/cancel_upload", post(uploads::cancel_upload))
        .route("/cleanup_chunks", post(uploads::cleanup_chunks))
        .route("/assembly_status", get(uploads::assembly_jobs))
        .route("/assembly_status/:file_id", get(uploads::assembly_status))
        .route("/protect_assembly/:file_id", post(uploads::protect_assembly))
        .route("/storage_stats_poll", get(live::storage_stats_poll))
        .route("/storage_stats", get(live::storage_stats))
        .route("/monitoring_status", get(live::monitoring_status))
        .route("/health", get(health_check))
        .route("/delete", post(storage::delete_entry))
        .route("/mkdir", post(storage::make_directory))
        .route("/rename", post(storage::rename_entry))
        .layer(RequestBodyLimitLayer::new(JSON_BODY_LIMIT))
        .merge(build_admin_routes(config))
        .merge(chunk_routes)
        .layer(axum::middleware::from_fn(no_store));

    // the push stream stays uncompressed so events are flushed as they happen
    Router::new()
        .route("/storage_stats_stream", get(live::storage_stats_stream))
        .merge(routes.layer(CompressionLayer::new().gzip(true).br(true).zstd(true)))
        .layer(build_cors(config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start both public and api servers
pub async fn start_servers(
    public_app: Router,
    api_app: Router,
    public_addr: SocketAddr,
    api_addr: SocketAddr,
) -> Result<(), std::io::Error> {
    tracing::info!("Starting servers...");

    // create listeners
    let public_listener = tokio::net::TcpListener::bind(public_addr).await?;
    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;

    tracing::debug!("Public listener bound to {}", public_addr);
    tracing::debug!("API listener bound to {}", api_addr);

    // start servers
    let public_server = axum::serve(
        public_listener,
        public_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .tcp_nodelay(true);

    let api_server = axum::serve(
        api_listener,
        api_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .tcp_nodelay(true);

    // run servers
    tracing::info!("Servers running and ready to accept connections");
    let _ = tokio::join!(
        async {
            if let Err(e) = public_server.await {
                tracing::error!("Public server error: {}", e);
            }
        },
        async {
            if let Err(e) = api_server.await {
                tracing::error!("API server error: {}", e);
            }
        }
    );
    Ok(())
}

/// print startup banner with server info
pub fn print_startup_banner(config: &Config) {
    tracing::info!("Driftbox starting...");
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("📡 PUBLIC FILE SERVER: http://{}:{}", config.public_host, config.public_port);
    tracing::info!("📤 UPLOAD API SERVER: http://{}:{}", config.api_host, config.api_port);
    tracing::info!(
        "📁 Serving files from: {:?}",
        config.files_dir.canonicalize().unwrap_or_else(|_| config.files_dir.clone())
    );
    tracing::info!("🧩 Chunk scratch: {:?}", config.chunks_dir);
    tracing::info!(
        "⚙️  {} assembly workers, chunks up to {} bytes",
        config.assembly_workers,
        config.max_chunk_size
    );
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
