use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use driftbox::config::Config;
use driftbox::server::{build_api_router, build_public_router, print_startup_banner, start_servers};
use driftbox::state::AppState;

// use mimalloc as the global allocator
// 10-20% faster than system allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    // load .env file if it exists (fails silently if not found)
    let _ = dotenvy::dotenv();

    // load configuration from environment variables
    let config = Config::from_env();

    // build tokio runtime with configured worker threads
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();

        match run(config).await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!("💥 {}", e);
                1
            }
        }
    });
    std::process::exit(code);
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let public_addr = SocketAddr::from((config.public_host.parse::<IpAddr>()?, config.public_port));
    let api_addr = SocketAddr::from((config.api_host.parse::<IpAddr>()?, config.api_port));

    // create shared state; this also creates the storage and scratch roots
    let state = Arc::new(AppState::new(config.clone())?);

    // background workers first so recovered uploads get assembled
    let background = state.start_background();
    state.recover().await?;

    let public_app = build_public_router(&state.files_dir);
    let api_app = build_api_router(state.clone(), &config);

    print_startup_banner(&config);
    let result = start_servers(public_app, api_app, public_addr, api_addr).await;

    for handle in background {
        handle.abort();
    }
    tracing::info!("👋 Shut down");
    result.map_err(Into::into)
}
