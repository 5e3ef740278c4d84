//! Image Resizer - on-demand image resizing over HTTP.
//!
//! This binary starts the HTTP server and configures all components.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use image_resizer::{
    cache::ShardedFileStore, codec::ImageCrateCodec, config::Config, resize::ResizeService,
    server::create_router,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    run_serve(config).await
}

// =============================================================================
// Serve
// =============================================================================

async fn run_serve(config: Config) -> ExitCode {
    info!("Image Resizer v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Content root: {}", config.content_root.display());
    info!("  Cache root: {}", config.cache_root.display());
    info!("  Prefixes: {}", config.prefixes.join(", "));
    info!("  Extensions: {}", config.extensions.join(", "));

    if config.max_cache_size == 0 {
        warn!("  Cache size: UNBOUNDED - set --max-cache-size to enable eviction");
    } else {
        info!(
            "  Cache size: {}MB, shard depth {}",
            config.max_cache_size / (1024 * 1024),
            config.shard_depth
        );
    }

    if !config.content_root.is_dir() {
        error!(
            "Content root '{}' is not a directory",
            config.content_root.display()
        );
        return ExitCode::FAILURE;
    }

    if let Err(e) = tokio::fs::create_dir_all(&config.cache_root).await {
        error!(
            "Failed to create cache root '{}': {}",
            config.cache_root.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let store = ShardedFileStore::new(config.store_config());

    if config.prune_on_startup {
        info!("Pruning cache (batch of {})...", config.prune_batch);
        if let Err(e) = store.prune_on_startup(config.prune_batch).await {
            // A failed prune leaves the cache usable; keep starting.
            warn!("Cache prune failed: {}", e);
        }
    }

    match store.stats().await {
        Ok(stats) => info!(
            "  Cache holds {} variant(s), {} bytes",
            stats.entry_count, stats.total_bytes
        ),
        Err(e) => warn!("Could not scan cache: {}", e),
    }

    let service = ResizeService::new(
        &config.content_root,
        store,
        ImageCrateCodec::new(),
        config.resize_settings(),
    );

    let router = create_router(service, config.router_config());

    let addr = config.bind_address();
    let prefix = config
        .prefixes
        .first()
        .map(|p| p.trim_matches('/').to_string())
        .unwrap_or_default();

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Server listening on: http://{}", addr);
    info!("");
    info!("  Try these endpoints:");
    info!("    curl http://{}/health", addr);
    info!("    curl -I 'http://{}/{}/<file>.jpg?width=320'", addr, prefix);
    info!("────────────────────────────────────────────────────────────────");
    info!("");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "image_resizer=debug,tower_http=debug"
    } else {
        "image_resizer=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
