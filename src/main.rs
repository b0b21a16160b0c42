use std::process;

use diskcache::{
    cache::{CacheConfig, CacheOrchestrator, CacheState, CacheStore},
    config::{self, Command, Settings},
    infra::{error::InfraError, files::FileRoot, http, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SOURCE: &str = "diskcache::main";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "diskcache failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "diskcache failed");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Some(Command::Sweep(_)) => run_sweep(&settings).await,
        Some(Command::Serve(_)) | None => run_serve(settings).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), InfraError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let store = CacheStore::new(cache_config.root.clone());
    store.ensure_root().await?;
    sweep_staging(&store).await;

    info!(
        target = SOURCE,
        enabled = cache_config.enabled,
        root = %cache_config.root.display(),
        key_parts = ?cache_config.key_mask.names(),
        use_stale = cache_config.use_stale,
        validity = ?cache_config.freshness.entries().collect::<Vec<_>>(),
        files = %settings.files.root.display(),
        "Starting cache server"
    );

    let orchestrator = CacheOrchestrator::new(cache_config);
    let router = http::build_router(
        CacheState::new(orchestrator),
        FileRoot::new(settings.files.root.clone()),
    );

    http::serve(
        settings.server.addr,
        router,
        settings.server.graceful_shutdown,
    )
    .await
}

async fn run_sweep(settings: &Settings) -> Result<(), InfraError> {
    let store = CacheStore::new(settings.cache.directory.clone());
    let removed = store.sweep_staging().await?;
    info!(
        target = SOURCE,
        root = %store.root().display(),
        removed,
        "Swept staging files"
    );
    Ok(())
}

async fn sweep_staging(store: &CacheStore) {
    match store.sweep_staging().await {
        Ok(0) => {}
        Ok(removed) => info!(
            target = SOURCE,
            removed,
            "Removed staging files left by a previous run"
        ),
        Err(err) => warn!(
            target = SOURCE,
            error = %err,
            "Failed to sweep staging files"
        ),
    }
}
