use std::{process, sync::Arc};

use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt};

use marketsnap_app::{AppError, config};
use marketsnap_app::services::{
    AdapterConfig, BatchProcessor, BatchStore, ExtractError, ExtractionAdapter, GeminiVisionClient,
    MemoryLedger, MemoryListingStore, ProcessorConfig, ProviderKind, VisionClient,
};
use marketsnap_server::{AppState, ServerError, serve};

const DEEPINFRA_API_BASE: &str = "https://api.deepinfra.com/google/v1beta";

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run().await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_target(false).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

async fn run() -> Result<(), MainError> {
    let config = config::load().map_err(AppError::from)?;

    let client = build_client(&config).map_err(AppError::from)?;
    let adapter = Arc::new(ExtractionAdapter::new(
        config.provider.kind,
        client,
        AdapterConfig::default(),
    ));
    tracing::info!(
        provider = config.provider.kind.as_ref(),
        model = %config.provider.model,
        "extraction adapter configured"
    );

    let ledger = Arc::new(MemoryLedger::new());
    let listings = Arc::new(MemoryListingStore::new());
    let processor = Arc::new(BatchProcessor::new(
        adapter,
        Arc::clone(&ledger) as _,
        listings as _,
        ProcessorConfig::default(),
    ));
    let state = AppState::new(Arc::new(BatchStore::new()), processor, ledger as _);

    serve(&config.server.listen_addr, state).await?;
    Ok(())
}

fn build_client(config: &config::AppConfig) -> Result<Arc<dyn VisionClient>, ExtractError> {
    let client = match config.provider.kind {
        ProviderKind::Gemini | ProviderKind::GeminiFlash => {
            GeminiVisionClient::from_env(&config.provider.model)?
        }
        ProviderKind::DeepInfra => {
            let api_key =
                std::env::var("DEEPINFRA_API_KEY").map_err(|_| ExtractError::MissingApiKey)?;
            GeminiVisionClient::new(api_key, &config.provider.model, DEEPINFRA_API_BASE)
        }
    };
    Ok(Arc::new(client))
}
