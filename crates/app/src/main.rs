mod pipeline;
mod problem;
mod replay;
mod router;
mod telemetry;
mod webhook;

use std::error::Error;

use tokio::net::TcpListener;
use tracing::{info, warn};
use url::Url;

use idrelay_core::signature::SignatureVerifier;
use idrelay_downstream::{ProviderClient, RecordClient};
use idrelay_storage::{Database, StatusCache};
use idrelay_util::{load_env_file, AppConfig};

use router::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let verifier = match &config.webhook_secret {
        Some(secret) => SignatureVerifier::new(secret.clone()),
        None => {
            warn!(
                stage = "startup",
                "WEBHOOK_SECRET is not set, inbound payloads will not be authenticated"
            );
            SignatureVerifier::unsigned()
        }
    };

    let http = reqwest::Client::builder().build()?;
    let forwarder = RecordClient::new(
        Url::parse(&config.downstream_url)?,
        config.downstream_timeout,
        http.clone(),
    );
    let provider = ProviderClient::new(
        Url::parse(&config.provider_base_url)?,
        config.provider_app_token.clone(),
        config.provider_timeout,
        http,
    );

    let state = AppState::new(
        metrics,
        database,
        StatusCache::new(),
        verifier,
        forwarder,
        provider,
    );

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        stage = "startup",
        addr = %config.bind_addr,
        env = %config.environment.as_str(),
        downstream = %config.downstream_url,
        "verification relay listening"
    );

    axum::serve(listener, app_router(state)).await?;
    Ok(())
}
