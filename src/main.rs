use canopy_features::{common::state::AppState, config::Config, routes};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing(&config);

    let state = AppState::from_config(config.clone())?;
    if state.pipeline.cache_healthy().await {
        info!(uri = %config.feature_cache_uri, "Connected to the feature cache");
    } else {
        error!(uri = %config.feature_cache_uri, "Could not connect to the feature cache");
    }

    let addr: std::net::SocketAddr = config.bind_address.parse()?;
    info!(%addr, deployment = %config.deployment, "Listening");

    let router = routes::build_router(&state);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, router.into_make_service()).await?;
    Ok(())
}
