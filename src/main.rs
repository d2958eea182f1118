use std::sync::Arc;

use tower_governor::governor::GovernorConfigBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trust_core::{AppState, Config, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    let state = AppState::new(&config).await?;
    tracing::info!("✅ AppState initialized");

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(1_000)
            .burst_size(5_000)
            .use_headers()
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid governor configuration"))?,
    );

    let app = routes::router(state.clone())
        .layer(tower_governor::GovernorLayer::new(governor_conf))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false))
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        );

    let sweep_state = state.clone();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            tracing::info!("🧹 Running scheduled maintenance...");
            sweep_state.run_maintenance().await;
        }
    });

    tracing::info!("🚀 Server listening on http://{}", config.bind_addr);
    tracing::info!(
        "✅ Background maintenance started (runs every {}s)",
        config.sweep_interval.as_secs()
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
