use gitfix_core::{Config, Deployment};
use tracing_subscriber::{EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,gitfix_core={level},server={level},worker={level},poller={level},queue={level},state={level},gitops={level},container={level},hosting={level},db={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("failed to build tracing filter");
    tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_filter(env_filter)).init();

    let config = Config::from_env()?;
    let deployment = Deployment::new(config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    deployment.spawn_workers(shutdown_rx.clone());
    let poller_handle = deployment.spawn_poller(shutdown_rx.clone());

    let app_state = server::AppState::new(deployment.db.clone(), deployment.state.clone(), deployment.queue.clone());
    let app_router = server::router(app_state);

    let bind_addr = deployment.config.server_bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app_router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|shutdown| *shutdown).await;
        })
        .await?;

    let _ = poller_handle.await;
    Ok(())
}
