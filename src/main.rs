use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    warden::telemetry::setup_logging();

    let state = warden::initialize_state().await?;
    let listen = state.config.listen.clone();

    let shutdown = CancellationToken::new();
    let sweeper = state.sweeper().start(shutdown.clone()).await;

    let listener = TcpListener::bind(&listen).await?;
    tracing::info!(%listen, version = env!("CARGO_PKG_VERSION"), "server started");

    axum::serve(listener, warden::app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    sweeper.await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
