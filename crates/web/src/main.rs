use std::sync::Arc;

use tracing::info;
use vmshare_common::AppConfig;
use vmshare_core::Coordinator;
use vmshare_web::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::from_env()?;
    info!("vmshare v{}", vmshare_common::VERSION);

    tokio::fs::create_dir_all(&config.run_dir).await?;
    tokio::fs::create_dir_all(&config.snapshots_dir).await?;
    for (tag, profile) in config.profiles.iter() {
        if let Some(dir) = &profile.overlay_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        info!(
            "Profile {} loaded (base image {})",
            tag,
            profile.base_image.display()
        );
    }

    let listen_addr = config.server.listen_addr.clone();
    let coordinator = Coordinator::new(config)?;

    let app = router(AppState {
        coordinator: coordinator.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!("vmshare web shell listening on {}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await?;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for ctrl-c, then reclaim every instance before the listener is
/// torn down.
async fn shutdown_signal(coordinator: Arc<Coordinator>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal, reclaiming all instances");
    coordinator.shutdown_all().await;
}
