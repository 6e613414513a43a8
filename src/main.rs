// image-api
//
// A small image rotation service:
//   - Accept uploads into a flat media directory
//   - Serve the stored files statically under /images
//   - Answer "which image next?" from a send-next queue, a loop queue, or a
//     random pick over what is on disk
//
// Queue state lives in memory only; a restart starts from empty queues.
// TLS and public exposure are expected to come from a reverse proxy.

mod api;
mod config;
mod selector;
mod store;

use tracing::{info, warn};

use crate::api::AppState;
use crate::config::Config;
use crate::selector::Selector;
use crate::store::MediaStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env()?;

    let store = MediaStore::new(&config.media_dir, &config.archive_dir);
    store.ensure_dir()?;

    let addr = config.bind;
    info!(
        media_dir = %config.media_dir.display(),
        public_url = %config.public_url,
        "image-api starting on http://{addr}"
    );

    let state = AppState::new(config, store, Selector::new());
    let app = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
