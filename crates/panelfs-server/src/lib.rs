//! HTTP API for panelfs.
//!
//! Exposes the task registry (create, poll, list, cancel, delete, download
//! content) and the chunked upload store under `/api`.

mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use error::{ApiError, Result};
pub use routes::{router, MAX_CHUNK_BYTES};
pub use state::AppState;

/// Serve the API on `addr` until `shutdown` fires.
///
/// Also runs the janitors that prune finished tasks and idle upload
/// sessions.
pub async fn serve(state: AppState, addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "panelfs listening");
    serve_on(state, listener, shutdown).await
}

/// Serve the API on an already bound listener.
pub async fn serve_on(
    state: AppState,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let config = state.config().clone();
    let task_janitor = state.engine.spawn_janitor(shutdown.clone());
    let upload_janitor = Arc::clone(&state.uploads).spawn_janitor(
        config.janitor_interval(),
        config.upload_session_ttl(),
        shutdown.clone(),
    );

    let app = router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    let _ = task_janitor.await;
    let _ = upload_janitor.await;
    info!("panelfs stopped");
    result
}
