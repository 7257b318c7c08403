//! Quarry Driver - the single process that owns the index database.

pub mod error;
pub mod executor;
pub mod jobs;
pub mod routes;
pub mod state;

pub use state::{AppState, DriverSettings, SharedState};

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/rpc", post(routes::rpc))
        .route("/health", get(routes::health))
        .route("/admin/integrity", post(routes::integrity))
        .route("/admin/backup", post(routes::backup))
        .route("/admin/recreate", post(routes::recreate))
        .route("/admin/restore", post(routes::restore))
        .route("/jobs", post(routes::submit_job))
        .route("/jobs/{id}", get(routes::get_job).delete(routes::delete_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A driver serving on a background thread with its own runtime.
///
/// Dropping it stops the server; the executor thread exits once the last
/// handle to it is gone.
pub struct BackgroundDriver {
    pub addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl BackgroundDriver {
    /// Bind `127.0.0.1:0` and serve `settings` until dropped.
    pub fn start(settings: DriverSettings) -> std::io::Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let state = AppState::start(settings)?;
        let (shutdown, stop) = tokio::sync::oneshot::channel::<()>();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let thread = std::thread::Builder::new()
            .name("quarry-driver".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(l) => l,
                        Err(err) => {
                            tracing::error!(error = %err, "listener setup failed");
                            return;
                        }
                    };
                    let server = axum::serve(listener, router(state)).with_graceful_shutdown(async {
                        let _ = stop.await;
                    });
                    if let Err(err) = server.await {
                        tracing::error!(error = %err, "driver server failed");
                    }
                });
            })?;

        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for BackgroundDriver {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
