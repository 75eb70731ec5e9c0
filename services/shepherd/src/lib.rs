pub mod broker;
pub mod bus;
pub mod config;
pub mod gateway;
pub mod http;
pub mod process;
pub mod state;
pub mod supervisor;
pub mod ws;

pub use state::AppState;

use std::path::PathBuf;

use axum::{
    extract::Request,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower::Service;
use tower_http::services::{ServeDir, ServeFile};

/// Build the service router: the websocket upgrade, the status view, and the
/// Lens static assets as the fallback.
pub fn build_router(state: AppState) -> Router {
    let public_dir = state.config.server.public_dir.clone();
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/status", get(http::status::get_status))
        .fallback(move |method: Method, uri: Uri, req: Request| {
            let public_dir = public_dir.clone();
            async move { lens_fallback(method, uri, req, public_dir).await }
        })
        .with_state(state)
}

fn is_reserved_backend_path(path: &str) -> bool {
    let first_segment = path.trim_start_matches('/').split('/').next().unwrap_or("");
    matches!(first_segment, "ws" | "status")
}

/// Serve the Lens page and its assets; `/` falls through to the index.
async fn lens_fallback(
    method: Method,
    uri: Uri,
    req: Request,
    public_dir: PathBuf,
) -> Response {
    if is_reserved_backend_path(uri.path()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let index = public_dir.join("index.html");
    let mut service = ServeDir::new(public_dir).fallback(ServeFile::new(index));
    match service.call(req).await {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
