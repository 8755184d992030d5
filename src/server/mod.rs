//! Web server module

mod routes;
mod websocket;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::AppState;

/// Run the web server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = {
        let settings = state.settings.read();
        format!("{}:{}", settings.server.host, settings.server.port)
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_routes())
        .route("/ws", axum::routing::get(websocket::ws_handler))
        .layer(cors)
        .with_state(state);

    info!("Starting web server on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
