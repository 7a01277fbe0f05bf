pub mod error;
pub mod jobs;
pub mod routes;
pub mod state;

use axum::routing::{delete, get, post, put};
use axum::Router;
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(root: PathBuf) -> anyhow::Result<Router> {
    let app_state = state::AppState::new(root)?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        // Tags
        .route("/api/tags", get(routes::tags::list_tags))
        .route("/api/tags", post(routes::tags::create_tag))
        .route("/api/tags/{name}", get(routes::tags::get_tag))
        .route("/api/tags/{name}", put(routes::tags::update_tag))
        .route("/api/tags/{name}", delete(routes::tags::delete_tag))
        .route("/api/tags/{name}/nodes", get(routes::tags::get_tag_nodes))
        .route(
            "/api/tags/{name}/nodes",
            post(routes::tags::update_tag_nodes),
        )
        .route("/api/tags/{name}/rebuild", post(routes::tags::rebuild_tag))
        // Nodes
        .route("/api/nodes", get(routes::nodes::list_nodes))
        .route("/api/nodes", post(routes::nodes::register_node))
        .route("/api/nodes/{system_id}", get(routes::nodes::get_node))
        .route("/api/nodes/{system_id}", delete(routes::nodes::delete_node))
        .route(
            "/api/nodes/{system_id}/facts",
            put(routes::nodes::set_facts),
        )
        // Global rebuild jobs
        .route("/api/rebuild", post(routes::rebuilds::start_rebuild))
        .route("/api/rebuilds", get(routes::rebuilds::list_rebuilds))
        .route("/api/rebuilds/{id}", get(routes::rebuilds::get_rebuild))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state);

    Ok(router)
}

/// Start the nodetag API server.
pub async fn serve(root: PathBuf, port: u16) -> anyhow::Result<()> {
    let app = build_router(root)?;

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let actual_port = listener.local_addr()?.port();

    tracing::info!("nodetag API listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
