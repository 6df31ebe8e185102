mod routes;
mod state;

use axum::http::{HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::infrastructure::llm::ChatBackend;

pub use state::{AppState, ChatSession};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP server error: {0}")]
    Serve(#[from] std::io::Error),
}

pub async fn serve<B>(state: Arc<AppState<B>>, port: u16) -> Result<(), ServerError>
where
    B: ChatBackend + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    serve_on(state, listener).await
}

/// Serves on a pre-bound listener.
pub async fn serve_on<B>(state: Arc<AppState<B>>, listener: TcpListener) -> Result<(), ServerError>
where
    B: ChatBackend + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(routes::misc::health::<B>))
        .route("/info", get(routes::misc::info::<B>))
        .route("/chat", post(routes::chat::chat::<B>))
        .route("/chat/stop", post(routes::chat::stop::<B>))
        .route("/chat/confirm", post(routes::chat::confirm::<B>))
        .route(
            "/conversations",
            get(routes::conversations::list::<B>).post(routes::conversations::create::<B>),
        )
        .route(
            "/conversations/:id",
            get(routes::conversations::get_one::<B>).delete(routes::conversations::delete::<B>),
        )
        .route(
            "/conversations/:id/tools",
            get(routes::conversations::get_tools::<B>)
                .put(routes::conversations::put_tools::<B>),
        )
        .route(
            "/conversations/:id/messages/:index",
            put(routes::conversations::edit_message::<B>)
                .delete(routes::conversations::delete_message::<B>),
        )
        .route(
            "/conversations/:id/messages/:index/from",
            axum::routing::delete(routes::conversations::delete_messages_from::<B>),
        )
        .route(
            "/conversations/:id/regenerate",
            post(routes::chat::regenerate::<B>),
        )
        .route(
            "/targets",
            get(routes::targets::list::<B>).post(routes::targets::add::<B>),
        )
        .route("/targets/:name", axum::routing::delete(routes::targets::remove::<B>))
        .route("/targets/probe", post(routes::targets::probe::<B>))
        .route("/specs/upload", post(routes::targets::upload_spec::<B>))
        .route("/tools", get(routes::tools::list::<B>))
        .route("/tools/sources", get(routes::tools::sources::<B>));

    let app = Router::new()
        .nest("/api", api)
        .layer(cors)
        .with_state(state);

    let addr = listener.local_addr().map_err(ServerError::Serve)?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app.into_make_service())
        .await
        .map_err(ServerError::Serve)
}
