use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use desk_orchestrator::Orchestrator;
use desk_protocol::Query;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub async fn serve(orchestrator: Arc<Orchestrator>, addr: &str) -> Result<()> {
    let app = Router::new()
        .route("/answer", post(answer))
        .route("/health", get(health))
        .with_state(orchestrator);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot bind {addr}"))?;
    log::info!("Serving on http://{addr}");
    axum::serve(listener, app).await.context("Server error")
}

/// Streams answer events as newline-delimited JSON. The connection closing
/// drops the receiver, which cancels the in-flight query cooperatively.
async fn answer(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(query): Json<Query>,
) -> Response {
    let rx = orchestrator.answer(query);
    let stream = ReceiverStream::new(rx).map(|event| {
        serde_json::to_string(&event).map(|mut line| {
            line.push('\n');
            line
        })
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn health(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    Json(orchestrator.health()).into_response()
}
