use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::command::{
    decode_command, CommandResult, EncodeCommand, InitCommand, PreviewCommand, ScanCommand,
};
use crate::error::RouterError;
use crate::router::ApiRouter;

const TOKEN_HEADER: &str = "token";

const BANNER: &str = "HandBrake Worker\n\n\
This worker runs on localhost loopback only and is not accessible to the wider network.\n\
It processes HandBrake scan and encode jobs in a background process.\n";

type Api = Arc<ApiRouter>;

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogQuery {
    from_index: Option<i64>,
}

/// Build the HTTP surface of the worker
pub fn router(api: Api) -> Router {
    let protected = Router::new()
        .route("/init", post(init))
        .route("/scan", post(scan))
        .route("/encode", post(encode))
        .route("/preview", post(preview))
        .route("/state", get(state))
        .route("/titles", get(titles))
        .route("/main-title", get(main_title))
        .route("/log", get(log_messages))
        .route("/log/reset", post(reset_log))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .route_layer(middleware::from_fn_with_state(api.clone(), require_token));

    Router::new()
        .route("/", get(banner))
        .route("/version", get(version))
        .route("/pair", post(pair))
        .merge(protected)
        .fallback(unknown_endpoint)
        .layer(middleware::from_fn(time_request))
        .with_state(api)
}

/// Serve the API until the router fires its termination event or Ctrl-C arrives
pub async fn serve(api: Api, addr: SocketAddr) -> Result<()> {
    if !addr.ip().is_loopback() {
        bail!("The worker API may only listen on a loopback address, not {}", addr);
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Unable to start HTTP server. Maybe the port {} is in use?", addr.port()))?;
    info!("Worker listening on http://{}", addr);

    let mut termination = api.subscribe_termination();
    let shutdown = async move {
        tokio::select! {
            _ = termination.wait_for(|terminating| *terminating) => {
                info!("Termination requested, shutting down HTTP server");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down HTTP server");
            }
        }
    };

    axum::serve(listener, router(api))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    Ok(())
}

fn presented_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(TOKEN_HEADER) {
        return value.to_str().ok().map(str::to_string);
    }

    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.token)
}

async fn require_token(State(api): State<Api>, request: Request, next: Next) -> Response {
    let token = presented_token(&request);
    if api.is_authenticated(token.as_deref()) {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    warn!("Access denied to '{}': missing or invalid token", path);
    (
        StatusCode::UNAUTHORIZED,
        format!(
            "HandBrake Worker: Access Denied to '{}'. The token provided was not valid.",
            path
        ),
    )
        .into_response()
}

async fn time_request(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    debug!(
        " - Processed call to: '{}', status {}, took {}ms",
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

async fn banner() -> impl IntoResponse {
    (StatusCode::UNAUTHORIZED, BANNER)
}

async fn unknown_endpoint() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "HandBrake Worker: The API endpoint is unknown.")
}

async fn version(State(api): State<Api>) -> impl IntoResponse {
    Json(api.version())
}

async fn pair(State(api): State<Api>, body: String) -> impl IntoResponse {
    Json(api.pair(&body))
}

async fn init(State(api): State<Api>, body: String) -> impl IntoResponse {
    let result = match decode_command::<InitCommand>(&body) {
        Ok(command) => api.init(command).await,
        Err(rejected) => rejected,
    };
    Json(result)
}

async fn scan(State(api): State<Api>, body: String) -> impl IntoResponse {
    let result = match decode_command::<ScanCommand>(&body) {
        Ok(command) => api.scan(command).await,
        Err(rejected) => rejected,
    };
    Json(result)
}

async fn encode(State(api): State<Api>, body: String) -> impl IntoResponse {
    let result = match decode_command::<EncodeCommand>(&body) {
        Ok(command) => api.encode(command).await,
        Err(rejected) => rejected,
    };
    Json(result)
}

async fn preview(State(api): State<Api>, body: String) -> Response {
    let command = match decode_command::<PreviewCommand>(&body) {
        Ok(command) => command,
        Err(rejected) => return (StatusCode::BAD_REQUEST, Json(rejected)).into_response(),
    };

    match api.preview(command).await {
        Ok(image) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            image,
        )
            .into_response(),
        Err(e) => {
            let status = match e {
                RouterError::NotInitialised | RouterError::EncodeActive => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!("Preview failed: {}", e);
            let result: CommandResult = e.into();
            (status, Json(result)).into_response()
        }
    }
}

async fn state(State(api): State<Api>) -> impl IntoResponse {
    Json(api.state())
}

async fn titles(State(api): State<Api>) -> impl IntoResponse {
    Json(api.titles())
}

async fn main_title(State(api): State<Api>) -> impl IntoResponse {
    Json(api.main_title())
}

async fn log_messages(State(api): State<Api>, Query(query): Query<LogQuery>) -> impl IntoResponse {
    Json(api.log_messages(query.from_index))
}

async fn reset_log(State(api): State<Api>) -> impl IntoResponse {
    Json(api.reset_log())
}

async fn pause(State(api): State<Api>) -> StatusCode {
    api.pause().await;
    StatusCode::OK
}

async fn resume(State(api): State<Api>) -> StatusCode {
    api.resume().await;
    StatusCode::OK
}

async fn stop(State(api): State<Api>) -> StatusCode {
    api.stop_encode().await;
    StatusCode::OK
}
