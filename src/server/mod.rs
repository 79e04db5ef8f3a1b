//! Local offline proxy.
//!
//! Every request is answered through [`Synchronizer::handle_fetch`] against
//! the configured origin; requests the synchronizer declines are forwarded to
//! the network. Two control routes live under `/__sync/`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::{
    CacheStorage, ClientControl, Fetcher, Method, MessageOutcome, Request, Response, Synchronizer,
};

/// Response headers describing the upstream transfer rather than the body.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-encoding",
    "content-length",
    "keep-alive",
    "transfer-encoding",
];

/// Request headers owned by the proxy hop; the upstream client sets its own.
/// Bodies are relayed decoded, so encodings are not negotiated upstream.
const NOT_FORWARDED: &[&str] = &["accept-encoding", "host", "proxy-connection", "te", "upgrade"];

type Shared<S, F, C> = Arc<Synchronizer<S, F, C>>;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    state: String,
    instance: String,
}

#[derive(Serialize)]
struct MessageResponse {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cached: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed: Option<usize>,
}

impl From<&MessageOutcome> for MessageResponse {
    fn from(outcome: &MessageOutcome) -> Self {
        match outcome {
            MessageOutcome::SkippedWaiting => Self {
                outcome: "skippedWaiting",
                cached: None,
                failed: None,
            },
            MessageOutcome::DownloadedOffline(report) => Self {
                outcome: "downloadedOffline",
                cached: Some(report.cached),
                failed: Some(report.failed.len()),
            },
            MessageOutcome::Ignored => Self {
                outcome: "ignored",
                cached: None,
                failed: None,
            },
        }
    }
}

async fn sync_health<S, F, C>(State(sync): State<Shared<S, F, C>>) -> impl IntoResponse
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
    C: ClientControl + 'static,
{
    axum::Json(HealthResponse {
        status: "ok".to_string(),
        state: sync.state().to_string(),
        instance: sync.id().to_string(),
    })
}

async fn sync_message<S, F, C>(
    State(sync): State<Shared<S, F, C>>,
    payload: String,
) -> axum::response::Response
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
    C: ClientControl + 'static,
{
    match sync.handle_message(payload.trim()).await {
        Ok(outcome) => axum::Json(MessageResponse::from(&outcome)).into_response(),
        Err(e) => {
            log::error!("Message {payload:?} failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn intercept<S, F, C>(
    State(sync): State<Shared<S, F, C>>,
    method: axum::http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
    C: ClientControl + 'static,
{
    let Some(method) = Method::parse(method.as_str()) else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    let request = to_request(&sync.config().origin, method, &uri, &headers, body);

    let result = match sync.handle_fetch(&request).await {
        Ok(Some(response)) => Ok(response),
        Ok(None) => sync.fetcher().fetch(&request).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(response) => to_http(response),
        Err(e) => {
            log::warn!("{} {} failed: {e}", request.method, request.url);
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

/// Rebuilds an inbound request against `origin`, keeping its end-to-end
/// headers and any body.
fn to_request(
    origin: &str,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: axum::body::Bytes,
) -> Request {
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let mut request = Request::get(format!("{origin}{path}")).with_method(method);
    for (name, value) in headers {
        let name = name.as_str();
        if HOP_BY_HOP.contains(&name) || NOT_FORWARDED.contains(&name) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.with_header(name, value);
        }
    }
    if !body.is_empty() {
        request = request.with_body(body);
    }
    request
}

fn to_http(response: Response) -> axum::response::Response {
    let mut builder = axum::http::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|e| {
            log::warn!("Dropping malformed cached response: {e}");
            StatusCode::BAD_GATEWAY.into_response()
        })
}

/// Builds the proxy router for `sync`.
pub fn router<S, F, C>(sync: Shared<S, F, C>) -> Router
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
    C: ClientControl + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/__sync/health", get(sync_health::<S, F, C>))
        .route("/__sync/message", post(sync_message::<S, F, C>))
        .fallback(intercept::<S, F, C>)
        .layer(cors)
        .with_state(sync)
}

/// Serves the proxy on an already bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve<S, F, C>(
    listener: TcpListener,
    sync: Shared<S, F, C>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> crate::Result<()>
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
    C: ClientControl + 'static,
{
    axum::serve(listener, router(sync))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Binds `host:port` and serves the proxy until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the address is invalid or cannot be bound.
pub async fn run_server<S, F, C>(sync: Shared<S, F, C>, host: &str, port: u16) -> crate::Result<()>
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
    C: ClientControl + 'static,
{
    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{host}:{port}: {e}"))
    })?;
    let listener = TcpListener::bind(addr).await?;
    log::info!(
        "Offline proxy for {} listening on http://{addr}",
        sync.config().origin
    );

    serve(listener, sync, async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Shutting down");
    })
    .await
}
