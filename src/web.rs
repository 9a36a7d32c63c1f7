//! HTTP endpoints for the sync service.
//!
//! Thin shim over the coordinator: /latest reports the published snapshot,
//! /rebuild and /update translate requests into coordinator calls and stream
//! each job's status lines back as plain text, one line per message, ending
//! when the job delivers its sentinel.

use axum::{
    body::{Body, Bytes},
    extract::{RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{Json, Response},
    routing::get,
    Router,
};
use std::sync::Arc;

use crate::coordinator::{Rebuilder, StatusRx, SyncContext, Updater};
use crate::import::ImportOptions;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SyncContext>,
    pub rebuilder: Arc<Rebuilder>,
    pub updater: Arc<Updater>,
    /// Requests must present this key when set
    pub api_key: Option<String>,
}

/// Decode a raw query string into ordered key/value pairs.
///
/// Hand-parsed because `ids[]` repeats and unknown keys must be rejected,
/// neither of which a map-shaped extractor preserves.
fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| {
                urlencoding::decode(&s.replace('+', " "))
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            };
            (decode(key), decode(value))
        })
        .collect()
}

fn text_response(body: String, code: StatusCode) -> Response {
    Response::builder()
        .status(code)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

/// Lazily stream a job's status lines; a slow client backpressures only its
/// own response, the worker keeps running.
fn status_stream_response(rx: StatusRx) -> Response {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Some(Some(mut line)) => {
                line.push('\n');
                Some((Ok::<_, std::convert::Infallible>(Bytes::from(line)), rx))
            }
            // sentinel or closed channel: end of stream
            Some(None) | None => None,
        }
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(stream))
        .unwrap()
}

fn api_key_rejection(state: &AppState, params: &[(String, String)]) -> Option<Response> {
    let expected = state.api_key.as_deref()?;
    let presented = params
        .iter()
        .find(|(key, _)| key == "apikey")
        .map(|(_, value)| value.as_str());
    if presented == Some(expected) {
        None
    } else {
        Some(text_response(
            "invalid api key".to_string(),
            StatusCode::FORBIDDEN,
        ))
    }
}

/// GET /latest - the published snapshot pointer, or {} when none is
/// compatible with this code's schema version
async fn latest_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let Some(info) = state.ctx.latest.current_compatible() else {
        return Json(serde_json::json!({}));
    };
    let Some(path) = &info.path else {
        return Json(serde_json::json!({}));
    };
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    Json(serde_json::json!({
        "schema-version": info.schema_version,
        "snapshot-started": info.started,
        "snapshot-updated": info.updated,
        "url": format!("http://{}/{}", host, path.trim_start_matches('/')),
    }))
}

/// GET /rebuild?apikey=K - request a full rebuild and stream its status
async fn rebuild_handler(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let params = parse_query(query.as_deref().unwrap_or(""));
    if let Some(rejection) = api_key_rejection(&state, &params) {
        return rejection;
    }
    status_stream_response(state.rebuilder.request())
}

/// GET /update?apikey=K&ids[]=N&no-gear=1... - queue a partial update for the
/// given raiders and stream its status. Unknown ids and unknown parameters
/// are client errors, rejected before anything is queued.
async fn update_handler(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let params = parse_query(query.as_deref().unwrap_or(""));
    if let Some(rejection) = api_key_rejection(&state, &params) {
        return rejection;
    }

    let mut ids: Vec<i64> = Vec::new();
    let mut opts = ImportOptions::default();
    for (key, value) in &params {
        match key.as_str() {
            "apikey" => {}
            "ids[]" => match value.parse::<i64>() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    return text_response(
                        format!("invalid raider id: {value}"),
                        StatusCode::BAD_REQUEST,
                    )
                }
            },
            "no-basic" => opts.basic = false,
            "no-gear" => opts.gear = false,
            "no-recruiting" => opts.recruiting = false,
            "no-questing" => opts.questing = false,
            other => {
                return text_response(
                    format!("unknown parameter: {other}"),
                    StatusCode::BAD_REQUEST,
                )
            }
        }
    }

    let known = state.ctx.known_ids();
    let mut invalid: Vec<i64> = ids.iter().copied().filter(|id| !known.contains(id)).collect();
    if !invalid.is_empty() {
        invalid.sort_unstable();
        invalid.dedup();
        let list: Vec<String> = invalid.iter().map(|id| id.to_string()).collect();
        return text_response(
            format!("invalid raider id(s): {}", list.join(", ")),
            StatusCode::BAD_REQUEST,
        );
    }

    ids.sort_unstable();
    ids.dedup();
    opts.raiders = Some(ids);
    status_stream_response(state.updater.request(opts))
}

/// Build the web server router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/latest", get(latest_handler))
        .route("/rebuild", get(rebuild_handler))
        .route("/update", get(update_handler))
        .with_state(state)
}

/// Start the web server (async)
///
/// Binds all interfaces; restrict exposure with a front-end proxy or
/// firewall, and serve the snapshot directory from the same host so /latest
/// URLs resolve.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);
    let addr = format!("0.0.0.0:{port}");
    log::info!("sync endpoint listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
