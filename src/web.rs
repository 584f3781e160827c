//! HTTP front end.
//!
//! Thin routing layer over the [`Publisher`]: a release request spawns a
//! background worker and returns immediately; the worker is never cancelled
//! by the request side.

use std::sync::Arc;

use axum::{
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::{RepoError, RepoResult};
use crate::release::Publisher;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The publish-flow driver.
    pub publisher: Arc<Publisher>,
}

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ReleaseStatus {
    tag: String,
    processed: bool,
}

#[derive(Serialize)]
struct ReleaseAccepted {
    tag: String,
    status: &'static str,
}

/// Parsed query parameters of the publish endpoint.
#[derive(Debug, Default, PartialEq, Eq)]
struct PublishParams {
    sync: bool,
    force: bool,
    binaries: Vec<String>,
}

/// Parse `sync`, `force` and repeated `binary` query parameters.
///
/// `serde_urlencoded` cannot express repeated keys, hence the manual parse.
fn parse_publish_params(query: Option<&str>) -> PublishParams {
    let mut params = PublishParams::default();
    let Some(query) = query else {
        return params;
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "sync" => params.sync = to_bool(&value),
            "force" => params.force = to_bool(&value),
            "binary" => params.binaries.push(value.into_owned()),
            _ => {}
        }
    }
    params
}

fn to_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "")
}

fn error_response(e: &RepoError) -> Response {
    let status = match e {
        RepoError::InvalidTag(_) => StatusCode::BAD_REQUEST,
        RepoError::Release(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

async fn root() -> impl IntoResponse {
    Json(ServiceInfo {
        name: "repo-publisher",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_release(State(state): State<AppState>, Path(tag): Path<String>) -> impl IntoResponse {
    let processed = state.publisher.is_processed(&tag);
    Json(ReleaseStatus { tag, processed })
}

async fn post_release(
    State(state): State<AppState>,
    Path(tag): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_publish_params(query.as_deref());

    if let Err(e) = crate::release::ReleaseTag::parse(&tag) {
        return error_response(&e);
    }
    if state.publisher.is_processed(&tag) && !params.force {
        info!("Release {} is already published, skipping", tag);
        return (StatusCode::OK, "the release is already published\n").into_response();
    }

    if params.sync {
        return match state.publisher.publish(&tag, &params.binaries).await {
            Ok(()) => (
                StatusCode::OK,
                Json(ReleaseAccepted {
                    tag,
                    status: "published",
                }),
            )
                .into_response(),
            Err(e) => error_response(&e),
        };
    }

    let publisher = Arc::clone(&state.publisher);
    let worker_tag = tag.clone();
    let binaries = params.binaries.clone();
    tokio::spawn(async move {
        if let Err(e) = publisher.publish(&worker_tag, &binaries).await {
            error!("Publishing {} failed: {}", worker_tag, e);
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(ReleaseAccepted {
            tag,
            status: "accepted",
        }),
    )
        .into_response()
}

/// Build the service router.
pub fn router(publisher: Arc<Publisher>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/release/:tag", get(get_release))
        .route("/release/:tag", post(post_release))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { publisher })
}

/// Serve the HTTP front end until the process is stopped.
pub async fn serve(publisher: Arc<Publisher>, bind_address: &str) -> RepoResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Listening on {}", bind_address);
    axum::serve(listener, router(publisher)).await?;
    Ok(())
}
