//! HTTP front end.
//!
//! * `GET /streaminfo/{token}?q={quality}` resolves the quality fallback
//!   and answers with the resulting stream descriptor as JSON.
//! * `GET /stream/{token}?q={quality}` relays the decrypted track,
//!   honouring a single `Range: bytes=start-[end]` header.
//!
//! A stream that fails after the headers went out cannot report an error
//! status any more. The body errors instead, which makes the server drop
//! the connection so that the client retries with a fresh range.

use std::{future::Future, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{
        header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use url::Url;

use crate::{
    decrypt::KeyProvider,
    error::{Error, ErrorKind, Result},
    fallback::Resolver,
    stream::RangeStream,
    track::{Quality, StreamInfo},
};

/// Shared by all requests.
#[derive(Clone)]
pub struct AppState {
    resolver: Resolver,
    keys: Arc<dyn KeyProvider>,

    /// Client for CDN downloads, without rate limiting.
    cdn: reqwest::Client,
}

impl AppState {
    #[must_use]
    pub fn new(resolver: Resolver, keys: Arc<dyn KeyProvider>, cdn: reqwest::Client) -> Self {
        Self {
            resolver,
            keys,
            cdn,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/streaminfo/{token}", get(stream_info))
        .route("/stream/{token}", get(stream))
        .with_state(state)
}

/// Serves requests on `listener` until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Into::into)
}

#[derive(Clone, Debug, Default, Deserialize)]
struct QualityParam {
    q: Option<String>,
}

impl QualityParam {
    fn quality(&self) -> Result<Quality> {
        self.q
            .as_deref()
            .map_or_else(|| Ok(Quality::default()), str::parse)
    }
}

#[derive(Serialize)]
struct StreamInfoBody {
    #[serde(flatten)]
    info: StreamInfo,
    url: Url,
}

async fn stream_info(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(param): Query<QualityParam>,
) -> Result<Json<StreamInfoBody>> {
    let info: StreamInfo = token.parse()?;
    let quality = param.quality()?;
    let track_id = info.track_id.clone();

    let info = state
        .resolver
        .resolve(info, quality)
        .await?
        .ok_or_else(|| Error::not_found(format!("no stream available for track {track_id}")))?;
    let url = info.url()?;

    Ok(Json(StreamInfoBody { info, url }))
}

async fn stream(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(param): Query<QualityParam>,
    headers: HeaderMap,
) -> Result<Response> {
    let info = token.parse::<StreamInfo>()?.with_quality(param.quality()?);

    let range = headers
        .get(RANGE)
        .map(|value| {
            value
                .to_str()
                .map_err(|e| Error::out_of_range(e.to_string()))
                .and_then(parse_range)
        })
        .transpose()?;
    let (start, end) = range.unwrap_or_default();

    let stream = RangeStream::open(&state.cdn, &info, Arc::clone(&state.keys), start, end)
        .await
        .map_err(|e| {
            warn!("opening track {} failed: {e}", info.track_id);
            match e.kind {
                ErrorKind::InvalidArgument | ErrorKind::OutOfRange => e,
                _ => Error::not_found(e.to_string()),
            }
        })?;

    stream_response(stream, range.is_some(), end, info.quality.mime_type())
}

/// Builds the response headers for an opened stream and relays its body.
fn stream_response(
    stream: RangeStream,
    ranged: bool,
    end: Option<u64>,
    mime_type: &'static str,
) -> Result<Response> {
    let size = stream
        .size()
        .ok_or_else(|| Error::not_found("stream has no declared length"))?;
    let start = stream.start();

    if ranged && start >= size {
        debug!("range starting at {start} is past the end of {size} bytes");
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(CONTENT_RANGE, format!("bytes */{size}"))
            .body(Body::empty())
            .map_err(|e| Error::internal(e.to_string()));
    }

    let builder = Response::builder().header(CONTENT_TYPE, mime_type);
    let builder = if ranged {
        let last = end.map_or(size.saturating_sub(1), |end| end.min(size.saturating_sub(1)));
        builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(CONTENT_RANGE, format!("bytes {start}-{last}/{size}"))
            .header(ACCEPT_RANGES, "bytes")
            .header(CONTENT_LENGTH, (last + 1).saturating_sub(start))
    } else {
        builder.status(StatusCode::OK).header(CONTENT_LENGTH, size)
    };

    debug!("streaming {stream:?}");
    let body = stream.inspect_err(|e| warn!("aborting stream: {e}"));

    builder
        .body(Body::from_stream(body))
        .map_err(|e| Error::internal(e.to_string()))
}

/// Parses a single byte range of the form `bytes=start-` or
/// `bytes=start-end`.
///
/// # Errors
///
/// Returns `Error::OutOfRange` for anything else, including suffix ranges
/// and multiple ranges.
fn parse_range(value: &str) -> Result<(u64, Option<u64>)> {
    let malformed = || Error::out_of_range(format!("unsupported range \"{value}\""));

    let (start, end) = value
        .trim()
        .strip_prefix("bytes=")
        .and_then(|spec| spec.split_once('-'))
        .ok_or_else(malformed)?;

    let start = start.trim().parse::<u64>().map_err(|_| malformed())?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse::<u64>().map_err(|_| malformed())?),
    };

    if end.is_some_and(|end| end < start) {
        return Err(malformed());
    }

    Ok((start, end))
}

/// Renders errors with the status code of their kind.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        if status.is_server_error() {
            error!("{self}");
        } else {
            debug!("{self}");
        }
        (status, self.to_string()).into_response()
    }
}
