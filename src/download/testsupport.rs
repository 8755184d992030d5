//! In-test HTTP origins for exercising the engine end to end.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;

/// Deterministic pseudo-random payload so corrupted reassembly can't pass.
pub fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i as u64 * 31 + 7) % 251) as u8).collect()
}

/// A configurable origin behavior.
#[derive(Clone)]
pub struct Origin {
    pub body: Vec<u8>,
    /// Advertise `Accept-Ranges: bytes` and honor Range requests.
    pub support_ranges: bool,
    /// Advertise range support but answer ranged requests with `200 OK`
    /// and the full body.
    pub ignore_ranges: bool,
    /// Reject any request carrying a Range header outright.
    pub reject_range_header: bool,
    /// Send this many bytes of the response, then hang forever.
    pub stall_after: Option<usize>,
    /// Deliver the body one byte at a time with this gap between bytes.
    pub trickle: Option<Duration>,
}

impl Origin {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            support_ranges: true,
            ignore_ranges: false,
            reject_range_header: false,
            stall_after: None,
            trickle: None,
        }
    }
}

/// Serve `origin` on an ephemeral local port, returning the file URL.
pub async fn spawn_origin(origin: Origin) -> String {
    let app = Router::new().route("/file", get(serve)).with_state(origin);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/file")
}

async fn serve(State(origin): State<Origin>, headers: HeaderMap) -> Response {
    let total = origin.body.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    if range.is_some() && origin.reject_range_header {
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("unexpected Range header"))
            .unwrap();
    }

    let honor_range = origin.support_ranges && !origin.ignore_ranges;
    let (status, start, end) = match range {
        Some((start, end)) if honor_range => {
            (StatusCode::PARTIAL_CONTENT, start, end.min(total as u64 - 1))
        }
        _ => (StatusCode::OK, 0, total.saturating_sub(1) as u64),
    };

    let slice = if total == 0 {
        Vec::new()
    } else {
        origin.body[start as usize..=end as usize].to_vec()
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, slice.len());
    if origin.support_ranges {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{total}"),
        );
    }

    if let Some(n) = origin.stall_after {
        let prefix = Bytes::copy_from_slice(&slice[..n.min(slice.len())]);
        let stream = futures_util::stream::iter(vec![Ok::<_, Infallible>(prefix)])
            .chain(futures_util::stream::pending());
        return builder.body(Body::from_stream(stream)).unwrap();
    }

    if let Some(gap) = origin.trickle {
        let stream = futures_util::stream::unfold((slice, 0usize), move |(slice, i)| async move {
            if i >= slice.len() {
                return None;
            }
            tokio::time::sleep(gap).await;
            let byte = Bytes::copy_from_slice(&slice[i..i + 1]);
            Some((Ok::<_, Infallible>(byte), (slice, i + 1)))
        });
        return builder.body(Body::from_stream(stream)).unwrap();
    }

    builder.body(Body::from(slice)).unwrap()
}

fn parse_range(raw: &str) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}
