use super::server::ServerState;
use super::stats::StreamStats;
use crate::buffer::FrameItem;
use crate::frame::Frame;
use crate::rate_limit::BucketRateLimiter;
use crate::SERVER_NAME;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed multipart boundary of the outgoing stream.
pub const STREAM_BOUNDARY: &str = "puppyserv-92af5f768c28fad8";

/// Tokens a streaming client may accumulate (burst allowance).
const CLIENT_BUCKET_SIZE: f64 = 10.0;

/// Handler for the continuous multipart stream endpoint.
///
/// Each client pulls from the shared buffer through its own token-bucket
/// limiter; the rate is recomputed on every frame as
/// `max_total_framerate / n_clients`, so the aggregate outbound rate stays
/// capped while clients come and go. Upstream timeouts are substituted
/// with the configured placeholder frame.
pub async fn stream_endpoint(State(state): State<ServerState>, method: Method) -> Response {
    if let Some(response) = reject_non_get(&method) {
        return response;
    }

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={STREAM_BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::SERVER, SERVER_NAME);

    if method == Method::HEAD {
        return builder.body(Body::empty()).unwrap();
    }

    info!("new stream client connected");
    let manager = Arc::clone(&state.manager);
    let config = state.config.clone();

    let body = async_stream::stream! {
        let mut client = manager.acquire();
        let mut stats = StreamStats::new();
        let mut limiter = {
            let total = config.borrow().max_total_framerate;
            BucketRateLimiter::new(
                total / manager.n_clients().max(1) as f64,
                Some(CLIENT_BUCKET_SIZE),
            )
        };

        loop {
            limiter.next().await;
            let Some(item) = client.next().await else {
                break;
            };
            let frame = match item {
                FrameItem::Frame(frame) => frame,
                FrameItem::Timeout => config.borrow().timeout_image.clone(),
            };

            // the fan-out budget is shared: recompute this client's slice
            let total = config.borrow().max_total_framerate;
            limiter.set_max_rate(total / manager.n_clients().max(1) as f64);

            let part = part_for_frame(&frame);
            stats.record(part.len());
            if stats.frames % 100 == 0 {
                info!(
                    "streamed {} frames ({:.1} f/s, {} bytes)",
                    stats.frames,
                    stats.rate(),
                    stats.bytes
                );
            }
            yield Ok::<_, Infallible>(part);
        }

        debug!("stream client done after {} frames", stats.frames);
        yield Ok(stream_terminator());
    };

    builder.body(Body::from_stream(body)).unwrap()
}

/// Handler for the single-frame snapshot endpoint.
pub async fn snapshot_endpoint(State(state): State<ServerState>, method: Method) -> Response {
    if let Some(response) = reject_non_get(&method) {
        return response;
    }

    let mut client = state.manager.acquire();
    let first = client.next().await;
    drop(client);

    let response = match first {
        None => gateway_timeout("Not connected to webcam"),
        Some(FrameItem::Timeout) => gateway_timeout("webcam connection timed out"),
        Some(FrameItem::Frame(frame)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONTENT_TYPE, frame.content_type())
            .header(header::SERVER, SERVER_NAME)
            .body(Body::from(frame.data().clone()))
            .unwrap(),
    };

    if method == Method::HEAD {
        let (parts, _) = response.into_parts();
        return Response::from_parts(parts, Body::empty());
    }
    response
}

pub async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn reject_non_get(method: &Method) -> Option<Response> {
    if method == Method::GET || method == Method::HEAD {
        return None;
    }
    Some(
        Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header(header::ALLOW, "GET, HEAD")
            .body(Body::empty())
            .unwrap(),
    )
}

fn gateway_timeout(reason: &str) -> Response {
    Response::builder()
        .status(StatusCode::GATEWAY_TIMEOUT)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::SERVER, SERVER_NAME)
        .body(Body::from(reason.to_string()))
        .unwrap()
}

/// Encode one frame as a part of the outgoing multipart stream.
pub fn part_for_frame(frame: &Frame) -> Bytes {
    let mut part = BytesMut::with_capacity(frame.len() + STREAM_BOUNDARY.len() + 64);
    part.put_slice(b"--");
    part.put_slice(STREAM_BOUNDARY.as_bytes());
    part.put_slice(b"\r\n");
    part.put_slice(format!("Content-Type: {}\r\n", frame.content_type()).as_bytes());
    part.put_slice(format!("Content-length: {}\r\n", frame.len()).as_bytes());
    part.put_slice(b"\r\n");
    part.put_slice(frame.data());
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Closing terminator of the multipart stream.
pub fn stream_terminator() -> Bytes {
    Bytes::from(format!("--{STREAM_BOUNDARY}--\r\n"))
}
