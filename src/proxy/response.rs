//! Response bodies and error responses for the plain path

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{Response, StatusCode};
use tokio_util::io::ReaderStream;

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// Stream a cached file. Read errors after the head is sent end the
/// connection and are logged, not turned into a new response.
pub fn file_body(file: tokio::fs::File, url: String) -> ProxyBody {
    let stream = ReaderStream::new(file)
        .inspect_err(move |e| tracing::warn!(url = %url, error = %e, "Failed while streaming cached file"))
        .map_ok(Frame::data);
    BodyExt::boxed(StreamBody::new(stream))
}

/// Plain-text error response with the given status
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = format!("Proxy error: {}\n", message);

    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}
