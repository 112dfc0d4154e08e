//! Shared outbound HTTP plumbing for the registry and gateway clients.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

/// Maximum response body size accepted from either backend.
pub(crate) const MAX_RESPONSE_BYTES: usize = 1 << 20;

pub(crate) type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Builds the TLS-capable client used for all outbound calls.
pub(crate) fn https_client() -> HttpsClient {
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Client::builder(TokioExecutor::new()).build(https)
}

/// Collects a response body, enforcing the size bound.
///
/// Returns `Err` with a human-readable reason on oversize or transport
/// failure; callers map it into their own error type.
pub(crate) async fn collect_body(
    body: hyper::body::Incoming,
) -> Result<Bytes, String> {
    let collected = body.collect().await.map_err(|e| e.to_string())?;
    let bytes = collected.to_bytes();
    if bytes.len() > MAX_RESPONSE_BYTES {
        return Err(format!(
            "response body exceeds {MAX_RESPONSE_BYTES} bytes"
        ));
    }
    Ok(bytes)
}
