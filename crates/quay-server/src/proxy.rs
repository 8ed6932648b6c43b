//! Reverse-proxy forwarding.
//!
//! Matches a request path against an ordered rule list and streams the
//! request to the configured upstream, then streams the response back
//! without buffering either payload. An upstream failure before response
//! headers arrive becomes a 502; failures mid-stream are logged and the
//! transfer is aborted.

use crate::config::ProxyRule;
use crate::error::HttpError;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::response::Response;
use futures::TryStreamExt;
use reqwest::Client;

/// Headers owned by the connection, never forwarded; the client and server
/// stacks re-frame these per hop.
const HOP_BY_HOP: &[header::HeaderName] = &[
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
];

/// First rule whose context prefixes `path`, scanning client rules before
/// global rules is the caller's responsibility (it passes the combined
/// ordered slice).
pub fn match_rule<'a>(rules: &'a [ProxyRule], path: &str) -> Option<&'a ProxyRule> {
    rules.iter().find(|rule| rule.matches(path))
}

/// Forward `req` to the rule's upstream and stream back the response.
///
/// Returns `HttpError::UpstreamUnavailable` (502) when the upstream cannot
/// be reached before its response headers are produced.
pub async fn forward(
    client: &Client,
    rule: &ProxyRule,
    req: Request<Body>,
) -> Result<Response, HttpError> {
    let path = req.uri().path();
    let rewritten = rule.rewrite_path(path);

    let mut upstream_url = format!(
        "{}{}",
        rule.target.as_str().trim_end_matches('/'),
        rewritten
    );
    if let Some(query) = req.uri().query() {
        upstream_url.push('?');
        upstream_url.push_str(query);
    }

    let method = req.method().clone();
    let mut headers = forwardable_headers(req.headers());

    for (name, value) in &rule.headers {
        let (Ok(name), Ok(value)) = (
            header::HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            tracing::warn!(header = %name, "skipping invalid proxy header");
            continue;
        };
        headers.insert(name, value);
    }

    if rule.change_origin {
        if let Some(host) = host_header_value(&rule.target) {
            headers.insert(header::HOST, host);
        }
    }

    let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());

    let upstream = client
        .request(method, &upstream_url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|err| {
            tracing::warn!(url = %upstream_url, error = %err, "proxy upstream unreachable");
            HttpError::UpstreamUnavailable(err.to_string())
        })?;

    let mut builder = Response::builder().status(upstream.status());
    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if HOP_BY_HOP.contains(name) {
                continue;
            }
            response_headers.insert(name.clone(), value.clone());
        }
    }

    // Mid-stream failures can no longer change the status line; log and let
    // the transfer abort.
    let stream = upstream
        .bytes_stream()
        .inspect_err(|err| tracing::warn!(error = %err, "proxy stream interrupted"));

    builder
        .body(Body::from_stream(stream))
        .map_err(|err| HttpError::Internal(err.to_string()))
}

/// Incoming headers minus `Host` and the hop-by-hop set. `Host` is either
/// re-set for `change_origin` or left for the client stack to derive from
/// the upstream URL.
fn forwardable_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if *name == header::HOST || HOP_BY_HOP.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn host_header_value(target: &url::Url) -> Option<HeaderValue> {
    let host = target.host_str()?;
    let value = match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    HeaderValue::try_from(value).ok()
}
