use crate::{text_response, BoxError, ProxyBody};
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    uri::{Authority, PathAndQuery, Uri},
    Request, Response, StatusCode,
};
use http_body_util::BodyExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::{net::IpAddr, time::Duration};
use tokio::time;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that apply to a single connection and must not be forwarded.
static HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwards requests to the real metadata service.
#[derive(Clone, Debug)]
pub struct Passthrough {
    client: Client<HttpConnector, ProxyBody>,
    authority: Authority,
    timeout: Duration,
}

/// How the caller's address is presented upstream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ForwardedFor {
    /// Append the caller to `X-Forwarded-For`.
    Append(IpAddr),

    /// Remove `X-Forwarded-For` entirely.
    Scrub,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid upstream URI: {0}")]
    Uri(#[from] http::Error),

    #[error("upstream request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
}

// === impl Passthrough ===

impl Passthrough {
    pub fn new(authority: Authority, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            authority,
            timeout,
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Forwards `req` upstream, responding with `502` when the metadata service cannot be
    /// reached.
    pub async fn forward(&self, req: Request<ProxyBody>, fwd: ForwardedFor) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();
        match self.try_forward(req, fwd).await {
            Ok(rsp) => rsp,
            Err(error) => {
                tracing::warn!(%path, %error, "Failed to forward request");
                text_response(StatusCode::BAD_GATEWAY, error.to_string())
            }
        }
    }

    async fn try_forward(
        &self,
        req: Request<ProxyBody>,
        fwd: ForwardedFor,
    ) -> Result<Response<ProxyBody>, Error> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::builder()
            .scheme("http")
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?;

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        match fwd {
            ForwardedFor::Append(ip) => append_forwarded_for(&mut parts.headers, ip),
            ForwardedFor::Scrub => {
                parts.headers.remove(&X_FORWARDED_FOR);
            }
        }

        let req = Request::from_parts(parts, body);
        let rsp = time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let (mut parts, body) = rsp.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let body = body.map_err(BoxError::from).boxed_unsync();
        Ok(Response::from_parts(parts, body))
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are also connection-scoped.
    let named = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect::<Vec<_>>();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{prior}, {ip}")
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(&X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::ACCEPT], "*/*");
    }

    #[test]
    fn forwarded_for_is_appended() {
        let ip = "10.1.2.3".parse().unwrap();

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, ip);
        assert_eq!(headers[&X_FORWARDED_FOR], "10.1.2.3");

        let mut headers = HeaderMap::new();
        headers.insert(&X_FORWARDED_FOR, HeaderValue::from_static("192.0.2.1"));
        append_forwarded_for(&mut headers, ip);
        assert_eq!(headers[&X_FORWARDED_FOR], "192.0.2.1, 10.1.2.3");
    }
}
