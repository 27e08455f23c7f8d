#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use metadata_proxy_broker as broker;
pub use metadata_proxy_core as core;
pub use metadata_proxy_k8s_index as index;

mod args;
pub mod liveness;
pub mod metrics;
pub mod passthrough;
pub mod proxy;
mod server;

#[cfg(test)]
mod test_util;

pub use self::{
    args::Args,
    liveness::Health,
    passthrough::Passthrough,
    proxy::{Proxy, ProxyService},
    server::serve,
};

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type of every request and response that passes through the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Builds a response that originates from the proxy itself rather than the upstream metadata
/// service.
pub(crate) fn local_response(
    status: http::StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> http::Response<ProxyBody> {
    let mut rsp = http::Response::new(full_body(body));
    *rsp.status_mut() = status;
    let headers = rsp.headers_mut();
    headers.insert(
        http::header::SERVER,
        http::HeaderValue::from_static(core::METADATA_SERVER_HEADER),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static(content_type),
    );
    rsp
}

pub(crate) fn text_response(status: http::StatusCode, body: impl Into<Bytes>) -> http::Response<ProxyBody> {
    local_response(status, "text/plain; charset=utf-8", body)
}
