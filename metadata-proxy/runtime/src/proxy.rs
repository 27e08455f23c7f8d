//! The metadata endpoint presented to workloads.
//!
//! Credential routes are answered locally from the identity index and the credential broker;
//! every other request is forwarded to the real metadata service. Each request runs behind a
//! failure boundary so that a fault in a handler only affects the request that caused it.

use crate::{
    liveness::Health,
    local_response,
    metrics::HttpMetrics,
    passthrough::{ForwardedFor, Passthrough},
    text_response, BoxError, ProxyBody,
};
use bytes::Bytes;
use futures::{future, FutureExt};
use http::{header::HeaderName, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use metadata_proxy_broker::{Broker, BrokerError};
use metadata_proxy_core::{role, Backoff, BaseArn};
use metadata_proxy_k8s_index::{resolve_external_id, Resolution, SharedIndex};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    any::Any,
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    panic::AssertUnwindSafe,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{sync::watch, time};


const CREDENTIALS_PATH: &str = "meta-data/iam/security-credentials";

static TOKEN_ROUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/?[^/]+/api/token$").expect("token route pattern must compile"));

static METADATA_TOKEN: HeaderName = HeaderName::from_static("x-aws-ec2-metadata-token");

/// Settings for the proxy's local handlers.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub base_arn: BaseArn,

    /// Reported by `/healthz`.
    pub host_ip: String,

    /// Serves the index dump at `/debug/store`.
    pub debug: bool,

    /// Bounds how long a credential request waits for a new workload to be indexed.
    pub lookup_backoff: Backoff,
}

#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

/// Serves requests from a single peer.
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<Inner>,
    peer: IpAddr,
}

struct Inner {
    config: Config,
    index: SharedIndex,
    broker: Broker,
    passthrough: Passthrough,
    health: watch::Receiver<Health>,
    metrics: HttpMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Route {
    Health,
    DebugStore,
    RoleName,
    Credentials(String),
    /// Forwarded without revealing the caller's address.
    Token,
    Passthrough,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse<'h> {
    #[serde(rename = "hostIP")]
    host_ip: &'h str,
    instance_id: &'h str,
}

// === impl Proxy ===

impl Proxy {
    pub fn new(
        config: Config,
        index: SharedIndex,
        broker: Broker,
        passthrough: Passthrough,
        health: watch::Receiver<Health>,
        metrics: HttpMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                index,
                broker,
                passthrough,
                health,
                metrics,
            }),
        }
    }

    pub fn service(&self, peer: SocketAddr) -> ProxyService {
        ProxyService {
            inner: self.inner.clone(),
            peer: peer.ip().to_canonical(),
        }
    }
}

// === impl ProxyService ===

impl<B> tower::Service<Request<B>> for ProxyService
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<ProxyBody>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let req: Request<ProxyBody> = req.map(|body| body.map_err(Into::into).boxed_unsync());
        let inner = self.inner.clone();
        let peer = self.peer;
        Box::pin(async move {
            let start = time::Instant::now();
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            let route = Route::classify(&req, inner.config.debug);
            let handler = route.name();

            let rsp = match AssertUnwindSafe(inner.handle(route.clone(), req, peer))
                .catch_unwind()
                .await
            {
                Ok(Ok(rsp)) => rsp,
                Ok(Err(error)) => {
                    tracing::error!(%method, %path, %error, "Request failed");
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
                }
                Err(panic) => {
                    let message = panic_message(&*panic);
                    tracing::error!(%method, %path, %message, "Request handler panicked");
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, message)
                }
            };

            inner.metrics.observe(handler, &method, rsp.status(), start);
            if route != Route::Health {
                tracing::info!(
                    %method,
                    %path,
                    %peer,
                    status = rsp.status().as_u16(),
                    latency = ?start.elapsed(),
                    "Handled request",
                );
            }
            Ok(rsp)
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "request handler panicked".to_string()
}

// === impl Inner ===

impl Inner {
    async fn handle(
        &self,
        route: Route,
        req: Request<ProxyBody>,
        caller: IpAddr,
    ) -> Result<Response<ProxyBody>, Error> {
        match route {
            Route::Health => Ok(self.health()),
            Route::DebugStore => self.debug_store(),
            Route::RoleName => Ok(self.role_name(caller).await),
            Route::Credentials(requested) => self.credentials(&requested, caller).await,
            Route::Token => Ok(self.passthrough.forward(req, ForwardedFor::Scrub).await),
            Route::Passthrough => Ok(self
                .passthrough
                .forward(req, ForwardedFor::Append(caller))
                .await),
        }
    }

    fn health(&self) -> Response<ProxyBody> {
        let health = self.health.borrow().clone();
        match health {
            Health::Healthy { instance_id } => {
                let rsp = HealthResponse {
                    host_ip: &self.config.host_ip,
                    instance_id: &instance_id,
                };
                match serde_json::to_vec(&rsp) {
                    Ok(body) => local_response(StatusCode::OK, "application/json", body),
                    Err(error) => {
                        text_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
                    }
                }
            }
            Health::Unhealthy { reason } => {
                text_response(StatusCode::INTERNAL_SERVER_ERROR, reason)
            }
            Health::Pending => text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "health check has not completed",
            ),
        }
    }

    fn debug_store(&self) -> Result<Response<ProxyBody>, Error> {
        let dump = self.index.read().dump();
        let body = serde_json::to_vec(&dump)?;
        Ok(local_response(StatusCode::OK, "application/json", body))
    }

    /// Resolves the caller's role, first waiting within the lookup budget for a workload at the
    /// caller's address to be indexed. Returns the workload's external ID alongside.
    async fn resolve(&self, caller: IpAddr) -> (Option<Resolution>, Option<String>) {
        let external_id =
            match resolve_external_id(&self.index, caller, &self.config.lookup_backoff).await {
                Ok(id) => id,
                Err(error) => {
                    tracing::debug!(%caller, %error, "Caller is not an indexed workload");
                    None
                }
            };
        (self.index.read().resolve(caller), external_id)
    }

    /// Lists the caller's role the way the metadata service lists the instance profile role.
    async fn role_name(&self, caller: IpAddr) -> Response<ProxyBody> {
        let (resolution, _) = self.resolve(caller).await;
        let Some(resolution) = resolution else {
            tracing::debug!(%caller, "No role for caller");
            return text_response(
                StatusCode::NOT_FOUND,
                format!("unable to find role for IP {caller}"),
            );
        };

        let base = &self.config.base_arn;
        let arn = base.role_arn(&resolution.role);
        let listed = base.strip(&arn).unwrap_or(&arn).to_string();
        text_response(StatusCode::OK, listed)
    }

    async fn credentials(
        &self,
        requested: &str,
        caller: IpAddr,
    ) -> Result<Response<ProxyBody>, Error> {
        let (resolution, external_id) = self.resolve(caller).await;
        let Some(resolution) = resolution else {
            tracing::debug!(%caller, role = %requested, "No role for caller");
            return Ok(text_response(
                StatusCode::NOT_FOUND,
                format!("unable to find role for IP {caller}"),
            ));
        };

        // Assigned callers may only obtain their own role. Unassigned callers get the default
        // role whatever they ask for.
        let base = &self.config.base_arn;
        let role_arn = base.role_arn(&resolution.role);
        if resolution.found && !requests_role(base, requested, &role_arn) {
            tracing::warn!(
                %caller,
                role = %requested,
                assigned = %role_arn,
                "Requested role is not assigned to caller",
            );
            return Ok(text_response(
                StatusCode::FORBIDDEN,
                format!("role {requested} is not assigned to {caller}"),
            ));
        }

        if let Some(ns) = resolution.namespace.as_deref() {
            let authorized = self.index.read().is_authorized(ns, &role_arn);
            if !authorized {
                tracing::warn!(%caller, %ns, role = %role_arn, "Role denied by namespace restriction");
                return Ok(text_response(
                    StatusCode::FORBIDDEN,
                    format!("role {role_arn} is not permitted in namespace {ns}"),
                ));
            }
        }

        // The external ID belongs to the assigned role, never to the default.
        let external_id = external_id.filter(|_| resolution.found);
        match self.broker.assume(&role_arn, external_id, caller).await {
            Ok(creds) => {
                let body = serde_json::to_vec(&*creds)?;
                Ok(local_response(StatusCode::OK, "application/json", body))
            }
            Err(error @ BrokerError::Panicked { .. }) => Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error.to_string(),
            )),
            Err(error) => Ok(text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                error.to_string(),
            )),
        }
    }
}

/// Returns true if `requested` names the role `assigned`, either as the same ARN or by its bare
/// name.
fn requests_role(base: &BaseArn, requested: &str, assigned: &str) -> bool {
    base.role_arn(requested) == assigned
        || (!role::is_arn(requested) && requested == role::name(assigned))
}

// === impl Route ===

impl Route {
    fn classify<B>(req: &Request<B>, debug: bool) -> Self {
        let path = req.uri().path();
        if path == "/healthz" {
            return Self::Health;
        }
        if debug && path == "/debug/store" {
            return Self::DebugStore;
        }

        let method = req.method();
        if method == Method::GET {
            if let Some((_version, rest)) = path.trim_start_matches('/').split_once('/') {
                if let Some(rest) = rest.strip_prefix(CREDENTIALS_PATH) {
                    match rest.strip_prefix('/') {
                        None if rest.is_empty() => return Self::RoleName,
                        Some("") => return Self::RoleName,
                        Some(role) => return Self::Credentials(role.to_string()),
                        None => {}
                    }
                }
            }
        }

        let has_token = req
            .headers()
            .get(&METADATA_TOKEN)
            .is_some_and(|v| !v.is_empty());
        if (method == Method::PUT && TOKEN_ROUTE.is_match(path))
            || (method == Method::GET && has_token)
        {
            return Self::Token;
        }

        Self::Passthrough
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::DebugStore => "debug_store",
            Self::RoleName => "role_name",
            Self::Credentials(_) => "credentials",
            Self::Token => "token",
            Self::Passthrough => "passthrough",
        }
    }
}
