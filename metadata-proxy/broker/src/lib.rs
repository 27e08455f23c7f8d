//! Credential broker
//!
//! Exchanges roles for temporary credentials. Responses are cached per role for a short TTL and
//! concurrent requests for the same role share a single in-flight call, so a burst of pods
//! starting at once results in one STS request per role rather than one per caller.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod session;
mod sts;

#[cfg(test)]
mod tests;

pub use self::{
    metrics::BrokerMetrics,
    session::{session_name, MAX_SESSION_NAME_LEN},
    sts::{regional_endpoint, StsClient, StsConfig},
};
use ahash::AHashMap as HashMap;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use metadata_proxy_core::{AssumeRole, AssumeRoleError, AssumeRoleRequest, Backoff, Credentials};
use parking_lot::Mutex;
use std::{any::Any, net::IpAddr, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::time;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to assume role {role}: {source}")]
    AssumeRole {
        role: String,
        #[source]
        source: AssumeRoleError,
    },

    #[error("assuming role {role} panicked: {message}")]
    Panicked { role: String, message: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    /// How long issued credentials are served from cache.
    pub cache_ttl: Duration,

    /// The nominal lifetime of a role session.
    pub session_ttl: Duration,

    /// Multiplies `session_ttl` to produce the lifetime requested from STS, so that cached
    /// credentials remain valid well past the point where callers refresh them.
    pub session_ttl_ratio: u32,

    /// Retry policy for transient STS failures.
    pub backoff: Backoff,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn AssumeRole>,
    config: Config,
    cache: Mutex<HashMap<String, Entry>>,
    metrics: BrokerMetrics,
}

type Fetch = Shared<BoxFuture<'static, Result<Arc<Credentials>, BrokerError>>>;

enum Entry {
    Ready {
        creds: Arc<Credentials>,
        inserted_at: time::Instant,
    },
    Pending(Fetch),
}

// === impl BrokerError ===

impl BrokerError {
    pub fn assume_role_error(&self) -> Option<&AssumeRoleError> {
        match self {
            Self::AssumeRole { source, .. } => Some(source),
            Self::Panicked { .. } => None,
        }
    }
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            session_ttl: Duration::from_secs(15 * 60),
            session_ttl_ratio: 2,
            backoff: Backoff::default(),
        }
    }
}

impl Config {
    pub fn sts_duration(&self) -> Duration {
        self.session_ttl * self.session_ttl_ratio
    }
}

// === impl Broker ===

impl Broker {
    pub fn new(client: Arc<dyn AssumeRole>, config: Config, metrics: BrokerMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                cache: Mutex::new(HashMap::default()),
                metrics,
            }),
        }
    }

    /// Returns credentials for `role_arn`, from cache when possible.
    ///
    /// At most one STS call per role is in flight at a time; concurrent callers wait on it and
    /// receive the same result.
    pub async fn assume(
        &self,
        role_arn: &str,
        external_id: Option<String>,
        caller: IpAddr,
    ) -> Result<Arc<Credentials>, BrokerError> {
        let fetch = {
            let mut cache = self.inner.cache.lock();
            match cache.get(role_arn) {
                Some(Entry::Ready { creds, inserted_at })
                    if inserted_at.elapsed() < self.inner.config.cache_ttl =>
                {
                    self.inner.metrics.hit();
                    tracing::debug!(role = %role_arn, "Serving cached credentials");
                    return Ok(creds.clone());
                }
                Some(Entry::Pending(fetch)) => {
                    tracing::debug!(role = %role_arn, "Joining in-flight request");
                    fetch.clone()
                }
                _ => {
                    self.inner.metrics.miss();
                    let req = AssumeRoleRequest {
                        role_arn: role_arn.to_string(),
                        session_name: session_name(role_arn, caller),
                        external_id,
                        duration: self.inner.config.sts_duration(),
                    };
                    let fetch = self.inner.clone().fetch(req).boxed().shared();
                    cache.insert(role_arn.to_string(), Entry::Pending(fetch.clone()));
                    fetch
                }
            }
        };

        fetch.await
    }

    /// Drops all cached credentials.
    pub fn clear(&self) {
        self.inner.cache.lock().clear();
    }
}

// === impl Inner ===

impl Inner {
    async fn fetch(self: Arc<Self>, req: AssumeRoleRequest) -> Result<Arc<Credentials>, BrokerError> {
        let role = req.role_arn.clone();
        let start = time::Instant::now();
        // A panic still has to clear the pending entry.
        let res = AssertUnwindSafe(
            self.config
                .backoff
                .retry("assume-role", || self.client.assume_role(req.clone())),
        )
        .catch_unwind()
        .await;
        self.metrics
            .observe_assume_role(start, matches!(res, Ok(Ok(_))));

        let mut cache = self.cache.lock();
        match res {
            Ok(Ok(creds)) => {
                let creds = Arc::new(creds);
                let ttl = self.config.cache_ttl;
                cache.retain(|_, entry| match entry {
                    Entry::Ready { inserted_at, .. } => inserted_at.elapsed() < ttl,
                    Entry::Pending(_) => true,
                });
                cache.insert(
                    role,
                    Entry::Ready {
                        creds: creds.clone(),
                        inserted_at: time::Instant::now(),
                    },
                );
                Ok(creds)
            }
            Ok(Err(source)) => {
                tracing::warn!(%role, error = %source, "Failed to assume role");
                cache.remove(&role);
                Err(BrokerError::AssumeRole { role, source })
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(%role, %message, "Assume role panicked");
                cache.remove(&role);
                Err(BrokerError::Panicked { role, message })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "assume role panicked".to_string()
}
