//! Caches the result of a periodic probe of the upstream metadata service so that `/healthz` can
//! be polled at a high rate without touching the upstream.

use crate::{full_body, ProxyBody};
use http::{uri::Authority, Request, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use prometheus_client::{metrics::gauge::Gauge, registry::Registry};
use std::time::Duration;
use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};

const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";

/// The latest probe result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Health {
    /// No probe has completed yet.
    Pending,
    Healthy { instance_id: String },
    Unhealthy { reason: String },
}

#[derive(Clone, Debug)]
pub struct Prober {
    client: Client<HttpConnector, ProxyBody>,
    uri: Uri,
    timeout: Duration,
    status: Gauge,
}

pub fn channel() -> (watch::Sender<Health>, watch::Receiver<Health>) {
    watch::channel(Health::Pending)
}

/// Registers the `health_check_status` gauge, which is 1 while the upstream is reachable.
pub fn register(reg: &mut Registry) -> Gauge {
    let status = Gauge::default();
    reg.register(
        "health_check_status",
        "Whether the last probe of the metadata service succeeded",
        status.clone(),
    );
    status
}

// === impl Prober ===

impl Prober {
    pub fn new(metadata: Authority, timeout: Duration, status: Gauge) -> Result<Self, http::Error> {
        let uri = Uri::builder()
            .scheme("http")
            .authority(metadata)
            .path_and_query(INSTANCE_ID_PATH)
            .build()?;
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            uri,
            timeout,
            status,
        })
    }

    /// Probes the upstream every `interval` until all receivers are dropped.
    pub async fn run(self, interval: Duration, tx: watch::Sender<Health>) {
        let mut interval = time::interval(interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let health = self.probe().await;
            if tx.send(health).is_err() {
                tracing::debug!("Health receivers dropped");
                return;
            }
        }
    }

    pub async fn probe(&self) -> Health {
        let health = match time::timeout(self.timeout, self.instance_id()).await {
            Ok(Ok(instance_id)) => Health::Healthy { instance_id },
            Ok(Err(reason)) => Health::Unhealthy { reason },
            Err(_) => Health::Unhealthy {
                reason: format!("Error getting instance id: timed out after {:?}", self.timeout),
            },
        };

        match &health {
            Health::Healthy { instance_id } => {
                tracing::trace!(%instance_id, "Metadata service is healthy");
                self.status.set(1);
            }
            Health::Unhealthy { reason } => {
                tracing::error!(%reason, "Health check failed");
                self.status.set(0);
            }
            Health::Pending => {}
        }
        health
    }

    async fn instance_id(&self) -> Result<String, String> {
        let req = Request::get(self.uri.clone())
            .body(full_body(""))
            .map_err(|e| format!("Error building request: {e}"))?;
        let rsp = self
            .client
            .request(req)
            .await
            .map_err(|e| format!("Error getting instance id: {e}"))?;
        if rsp.status() != StatusCode::OK {
            return Err(format!(
                "Error getting instance id, got status: {}",
                rsp.status()
            ));
        }
        let body = rsp
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("Error reading response body: {e}"))?
            .to_bytes();
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{unreachable_addr, upstream};
    use bytes::Bytes;
    use http::Response;
    use http_body_util::Full;

    fn prober(addr: std::net::SocketAddr) -> (Prober, Gauge) {
        let status = Gauge::default();
        let authority = addr.to_string().parse().unwrap();
        let prober = Prober::new(authority, Duration::from_secs(1), status.clone()).unwrap();
        (prober, status)
    }

    #[tokio::test]
    async fn healthy() {
        let addr = upstream(|req| {
            assert_eq!(req.uri().path(), INSTANCE_ID_PATH);
            Response::new(Full::new(Bytes::from_static(b"i-0123456789abcdef0")))
        })
        .await;
        let (prober, status) = prober(addr);

        assert_eq!(
            prober.probe().await,
            Health::Healthy {
                instance_id: "i-0123456789abcdef0".to_string()
            }
        );
        assert_eq!(status.get(), 1);
    }

    #[tokio::test]
    async fn unexpected_status() {
        let addr = upstream(|_| {
            let mut rsp = Response::new(Full::new(Bytes::new()));
            *rsp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            rsp
        })
        .await;
        let (prober, status) = prober(addr);
        status.set(1);

        match prober.probe().await {
            Health::Unhealthy { reason } => {
                assert_eq!(
                    reason,
                    "Error getting instance id, got status: 503 Service Unavailable"
                )
            }
            health => panic!("unexpected {health:?}"),
        }
        assert_eq!(status.get(), 0);
    }

    #[tokio::test]
    async fn unreachable() {
        let (prober, status) = prober(unreachable_addr().await);

        match prober.probe().await {
            Health::Unhealthy { reason } => {
                assert!(reason.starts_with("Error getting instance id"), "{reason}")
            }
            health => panic!("unexpected {health:?}"),
        }
        assert_eq!(status.get(), 0);
    }

    #[tokio::test]
    async fn run_publishes_results() {
        let addr = upstream(|_| Response::new(Full::new(Bytes::from_static(b"i-1")))).await;
        let (prober, _) = prober(addr);
        let (tx, mut rx) = channel();
        assert_eq!(*rx.borrow(), Health::Pending);

        tokio::spawn(prober.run(Duration::from_secs(30), tx));
        rx.changed().await.unwrap();
        assert_eq!(
            *rx.borrow(),
            Health::Healthy {
                instance_id: "i-1".to_string()
            }
        );
    }
}
