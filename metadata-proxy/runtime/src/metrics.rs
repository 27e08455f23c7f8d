use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    request_duration: Family<RequestLabels, Histogram>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    handler: &'static str,
    method: String,
    status: String,
}

// === impl HttpMetrics ===

impl Default for HttpMetrics {
    fn default() -> Self {
        Self {
            request_duration: Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
            }),
        }
    }
}

impl HttpMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register_with_unit(
            "request_duration",
            "Histogram of metadata request latency (seconds) by handler, method and status",
            Unit::Seconds,
            metrics.request_duration.clone(),
        );
        metrics
    }

    pub(crate) fn observe(
        &self,
        handler: &'static str,
        method: &http::Method,
        status: http::StatusCode,
        start: time::Instant,
    ) {
        self.request_duration
            .get_or_create(&RequestLabels {
                handler,
                method: method.to_string(),
                status: status.as_u16().to_string(),
            })
            .observe(start.elapsed().as_secs_f64());
    }
}
