use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct BrokerMetrics {
    hits: Counter,
    misses: Counter,
    assume_role: Family<OutcomeLabels, Histogram>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OutcomeLabels {
    outcome: &'static str,
}

// === impl BrokerMetrics ===

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self {
            hits: Counter::default(),
            misses: Counter::default(),
            assume_role: Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
            }),
        }
    }
}

impl BrokerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "credential_cache_hits",
            "Total number of credential requests served from cache",
            metrics.hits.clone(),
        );
        reg.register(
            "credential_cache_misses",
            "Total number of credential requests that required a call to STS",
            metrics.misses.clone(),
        );
        reg.register_with_unit(
            "assume_role_duration",
            "Histogram of AssumeRole call latency (seconds), including retries",
            Unit::Seconds,
            metrics.assume_role.clone(),
        );
        metrics
    }

    pub(crate) fn hit(&self) {
        self.hits.inc();
    }

    pub(crate) fn miss(&self) {
        self.misses.inc();
    }

    pub(crate) fn observe_assume_role(&self, start: time::Instant, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.assume_role
            .get_or_create(&OutcomeLabels { outcome })
            .observe(start.elapsed().as_secs_f64());
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (u64, u64) {
        (self.hits.get(), self.misses.get())
    }
}
