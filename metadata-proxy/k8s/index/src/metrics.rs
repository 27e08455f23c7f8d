use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

use super::SharedIndex;

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut by_ns = ahash::AHashMap::<&str, (u32, u32)>::default();
        for placement in this.workloads() {
            let (workloads, assigned) = by_ns.entry(placement.namespace.as_str()).or_default();
            *workloads += 1;
            if placement.role.is_some() {
                *assigned += 1;
            }
        }

        let mut workloads_encoder = encoder.encode_descriptor(
            "workload_index_size",
            "The number of workloads with an IP in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, (workloads, _)) in &by_ns {
            let labels = [("namespace", *ns)];
            let workloads = ConstGauge::new(*workloads);
            let workloads_encoder = workloads_encoder.encode_family(&labels)?;
            workloads.encode(workloads_encoder)?;
        }

        let mut assigned_encoder = encoder.encode_descriptor(
            "role_assignment_index_size",
            "The number of workloads with an assigned role in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, (_, assigned)) in &by_ns {
            let labels = [("namespace", *ns)];
            let assigned = ConstGauge::new(*assigned);
            let assigned_encoder = assigned_encoder.encode_family(&labels)?;
            assigned.encode(assigned_encoder)?;
        }

        let restrictions_encoder = encoder.encode_descriptor(
            "namespace_restriction_index_size",
            "The number of namespace allow-lists in index",
            None,
            MetricType::Gauge,
        )?;
        let restrictions = ConstGauge::new(this.restriction_count() as u32);
        restrictions.encode(restrictions_encoder)?;

        Ok(())
    }
}
