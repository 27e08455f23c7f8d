use crate::SharedIndex;
use metadata_proxy_core::{Backoff, Transient};
use std::net::IpAddr;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("no workload found for {0}")]
    NotFound(IpAddr),
}

impl Transient for LookupError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Looks up the external ID for the workload at `ip`, retrying while the index catches up with
/// the cluster.
pub async fn resolve_external_id(
    index: &SharedIndex,
    ip: IpAddr,
    backoff: &Backoff,
) -> Result<Option<String>, LookupError> {
    backoff
        .retry("external-id", || {
            let res = index.read().external_id(ip);
            async move { res }
        })
        .await
}
