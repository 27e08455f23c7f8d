//! Translates Kubernetes `Pod` and `Namespace` watches into index [`Event`]s.

use crate::Event;
use ahash::AHashMap as HashMap;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::ResourceExt;
use metadata_proxy_core::{
    Dialect, NamespaceRestriction, Placement, PlacementEvent, RestrictionEvent,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub const DEFAULT_ROLE_KEY: &str = "iam.amazonaws.com/role";
pub const DEFAULT_EXTERNAL_ID_KEY: &str = "iam.amazonaws.com/external-id";
pub const DEFAULT_NAMESPACE_KEY: &str = "iam.amazonaws.com/allowed-roles";

/// Annotation keys and formats used to read identity from cluster resources.
#[derive(Clone, Debug)]
pub struct Annotations {
    pub role_key: String,
    pub external_id_key: String,
    pub namespace_key: String,
    pub dialect: Dialect,
}

/// Indexes watched resources and publishes normalized events.
///
/// The last placement of each pod is retained so that updates carry both the previous and the
/// current placement, and deletes carry the placement being removed.
pub struct Watcher {
    annotations: Annotations,
    pods: HashMap<(String, String), Placement>,
    events: UnboundedSender<Event>,
}

// === impl Annotations ===

impl Default for Annotations {
    fn default() -> Self {
        Self {
            role_key: DEFAULT_ROLE_KEY.to_string(),
            external_id_key: DEFAULT_EXTERNAL_ID_KEY.to_string(),
            namespace_key: DEFAULT_NAMESPACE_KEY.to_string(),
            dialect: Dialect::default(),
        }
    }
}

impl Annotations {
    pub fn placement(&self, pod: &Pod) -> Placement {
        let annotations = pod.annotations();
        let status = pod.status.as_ref();

        let terminated = matches!(
            status.and_then(|s| s.phase.as_deref()),
            Some("Succeeded" | "Failed")
        );
        // Host-network pods report the node's address, which they share with everything else on
        // the host.
        let host_network = pod
            .spec
            .as_ref()
            .and_then(|s| s.host_network)
            .unwrap_or(false);
        let ip = status
            .and_then(|s| s.pod_ip.as_deref())
            .filter(|_| !terminated && !host_network)
            .and_then(|ip| ip.parse().ok());

        Placement {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_unchecked(),
            ip,
            role: annotations
                .get(&self.role_key)
                .filter(|r| !r.is_empty())
                .cloned(),
            external_id: annotations
                .get(&self.external_id_key)
                .filter(|id| !id.is_empty())
                .cloned(),
        }
    }

    pub fn restriction(&self, ns: &Namespace) -> NamespaceRestriction {
        let name = ns.name_unchecked();
        let allowed_roles = match ns.annotations().get(&self.namespace_key) {
            None => Vec::new(),
            Some(value) => serde_json::from_str::<Vec<String>>(value).unwrap_or_else(|error| {
                tracing::warn!(ns = %name, %error, "Malformed allowed roles annotation");
                Vec::new()
            }),
        };

        NamespaceRestriction {
            namespace: name,
            allowed_roles,
            enabled: true,
            dialect: self.dialect,
        }
    }
}

// === impl Watcher ===

impl Watcher {
    pub fn new(annotations: Annotations, events: UnboundedSender<Event>) -> Self {
        Self {
            annotations,
            pods: HashMap::default(),
            events,
        }
    }

    pub fn shared(
        annotations: Annotations,
        events: UnboundedSender<Event>,
    ) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self::new(annotations, events)))
    }

    fn send(&self, event: impl Into<Event>) {
        if self.events.send(event.into()).is_err() {
            tracing::error!("Index event channel closed");
        }
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for Watcher {
    fn apply(&mut self, pod: Pod) {
        let placement = self.annotations.placement(&pod);
        let id = (placement.namespace.clone(), placement.name.clone());

        match self.pods.insert(id, placement.clone()) {
            None => self.send(PlacementEvent::Added(placement)),
            Some(old) if old == placement => {}
            Some(old) => self.send(PlacementEvent::Updated {
                old,
                new: placement,
            }),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(placement) = self.pods.remove(&(namespace, name)) {
            self.send(PlacementEvent::Deleted(placement));
        }
    }
}

impl kubert::index::IndexClusterResource<Namespace> for Watcher {
    fn apply(&mut self, ns: Namespace) {
        let restriction = self.annotations.restriction(&ns);
        self.send(RestrictionEvent::Applied(restriction));
    }

    fn delete(&mut self, name: String) {
        self.send(RestrictionEvent::Deleted(name));
    }
}
