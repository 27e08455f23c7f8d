use std::net::IpAddr;

/// Where a workload runs and which identity it was assigned.
///
/// `namespace` and `name` identify the workload so that events describing a
/// previous owner of an IP can be recognised.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Placement {
    pub namespace: String,
    pub name: String,
    pub ip: Option<IpAddr>,
    pub role: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlacementEvent {
    Added(Placement),
    Updated { old: Placement, new: Placement },
    Deleted(Placement),
}

// === impl Placement ===

impl Placement {
    /// Returns true if `other` describes the same workload.
    pub fn same_workload(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}
