#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod assume_role;
pub mod backoff;
pub mod credentials;
pub mod duration;
pub mod placement;
pub mod restriction;
pub mod role;

pub use self::{
    assume_role::{AssumeRole, AssumeRoleError, AssumeRoleRequest},
    backoff::{Backoff, Transient},
    credentials::Credentials,
    placement::{Placement, PlacementEvent},
    restriction::{Dialect, NamespaceRestriction, RestrictionEvent},
    role::BaseArn,
};

/// The `Server` header value the EC2 metadata service sets on its responses.
pub const METADATA_SERVER_HEADER: &str = "EC2ws";
