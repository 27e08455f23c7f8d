use metadata_proxy_core::role;
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// STS limits role session names to 64 characters.
pub const MAX_SESSION_NAME_LEN: usize = 64;

/// Derives the STS session name for a caller assuming `role_arn`.
///
/// The name pairs a short hash of the caller's address with the role name so that sessions can be
/// attributed in CloudTrail without exposing the address itself.
pub fn session_name(role_arn: &str, caller: IpAddr) -> String {
    let digest = Sha256::digest(caller.to_string().as_bytes());
    let mut name = format!("{}-{}", hex::encode(&digest[..8]), role::last_segment(role_arn));
    if name.len() > MAX_SESSION_NAME_LEN {
        let mut end = MAX_SESSION_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}
