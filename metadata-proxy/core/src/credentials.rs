use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Timestamp layout used by the metadata service, always in UTC.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Temporary security credentials in the shape served by the EC2 metadata
/// service at `meta-data/iam/security-credentials/{role}`.
///
/// The field names are part of the compatibility contract with AWS SDKs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub code: String,
    #[serde(serialize_with = "timestamp")]
    pub expiration: DateTime<Utc>,
    #[serde(serialize_with = "timestamp")]
    pub last_updated: DateTime<Utc>,
    pub secret_access_key: String,
    pub token: String,
    #[serde(rename = "Type")]
    pub kind: String,
}

// === impl Credentials ===

impl Credentials {
    pub const CODE_SUCCESS: &'static str = "Success";
    pub const TYPE_HMAC: &'static str = "AWS-HMAC";

    /// Builds a successful credential set issued at `last_updated`.
    pub fn issued(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        token: impl Into<String>,
        expiration: DateTime<Utc>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            code: Self::CODE_SUCCESS.to_string(),
            expiration,
            last_updated,
            secret_access_key: secret_access_key.into(),
            token: token.into(),
            kind: Self::TYPE_HMAC.to_string(),
        }
    }
}

fn timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&ts.format(TIMESTAMP_FORMAT))
}
