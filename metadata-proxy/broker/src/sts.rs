use aws_sdk_sts::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    operation::assume_role::AssumeRoleError as SdkAssumeRoleError,
};
use aws_smithy_types::timeout::TimeoutConfig;
use metadata_proxy_core::{AssumeRole, AssumeRoleError, AssumeRoleRequest, Credentials};
use std::time::Duration;

/// Selects the STS endpoint and call timeout.
#[derive(Clone, Debug, Default)]
pub struct StsConfig {
    /// Use the STS endpoint of the configured region instead of the global endpoint.
    pub regional: bool,

    /// An explicit endpoint, e.g. an STS VPC endpoint. Takes precedence over `regional`.
    pub vpc_endpoint: Option<String>,

    pub timeout: Option<Duration>,
}

/// Assumes roles through AWS STS.
#[derive(Clone, Debug)]
pub struct StsClient {
    client: aws_sdk_sts::Client,
    endpoint: Option<String>,
}

/// Returns the regional STS endpoint for `region`.
pub fn regional_endpoint(region: &str) -> String {
    if region.starts_with("cn-") {
        format!("https://sts.{region}.amazonaws.com.cn")
    } else {
        format!("https://sts.{region}.amazonaws.com")
    }
}

// === impl StsClient ===

impl StsClient {
    pub fn new(sdk_config: &aws_config::SdkConfig, config: StsConfig) -> Self {
        let mut builder = aws_sdk_sts::config::Builder::from(sdk_config);

        let endpoint = match config.vpc_endpoint {
            Some(endpoint) => Some(endpoint),
            None if config.regional => match sdk_config.region() {
                Some(region) => Some(regional_endpoint(region.as_ref())),
                None => {
                    tracing::warn!("No region configured; using the global STS endpoint");
                    None
                }
            },
            None => None,
        };
        if let Some(endpoint) = endpoint.clone() {
            builder = builder.endpoint_url(endpoint);
        }

        if let Some(timeout) = config.timeout {
            let timeout_config = TimeoutConfig::builder().operation_timeout(timeout).build();
            builder = builder.timeout_config(timeout_config);
        }

        Self {
            client: aws_sdk_sts::Client::from_conf(builder.build()),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

#[async_trait::async_trait]
impl AssumeRole for StsClient {
    async fn assume_role(&self, req: AssumeRoleRequest) -> Result<Credentials, AssumeRoleError> {
        let AssumeRoleRequest {
            role_arn,
            session_name,
            external_id,
            duration,
        } = req;

        let output = self
            .client
            .assume_role()
            .role_arn(&role_arn)
            .role_session_name(session_name)
            .set_external_id(external_id)
            .duration_seconds(i32::try_from(duration.as_secs()).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(classify)?;

        let creds = output
            .credentials()
            .ok_or_else(|| AssumeRoleError::Invalid("response did not include credentials".into()))?;
        let expiration = creds.expiration();
        let expiration = chrono::DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| AssumeRoleError::Invalid("credential expiration out of range".into()))?;

        tracing::debug!(role = %role_arn, %expiration, "Assumed role");
        Ok(Credentials::issued(
            creds.access_key_id(),
            creds.secret_access_key(),
            creds.session_token(),
            expiration,
            chrono::Utc::now(),
        ))
    }
}

fn classify<R>(error: SdkError<SdkAssumeRoleError, R>) -> AssumeRoleError
where
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&error).to_string();
    match &error {
        SdkError::TimeoutError(_) => AssumeRoleError::Timeout,
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            AssumeRoleError::Transport(message)
        }
        SdkError::ConstructionFailure(_) => AssumeRoleError::Invalid(message),
        _ => match error.code() {
            Some("Throttling" | "ThrottlingException" | "RequestLimitExceeded") => {
                AssumeRoleError::Throttled(message)
            }
            Some("IDPCommunicationError" | "InternalFailure" | "ServiceUnavailable") => {
                AssumeRoleError::Transport(message)
            }
            Some("AccessDenied" | "RegionDisabledException" | "ExpiredTokenException") => {
                AssumeRoleError::Denied(message)
            }
            _ => AssumeRoleError::Invalid(message),
        },
    }
}
