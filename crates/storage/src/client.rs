//! Object store client and bucket lookup.

use std::fmt;

use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{
    BehaviorVersion, Region, RequestChecksumCalculation, ResponseChecksumValidation,
};
use tracing::debug;

use crate::bucket::Bucket;
use crate::error::BackendError;
use crate::{CONNECT_TIMEOUT, DEFAULT_REGION};

/// Provider name reported for static credentials.
const CREDENTIALS_PROVIDER: &str = "objput";

/// Access key pair used to sign requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub access_key_secret: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, access_key_secret: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .finish()
    }
}

/// Scheme and host (with port if non-default) of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub scheme: String,
    pub host: String,
}

impl Endpoint {
    /// Parses `endpoint`, defaulting to `https` when no scheme is given.
    pub fn parse(endpoint: &str) -> Result<Self, BackendError> {
        let trimmed = endpoint.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(BackendError::InvalidEndpoint("empty endpoint".into()));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        let url = url::Url::parse(&with_scheme)
            .map_err(|e| BackendError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(BackendError::InvalidEndpoint(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if url.path() != "/" || url.query().is_some() {
            return Err(BackendError::InvalidEndpoint(format!(
                "endpoint must not carry a path or query: {endpoint}"
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| BackendError::InvalidEndpoint(format!("missing host: {endpoint}")))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

/// Client for an S3-compatible object store.
pub struct Client {
    endpoint: Endpoint,
    credentials: Credentials,
    region: String,
    path_style: bool,
}

impl Client {
    /// Creates a client for `endpoint` (e.g. `oss-cn-hangzhou.aliyuncs.com`
    /// or `http://localhost:9000`).
    ///
    /// Fails with [`BackendError::Auth`] when either half of the key pair is
    /// empty.
    pub fn new(endpoint: &str, credentials: Credentials) -> Result<Self, BackendError> {
        if credentials.access_key_id.is_empty() {
            return Err(BackendError::Auth("access key id is empty".into()));
        }
        if credentials.access_key_secret.is_empty() {
            return Err(BackendError::Auth("access key secret is empty".into()));
        }

        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
            credentials,
            region: DEFAULT_REGION.to_string(),
            path_style: false,
        })
    }

    /// Sets the signing region (default `us-east-1`).
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Addresses buckets as `endpoint/bucket/key` instead of
    /// `bucket.endpoint/key`. Needed by stores without virtual-host support.
    pub fn with_path_style(mut self, path_style: bool) -> Self {
        self.path_style = path_style;
        self
    }

    /// Looks up a bucket, failing with [`BackendError::BucketNotFound`] if it
    /// does not exist.
    pub async fn bucket(&self, name: &str) -> Result<Bucket, BackendError> {
        let bucket = self.bucket_unchecked(name)?;
        match bucket.head().await {
            Ok(()) => {
                debug!(bucket = %name, endpoint = %self.endpoint, "bucket found");
                Ok(bucket)
            }
            Err(BackendError::Api { status: 404, .. }) => {
                Err(BackendError::BucketNotFound(name.to_string()))
            }
            Err(BackendError::Api {
                status: 401 | 403, ..
            }) => Err(BackendError::Auth(format!("access to bucket {name} denied"))),
            Err(e) => Err(e),
        }
    }

    /// Returns a bucket handle without checking that it exists.
    pub fn bucket_unchecked(&self, name: &str) -> Result<Bucket, BackendError> {
        if name.is_empty() || name.contains('/') {
            return Err(BackendError::BucketNotFound(format!(
                "invalid bucket name {name:?}"
            )));
        }
        Ok(Bucket::new(
            aws_sdk_s3::Client::from_conf(self.sdk_config()),
            name.to_string(),
        ))
    }

    /// SDK configuration with static credentials. SDK retries are off and
    /// checksums are only sent where an operation requires them.
    fn sdk_config(&self) -> aws_sdk_s3::Config {
        let credentials = aws_sdk_s3::config::Credentials::new(
            &self.credentials.access_key_id,
            &self.credentials.access_key_secret,
            None,
            None,
            CREDENTIALS_PROVIDER,
        );
        aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .endpoint_url(self.endpoint.to_string())
            .force_path_style(self.path_style)
            .credentials_provider(credentials)
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .build(),
            )
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .build()
    }
}
