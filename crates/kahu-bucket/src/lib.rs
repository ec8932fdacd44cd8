//! Abstractions over S3-compatible storage backends holding extract deliveries.
//!
//! The ingestion engine only ever enumerates, inspects, and streams objects;
//! it never writes back to the store. `BucketStore` is the seam the engine
//! depends on, with an S3 implementation for production and an in-memory
//! implementation for tests.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

mod memory;

pub use memory::MemoryBucketStore;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    pub retry_attempts: u32,
    pub timeout: Option<Duration>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "kahu-extracts".to_string(),
            region: "ap-southeast-2".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            retry_attempts: 3,
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Metadata for one remote object as observed at listing/head time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    pub version_id: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("sdk error: {0}")]
    Sdk(String),
}

impl BucketError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BucketError::Transient(_))
    }

    fn from_sdk(err: impl fmt::Display) -> Self {
        Self::Sdk(err.to_string())
    }

    fn classify<E>(key: &str, err: SdkError<E, aws_sdk_s3::config::http::HttpResponse>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                BucketError::Transient(format!("{key}: request failed to complete"))
            }
            SdkError::ResponseError(_) => {
                BucketError::Transient(format!("{key}: malformed response"))
            }
            SdkError::ServiceError(service_err) => {
                let status = service_err.raw().status().as_u16();
                let message = service_err.err().to_string();
                match status {
                    404 => BucketError::NotFound(key.to_string()),
                    403 => BucketError::AccessDenied(key.to_string()),
                    429 | 500..=599 => BucketError::Transient(format!("{key}: {message}")),
                    _ if message.contains("NoSuchKey") => BucketError::NotFound(key.to_string()),
                    _ => BucketError::Sdk(format!("{key}: {message}")),
                }
            }
            other => BucketError::from_sdk(other),
        }
    }
}

/// Ordered chunks of object bytes. Callers re-open the stream on partial read.
pub type ObjectByteStream = BoxStream<'static, Result<Bytes, BucketError>>;

#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Enumerate every object under `prefix`, paginating transparently.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError>;

    async fn head(&self, key: &str) -> Result<ObjectMeta, BucketError>;

    async fn exists(&self, key: &str) -> Result<bool, BucketError> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(BucketError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn open_stream(&self, key: &str) -> Result<ObjectByteStream, BucketError>;
}

/// Retry a storage operation with exponential backoff on transient failures.
pub async fn with_retries<T, Fut, F>(
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, BucketError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BucketError>>,
{
    let attempts = attempts.max(1);
    let mut delay = base_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Clone)]
pub struct S3BucketStore {
    client: Client,
    bucket: String,
    timeout: Option<Duration>,
}

impl S3BucketStore {
    pub async fn new(config: S3Config) -> Result<Self, BucketError> {
        if config.bucket.is_empty() {
            return Err(BucketError::Configuration(
                "bucket name cannot be empty".into(),
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        let shared_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());
        Ok(Self {
            client,
            bucket: config.bucket,
            timeout: config.timeout,
        })
    }

    async fn bounded<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T, BucketError>
    where
        Fut: Future<Output = Result<T, BucketError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| BucketError::Transient(format!("{operation} timed out")))?,
            None => fut.await,
        }
    }
}

fn aws_datetime_to_utc(value: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|dt| Utc.timestamp_opt(dt.secs(), dt.subsec_nanos()).single())
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_default())
}

#[async_trait]
impl BucketStore for S3BucketStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
        let mut metas = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.clone());

            let output = self
                .bounded("list", async {
                    request
                        .send()
                        .await
                        .map_err(|err| BucketError::classify(prefix, err))
                })
                .await?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                metas.push(ObjectMeta {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0),
                    last_modified: aws_datetime_to_utc(object.last_modified()),
                    etag: object.e_tag().unwrap_or_default().trim_matches('"').to_string(),
                    version_id: None,
                    checksum: None,
                });
            }

            continuation = output
                .next_continuation_token()
                .map(|token| token.to_string());
            if continuation.is_none() {
                break;
            }
        }

        Ok(metas)
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta, BucketError> {
        let request = self.client.head_object().bucket(&self.bucket).key(key);
        let output = self
            .bounded("head", async {
                request
                    .send()
                    .await
                    .map_err(|err| BucketError::classify(key, err))
            })
            .await?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size: output.content_length().unwrap_or(0),
            last_modified: aws_datetime_to_utc(output.last_modified()),
            etag: output.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            version_id: output.version_id().map(|id| id.to_string()),
            checksum: output.checksum_sha256().map(|sum| sum.to_string()),
        })
    }

    async fn open_stream(&self, key: &str) -> Result<ObjectByteStream, BucketError> {
        let request = self.client.get_object().bucket(&self.bucket).key(key);
        let output = self
            .bounded("get", async {
                request
                    .send()
                    .await
                    .map_err(|err| BucketError::classify(key, err))
            })
            .await?;

        let stream = futures::stream::unfold(output.body, |mut body| async move {
            match body.try_next().await {
                Ok(Some(bytes)) => Some((Ok(bytes), body)),
                Ok(None) => None,
                Err(err) => Some((Err(BucketError::from_sdk(err)), body)),
            }
        });

        Ok(Box::pin(stream))
    }
}
