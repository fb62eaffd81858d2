use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;

use super::{
    collapse_to_directories, collect_stream, join_key, with_retries, ByteStream,
    CredentialsProvider, MetadataStream, StorageProvider,
};
use crate::config::ProviderSchema;
use crate::models::{ByteRange, ObjectMetadata};
use crate::{Error, Result};

const DEFAULT_PAGE_SIZE: u32 = 1_000;
const DEFAULT_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// NVIDIA AIStore provider, speaking the native REST API. `base_path` is
/// `bucket` or `bucket/prefix`; authentication is a bearer token drawn from
/// the credentials provider on demand.
pub struct AisStorageProvider {
    client: reqwest::Client,
    endpoint: String,
    base_path: String,
    bucket: String,
    prefix: String,
    backend_provider: String,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    attempts: u32,
}

impl std::fmt::Debug for AisStorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AisStorageProvider")
            .field("endpoint", &self.endpoint)
            .field("base_path", &self.base_path)
            .field("credentials", &"<opaque>")
            .finish()
    }
}

impl AisStorageProvider {
    pub(crate) fn from_options(
        schema: &ProviderSchema,
        credentials: Option<Arc<dyn CredentialsProvider>>,
    ) -> Result<Self> {
        let endpoint = schema
            .option_str("endpoint")
            .ok_or_else(|| Error::invalid("ais provider requires an endpoint option"))?
            .trim_end_matches('/')
            .to_string();
        let base_path = schema
            .option_str("base_path")
            .ok_or_else(|| Error::invalid("ais provider requires a base_path option"))?
            .trim_matches('/')
            .to_string();
        let (bucket, prefix) = match base_path.split_once('/') {
            Some((bucket, prefix)) => (bucket.to_string(), prefix.to_string()),
            None => (base_path.clone(), String::new()),
        };
        if bucket.is_empty() {
            return Err(Error::invalid("ais base_path has no bucket"));
        }

        let request_timeout =
            Duration::from_millis(schema.option_u64("request_timeout_millis").unwrap_or(120_000));
        let connect_timeout =
            Duration::from_millis(schema.option_u64("connect_timeout_millis").unwrap_or(30_000));
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(AisStorageProvider {
            client,
            endpoint,
            base_path,
            bucket,
            prefix,
            backend_provider: schema
                .option_str("provider")
                .unwrap_or("ais")
                .to_string(),
            credentials,
            attempts: schema
                .option_u64("retries")
                .map(|n| n as u32)
                .unwrap_or(DEFAULT_ATTEMPTS),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/v1/objects/{}/{}",
            self.endpoint,
            crate::percent_encode(&self.bucket),
            crate::percent_encode_noslash(&join_key(&self.prefix, key))
        )
    }

    fn bucket_url(&self) -> String {
        format!(
            "{}/v1/buckets/{}",
            self.endpoint,
            crate::percent_encode(&self.bucket)
        )
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(provider) = &self.credentials {
            let credentials = provider.get().await?;
            if let Some(token) = credentials.session_token {
                headers.insert(
                    AUTHORIZATION,
                    format!("Bearer {}", token)
                        .parse()
                        .map_err(|_| Error::invalid("bearer token is not a valid header value"))?,
                );
            }
        }
        Ok(headers)
    }

    async fn check(
        operation: &'static str,
        key: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => Error::not_found(operation, key),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Error::unauthorized(operation, key, detail)
            }
            StatusCode::CONFLICT => Error::conflict(operation, key, detail),
            status
                if status == StatusCode::REQUEST_TIMEOUT
                    || status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error() =>
            {
                Error::unavailable(operation, key, format!("{}: {}", status, detail))
            }
            status => Error::Other(format!("{} {:?}: {}: {}", operation, key, status, detail)),
        })
    }
}

#[derive(serde::Serialize)]
struct ListMessage<'a> {
    action: &'a str,
    value: ListParams<'a>,
}

#[derive(serde::Serialize)]
struct ListParams<'a> {
    prefix: &'a str,
    #[serde(rename = "pagesize")]
    page_size: u32,
    #[serde(rename = "continuation_token", skip_serializing_if = "is_empty_token")]
    token: &'a str,
}

fn is_empty_token(token: &&str) -> bool {
    token.is_empty()
}

#[derive(serde::Deserialize)]
struct BucketList {
    #[serde(default)]
    entries: Vec<BucketEntry>,
    #[serde(default)]
    continuation_token: String,
}

#[derive(serde::Deserialize)]
struct BucketEntry {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    atime: String,
    #[serde(default)]
    checksum: String,
}

#[async_trait]
impl StorageProvider for AisStorageProvider {
    fn name(&self) -> &'static str {
        "ais"
    }

    fn base_path(&self) -> &str {
        &self.base_path
    }

    async fn put(&self, key: &str, body: ByteStream, size: Option<u64>) -> Result<()> {
        // Buffer the body so every retry replays identical bytes.
        let data = collect_stream(body).await?;
        if let Some(size) = size {
            if data.len() as u64 != size {
                return Err(Error::invalid(format!(
                    "put {:?}: body is {} bytes, expected {}",
                    key,
                    data.len(),
                    size
                )));
            }
        }
        let url = self.object_url(key);
        with_retries(self.attempts, RETRY_BASE_DELAY, || {
            let data = data.clone();
            let url = url.clone();
            async move {
                let mut headers = self.headers().await?;
                headers.insert(
                    CONTENT_LENGTH,
                    data.len().to_string().parse().map_err(|_| {
                        Error::invalid("content length is not a valid header value")
                    })?,
                );
                let response = self
                    .client
                    .put(&url)
                    .query(&[("provider", self.backend_provider.as_str())])
                    .headers(headers)
                    .body(data)
                    .send()
                    .await?;
                Self::check("put", key, response).await?;
                Ok(())
            }
        })
        .await
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<ByteStream> {
        let url = self.object_url(key);
        let response = with_retries(self.attempts, RETRY_BASE_DELAY, || {
            let url = url.clone();
            async move {
                let mut headers = self.headers().await?;
                if let Some(range) = range {
                    headers.insert(
                        RANGE,
                        range.to_http_header().parse().map_err(|_| {
                            Error::invalid("byte range is not a valid header value")
                        })?,
                    );
                }
                let response = self
                    .client
                    .get(&url)
                    .query(&[("provider", self.backend_provider.as_str())])
                    .headers(headers)
                    .send()
                    .await?;
                Self::check("get", key, response).await
            }
        })
        .await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(key);
        with_retries(self.attempts, RETRY_BASE_DELAY, || {
            let url = url.clone();
            async move {
                let headers = self.headers().await?;
                let response = self
                    .client
                    .delete(&url)
                    .query(&[("provider", self.backend_provider.as_str())])
                    .headers(headers)
                    .send()
                    .await?;
                Self::check("delete", key, response).await?;
                Ok(())
            }
        })
        .await
    }

    async fn head(&self, key: &str) -> Result<ObjectMetadata> {
        let url = self.object_url(key);
        let response = with_retries(self.attempts, RETRY_BASE_DELAY, || {
            let url = url.clone();
            async move {
                let headers = self.headers().await?;
                let response = self
                    .client
                    .head(&url)
                    .query(&[("provider", self.backend_provider.as_str())])
                    .headers(headers)
                    .send()
                    .await?;
                Self::check("head", key, response).await
            }
        })
        .await?;

        let headers = response.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_modified = headers
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                time::OffsetDateTime::parse(v, &time::format_description::well_known::Rfc2822).ok()
            })
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
        let etag = headers
            .get(reqwest::header::ETAG)
            .or_else(|| headers.get("ais-checksum-value"))
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        let mut metadata = ObjectMetadata::file(key, content_length, last_modified);
        metadata.etag = etag;
        Ok(metadata)
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        // The cluster offers no single-object server-side copy; stream
        // through the client instead.
        let body = self.get(src_key, None).await?;
        self.put(dst_key, body, None).await
    }

    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        start_after: Option<String>,
    ) -> Result<MetadataStream> {
        let full_prefix = join_key(&self.prefix, prefix);
        let strip = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };

        let mut entries: Vec<ObjectMetadata> = Vec::new();
        let mut token = String::new();
        loop {
            let url = self.bucket_url();
            let page: BucketList = {
                let message = ListMessage {
                    action: "list",
                    value: ListParams {
                        prefix: &full_prefix,
                        page_size: DEFAULT_PAGE_SIZE,
                        token: &token,
                    },
                };
                with_retries(self.attempts, RETRY_BASE_DELAY, || {
                    let url = url.clone();
                    let message = &message;
                    let full_prefix = full_prefix.clone();
                    async move {
                        let headers = self.headers().await?;
                        let response = self
                            .client
                            .post(&url)
                            .query(&[("provider", self.backend_provider.as_str())])
                            .headers(headers)
                            .json(message)
                            .send()
                            .await?;
                        let response = Self::check("list", &full_prefix, response).await?;
                        Ok(response.json::<BucketList>().await?)
                    }
                })
                .await?
            };

            for entry in page.entries {
                let key = entry
                    .name
                    .strip_prefix(strip.as_str())
                    .unwrap_or(&entry.name)
                    .to_string();
                if let Some(after) = &start_after {
                    if key.as_str() <= after.as_str() {
                        continue;
                    }
                }
                let last_modified = time::OffsetDateTime::parse(
                    &entry.atime,
                    &time::format_description::well_known::Rfc3339,
                )
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
                let mut metadata = ObjectMetadata::file(key, entry.size, last_modified);
                if !entry.checksum.is_empty() {
                    metadata.etag = Some(entry.checksum);
                }
                entries.push(metadata);
            }
            if page.continuation_token.is_empty() {
                break;
            }
            token = page.continuation_token;
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        if !recursive {
            entries = collapse_to_directories(entries, prefix);
        }
        Ok(futures_util::stream::iter(entries.into_iter().map(Ok)).boxed())
    }
}
