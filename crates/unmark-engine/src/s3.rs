//! S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO).

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{MetadataDirective, ObjectCannedAcl};
use aws_sdk_s3::Client;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use unmark_core::capability::ObjectStorage;
use unmark_core::error::StorageError;

/// Metadata key carrying the RFC 3339 expiry instant.
pub const EXPIRES_META: &str = "expires";

#[derive(Clone, Default)]
pub struct S3Config {
    /// Custom endpoint (`https://nyc3.digitaloceanspaces.com`); `None` for AWS.
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    /// Overrides the derived public URL base, e.g. a CDN host.
    pub public_base: Option<String>,
    /// Folder prepended to every key.
    pub prefix: String,
    /// Upload objects with the `public-read` canned ACL.
    pub public_read: bool,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("public_base", &self.public_base)
            .field("prefix", &self.prefix)
            .field("public_read", &self.public_read)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
    public_base: String,
    public_read: bool,
}

impl S3Storage {
    pub fn new(cfg: S3Config) -> Self {
        let credentials =
            Credentials::new(&cfg.access_key, &cfg.secret_key, None, None, "unmark-env");
        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(cfg.region.clone()))
            .behavior_version_latest();
        if let Some(endpoint) = &cfg.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            public_base: public_base(&cfg),
            prefix: normalize_prefix(&cfg.prefix),
            bucket: cfg.bucket,
            public_read: cfg.public_read,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.trim_start_matches('/'))
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, self.full_key(key))
    }

    /// Delete every object under the prefix whose expiry metadata is in the
    /// past. Returns the deleted keys; per-object failures are logged.
    pub async fn purge_expired(&self) -> Result<Vec<String>, StorageError> {
        let now = Utc::now();
        let mut deleted = Vec::new();
        let mut token = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(token)
                .send()
                .await
                .map_err(|e| backend("list", &self.prefix, e))?;

            for key in page.contents().iter().filter_map(|o| o.key()) {
                let head = match self.client.head_object().bucket(&self.bucket).key(key).send().await {
                    Ok(head) => head,
                    Err(e) => {
                        warn!(key, error = %DisplayErrorContext(&e), "could not read object metadata");
                        continue;
                    }
                };
                let Some(expires) = head.metadata().and_then(|m| m.get(EXPIRES_META)) else {
                    continue;
                };
                match is_expired(expires, now) {
                    Some(true) => {
                        match self.client.delete_object().bucket(&self.bucket).key(key).send().await {
                            Ok(_) => {
                                info!(key, expires = %expires, "expired object deleted");
                                deleted.push(key.to_owned());
                            }
                            Err(e) => warn!(key, error = %DisplayErrorContext(&e), "could not delete expired object"),
                        }
                    }
                    Some(false) => {}
                    None => warn!(key, expires = %expires, "unparseable expiry metadata"),
                }
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated() == Some(true) => token = Some(next.to_owned()),
                _ => break,
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn upload(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        let full_key = self.full_key(key);
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| backend("upload", &full_key, e))?;

        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type("video/mp4")
            .body(body);
        if self.public_read {
            req = req.acl(ObjectCannedAcl::PublicRead);
        }
        req.send()
            .await
            .map_err(|e| backend("upload", &full_key, DisplayErrorContext(e)))?;

        debug!(key = %full_key, "object uploaded");
        Ok(self.public_url(key))
    }

    async fn download(&self, key: &str, local: &Path) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound(full_key.clone())
                } else {
                    backend("download", &full_key, DisplayErrorContext(e))
                }
            })?;

        let mut body = resp.body;
        let mut file = tokio::fs::File::create(local).await?;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| backend("download", &full_key, e))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(key = %full_key, "object downloaded");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| backend("delete", &full_key, DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let full_key = self.full_key(key);
        match self.client.head_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(backend("exists", &full_key, DisplayErrorContext(e))),
        }
    }

    /// Copy the object onto itself with an `expires` metadata entry, keeping
    /// the metadata it already had.
    async fn mark_for_expiration(&self, key: &str, days: u32) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        let mut metadata: HashMap<String, String> = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(head) => head.metadata().cloned().unwrap_or_default(),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                return Err(StorageError::NotFound(full_key));
            }
            Err(e) => return Err(backend("head", &full_key, DisplayErrorContext(e))),
        };
        let expires = expiry_after(Utc::now(), days);
        metadata.insert(EXPIRES_META.to_owned(), expires.clone());

        let mut req = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, full_key))
            .key(&full_key)
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(metadata));
        if self.public_read {
            req = req.acl(ObjectCannedAcl::PublicRead);
        }
        req.send()
            .await
            .map_err(|e| backend("copy", &full_key, DisplayErrorContext(e)))?;

        info!(key = %full_key, days, expires = %expires, "object marked for expiration");
        Ok(())
    }

    async fn check(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| backend("head_bucket", &self.bucket, DisplayErrorContext(e)))?;
        Ok(())
    }
}

fn backend(op: &'static str, key: &str, err: impl fmt::Display) -> StorageError {
    StorageError::Backend {
        op,
        key: key.to_owned(),
        message: err.to_string(),
    }
}

/// `"unmark"`, `"/unmark/"` → `"unmark/"`; empty stays empty.
fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Explicit base, else virtual-host style on the custom endpoint, else AWS.
fn public_base(cfg: &S3Config) -> String {
    if let Some(base) = cfg.public_base.as_deref().filter(|b| !b.trim().is_empty()) {
        return base.trim_end_matches('/').to_owned();
    }
    match cfg.endpoint.as_deref() {
        Some(endpoint) => {
            let host = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/');
            format!("https://{}.{host}", cfg.bucket)
        }
        None => format!("https://{}.s3.{}.amazonaws.com", cfg.bucket, cfg.region),
    }
}

fn expiry_after(now: DateTime<Utc>, days: u32) -> String {
    (now + Duration::days(i64::from(days))).to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn is_expired(raw: &str, now: DateTime<Utc>) -> Option<bool> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc) < now)
}
