// src/storage.rs
//
// Object storage for input and generated images (S3-compatible).

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StorageError;

pub const ALLOWED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp", "image/gif"];
pub const MAX_OBJECT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StoragePolicy {
    pub allowed_content_types: Vec<String>,
    pub max_object_bytes: usize,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            allowed_content_types: ALLOWED_IMAGE_TYPES.iter().map(|s| s.to_string()).collect(),
            max_object_bytes: MAX_OBJECT_BYTES,
        }
    }
}

impl StoragePolicy {
    pub fn check(&self, content_type: &str, size: usize) -> Result<(), StorageError> {
        if !self
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(content_type))
        {
            return Err(StorageError::UnsupportedContentType(content_type.to_string()));
        }
        if size > self.max_object_bytes {
            return Err(StorageError::TooLarge {
                size,
                limit: self.max_object_bytes,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Buckets {
    pub input: String,
    pub output: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Creates the bucket when it does not exist yet. Safe to call repeatedly.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    async fn put(
        &self,
        bucket: &str,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError>;

    /// Inverse of `public_url`; `None` when the URL does not point into `bucket`.
    fn path_from_public_url(&self, bucket: &str, url: &str) -> Option<String>;
}

pub async fn provision_buckets(store: &dyn ObjectStore, buckets: &Buckets) -> Result<(), StorageError> {
    for bucket in [&buckets.input, &buckets.output] {
        store.ensure_bucket(bucket).await?;
        log::info!("bucket ready bucket={}", bucket);
    }
    Ok(())
}

/// `<prefix>/<utc timestamp>-<uuid>.<ext>`
pub fn object_path(prefix: &str, content_type: &str) -> String {
    format!(
        "{}/{}-{}.{}",
        prefix,
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        Uuid::new_v4(),
        extension_for(content_type)
    )
}

pub fn extension_for(content_type: &str) -> &str {
    match content_type.split('/').nth(1).map(|s| s.split(';').next().unwrap_or(s).trim()) {
        Some("jpeg") => "jpg",
        Some(ext) if !ext.is_empty() => ext,
        _ => "png",
    }
}

// Helpers for working with public S3-compatible URLs.
pub fn build_public_url(base: &str, bucket: &str, key: &str) -> String {
    let trimmed = base.trim_end_matches('/');

    // Simple templating: https://host/{bucket}/{key} or https://{bucket}.host/{key}
    if trimmed.contains("{bucket}") || trimmed.contains("{key}") {
        return trimmed.replace("{bucket}", bucket).replace("{key}", key);
    }

    if trimmed.contains(bucket) {
        format!("{}/{}", trimmed, key)
    } else {
        format!("{}/{}/{}", trimmed, bucket, key)
    }
}

pub fn resolve_path_from_public_url(base: &str, bucket: &str, url: &str) -> Option<String> {
    let prefix = build_public_url(base, bucket, "");
    if let Some(path) = url.strip_prefix(prefix.as_str()) {
        let path = path.trim_start_matches('/');
        return (!path.is_empty()).then(|| path.to_string());
    }

    // Fall back to locating the bucket segment, e.g. after a CDN host change.
    let parsed = reqwest::Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    let idx = segments.iter().position(|s| *s == bucket)?;
    let path = segments[idx + 1..].join("/");
    (!path.is_empty()).then_some(path)
}

pub struct S3ObjectStore {
    client: S3Client,
    public_base_url: String,
    policy: StoragePolicy,
}

impl S3ObjectStore {
    pub fn new(client: S3Client, public_base_url: String, policy: StoragePolicy) -> Self {
        Self {
            client,
            public_base_url,
            policy,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let missing = e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false);
                if !missing {
                    return Err(StorageError::Backend(format!("head bucket {bucket}: {e}")));
                }
            }
        }

        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                log::info!("bucket created bucket={}", bucket);
                Ok(())
            }
            Err(e) => {
                let already = e
                    .as_service_error()
                    .map(|se| se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists())
                    .unwrap_or(false);
                if already {
                    Ok(())
                } else {
                    Err(StorageError::Backend(format!("create bucket {bucket}: {e}")))
                }
            }
        }
    }

    async fn put(
        &self,
        bucket: &str,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.policy.check(content_type, data.len())?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(path)
            .content_type(content_type)
            .cache_control("max-age=3600")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("put {bucket}/{path}: {e}")))?;

        Ok(path.to_string())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        build_public_url(&self.public_base_url, bucket, path)
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("delete {bucket}/{path}: {e}")))?;
        Ok(())
    }

    fn path_from_public_url(&self, bucket: &str, url: &str) -> Option<String> {
        resolve_path_from_public_url(&self.public_base_url, bucket, url)
    }
}
