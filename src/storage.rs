use async_trait::async_trait;
use log::{error, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

/// Classification of a stored object: `Image` goes through image-oriented
/// delivery, `Raw` is byte passthrough (PDFs must never hit an image
/// transformation pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Image,
    Raw,
}

impl ResourceClass {
    pub fn classify(mime: &str) -> Self {
        if mime.starts_with("image/") {
            ResourceClass::Image
        } else {
            ResourceClass::Raw
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Image => "image",
            ResourceClass::Raw => "raw",
        }
    }
}

/// Canonical record of a stored object. The URL, MIME type and resource
/// class are decided exactly once, at save time; consumers never rewrite
/// the URL to "fix" downloads.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub url: String,
    pub original_filename: String,
    pub mime_type: String,
    pub resource_class: ResourceClass,
    pub size: usize,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn save(
        &self,
        original_filename: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, FileStoreError>;
    async fn load(&self, name: &str) -> Result<(Vec<u8>, String), FileStoreError>;
    async fn delete(&self, name: &str) -> Result<(), FileStoreError>;
}

/// File extension derived from the verified MIME type, never from the
/// client-supplied filename. This is what makes stored PDF URLs end in
/// `.pdf` without any read-time string surgery.
pub fn ext_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

fn mime_for_ext(ext: &str) -> &'static str {
    match ext {
        "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Strip characters that would break a quoted content-disposition value.
fn disposition_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect()
}

// ---------------- Local disk (dev fallback) ----------------

pub struct LocalDiskStore {
    dir: PathBuf,
    public_base: String,
}

impl LocalDiskStore {
    pub fn new(dir: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_base: public_base.into(),
        }
    }

    pub fn from_env() -> Self {
        let dir = std::env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".into());
        // empty base yields relative "/uploads/..." URLs served by this process
        let base = std::env::var("PUBLIC_BASE_URL").unwrap_or_default();
        Self::new(dir, base)
    }
}

#[async_trait]
impl FileStore for LocalDiskStore {
    async fn save(
        &self,
        original_filename: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, FileStoreError> {
        let name = format!("{}.{}", Uuid::new_v4(), ext_for_mime(mime));
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| FileStoreError::Other(e.to_string()))?;
        let path = self.dir.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| FileStoreError::Other(e.to_string()))?;
        info!("stored {} ({} bytes) at {}", original_filename, bytes.len(), path.display());
        Ok(StoredFile {
            url: format!("{}/uploads/{}", self.public_base, name),
            original_filename: original_filename.to_string(),
            mime_type: mime.to_string(),
            resource_class: ResourceClass::classify(mime),
            size: bytes.len(),
        })
    }

    async fn load(&self, name: &str) -> Result<(Vec<u8>, String), FileStoreError> {
        // reject anything that could escape the upload dir
        if name.contains('/') || name.contains("..") {
            return Err(FileStoreError::NotFound);
        }
        let path = self.dir.join(name);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| FileStoreError::NotFound)?;
        let ext = name.rsplit('.').next().unwrap_or_default();
        Ok((bytes, mime_for_ext(ext).to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), FileStoreError> {
        if name.contains('/') || name.contains("..") {
            return Err(FileStoreError::NotFound);
        }
        // best-effort: missing file counts as deleted
        let _ = tokio::fs::remove_file(self.dir.join(name)).await;
        Ok(())
    }
}

// ---------------- S3 / MinIO object storage ----------------

pub struct S3FileStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    prefix: String,
    public_base: String,
}

impl S3FileStore {
    pub async fn new() -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "campus-files".into());
        let endpoint = std::env::var("S3_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();
        let public_base = std::env::var("S3_PUBLIC_URL")
            .unwrap_or_else(|_| format!("{}/{}", endpoint.trim_end_matches('/'), bucket));

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region));
        loader = loader.endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // Path-style addressing is required for most MinIO/local endpoints.
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("initialized S3/MinIO client (path-style addressing)");

        // Ensure bucket exists (create if missing)
        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}' (will attempt create): {e:?}");
            let mut attempt = 0u32;
            let max_attempts = 8;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{bucket}' (attempt {attempt})");
                        break;
                    }
                    Err(e2) => {
                        if attempt >= max_attempts {
                            error!("create_bucket failed for '{bucket}' after {attempt} attempts: {e2:?}");
                            return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"));
                        }
                        let backoff_ms = 200 * attempt.pow(2);
                        warn!("create_bucket attempt {attempt} failed for '{bucket}': {e2:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms as u64))
                            .await;
                    }
                }
            }
        }

        Ok(Self {
            bucket,
            client,
            prefix: "campus".into(),
            public_base,
        })
    }

    fn key_for(&self, class: ResourceClass, name: &str) -> String {
        format!("{}/{}/{}", self.prefix, class.as_str(), name)
    }
}

#[async_trait]
impl FileStore for S3FileStore {
    async fn save(
        &self,
        original_filename: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, FileStoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        let class = ResourceClass::classify(mime);
        let name = format!("{}.{}", Uuid::new_v4(), ext_for_mime(mime));
        let key = self.key_for(class, &name);

        let mut put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(mime);
        if class == ResourceClass::Raw {
            // force a download with the user's original filename
            put = put.content_disposition(format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                disposition_filename(original_filename),
                urlencoding::encode(original_filename)
            ));
        }
        if let Err(e) = put.send().await {
            error!(
                "put_object failed key={key} bucket={} err={:?}",
                self.bucket, e
            );
            let hint = if e.to_string().contains("AccessDenied") {
                " (check S3_ACCESS_KEY/S3_SECRET_KEY permissions)"
            } else {
                ""
            };
            return Err(FileStoreError::Other(format!("{e}{hint}")));
        }

        Ok(StoredFile {
            url: format!("{}/{}", self.public_base, key),
            original_filename: original_filename.to_string(),
            mime_type: mime.to_string(),
            resource_class: class,
            size: bytes.len(),
        })
    }

    async fn load(&self, name: &str) -> Result<(Vec<u8>, String), FileStoreError> {
        // try both class prefixes; the name alone does not encode the class
        for class in [ResourceClass::Image, ResourceClass::Raw] {
            let key = self.key_for(class, name);
            if let Ok(obj) = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                let data = obj
                    .body
                    .collect()
                    .await
                    .map_err(|e| FileStoreError::Other(e.to_string()))?;
                let bytes = Vec::from(data.into_bytes().as_ref());
                let mime = infer::get(&bytes)
                    .map(|t| t.mime_type().to_string())
                    .unwrap_or_else(|| "application/octet-stream".into());
                return Ok((bytes, mime));
            }
        }
        Err(FileStoreError::NotFound)
    }

    async fn delete(&self, name: &str) -> Result<(), FileStoreError> {
        for class in [ResourceClass::Image, ResourceClass::Raw] {
            let key = self.key_for(class, name);
            let _ = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await;
        }
        Ok(())
    }
}

/// Pick the backend once at startup: S3 when an endpoint is configured,
/// local disk otherwise. Handlers only ever see `dyn FileStore`.
pub async fn build_file_store() -> anyhow::Result<Arc<dyn FileStore>> {
    if std::env::var("S3_ENDPOINT").is_ok() {
        let store = S3FileStore::new().await?;
        Ok(Arc::new(store))
    } else {
        info!("no S3_ENDPOINT configured; storing uploads on local disk");
        Ok(Arc::new(LocalDiskStore::from_env()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_is_raw_and_images_are_images() {
        assert_eq!(ResourceClass::classify("application/pdf"), ResourceClass::Raw);
        assert_eq!(ResourceClass::classify("image/png"), ResourceClass::Image);
        assert_eq!(ResourceClass::classify("image/webp"), ResourceClass::Image);
    }

    #[test]
    fn extension_follows_mime_not_filename() {
        assert_eq!(ext_for_mime("application/pdf"), "pdf");
        assert_eq!(ext_for_mime("image/jpeg"), "jpg");
        assert_eq!(ext_for_mime("text/plain"), "bin");
    }

    #[test]
    fn disposition_filename_is_quotable() {
        assert_eq!(disposition_filename("notes \"v2\".pdf"), "notes v2.pdf");
    }

    #[tokio::test]
    async fn local_store_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(tmp.path(), "");
        let stored = store
            .save("syllabus.pdf", "application/pdf", b"%PDF-1.4 fake")
            .await
            .unwrap();
        assert!(stored.url.starts_with("/uploads/"));
        assert!(stored.url.ends_with(".pdf"));
        assert_eq!(stored.resource_class, ResourceClass::Raw);
        assert_eq!(stored.original_filename, "syllabus.pdf");

        let name = stored.url.rsplit('/').next().unwrap();
        let (bytes, mime) = store.load(name).await.unwrap();
        assert_eq!(bytes, b"%PDF-1.4 fake");
        assert_eq!(mime, "application/pdf");

        store.delete(name).await.unwrap();
        assert!(store.load(name).await.is_err());
    }

    #[tokio::test]
    async fn local_store_rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(tmp.path(), "");
        assert!(store.load("../etc/passwd").await.is_err());
    }
}
