//! Object storage abstraction.
//!
//! Provides a single interface over S3, GCS and the local filesystem. All
//! paths handed to a `StorageProvider` are relative to the key prefix of
//! the URL it was built from.

mod gcs;
mod local;
mod prefix;
mod s3;
mod url_parser;

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use prefix::date_path;
pub use s3::S3Config;
pub use url_parser::BackendConfig;

use bytes::Bytes;
use object_store::path::Path;
use object_store::{Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

pub const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over different object storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// The underlying store, for writers that stream directly into it.
    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    /// Human-readable location of `path`, e.g. `s3://bucket/orders/2024/01/05.parquet`.
    pub fn uri_for(&self, path: &Path) -> String {
        // canonical_url already ends with the key prefix
        format!("{}/{}", self.canonical_url, path)
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Object attributes carrying `content_type`.
    ///
    /// The local filesystem rejects attributes, so they are empty there.
    pub fn content_attributes(&self, content_type: &'static str) -> Attributes {
        if matches!(self.config, BackendConfig::Local(_)) {
            return Attributes::new();
        }
        Attributes::from_iter([(Attribute::ContentType, AttributeValue::from(content_type))])
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = match self.object_store.get(&self.qualify_path(path)).await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: RequestStatus::from_result(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)
    }

    /// Put a JSON document, replacing any existing object at `path`.
    pub async fn put_json(&self, path: &Path, body: Vec<u8>) -> Result<(), StorageError> {
        let opts = PutOptions {
            attributes: self.content_attributes(JSON_CONTENT_TYPE),
            ..Default::default()
        };
        self.put_payload_with_opts(path, PutPayload::from(Bytes::from(body)), opts)
            .await
    }

    async fn put_payload_with_opts(
        &self,
        path: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, opts).await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: RequestStatus::from_result(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_put_get_overwrite() {
        let dir = TempDir::new().unwrap();
        let storage =
            StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap();

        let path = Path::from("etl.json");
        storage.put_json(&path, b"{\"a\":1}".to_vec()).await.unwrap();
        storage.put_json(&path, b"{\"a\":2}".to_vec()).await.unwrap();

        let bytes = storage.get(&path).await.unwrap();
        assert_eq!(&bytes[..], b"{\"a\":2}");
        assert!(dir.path().join("etl.json").exists());
    }

    #[tokio::test]
    async fn test_local_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage =
            StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap();

        let err = storage.get(&Path::from("missing.json")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_local_has_no_attributes() {
        let dir = TempDir::new().unwrap();
        let storage =
            StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap();

        assert!(storage.content_attributes(PARQUET_CONTENT_TYPE).is_empty());
    }

    #[tokio::test]
    async fn test_qualify_path_with_prefix() {
        let storage =
            StorageProvider::for_url_with_options("s3://bucket/exports", HashMap::new())
                .await
                .unwrap();

        let path = Path::from("orders/2024/01/05.parquet");
        assert_eq!(
            storage.qualify_path(&path).as_ref(),
            &Path::from("exports/orders/2024/01/05.parquet")
        );
        assert_eq!(
            storage.uri_for(&path),
            "s3://bucket/exports/orders/2024/01/05.parquet"
        );
        assert!(!storage.content_attributes(JSON_CONTENT_TYPE).is_empty());
    }
}
