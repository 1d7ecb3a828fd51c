//! S3 storage backend.

use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{S3ConfigSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

/// S3 storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: String,
    pub key: Option<Path>,
}

impl StorageProvider {
    /// Options are `aws_*` keys understood by `AmazonS3Builder`, e.g.
    /// `aws_region` or `aws_access_key_id`. They win over the environment.
    pub(super) async fn construct_s3(
        config: S3Config,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }

        for (key, value) in &options {
            builder = builder.with_config(key.parse().context(S3ConfigSnafu)?, value.clone());
        }

        builder = builder.with_retry(RetryConfig::default());

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }

        let canonical_url = match &config.key {
            Some(key) => format!("s3://{}/{}", config.bucket, key),
            None => format!("s3://{}", config.bucket),
        };

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(builder.build().context(S3ConfigSnafu)?);

        Ok(Self {
            config: BackendConfig::S3(config),
            object_store,
            canonical_url,
        })
    }
}
