//! URL parsing for storage backends.
//!
//! Extracts backend configuration from S3, GCS and local filesystem URLs.

use object_store::path::Path;
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, RegexGroupMissingSnafu, StorageError};

use super::{GcsConfig, LocalConfig, S3Config};

// URL patterns for different storage backends
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const GCS_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$";
const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$";
const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Local,
}

static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    [
        (Backend::S3, S3_PATH),
        (Backend::S3, S3_VIRTUAL),
        (Backend::S3, S3_ENDPOINT_URL),
        (Backend::S3, S3_URL),
        (Backend::Gcs, GCS_PATH),
        (Backend::Gcs, GCS_VIRTUAL),
        (Backend::Gcs, GCS_URL),
        (Backend::Local, FILE_URI),
        (Backend::Local, FILE_URL),
        (Backend::Local, FILE_PATH),
    ]
    .into_iter()
    .map(|(backend, pattern)| (backend, Regex::new(pattern).expect("Invalid regex pattern")))
    .collect()
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, regex) in MATCHERS.iter() {
            if let Some(caps) = regex.captures(url) {
                return match backend {
                    Backend::S3 => Self::parse_s3(&caps),
                    Backend::Gcs => Self::parse_gcs(&caps),
                    Backend::Local => Self::parse_local(&caps),
                };
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(caps: &Captures) -> Result<Self, StorageError> {
        let bucket = required(caps, "bucket")?;

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| caps.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            caps.name("endpoint").map(|endpoint| {
                let port = caps
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = caps.name("protocol").map(|p| p.as_str()).unwrap_or("https");
                format!("{protocol}://{}:{port}", endpoint.as_str())
            })
        });

        Ok(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: key(caps),
        }))
    }

    fn parse_gcs(caps: &Captures) -> Result<Self, StorageError> {
        Ok(BackendConfig::Gcs(GcsConfig {
            bucket: required(caps, "bucket")?,
            key: key(caps),
        }))
    }

    fn parse_local(caps: &Captures) -> Result<Self, StorageError> {
        let path = required(caps, "path")?;
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };

        Ok(BackendConfig::Local(LocalConfig { path }))
    }

    /// Key prefix inside the bucket, if the URL carried one.
    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

fn required(caps: &Captures, group: &str) -> Result<String, StorageError> {
    caps.name(group)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| RegexGroupMissingSnafu { group }.build())
}

fn key(caps: &Captures) -> Option<Path> {
    caps.name("key")
        .map(|m| m.as_str().trim_end_matches('/'))
        .filter(|k| !k.is_empty())
        .map(Path::from)
}
