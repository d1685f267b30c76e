//! Artifact references accepted by `cutover deploy`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ArtifactRef {
    /// OCI registry: oci://registry.example.com/shop:v1.4.0
    Oci { registry: String, repository: String, tag: String },
    /// HTTPS: https://builds.example.com/shop-1.4.0.tar.gz
    Https { url: String },
    /// S3: s3://bucket/builds/shop-1.4.0.tar.gz
    S3 { bucket: String, key: String },
    /// Git: git://github.com/org/shop.git#v1.4.0
    Git { url: String, reference: String },
    /// Local file or directory: file:///srv/builds/shop.tar.gz or ./build
    File { path: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported artifact scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid artifact reference: {0}")]
    InvalidUri(String),
}

/// Shape of a local artifact, which decides how it is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    Directory,
    Tarball,
    GzipTarball,
}

impl ArtifactRef {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(SourceError::InvalidUri(uri.to_string()));
        }

        if let Some(rest) = uri.strip_prefix("oci://") {
            let (registry, path) = rest
                .split_once('/')
                .ok_or_else(|| SourceError::InvalidUri(uri.to_string()))?;
            // The tag separator can only appear in the last path segment;
            // a colon before the first slash is a registry port.
            let name_start = path.rfind('/').map_or(0, |i| i + 1);
            let (repository, tag) = match path[name_start..].rsplit_once(':') {
                Some((name, tag)) => (&path[..name_start + name.len()], tag),
                None => (path, "latest"),
            };
            if repository.is_empty() || tag.is_empty() {
                return Err(SourceError::InvalidUri(uri.to_string()));
            }
            Ok(ArtifactRef::Oci {
                registry: registry.to_string(),
                repository: repository.to_string(),
                tag: tag.to_string(),
            })
        } else if uri.starts_with("https://") || uri.starts_with("http://") {
            Ok(ArtifactRef::Https { url: uri.to_string() })
        } else if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or_else(|| SourceError::InvalidUri(uri.to_string()))?;
            Ok(ArtifactRef::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        } else if uri.starts_with("git://") {
            let (url, reference) = uri.rsplit_once('#').unwrap_or((uri, "main"));
            Ok(ArtifactRef::Git {
                url: url.to_string(),
                reference: reference.to_string(),
            })
        } else if let Some(path) = uri.strip_prefix("file://") {
            Ok(ArtifactRef::File { path: path.to_string() })
        } else if uri.contains("://") {
            Err(SourceError::UnsupportedScheme(uri.to_string()))
        } else {
            Ok(ArtifactRef::File { path: uri.to_string() })
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ArtifactRef::Oci { .. } => "oci",
            ArtifactRef::Https { .. } => "https",
            ArtifactRef::S3 { .. } => "s3",
            ArtifactRef::Git { .. } => "git",
            ArtifactRef::File { .. } => "file",
        }
    }

    /// Local filesystem path, for `file` references.
    pub fn local_path(&self) -> Option<PathBuf> {
        match self {
            ArtifactRef::File { path } => Some(PathBuf::from(path)),
            _ => None,
        }
    }

    /// Classify a local path by its name. Directories are detected by the caller.
    pub fn archive_kind(path: &Path) -> Option<LocalKind> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(LocalKind::GzipTarball)
        } else if name.ends_with(".tar") {
            Some(LocalKind::Tarball)
        } else {
            None
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactRef::Oci { registry, repository, tag } => {
                write!(f, "oci://{registry}/{repository}:{tag}")
            }
            ArtifactRef::Https { url } => f.write_str(url),
            ArtifactRef::S3 { bucket, key } => write!(f, "s3://{bucket}/{key}"),
            ArtifactRef::Git { url, reference } => write!(f, "{url}#{reference}"),
            ArtifactRef::File { path } => f.write_str(path),
        }
    }
}
