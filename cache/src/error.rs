use std::fmt;

/// Raised while setting up or probing a remote (§4.6, §4.8): the capability probe failed, the
/// remote lacks a required service, or a push was requested against a read-only remote.
#[derive(Debug, Clone)]
pub enum AssetCacheError {
    RemoteNotCompatible(String),
    Other(String),
}

impl fmt::Display for AssetCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetCacheError::RemoteNotCompatible(detail) => write!(f, "remote is not compatible: {detail}"),
            AssetCacheError::Other(detail) => write!(f, "{detail}"),
        }
    }
}

impl std::error::Error for AssetCacheError {}

/// A failure of an artifact-cache operation (push/pull/list/link) that tried every available
/// remote and still didn't succeed. `detail` carries the per-remote errors that were
/// accumulated along the way, newline-joined, kept separate from `message` so callers can show a
/// one-line summary without the full trace.
#[derive(Debug, Clone)]
pub struct ArtifactCacheError {
    pub message: String,
    pub detail: Option<String>,
}

impl ArtifactCacheError {
    pub fn new(message: impl Into<String>) -> Self {
        ArtifactCacheError { message: message.into(), detail: None }
    }

    pub fn with_remote_errors(message: impl Into<String>, errors: &[String]) -> Self {
        ArtifactCacheError {
            message: message.into(),
            detail: if errors.is_empty() { None } else { Some(errors.join("\n")) },
        }
    }
}

impl fmt::Display for ArtifactCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ArtifactCacheError {}

impl From<store::CacheError> for ArtifactCacheError {
    fn from(err: store::CacheError) -> Self {
        ArtifactCacheError::new(err.to_string())
    }
}

/// The source-cache equivalent of `ArtifactCacheError` (§4.10). Kept as a distinct type rather
/// than unified with `ArtifactCacheError`, since the two caches report against independent sets
/// of remotes and a caller handling one should never be tempted to also catch the other.
#[derive(Debug, Clone)]
pub struct SourceCacheError {
    pub message: String,
    pub detail: Option<String>,
}

impl SourceCacheError {
    pub fn new(message: impl Into<String>) -> Self {
        SourceCacheError { message: message.into(), detail: None }
    }

    pub fn with_remote_errors(message: impl Into<String>, errors: &[String]) -> Self {
        SourceCacheError {
            message: message.into(),
            detail: if errors.is_empty() { None } else { Some(errors.join("\n")) },
        }
    }
}

impl fmt::Display for SourceCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SourceCacheError {}

impl From<store::CacheError> for SourceCacheError {
    fn from(err: store::CacheError) -> Self {
        SourceCacheError::new(err.to_string())
    }
}
