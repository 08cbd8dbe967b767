use std::fmt;

use hashing::Fingerprint;

/// The Local CAS error taxonomy (§4.4, §7). Kept distinct from `casd::DaemonError` and from
/// `cache`'s higher-level error types — see `DESIGN.md`'s Open Question decisions.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// A batch read reported `NOT_FOUND` for this blob.
    BlobNotFound(Fingerprint),
    /// The daemon or a remote reported `RESOURCE_EXHAUSTED`.
    CacheTooFull,
    /// `UNIMPLEMENTED`, or an `INVALID_ARGUMENT` naming an unknown instance, from the daemon.
    DaemonUnsupported(String),
    /// Size mismatch, unexpected gRPC status, or proto parse failure.
    CASError(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::BlobNotFound(hash) => write!(f, "blob not found: {hash}"),
            CacheError::CacheTooFull => write!(f, "cache is too full to accept this write"),
            CacheError::DaemonUnsupported(detail) => {
                write!(f, "storage daemon does not support this operation: {detail}")
            }
            CacheError::CASError(detail) => write!(f, "CAS error: {detail}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<casd::DaemonError> for CacheError {
    fn from(err: casd::DaemonError) -> Self {
        CacheError::CASError(err.to_string())
    }
}

/// Classifies a `tonic::Status` coming back from the daemon into the taxonomy above, for call
/// sites that have no more specific digest/hash context to attach.
pub fn status_to_cache_error(status: &tonic::Status) -> CacheError {
    use tonic::Code;
    match status.code() {
        Code::ResourceExhausted => CacheError::CacheTooFull,
        Code::Unimplemented => CacheError::DaemonUnsupported(status.message().to_owned()),
        Code::InvalidArgument if status.message().contains("instance") => {
            CacheError::DaemonUnsupported(status.message().to_owned())
        }
        _ => CacheError::CASError(grpc_util::status_to_str(status)),
    }
}
