use std::fmt;

/// Errors owned by the daemon supervisor and its RPC channel (§7 Error Handling Design).
/// Kept distinct from the local-CAS and asset-cache error types (`store::CacheError`,
/// `cache::AssetCacheError`) rather than folded into one conflated "domain" tag — see
/// `DESIGN.md`'s Open Question decisions.
#[derive(Debug)]
pub enum DaemonError {
    /// The daemon binary reported a version below the compile-time minimum, or its version
    /// output could not be parsed strictly enough to tell.
    VersionTooOld { found: String, minimum: String },
    /// The daemon binary could not be located on PATH, or failed to spawn.
    SpawnFailed(String),
    /// The daemon process exited (or was observed dead) while a caller was waiting on it, either
    /// during the initial connect or mid-session.
    DaemonDied { exit_detail: String, log_path: Option<std::path::PathBuf> },
    /// The socket never appeared within `T_READY`, and the process could not be confirmed dead.
    Timeout,
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::VersionTooOld { found, minimum } => write!(
                f,
                "storage daemon version {found} is older than the minimum supported version {minimum}"
            ),
            DaemonError::SpawnFailed(detail) => write!(f, "failed to start storage daemon: {detail}"),
            DaemonError::DaemonDied { exit_detail, log_path } => {
                write!(f, "storage daemon died: {exit_detail}")?;
                if let Some(log_path) = log_path {
                    write!(f, " (see log at {})", log_path.display())?;
                }
                Ok(())
            }
            DaemonError::Timeout => write!(f, "timed out waiting for storage daemon to become ready"),
        }
    }
}

impl std::error::Error for DaemonError {}
