use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Minimum daemon version this workspace knows how to speak to (§6 Daemon CLI contract).
pub const MIN_SUPPORTED_VERSION: (u32, u32, u32) = (2, 1, 0);

/// How many rotated log files to retain per daemon session (§4.2).
pub const N_LOG: usize = 10;

/// `--log-level` values accepted by the daemon binary (§6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Warning,
    Info,
    Trace,
}

impl LogLevel {
    pub fn as_cli_value(self) -> &'static str {
        match self {
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Trace => "trace",
        }
    }
}

/// The upstream remote the daemon itself should consult on cache misses (`--cas-remote` and
/// friends, §6). Distinct from the `RemoteSpec`s the `cache` crate manages: this one remote is
/// wired directly into the daemon process, not spoken to over our own RPC channel.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub url: String,
    pub instance_name: Option<String>,
    pub server_cert: Option<Vec<u8>>,
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
}

/// Everything the supervisor needs to spawn and configure the storage daemon. Constructed by the
/// embedding application; this crate does not parse configuration files itself (§11 Ambient
/// Stack: Configuration).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Fixed binary name to resolve on PATH (optionally via `subprojects_dir`).
    pub daemon_binary_name: String,
    /// A bundled subprojects directory prepended to PATH so daemon-side helper binaries can be
    /// located (§6 Environment).
    pub subprojects_dir: Option<PathBuf>,
    pub cas_root: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: LogLevel,
    /// `None` means unbounded (§4.5 `quota_bytes == 0`).
    pub quota_high_bytes: Option<u64>,
    pub protect_session_blobs: bool,
    pub cas_remote: Option<RemoteEndpoint>,
}

impl DaemonConfig {
    /// `--quota-low` is always half of `--quota-high` (§4.2).
    pub fn quota_low_bytes(&self) -> Option<u64> {
        self.quota_high_bytes.map(|q| q / 2)
    }

    ///
    /// Resolves the effective quota to pass to the daemon. When the caller left `quota_high_bytes`
    /// unset, clamps to leave at least 2 GiB of headroom below the detected free space on the
    /// filesystem backing `cas_root`, rather than starting the daemon genuinely unbounded
    /// (supplemented from `casdprocessmanager.py`; see `DESIGN.md` §12.3).
    ///
    pub fn quota_or_default(&self, free_bytes_on_cas_root: u64) -> Option<u64> {
        const HEADROOM_BYTES: u64 = 2 * 1024 * 1024 * 1024;
        match self.quota_high_bytes {
            Some(q) => Some(q),
            None => free_bytes_on_cas_root.checked_sub(HEADROOM_BYTES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(quota_high_bytes: Option<u64>) -> DaemonConfig {
        DaemonConfig {
            daemon_binary_name: "casd".to_owned(),
            subprojects_dir: None,
            cas_root: PathBuf::from("/tmp/cas"),
            log_dir: PathBuf::from("/tmp/log"),
            log_level: LogLevel::Info,
            quota_high_bytes,
            protect_session_blobs: false,
            cas_remote: None,
        }
    }

    #[test]
    fn quota_low_is_half_of_high() {
        let config = config(Some(1000));
        assert_eq!(config.quota_low_bytes(), Some(500));
    }

    #[test]
    fn quota_low_is_none_when_unbounded() {
        let config = config(None);
        assert_eq!(config.quota_low_bytes(), None);
    }

    #[test]
    fn quota_or_default_uses_explicit_quota_when_set() {
        let config = config(Some(42));
        assert_eq!(config.quota_or_default(u64::MAX), Some(42));
    }

    #[test]
    fn quota_or_default_leaves_headroom_when_unset() {
        let config = config(None);
        let free = 10 * 1024 * 1024 * 1024;
        assert_eq!(config.quota_or_default(free), Some(8 * 1024 * 1024 * 1024));
    }
}
