use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{self, Signal};
use nix::sys::statvfs::statvfs;
use nix::unistd::Pid;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::config::{DaemonConfig, MIN_SUPPORTED_VERSION, N_LOG};
use crate::error::DaemonError;

const POLITE_WAIT: Duration = Duration::from_millis(500);
const ESCALATION_WAIT: Duration = Duration::from_secs(15);
const FORCEFUL_WAIT: Duration = Duration::from_secs(15);

/// Owns the lifetime of the storage daemon subprocess: spawning, version-gating, health
/// monitoring, and graceful-then-forceful termination (§4.2).
pub struct DaemonSupervisor {
    child: Child,
    socket_path: PathBuf,
    log_path: PathBuf,
    /// Holds the private temp dir (containing the `cas` symlink and the socket) alive until
    /// dropped; removed explicitly by `terminate` rather than relying on `Drop` alone, so
    /// teardown can be observed and logged.
    temp_dir: tempfile::TempDir,
    request_shutdown: Arc<AtomicBool>,
}

impl DaemonSupervisor {
    /// Looks up `config.daemon_binary_name` on PATH, optionally extended by a bundled
    /// subprojects directory, returning the resolved path.
    fn resolve_binary(config: &DaemonConfig) -> Result<PathBuf, DaemonError> {
        let path_var = std::env::var_os("PATH").unwrap_or_default();
        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Some(subprojects_dir) = &config.subprojects_dir {
            dirs.push(subprojects_dir.clone());
        }
        dirs.extend(std::env::split_paths(&path_var));

        dirs.into_iter()
            .map(|dir| dir.join(&config.daemon_binary_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                DaemonError::SpawnFailed(format!(
                    "could not find `{}` on PATH",
                    config.daemon_binary_name
                ))
            })
    }

    /// Invokes `<daemon> --version /` and parses a three-part integer version from its output.
    /// An unparseable output is a warning, not a failure (§4.2 step 2).
    async fn check_version(binary: &Path) -> Result<(), DaemonError> {
        let output = Command::new(binary)
            .arg("--version")
            .arg("/")
            .output()
            .await
            .map_err(|e| DaemonError::SpawnFailed(format!("failed to run --version: {e}")))?;

        let text = String::from_utf8_lossy(&output.stdout);
        match parse_version(&text) {
            Some(found) if found < MIN_SUPPORTED_VERSION => Err(DaemonError::VersionTooOld {
                found: format_version(found),
                minimum: format_version(MIN_SUPPORTED_VERSION),
            }),
            Some(_) => Ok(()),
            None => {
                log::warn!(
                    "could not parse a version triple out of `{}`; continuing anyway",
                    text.trim()
                );
                Ok(())
            }
        }
    }

    /// Creates the private socket directory: mode 0755, containing a `cas -> cas_root` symlink
    /// so a (possibly setuid) daemon can reach the cache directory through a world-executable
    /// path without exposing the rest of the parent directory (§4.2 step 3).
    fn make_socket_dir(cas_root: &Path) -> io::Result<(tempfile::TempDir, PathBuf)> {
        let temp_dir = tempfile::Builder::new().prefix("cas-daemon-").tempdir()?;
        std::fs::set_permissions(temp_dir.path(), std::fs::Permissions::from_mode(0o755))?;

        let cas_symlink = temp_dir.path().join("cas");
        symlink(cas_root, &cas_symlink)?;

        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let socket_path = cas_symlink.join(format!("casserver-{suffix}.sock"));
        Ok((temp_dir, socket_path))
    }

    /// Picks `<log_dir>/<epoch>.log` and rotates away older logs so that at most `N_LOG` remain
    /// (§4.2 step 4, property B3).
    fn select_log_path(log_dir: &Path) -> io::Result<PathBuf> {
        std::fs::create_dir_all(log_dir)?;

        let mut existing: Vec<(u64, PathBuf)> = std::fs::read_dir(log_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                let epoch: u64 = path.file_stem()?.to_str()?.parse().ok()?;
                Some((epoch, path))
            })
            .collect();
        existing.sort_by_key(|(epoch, _)| *epoch);

        // We're about to add one more; keep N_LOG - 1 of the existing ones (oldest first).
        while existing.len() >= N_LOG {
            let (_, oldest) = existing.remove(0);
            let _ = std::fs::remove_file(oldest);
        }

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Ok(log_dir.join(format!("{epoch}.log")))
    }

    /// Free space available to this process on the filesystem backing `path`, used to resolve
    /// `DaemonConfig::quota_or_default` (§12.3). `None` on any `statvfs` failure.
    fn free_bytes(path: &Path) -> Option<u64> {
        let stat = statvfs(path).ok()?;
        Some(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    /// Spawns the daemon (§4.2 step 5) and returns a supervisor for it. `cas_root` must already
    /// exist.
    pub async fn spawn(config: &DaemonConfig) -> Result<DaemonSupervisor, DaemonError> {
        let binary = Self::resolve_binary(config)?;
        Self::check_version(&binary).await?;

        let (temp_dir, socket_path) = Self::make_socket_dir(&config.cas_root)
            .map_err(|e| DaemonError::SpawnFailed(format!("failed to prepare socket dir: {e}")))?;
        let log_path = Self::select_log_path(&config.log_dir)
            .map_err(|e| DaemonError::SpawnFailed(format!("failed to prepare log file: {e}")))?;

        let log_file = std::fs::File::create(&log_path)
            .map_err(|e| DaemonError::SpawnFailed(format!("failed to create log file: {e}")))?;
        let log_file_stderr = log_file
            .try_clone()
            .map_err(|e| DaemonError::SpawnFailed(format!("failed to dup log file: {e}")))?;

        let mut command = Command::new(&binary);
        command
            .arg(format!("--bind=unix:{}", socket_path.display()))
            .arg(format!("--log-level={}", config.log_level.as_cli_value()));

        let quota_high = match Self::free_bytes(&config.cas_root) {
            Some(free_bytes) => config.quota_or_default(free_bytes),
            None => {
                log::warn!(
                    "failed to probe free space on {}; falling back to the configured quota",
                    config.cas_root.display()
                );
                config.quota_high_bytes
            }
        };
        if let Some(quota_high) = quota_high {
            command.arg(format!("--quota-high={quota_high}"));
            command.arg(format!("--quota-low={}", quota_high / 2));
        }
        if config.protect_session_blobs {
            command.arg("--protect-session-blobs");
        }
        if let Some(remote) = &config.cas_remote {
            command.arg(format!("--cas-remote={}", remote.url));
            if let Some(instance_name) = &remote.instance_name {
                command.arg(format!("--cas-instance={instance_name}"));
            }
        }
        command.arg(&config.cas_root);

        if let Some(subprojects_dir) = &config.subprojects_dir {
            let path_var = std::env::var_os("PATH").unwrap_or_default();
            let mut dirs = vec![subprojects_dir.clone()];
            dirs.extend(std::env::split_paths(&path_var));
            let new_path = std::env::join_paths(dirs)
                .map_err(|e| DaemonError::SpawnFailed(format!("invalid PATH entries: {e}")))?;
            command.env("PATH", new_path);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_stderr))
            .process_group(0);

        log::info!(
            "Starting CAS daemon `{}` with socket at {}, logging to {}",
            binary.display(),
            socket_path.display(),
            log_path.display()
        );

        let child = command
            .spawn()
            .map_err(|e| DaemonError::SpawnFailed(format!("failed to spawn daemon: {e}")))?;

        Ok(DaemonSupervisor {
            child,
            socket_path,
            log_path,
            temp_dir,
            request_shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// A flag that, once set, suppresses unexpected-death reporting from the health monitor and
    /// lets a waiting RPC channel give up without raising (§5 Cancellation).
    pub fn request_shutdown_flag(&self) -> Arc<AtomicBool> {
        self.request_shutdown.clone()
    }

    ///
    /// Spawns a background task on `executor` that awaits the child's exit. If the child exits
    /// while `request_shutdown` has not been set, logs a bug-level error naming the exit code and
    /// log path (§4.2 Health); the caller is expected to treat all in-flight work as aborted by
    /// observing the returned flag or channel failures.
    ///
    pub fn monitor_health(&mut self, executor: &task_executor::Executor) -> Arc<AtomicBool> {
        let died = Arc::new(AtomicBool::new(false));
        let wait = self.child.wait();
        let request_shutdown = self.request_shutdown.clone();
        let log_path = self.log_path.clone();
        let died_flag = died.clone();
        executor.native_spawn(async move {
            let result = wait.await;
            died_flag.store(true, Ordering::SeqCst);
            if !request_shutdown.load(Ordering::SeqCst) {
                match result {
                    Ok(status) => log::error!(
                        "storage daemon exited unexpectedly with {status}; see log at {}",
                        log_path.display()
                    ),
                    Err(e) => log::error!(
                        "lost track of the storage daemon process: {e}; see log at {}",
                        log_path.display()
                    ),
                }
            }
        });
        died
    }

    ///
    /// Terminates the daemon: polite SIGTERM with a 0.5 s grace period, then up to 15 s more
    /// before escalating to SIGKILL, then up to 15 s more waiting on that. Always removes the
    /// socket directory tree on the way out (§4.2 Termination).
    ///
    pub async fn terminate(mut self) -> Result<(), DaemonError> {
        self.request_shutdown.store(true, Ordering::SeqCst);

        if let Ok(Some(status)) = self.child.try_wait() {
            log::info!(
                "storage daemon had already exited with {status} before termination was requested"
            );
            return Ok(());
        }

        let pid = self.child.id();
        if let Some(pid) = pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        if timeout(POLITE_WAIT, self.child.wait()).await.is_ok() {
            return Ok(());
        }

        log::info!("Terminating CAS daemon; waiting up to 15s for it to exit...");
        if timeout(ESCALATION_WAIT, self.child.wait()).await.is_ok() {
            return Ok(());
        }

        log::warn!("storage daemon did not exit politely; killing it");
        if let Some(pid) = pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        match timeout(FORCEFUL_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::warn!("storage daemon had to be killed; exited with {status}");
                Ok(())
            }
            _ => Err(DaemonError::DaemonDied {
                exit_detail: "did not exit even after SIGKILL".to_owned(),
                log_path: Some(self.log_path.clone()),
            }),
        }
    }
}

impl Drop for DaemonSupervisor {
    fn drop(&mut self) {
        // Best-effort: `terminate` is the normal path and already removes this, but a supervisor
        // dropped without an explicit terminate (e.g. a panic unwind) should not leak the socket
        // directory.
        let _ = std::fs::remove_dir_all(self.temp_dir.path());
    }
}

fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let digits: Vec<&str> = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .collect();
    if digits.len() < 3 {
        return None;
    }
    let major = digits[0].parse().ok()?;
    let minor = digits[1].parse().ok()?;
    let micro = digits[2].parse().ok()?;
    Some((major, minor, micro))
}

fn format_version(v: (u32, u32, u32)) -> String {
    format!("{}.{}.{}", v.0, v.1, v.2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_extracts_three_part_triple() {
        assert_eq!(parse_version("casd 2.3.4\n"), Some((2, 3, 4)));
        assert_eq!(parse_version("version: v10.0.1-rc1"), Some((10, 0, 1)));
    }

    #[test]
    fn parse_version_rejects_unparseable_output() {
        assert_eq!(parse_version("not a version"), None);
        assert_eq!(parse_version("1.2"), None);
    }
}
