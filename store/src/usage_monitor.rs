// A background poller of the daemon's disk usage/quota (§4.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tonic::Request;

use casd::DaemonChannel;
use protos::pb::build::buildgrid::GetLocalDiskUsageRequest;

/// How often the usage monitor polls the daemon (§4.5).
const T_REFRESH: Duration = Duration::from_secs(5);
/// How often the stop flag is checked while the worker is otherwise idle.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// A `(used_size, quota_size, used_percent)` snapshot (§4.5). `quota_size == 0` means unbounded,
/// in which case `used_percent` is `0` rather than a divide-by-zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Usage {
    pub used_size: u64,
    pub quota_size: u64,
}

impl Usage {
    pub fn used_percent(&self) -> u64 {
        if self.quota_size == 0 {
            0
        } else {
            (100 * self.used_size) / self.quota_size
        }
    }
}

/// Polls `GetLocalDiskUsage` every `T_REFRESH` and exposes the last-observed value. Exits its
/// background loop (rather than retrying) on RPC failure; callers then see a stale `Usage`
/// forever, or `None` if the first poll never succeeded.
pub struct UsageMonitor {
    last: Arc<Mutex<Option<Usage>>>,
    stop: Arc<AtomicBool>,
}

impl UsageMonitor {
    /// Spawns the polling task on `executor`. `instance_name` identifies which of the daemon's
    /// tracked CAS roots to report on; empty for the default.
    pub fn start(executor: &task_executor::Executor, channel: Arc<DaemonChannel>, instance_name: String) -> Self {
        let last = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let last_for_task = last.clone();
        let stop_for_task = stop.clone();
        executor.native_spawn(async move {
            loop {
                match channel.local_cas().await {
                    Ok(mut client) => {
                        let request = GetLocalDiskUsageRequest {
                            instance_name: instance_name.clone(),
                        };
                        match client.get_local_disk_usage(Request::new(request)).await {
                            Ok(response) => {
                                let response = response.into_inner();
                                *last_for_task.lock() = Some(Usage {
                                    used_size: response.size_bytes.max(0) as u64,
                                    quota_size: response.quota_bytes.max(0) as u64,
                                });
                            }
                            Err(status) => {
                                log::warn!("usage monitor stopping: {}", grpc_util::status_to_str(&status));
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        log::warn!("usage monitor stopping: failed to connect to daemon: {err}");
                        return;
                    }
                }

                if Self::sleep_or_stop(&stop_for_task, T_REFRESH).await {
                    return;
                }
            }
        });

        Self { last, stop }
    }

    /// Sleeps for `total`, waking every `STOP_CHECK_INTERVAL` to check `stop`. Returns `true` if
    /// the wake-up was due to a stop request.
    async fn sleep_or_stop(stop: &AtomicBool, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if stop.load(Ordering::SeqCst) {
                return true;
            }
            let nap = remaining.min(STOP_CHECK_INTERVAL);
            tokio::time::sleep(nap).await;
            remaining -= nap;
        }
        stop.load(Ordering::SeqCst)
    }

    /// The last-observed `(used_size, quota_size, used_percent)` tuple, or `None` if no poll has
    /// succeeded yet (or the loop has since exited with no prior success).
    pub fn last(&self) -> Option<Usage> {
        *self.last.lock()
    }

    /// Cooperative stop (§4.5, §5): the worker notices within `STOP_CHECK_INTERVAL`.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_percent_is_zero_when_quota_unbounded() {
        let usage = Usage { used_size: 500, quota_size: 0 };
        assert_eq!(usage.used_percent(), 0);
    }

    #[test]
    fn used_percent_floors() {
        let usage = Usage { used_size: 33, quota_size: 100 };
        assert_eq!(usage.used_percent(), 33);
        let usage = Usage { used_size: 1, quota_size: 3 };
        assert_eq!(usage.used_percent(), 0);
    }
}
