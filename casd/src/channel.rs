// The daemon's control channel (§4.3 RPC Channel): a lazily-connected, cached
// `tonic::transport::Channel` over the private UNIX socket that `DaemonSupervisor::spawn`
// allocated, plus typed accessors for every service the daemon and its upstream remote speak.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use tonic::transport::Channel;

use protos::pb::build::bazel::remote::asset::v1::{fetch_client::FetchClient, push_client::PushClient};
use protos::pb::build::bazel::remote::execution::v2::{
    capabilities_client::CapabilitiesClient,
    content_addressable_storage_client::ContentAddressableStorageClient,
};
use protos::pb::build::buildgrid::local_content_addressable_storage_client::LocalContentAddressableStorageClient;
use protos::pb::google::bytestream::byte_stream_client::ByteStreamClient;

use crate::error::DaemonError;

/// How long to wait for the daemon's socket to become connectable before giving up (§4.3, §6).
const T_READY: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A lazily-connected RPC channel to the storage daemon over its private UNIX socket (§4.3).
///
/// The first call that needs the channel pays the cost of waiting for the socket to appear and
/// dialing it; later calls reuse the same underlying `tonic::transport::Channel`. Concurrent
/// callers racing to connect are serialized by the connect-step's mutex, so only one dial attempt
/// is ever in flight, and every typed accessor (`local_cas`, `cas`, ...) shares it.
pub struct DaemonChannel {
    socket_path: PathBuf,
    request_shutdown: Arc<AtomicBool>,
    daemon_died: Arc<AtomicBool>,
    concurrency_limit: usize,
    headers: HeaderMap,
    ready_timeout: Duration,
    channel: Arc<tokio::sync::Mutex<Option<Channel>>>,
}

impl DaemonChannel {
    /// `daemon_died` is the flag returned by `DaemonSupervisor::monitor_health`, and
    /// `request_shutdown` the one from `DaemonSupervisor::request_shutdown_flag`; both let the
    /// channel give up waiting promptly instead of always running out the full `T_READY` budget.
    pub fn new(
        socket_path: PathBuf,
        request_shutdown: Arc<AtomicBool>,
        daemon_died: Arc<AtomicBool>,
        concurrency_limit: usize,
        headers: HeaderMap,
    ) -> Self {
        Self {
            socket_path,
            request_shutdown,
            daemon_died,
            concurrency_limit,
            headers,
            ready_timeout: T_READY,
            channel: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    #[cfg(test)]
    fn new_with_timeout(
        socket_path: PathBuf,
        request_shutdown: Arc<AtomicBool>,
        daemon_died: Arc<AtomicBool>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            socket_path,
            request_shutdown,
            daemon_died,
            concurrency_limit: 1,
            headers: HeaderMap::new(),
            ready_timeout,
            channel: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Returns the cached, connected channel, waiting for the daemon's socket to become
    /// connectable the first time this is called.
    async fn channel(&self) -> Result<Channel, DaemonError> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = &*guard {
            return Ok(channel.clone());
        }

        let channel = self.wait_and_connect().await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn wait_and_connect(&self) -> Result<Channel, DaemonError> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if self.daemon_died.load(Ordering::SeqCst) {
                return Err(DaemonError::DaemonDied {
                    exit_detail: "died before its socket became ready".to_owned(),
                    log_path: None,
                });
            }
            if self.request_shutdown.load(Ordering::SeqCst) {
                return Err(DaemonError::Timeout);
            }

            if self.socket_path.exists() {
                if let Ok(channel) = grpc_util::uds::connect(self.socket_path.clone()).await {
                    return Ok(channel);
                }
                // The socket file can exist slightly before its listener is accepting
                // connections; fall through and retry rather than treating this as fatal.
            }

            if Instant::now() >= deadline {
                return Err(DaemonError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn layered(&self, channel: Channel) -> grpc_util::LayeredService {
        grpc_util::layered_service(channel, self.concurrency_limit, self.headers.clone())
    }

    /// The daemon-only surface: `FetchMissingBlobs`, `StageTree`, `GetLocalDiskUsage`, etc.
    pub async fn local_cas(
        &self,
    ) -> Result<LocalContentAddressableStorageClient<grpc_util::LayeredService>, DaemonError> {
        let channel = self.channel().await?;
        Ok(LocalContentAddressableStorageClient::new(self.layered(channel)))
    }

    /// The upstream-compatible `FindMissingBlobs`/`BatchReadBlobs`/`BatchUpdateBlobs`/`GetTree`.
    pub async fn cas(
        &self,
    ) -> Result<ContentAddressableStorageClient<grpc_util::LayeredService>, DaemonError> {
        let channel = self.channel().await?;
        Ok(ContentAddressableStorageClient::new(self.layered(channel)))
    }

    pub async fn capabilities(
        &self,
    ) -> Result<CapabilitiesClient<grpc_util::LayeredService>, DaemonError> {
        let channel = self.channel().await?;
        Ok(CapabilitiesClient::new(self.layered(channel)))
    }

    pub async fn byte_stream(&self) -> Result<ByteStreamClient<grpc_util::LayeredService>, DaemonError> {
        let channel = self.channel().await?;
        Ok(ByteStreamClient::new(self.layered(channel)))
    }

    pub async fn fetch(&self) -> Result<FetchClient<grpc_util::LayeredService>, DaemonError> {
        let channel = self.channel().await?;
        Ok(FetchClient::new(self.layered(channel)))
    }

    pub async fn push(&self) -> Result<PushClient<grpc_util::LayeredService>, DaemonError> {
        let channel = self.channel().await?;
        Ok(PushClient::new(self.layered(channel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gives_up_promptly_when_daemon_already_died() {
        let channel = DaemonChannel::new_with_timeout(
            PathBuf::from("/nonexistent/cas-daemon-test.sock"),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(true)),
            Duration::from_secs(30),
        );

        let err = channel.channel().await.unwrap_err();
        assert!(matches!(err, DaemonError::DaemonDied { .. }));
    }

    #[tokio::test]
    async fn times_out_when_socket_never_appears() {
        let channel = DaemonChannel::new_with_timeout(
            PathBuf::from("/nonexistent/cas-daemon-test.sock"),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(50),
        );

        let err = channel.channel().await.unwrap_err();
        assert!(matches!(err, DaemonError::Timeout));
    }

    #[tokio::test]
    async fn gives_up_promptly_when_shutdown_requested() {
        let channel = DaemonChannel::new_with_timeout(
            PathBuf::from("/nonexistent/cas-daemon-test.sock"),
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            Duration::from_secs(30),
        );

        let err = channel.channel().await.unwrap_err();
        assert!(matches!(err, DaemonError::Timeout));
    }
}
