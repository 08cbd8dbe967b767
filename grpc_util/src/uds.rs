// Transport for the daemon's local control channel (§4.3 RPC Channel): an
// insecure UNIX-domain-socket connection, since the daemon and this process
// always share a filesystem namespace.

use std::path::PathBuf;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Connects a Tonic `Channel` to a UNIX-domain socket at `path`. The URI passed to `Endpoint` is
/// a placeholder; all connections made through the resulting channel ignore it and dial `path`
/// instead, via the custom connector.
pub async fn connect(path: PathBuf) -> Result<Channel, String> {
    Endpoint::try_from("http://[::]:50051")
        .map_err(|e| format!("failed to construct daemon endpoint: {e}"))?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                let stream = UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|e| format!("failed to connect to daemon socket: {e}"))
}
