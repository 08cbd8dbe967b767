// A real storage daemon, minus the supervisor: serves the Local CAS (daemon-only) and CAS v2
// surfaces (§4.4, §6) over a UNIX socket backed by an on-disk `objects/` tree, plus a
// per-registered-remote in-memory blob map standing in for an upstream. Lets `store::LocalCas`
// be exercised through `casd::DaemonChannel` exactly as it would be against the real `cas`
// binary, without spawning one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::{Request, Response, Status, Streaming};

use hashing::{Digest, Fingerprint};
use protos::pb::build::bazel::remote::execution::v2 as remexec;
use protos::pb::build::buildgrid as local_cas_pb;
use protos::pb::google::rpc::Status as RpcStatus;
use protos::require_digest;

use remexec::content_addressable_storage_server::{
    ContentAddressableStorage, ContentAddressableStorageServer,
};
use local_cas_pb::local_content_addressable_storage_server::{
    LocalContentAddressableStorage, LocalContentAddressableStorageServer,
};

fn objpath(cas_root: &Path, digest: &Digest) -> PathBuf {
    let hex = digest.hash.to_hex();
    cas_root.join("objects").join(&hex[0..2]).join(&hex[2..])
}

fn ok_status() -> RpcStatus {
    RpcStatus { code: 0, message: String::new() }
}

fn not_found_status(message: String) -> RpcStatus {
    RpcStatus { code: tonic::Code::NotFound as i32, message }
}

fn resource_exhausted_status(message: String) -> RpcStatus {
    RpcStatus { code: tonic::Code::ResourceExhausted as i32, message }
}

/// A registered upstream, keyed by the `instance_name` the mock hands back from
/// `GetInstanceNameForRemote`. Blobs pushed there never touch `cas_root` directly -- only
/// `FetchMissingBlobs`/`UploadMissingBlobs` cross that boundary, same as the real daemon talking
/// to a real upstream.
#[derive(Default)]
struct RemoteState {
    blobs: HashMap<Fingerprint, Bytes>,
}

struct Shared {
    cas_root: PathBuf,
    remotes: Mutex<HashMap<String, RemoteState>>,
    next_remote_id: Mutex<u64>,
    used_bytes: AtomicI64,
    quota_bytes: AtomicI64,
    always_full: AtomicBool,
}

impl Shared {
    fn local_bytes(&self, digest: &Digest) -> std::io::Result<Bytes> {
        std::fs::read(objpath(&self.cas_root, digest)).map(Bytes::from)
    }

    fn write_local(&self, digest: &Digest, data: &[u8]) -> std::io::Result<()> {
        let path = objpath(&self.cas_root, digest);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)
    }

    fn has_local(&self, digest: &Digest) -> bool {
        objpath(&self.cas_root, digest).is_file()
    }

    fn read_directory(&self, digest: &Digest) -> Result<remexec::Directory, Status> {
        let bytes = self
            .local_bytes(digest)
            .map_err(|e| Status::not_found(format!("directory {digest} not available: {e}")))?;
        remexec::Directory::decode(bytes.as_ref())
            .map_err(|e| Status::internal(format!("corrupt directory proto for {digest}: {e}")))
    }

    /// Ensures `digest` (a directory blob) is present locally, fetching it from `remote` first
    /// if not. Returns `false` if it's unavailable from either source.
    fn ensure_directory_local(&self, digest: &Digest, remote: &str) -> bool {
        if self.has_local(digest) {
            return true;
        }
        if remote.is_empty() {
            return false;
        }
        let remotes = self.remotes.lock();
        match remotes.get(remote).and_then(|state| state.blobs.get(&digest.hash)) {
            Some(bytes) => self.write_local(digest, bytes).is_ok(),
            None => false,
        }
    }

    fn ensure_blob_local(&self, digest: &Digest, remote: &str) -> bool {
        if self.has_local(digest) {
            return true;
        }
        if remote.is_empty() {
            return false;
        }
        let remotes = self.remotes.lock();
        match remotes.get(remote).and_then(|state| state.blobs.get(&digest.hash)) {
            Some(bytes) => self.write_local(digest, bytes).is_ok(),
            None => false,
        }
    }

    /// Walks the tree rooted at `root`, skipping `excluded_subdirs`, fetching any missing
    /// directory blobs (and, if `fetch_file_blobs`, file blobs) from `remote`. Returns `false`
    /// the first time something is unavailable from both local storage and `remote`.
    fn fetch_tree_into_local(
        &self,
        root: &Digest,
        fetch_file_blobs: bool,
        excluded_subdirs: &[String],
        remote: &str,
    ) -> bool {
        let mut stack = vec![root.clone()];
        while let Some(dir_digest) = stack.pop() {
            if !self.ensure_directory_local(&dir_digest, remote) {
                return false;
            }
            let directory = match self.read_directory(&dir_digest) {
                Ok(directory) => directory,
                Err(_) => return false,
            };

            if fetch_file_blobs {
                for file in &directory.files {
                    let file_digest = match require_digest(file.digest.as_ref()) {
                        Ok(digest) => digest,
                        Err(_) => return false,
                    };
                    if !self.ensure_blob_local(&file_digest, remote) {
                        return false;
                    }
                }
            }

            for subdir in &directory.directories {
                if excluded_subdirs.iter().any(|excluded| excluded == &subdir.name) {
                    continue;
                }
                let subdir_digest = match require_digest(subdir.digest.as_ref()) {
                    Ok(digest) => digest,
                    Err(_) => return false,
                };
                stack.push(subdir_digest);
            }
        }
        true
    }

    fn register_remote(&self) -> String {
        let mut next_id = self.next_remote_id.lock();
        let name = format!("remote-{next_id}");
        *next_id += 1;
        self.remotes.lock().insert(name.clone(), RemoteState::default());
        name
    }

    fn capture_path(&self, fs_path: &Path, node_properties_mtime: bool) -> std::io::Result<Digest> {
        let metadata = std::fs::symlink_metadata(fs_path)?;
        if metadata.is_dir() {
            self.capture_directory(fs_path, node_properties_mtime)
        } else if metadata.file_type().is_symlink() {
            // A bare symlink path can't be represented as a root digest; capture its parent.
            Err(std::io::Error::other("cannot capture a bare symlink as a root"))
        } else {
            self.capture_file(fs_path, node_properties_mtime).map(|(digest, _)| digest)
        }
    }

    fn capture_file(&self, fs_path: &Path, node_properties_mtime: bool) -> std::io::Result<(Digest, bool)> {
        use std::os::unix::fs::PermissionsExt;
        let bytes = std::fs::read(fs_path)?;
        let digest = Digest::of_bytes(&bytes);
        self.write_local(&digest, &bytes)?;
        let metadata = std::fs::metadata(fs_path)?;
        let is_executable = metadata.permissions().mode() & 0o111 != 0;
        let _ = node_properties_mtime;
        Ok((digest, is_executable))
    }

    fn capture_directory(&self, fs_path: &Path, node_properties_mtime: bool) -> std::io::Result<Digest> {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let mut entries: Vec<_> = std::fs::read_dir(fs_path)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        let mut files = Vec::new();
        let mut directories = Vec::new();
        let mut symlinks = Vec::new();

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_symlink() {
                let target = std::fs::read_link(&path)?.to_string_lossy().into_owned();
                symlinks.push(remexec::SymlinkNode { name, target });
            } else if file_type.is_dir() {
                let digest = self.capture_directory(&path, node_properties_mtime)?;
                directories.push(remexec::DirectoryNode { name, digest: Some((&digest).into()) });
            } else {
                let bytes = std::fs::read(&path)?;
                let digest = Digest::of_bytes(&bytes);
                self.write_local(&digest, &bytes)?;
                let metadata = std::fs::metadata(&path)?;
                let is_executable = metadata.permissions().mode() & 0o111 != 0;
                let node_properties = node_properties_mtime.then(|| remexec::NodeProperties {
                    mtime: metadata.mtime(),
                });
                files.push(remexec::FileNode {
                    name,
                    digest: Some((&digest).into()),
                    is_executable,
                    node_properties,
                });
            }
        }

        let directory = remexec::Directory { files, directories, symlinks };
        let bytes = directory.encode_to_vec();
        let digest = Digest::of_bytes(&bytes);
        self.write_local(&digest, &bytes)?;
        Ok(digest)
    }

    /// Recursively materializes `digest` at `dest`, reading only from local storage. Used by
    /// `StageTree`, which only ever stages trees the client has already ensured are present.
    fn materialize(&self, dest: &Path, digest: &Digest) -> Result<(), Status> {
        std::fs::create_dir_all(dest)
            .map_err(|e| Status::internal(format!("failed to create {}: {e}", dest.display())))?;
        let directory = self.read_directory(digest)?;

        for file in &directory.files {
            let file_digest = require_digest(file.digest.as_ref())
                .map_err(|e| Status::internal(format!("malformed file digest: {e}")))?;
            let bytes = self
                .local_bytes(&file_digest)
                .map_err(|e| Status::not_found(format!("blob {file_digest} not available: {e}")))?;
            let dest_path = dest.join(&file.name);
            std::fs::write(&dest_path, &bytes)
                .map_err(|e| Status::internal(format!("failed to write {}: {e}", dest_path.display())))?;
            if file.is_executable {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = std::fs::metadata(&dest_path)
                    .map_err(|e| Status::internal(e.to_string()))?
                    .permissions();
                perms.set_mode(perms.mode() | 0o111);
                std::fs::set_permissions(&dest_path, perms).map_err(|e| Status::internal(e.to_string()))?;
            }
        }
        for symlink in &directory.symlinks {
            let dest_path = dest.join(&symlink.name);
            std::os::unix::fs::symlink(&symlink.target, &dest_path)
                .map_err(|e| Status::internal(format!("failed to symlink {}: {e}", dest_path.display())))?;
        }
        for subdir in &directory.directories {
            let subdir_digest = require_digest(subdir.digest.as_ref())
                .map_err(|e| Status::internal(format!("malformed directory digest: {e}")))?;
            self.materialize(&dest.join(&subdir.name), &subdir_digest)?;
        }
        Ok(())
    }
}

struct DaemonService {
    shared: Arc<Shared>,
}

#[tonic::async_trait]
impl LocalContentAddressableStorage for DaemonService {
    async fn fetch_missing_blobs(
        &self,
        request: Request<local_cas_pb::FetchMissingBlobsRequest>,
    ) -> Result<Response<local_cas_pb::FetchMissingBlobsResponse>, Status> {
        let request = request.into_inner();
        let remote = request.remote_instance_name;
        let mut responses = Vec::with_capacity(request.blob_digests.len());

        for proto_digest in request.blob_digests {
            let digest = Digest::try_from(&proto_digest)
                .map_err(|e| Status::invalid_argument(format!("malformed digest: {e}")))?;

            let status = if self.shared.has_local(&digest) {
                ok_status()
            } else if !remote.is_empty() {
                let remotes = self.shared.remotes.lock();
                let found = remotes
                    .get(&remote)
                    .and_then(|state| state.blobs.get(&digest.hash).cloned());
                drop(remotes);
                match found {
                    Some(bytes) if self.shared.write_local(&digest, &bytes).is_ok() => ok_status(),
                    _ => not_found_status(format!("blob {digest} not found in remote {remote}")),
                }
            } else {
                not_found_status(format!("blob {digest} not found locally"))
            };

            responses.push(local_cas_pb::fetch_missing_blobs_response::Response {
                digest: Some(proto_digest),
                status: Some(status),
            });
        }

        Ok(Response::new(local_cas_pb::FetchMissingBlobsResponse { responses }))
    }

    async fn upload_missing_blobs(
        &self,
        request: Request<local_cas_pb::UploadMissingBlobsRequest>,
    ) -> Result<Response<local_cas_pb::UploadMissingBlobsResponse>, Status> {
        let request = request.into_inner();
        let remote = request.remote_instance_name;
        let mut responses = Vec::with_capacity(request.blob_digests.len());

        for proto_digest in request.blob_digests {
            let digest = Digest::try_from(&proto_digest)
                .map_err(|e| Status::invalid_argument(format!("malformed digest: {e}")))?;

            let status = if self.shared.always_full.load(Ordering::SeqCst) {
                resource_exhausted_status(format!("remote ({remote}) is full"))
            } else {
                match self.shared.local_bytes(&digest) {
                    Ok(bytes) => {
                        if !remote.is_empty() {
                            let mut remotes = self.shared.remotes.lock();
                            remotes.entry(remote.clone()).or_default().blobs.insert(digest.hash, bytes);
                        }
                        ok_status()
                    }
                    Err(e) => not_found_status(format!("blob {digest} not available locally: {e}")),
                }
            };

            responses.push(local_cas_pb::upload_missing_blobs_response::Response {
                digest: Some(proto_digest),
                status: Some(status),
            });
        }

        Ok(Response::new(local_cas_pb::UploadMissingBlobsResponse { responses }))
    }

    async fn fetch_tree(
        &self,
        request: Request<local_cas_pb::FetchTreeRequest>,
    ) -> Result<Response<local_cas_pb::FetchTreeResponse>, Status> {
        let request = request.into_inner();
        let root_digest = require_digest(request.root_digest.as_ref())
            .map_err(|e| Status::invalid_argument(format!("malformed digest: {e}")))?;

        let present = self.shared.fetch_tree_into_local(
            &root_digest,
            request.fetch_file_blobs,
            &request.excluded_subdirs,
            &request.remote_instance_name,
        );
        if present {
            Ok(Response::new(local_cas_pb::FetchTreeResponse {}))
        } else {
            Err(Status::not_found(format!("tree {root_digest} not available")))
        }
    }

    async fn upload_tree(
        &self,
        request: Request<local_cas_pb::UploadTreeRequest>,
    ) -> Result<Response<local_cas_pb::UploadTreeResponse>, Status> {
        let request = request.into_inner();
        let root_digest = require_digest(request.root_digest.as_ref())
            .map_err(|e| Status::invalid_argument(format!("malformed digest: {e}")))?;
        let remote = request.remote_instance_name;
        if remote.is_empty() {
            return Err(Status::invalid_argument("UploadTree requires a remote_instance_name"));
        }

        let mut stack = vec![root_digest];
        while let Some(dir_digest) = stack.pop() {
            let bytes = self
                .shared
                .local_bytes(&dir_digest)
                .map_err(|e| Status::not_found(format!("directory {dir_digest} not available: {e}")))?;
            self.shared
                .remotes
                .lock()
                .entry(remote.clone())
                .or_default()
                .blobs
                .insert(dir_digest.hash, bytes.clone());

            let directory = remexec::Directory::decode(bytes.as_ref())
                .map_err(|e| Status::internal(format!("corrupt directory proto: {e}")))?;
            for file in &directory.files {
                let file_digest = require_digest(file.digest.as_ref())
                    .map_err(|e| Status::internal(format!("malformed file digest: {e}")))?;
                let file_bytes = self
                    .shared
                    .local_bytes(&file_digest)
                    .map_err(|e| Status::not_found(format!("blob {file_digest} not available: {e}")))?;
                self.shared
                    .remotes
                    .lock()
                    .entry(remote.clone())
                    .or_default()
                    .blobs
                    .insert(file_digest.hash, file_bytes);
            }
            for subdir in &directory.directories {
                let subdir_digest = require_digest(subdir.digest.as_ref())
                    .map_err(|e| Status::internal(format!("malformed directory digest: {e}")))?;
                stack.push(subdir_digest);
            }
        }

        Ok(Response::new(local_cas_pb::UploadTreeResponse {}))
    }

    type StageTreeStream = ReceiverStream<Result<local_cas_pb::StageTreeResponse, Status>>;

    async fn stage_tree(
        &self,
        request: Request<Streaming<local_cas_pb::StageTreeRequest>>,
    ) -> Result<Response<Self::StageTreeStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("StageTree stream closed before any message"))?;
        let root_digest = require_digest(first.root_digest.as_ref())
            .map_err(|e| Status::invalid_argument(format!("malformed digest: {e}")))?;

        let staging_root = self.shared.cas_root.join("staging").join(uuid::Uuid::new_v4().to_string());
        self.shared.materialize(&staging_root, &root_digest)?;

        let (tx, rx) = mpsc::channel(1);
        tx.send(Ok(local_cas_pb::StageTreeResponse { path: staging_root.display().to_string() }))
            .await
            .map_err(|_| Status::internal("failed to send StageTree response"))?;

        tokio::spawn(async move {
            while let Ok(Some(message)) = inbound.message().await {
                if message.is_done {
                    break;
                }
            }
            let _ = tokio::fs::remove_dir_all(&staging_root).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn capture_tree(
        &self,
        request: Request<local_cas_pb::CaptureTreeRequest>,
    ) -> Result<Response<local_cas_pb::CaptureTreeResponse>, Status> {
        let request = request.into_inner();
        let mut responses = Vec::with_capacity(request.paths.len());

        for path in request.paths {
            let fs_path = PathBuf::from(&path);
            let response = match self.shared.capture_path(&fs_path, request.node_properties_mtime) {
                Ok(digest) => local_cas_pb::capture_tree_response::Response {
                    path,
                    root_digest: Some((&digest).into()),
                    status: Some(ok_status()),
                },
                Err(e) => local_cas_pb::capture_tree_response::Response {
                    path,
                    root_digest: None,
                    status: Some(not_found_status(e.to_string())),
                },
            };
            responses.push(response);
        }

        Ok(Response::new(local_cas_pb::CaptureTreeResponse { responses }))
    }

    async fn capture_files(
        &self,
        request: Request<local_cas_pb::CaptureFilesRequest>,
    ) -> Result<Response<local_cas_pb::CaptureFilesResponse>, Status> {
        let request = request.into_inner();
        let mut responses = Vec::with_capacity(request.paths.len());

        for path in request.paths {
            let fs_path = PathBuf::from(&path);
            let response = match self.shared.capture_file(&fs_path, false) {
                Ok((digest, is_executable)) => local_cas_pb::capture_files_response::Response {
                    path,
                    digest: Some((&digest).into()),
                    is_executable,
                    status: Some(ok_status()),
                },
                Err(e) => local_cas_pb::capture_files_response::Response {
                    path,
                    digest: None,
                    is_executable: false,
                    status: Some(not_found_status(e.to_string())),
                },
            };
            responses.push(response);
        }

        Ok(Response::new(local_cas_pb::CaptureFilesResponse { responses }))
    }

    async fn get_instance_name_for_remote(
        &self,
        _request: Request<local_cas_pb::GetInstanceNameForRemoteRequest>,
    ) -> Result<Response<local_cas_pb::GetInstanceNameForRemoteResponse>, Status> {
        Ok(Response::new(local_cas_pb::GetInstanceNameForRemoteResponse {
            instance_name: self.shared.register_remote(),
        }))
    }

    async fn get_instance_name_for_remotes(
        &self,
        _request: Request<local_cas_pb::GetInstanceNameForRemotesRequest>,
    ) -> Result<Response<local_cas_pb::GetInstanceNameForRemotesResponse>, Status> {
        Ok(Response::new(local_cas_pb::GetInstanceNameForRemotesResponse {
            instance_name: self.shared.register_remote(),
        }))
    }

    async fn get_local_disk_usage(
        &self,
        _request: Request<local_cas_pb::GetLocalDiskUsageRequest>,
    ) -> Result<Response<local_cas_pb::GetLocalDiskUsageResponse>, Status> {
        Ok(Response::new(local_cas_pb::GetLocalDiskUsageResponse {
            size_bytes: self.shared.used_bytes.load(Ordering::SeqCst),
            quota_bytes: self.shared.quota_bytes.load(Ordering::SeqCst),
        }))
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for DaemonService {
    async fn find_missing_blobs(
        &self,
        request: Request<remexec::FindMissingBlobsRequest>,
    ) -> Result<Response<remexec::FindMissingBlobsResponse>, Status> {
        let request = request.into_inner();
        let mut missing_blob_digests = Vec::new();
        for proto_digest in request.blob_digests {
            let digest = Digest::try_from(&proto_digest)
                .map_err(|e| Status::invalid_argument(format!("malformed digest: {e}")))?;
            if !self.shared.has_local(&digest) {
                missing_blob_digests.push(proto_digest);
            }
        }
        Ok(Response::new(remexec::FindMissingBlobsResponse { missing_blob_digests }))
    }

    async fn batch_update_blobs(
        &self,
        request: Request<remexec::BatchUpdateBlobsRequest>,
    ) -> Result<Response<remexec::BatchUpdateBlobsResponse>, Status> {
        let request = request.into_inner();
        let mut responses = Vec::with_capacity(request.requests.len());

        for item in request.requests {
            let digest = require_digest(item.digest.as_ref())
                .map_err(|e| Status::invalid_argument(format!("malformed digest: {e}")))?;
            let status = if self.shared.always_full.load(Ordering::SeqCst) {
                resource_exhausted_status("local cas is full".to_owned())
            } else {
                match self.shared.write_local(&digest, &item.data) {
                    Ok(()) => ok_status(),
                    Err(e) => RpcStatus { code: tonic::Code::Internal as i32, message: e.to_string() },
                }
            };
            responses.push(remexec::batch_update_blobs_response::Response {
                digest: item.digest,
                status: Some(status),
            });
        }

        Ok(Response::new(remexec::BatchUpdateBlobsResponse { responses }))
    }

    async fn batch_read_blobs(
        &self,
        request: Request<remexec::BatchReadBlobsRequest>,
    ) -> Result<Response<remexec::BatchReadBlobsResponse>, Status> {
        let request = request.into_inner();
        let mut responses = Vec::with_capacity(request.digests.len());

        for proto_digest in request.digests {
            let digest = Digest::try_from(&proto_digest)
                .map_err(|e| Status::invalid_argument(format!("malformed digest: {e}")))?;
            let (data, status) = match self.shared.local_bytes(&digest) {
                Ok(bytes) => (bytes, ok_status()),
                Err(e) => (Bytes::new(), not_found_status(e.to_string())),
            };
            responses.push(remexec::batch_read_blobs_response::Response {
                digest: Some(proto_digest),
                data,
                status: Some(status),
            });
        }

        Ok(Response::new(remexec::BatchReadBlobsResponse { responses }))
    }
}

/// A running mock daemon, listening on a private UNIX socket under its own temp directory. Drop
/// this to stop the server task and remove the socket's directory.
pub struct MockDaemon {
    socket_path: PathBuf,
    shared: Arc<Shared>,
    server_task: tokio::task::JoinHandle<()>,
    _temp_dir: tempfile::TempDir,
}

impl MockDaemon {
    /// Starts serving over a freshly allocated socket, backed by `cas_root` (which need not
    /// exist yet -- `objects/` is created under it lazily as blobs are written).
    pub async fn start(cas_root: PathBuf) -> MockDaemon {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir for mock daemon socket");
        let socket_path = temp_dir.path().join("mock-cas.sock");

        let shared = Arc::new(Shared {
            cas_root,
            remotes: Mutex::new(HashMap::new()),
            next_remote_id: Mutex::new(0),
            used_bytes: AtomicI64::new(0),
            quota_bytes: AtomicI64::new(0),
            always_full: AtomicBool::new(false),
        });

        let listener = UnixListener::bind(&socket_path).expect("failed to bind mock daemon socket");
        let incoming = UnixListenerStream::new(listener);
        let local_cas_service = DaemonService { shared: shared.clone() };
        let cas_service = DaemonService { shared: shared.clone() };

        let server_task = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(LocalContentAddressableStorageServer::new(local_cas_service))
                .add_service(ContentAddressableStorageServer::new(cas_service))
                .serve_with_incoming(incoming)
                .await;
        });

        // Give the listener a moment to start accepting; DaemonChannel also retries, but this
        // keeps tests that don't go through the retry loop from racing the bind.
        tokio::task::yield_now().await;

        MockDaemon { socket_path, shared, server_task, _temp_dir: temp_dir }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Builds a `casd::DaemonChannel` pointed at this daemon, as a test would receive from a
    /// real `DaemonSupervisor::spawn` + `monitor_health`.
    pub fn channel(&self) -> Arc<casd::DaemonChannel> {
        Arc::new(casd::DaemonChannel::new(
            self.socket_path.clone(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            64,
            http::HeaderMap::new(),
        ))
    }

    /// Pre-populates a registered remote's blob map, bypassing the wire protocol. `instance_name`
    /// is the value returned by a prior `LocalCas::register_remote` call against this daemon.
    pub fn seed_remote_blob(&self, instance_name: &str, bytes: Bytes) -> Digest {
        let digest = Digest::of_bytes(&bytes);
        self.shared
            .remotes
            .lock()
            .entry(instance_name.to_owned())
            .or_default()
            .blobs
            .insert(digest.hash, bytes);
        digest
    }

    /// Reports whether `digest` has been pushed into `instance_name`'s remote blob map.
    pub fn remote_has_blob(&self, instance_name: &str, digest: &Digest) -> bool {
        self.shared
            .remotes
            .lock()
            .get(instance_name)
            .is_some_and(|state| state.blobs.contains_key(&digest.hash))
    }

    /// Makes every subsequent `UploadMissingBlobs`/`BatchUpdateBlobs` call fail with
    /// `RESOURCE_EXHAUSTED`, simulating a full remote (spec.md's `CacheTooFull`).
    pub fn set_always_full(&self, full: bool) {
        self.shared.always_full.store(full, Ordering::SeqCst);
    }

    pub fn set_usage(&self, used_bytes: i64, quota_bytes: i64) {
        self.shared.used_bytes.store(used_bytes, Ordering::SeqCst);
        self.shared.quota_bytes.store(quota_bytes, Ordering::SeqCst);
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
