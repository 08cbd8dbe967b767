// The typed client of the daemon's Local CAS / CAS v2 / ByteStream services (§4.4), plus the
// filesystem materialization (`checkout`) that has no daemon-side equivalent because the daemon
// and this process share the same `cas-root` on disk.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::Stream;
use futures::TryStreamExt;
use prost::Message;
use tonic::Request;

use casd::DaemonChannel;
use hashing::Digest;
use protos::pb::build::bazel::remote::execution::v2 as remexec;
use protos::pb::build::buildgrid as local_cas_pb;
use protos::require_digest;

use crate::error::CacheError;
use crate::objpath::objpath;

/// Maximum digests per `FetchMissingBlobs`/`UploadMissingBlobs` subrequest to the daemon (§4.4,
/// §6). Also used, slightly conservatively, as the chunk size for `BatchUpdateBlobs` writes.
pub const FETCH_MISSING_BATCH_SIZE: usize = 512;

/// Identifies an upstream remote the daemon already knows about, by the instance name it
/// returned from `GetInstanceNameForRemote` (§4.6 step 5). Local CAS operations thread this
/// through as `Option<&RemoteRef>` rather than a bare boolean, per §9's "two-layer remote model"
/// guidance to "pass a remote descriptor into each operation that may need to consult it".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteRef {
    pub instance_name: String,
}

impl RemoteRef {
    fn instance_name_of(remote: Option<&RemoteRef>) -> String {
        remote.map(|r| r.instance_name.clone()).unwrap_or_default()
    }
}

/// What to capture alongside file content when importing a filesystem tree (§4.4
/// `import_directory`).
#[derive(Clone, Copy, Debug, Default)]
pub struct CaptureProperties {
    pub mtime: bool,
}

/// The source of blobs for `add_objects`: either paths to capture from disk, or buffers already
/// held in memory (§4.4: "`add_objects(paths | buffers)`").
pub enum ObjectSource {
    Paths(Vec<PathBuf>),
    Buffers(Vec<Bytes>),
}

/// A directory materialized by the daemon at a scoped path via `StageTree` (§4.4
/// `stage_directory`). Call `finish` when done with `path()`; the daemon cleans up the staging
/// location once it sees the stream's completion message.
pub struct StagedDirectory {
    path: String,
    done_tx: Option<tokio::sync::mpsc::Sender<local_cas_pb::StageTreeRequest>>,
}

impl StagedDirectory {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Signals the daemon that this staging session is over. Safe to call at most once;
    /// dropping a `StagedDirectory` without calling `finish` closes the request stream abruptly,
    /// which the daemon should treat the same way it treats any other unexpected stream end.
    pub async fn finish(mut self) -> Result<(), CacheError> {
        if let Some(tx) = self.done_tx.take() {
            let _ = tx
                .send(local_cas_pb::StageTreeRequest {
                    instance_name: String::new(),
                    root_digest: None,
                    uid: 0,
                    is_done: true,
                })
                .await;
        }
        Ok(())
    }
}

/// The Local CAS (§4.4): a handle to the daemon's storage, plus the `objpath` helpers of §4.1.
/// Cheaply `Clone`-able; every clone shares the same underlying channel.
#[derive(Clone)]
pub struct LocalCas {
    channel: Arc<DaemonChannel>,
    cas_root: PathBuf,
    /// The instance name this process identifies itself as to the daemon; empty in every
    /// deployment this crate has been used in so far, but threaded through explicitly rather
    /// than hardcoded so a multi-tenant daemon could be supported later.
    instance_name: String,
    /// The daemon's own configured upstream remote, if `casd::DaemonConfig::cas_remote` was set
    /// (§9 "two-layer remote model"). Used as the fallback route whenever an operation is not
    /// given a more specific `RemoteRef`.
    default_remote: Option<RemoteRef>,
}

impl LocalCas {
    pub fn new(channel: Arc<DaemonChannel>, cas_root: PathBuf, default_remote: Option<RemoteRef>) -> Self {
        Self {
            channel,
            cas_root,
            instance_name: String::new(),
            default_remote,
        }
    }

    pub fn cas_root(&self) -> &Path {
        &self.cas_root
    }

    fn objpath(&self, digest: &Digest) -> PathBuf {
        objpath(&self.cas_root, digest)
    }

    fn has_remote_cache(&self) -> bool {
        self.default_remote.is_some()
    }

    /// `None` always means "purely local" (§4.4: `missing_blobs`'s "empty for purely local"); it
    /// is never silently replaced by the daemon's configured `default_remote`. Callers that want
    /// the default remote consulted pass it explicitly.
    fn resolve_remote(&self, remote: Option<&RemoteRef>) -> Option<RemoteRef> {
        remote.cloned()
    }

    /// Registers an upstream with the daemon via `GetInstanceNameForRemote` (§4.6 step 5),
    /// returning a `RemoteRef` that later calls can pass explicitly to route through it.
    pub async fn register_remote(
        &self,
        url: &str,
        server_cert: Option<Vec<u8>>,
        client_cert: Option<Vec<u8>>,
        client_key: Option<Vec<u8>>,
    ) -> Result<RemoteRef, CacheError> {
        let request = local_cas_pb::GetInstanceNameForRemoteRequest {
            url: url.to_owned(),
            instance_name: String::new(),
            server_cert: server_cert.unwrap_or_default().into(),
            client_cert: client_cert.unwrap_or_default().into(),
            client_key: client_key.unwrap_or_default().into(),
        };
        let response = self
            .channel
            .local_cas()
            .await?
            .get_instance_name_for_remote(Request::new(request))
            .await
            .map_err(|status| crate::error::status_to_cache_error(&status))?
            .into_inner();
        Ok(RemoteRef {
            instance_name: response.instance_name,
        })
    }

    /// `contains_files(digests) → bool` (§4.4).
    pub async fn contains_files(&self, digests: &[Digest]) -> Result<bool, CacheError> {
        Ok(self.missing_blobs(digests, None).await?.is_empty())
    }

    /// `contains_directory(root_digest, with_files) → bool` (§4.4).
    pub async fn contains_directory(&self, root_digest: &Digest, with_files: bool) -> Result<bool, CacheError> {
        if !self.fetch_tree_present(root_digest, false, &[]).await? {
            return Ok(false);
        }
        if !with_files {
            return Ok(true);
        }

        let digests: Vec<Digest> = self
            .required_blobs_for_directory(root_digest.clone(), Vec::new())
            .try_collect()
            .await?;

        if !self.has_remote_cache() {
            for digest in &digests {
                if !Path::new(&self.objpath(digest)).exists() {
                    return Ok(false);
                }
            }
            Ok(true)
        } else {
            Ok(self.missing_blobs(&digests, None).await?.is_empty())
        }
    }

    /// `import_directory(fs_path, properties?) → Digest` (§4.4).
    pub async fn import_directory(
        &self,
        fs_path: &Path,
        properties: CaptureProperties,
    ) -> Result<Digest, CacheError> {
        let request = local_cas_pb::CaptureTreeRequest {
            instance_name: self.instance_name.clone(),
            paths: vec![fs_path.display().to_string()],
            bypass_local_cache: false,
            node_properties_mtime: properties.mtime,
        };
        let response = self
            .channel
            .local_cas()
            .await?
            .capture_tree(Request::new(request))
            .await
            .map_err(|status| crate::error::status_to_cache_error(&status))?
            .into_inner();

        let entry = response.responses.into_iter().next().ok_or_else(|| {
            CacheError::CASError("CaptureTree returned no response for the requested path".to_owned())
        })?;
        if let Some(status) = &entry.status {
            if status.code != 0 {
                return Err(status_proto_to_cache_error(status));
            }
        }
        require_digest(entry.root_digest.as_ref()).map_err(CacheError::CASError)
    }

    /// `add_objects(paths | buffers) → [Digest]` (§4.4).
    pub async fn add_objects(&self, source: ObjectSource) -> Result<Vec<Digest>, CacheError> {
        match source {
            ObjectSource::Paths(paths) => self.add_objects_from_paths(paths).await,
            ObjectSource::Buffers(buffers) => self.add_objects_from_buffers(buffers).await,
        }
    }

    async fn add_objects_from_paths(&self, paths: Vec<PathBuf>) -> Result<Vec<Digest>, CacheError> {
        let request = local_cas_pb::CaptureFilesRequest {
            instance_name: self.instance_name.clone(),
            paths: paths.iter().map(|p| p.display().to_string()).collect(),
            bypass_local_cache: false,
        };
        let response = self
            .channel
            .local_cas()
            .await?
            .capture_files(Request::new(request))
            .await
            .map_err(|status| crate::error::status_to_cache_error(&status))?
            .into_inner();

        response
            .responses
            .into_iter()
            .map(|entry| {
                if let Some(status) = &entry.status {
                    if status.code != 0 {
                        return Err(status_proto_to_cache_error(status));
                    }
                }
                require_digest(entry.digest.as_ref()).map_err(CacheError::CASError)
            })
            .collect()
    }

    async fn add_objects_from_buffers(&self, buffers: Vec<Bytes>) -> Result<Vec<Digest>, CacheError> {
        let digests: Vec<Digest> = buffers.iter().map(|b| Digest::of_bytes(b)).collect();
        let requests: Vec<remexec::batch_update_blobs_request::Request> = digests
            .iter()
            .cloned()
            .zip(buffers)
            .map(|(digest, data)| remexec::batch_update_blobs_request::Request {
                digest: Some(digest.into()),
                data,
            })
            .collect();

        for chunk in requests.chunks(FETCH_MISSING_BATCH_SIZE) {
            let request = remexec::BatchUpdateBlobsRequest {
                instance_name: self.instance_name.clone(),
                requests: chunk.to_vec(),
            };
            let response = self
                .channel
                .cas()
                .await?
                .batch_update_blobs(Request::new(request))
                .await
                .map_err(|status| crate::error::status_to_cache_error(&status))?
                .into_inner();
            for item in response.responses {
                if let Some(status) = &item.status {
                    if status.code != 0 {
                        return Err(status_proto_to_cache_error(status));
                    }
                }
            }
        }
        Ok(digests)
    }

    /// `checkout(dest, root_digest, can_link)` (§4.4).
    pub async fn checkout(&self, dest: &Path, root_digest: &Digest, can_link: bool) -> Result<(), CacheError> {
        if self.has_remote_cache() {
            let digests: Vec<Digest> = self
                .required_blobs_for_directory(root_digest.clone(), Vec::new())
                .try_collect()
                .await?;
            self.fetch_blobs(self.default_remote.as_ref(), &digests, false).await?;
        }
        self.materialize_directory(dest, root_digest, can_link).await
    }

    fn materialize_directory<'a>(
        &'a self,
        dest: &'a Path,
        digest: &'a Digest,
        can_link: bool,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            std::fs::create_dir_all(dest)
                .map_err(|e| CacheError::CASError(format!("failed to create {}: {e}", dest.display())))?;

            let directory = self.read_directory_proto(digest)?;

            for file in &directory.files {
                let file_digest = require_digest(file.digest.as_ref()).map_err(CacheError::CASError)?;
                let src_path = self.objpath(&file_digest);
                let dest_path = dest.join(&file.name);
                let mtime_override = file.node_properties.as_ref().map(|p| p.mtime).filter(|m| *m != 0);

                if can_link && mtime_override.is_none() {
                    if std::fs::hard_link(&src_path, &dest_path).is_err() {
                        std::fs::copy(&src_path, &dest_path).map_err(|e| {
                            CacheError::CASError(format!("failed to copy {}: {e}", src_path.display()))
                        })?;
                    }
                } else {
                    std::fs::copy(&src_path, &dest_path)
                        .map_err(|e| CacheError::CASError(format!("failed to copy {}: {e}", src_path.display())))?;
                }

                if file.is_executable {
                    use std::os::unix::fs::PermissionsExt;
                    let metadata = std::fs::metadata(&dest_path)
                        .map_err(|e| CacheError::CASError(format!("failed to stat {}: {e}", dest_path.display())))?;
                    let mut perms = metadata.permissions();
                    let mode = perms.mode();
                    perms.set_mode(mode | ((mode & 0o444) >> 2));
                    std::fs::set_permissions(&dest_path, perms).map_err(|e| {
                        CacheError::CASError(format!("failed to chmod {}: {e}", dest_path.display()))
                    })?;
                }

                if let Some(mtime) = mtime_override {
                    let modified = std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime.max(0) as u64);
                    let file = std::fs::File::options()
                        .write(true)
                        .open(&dest_path)
                        .map_err(|e| CacheError::CASError(format!("failed to reopen {}: {e}", dest_path.display())))?;
                    file.set_modified(modified).map_err(|e| {
                        CacheError::CASError(format!("failed to set mtime on {}: {e}", dest_path.display()))
                    })?;
                }
            }

            for symlink in &directory.symlinks {
                let dest_path = dest.join(&symlink.name);
                std::os::unix::fs::symlink(&symlink.target, &dest_path).map_err(|e| {
                    CacheError::CASError(format!("failed to symlink {}: {e}", dest_path.display()))
                })?;
            }

            for subdir in &directory.directories {
                let subdir_digest = require_digest(subdir.digest.as_ref()).map_err(CacheError::CASError)?;
                self.materialize_directory(&dest.join(&subdir.name), &subdir_digest, can_link)
                    .await?;
            }

            Ok(())
        })
    }

    /// `stage_directory(digest) → scoped path` (§4.4).
    pub async fn stage_directory(&self, root_digest: &Digest) -> Result<StagedDirectory, CacheError> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let uid = unsafe { libc::getuid() };
        tx.send(local_cas_pb::StageTreeRequest {
            instance_name: self.instance_name.clone(),
            root_digest: Some(root_digest.clone().into()),
            uid,
            is_done: false,
        })
        .await
        .map_err(|_| CacheError::CASError("failed to start StageTree stream".to_owned()))?;

        let outbound = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut response_stream = self
            .channel
            .local_cas()
            .await?
            .stage_tree(Request::new(outbound))
            .await
            .map_err(|status| crate::error::status_to_cache_error(&status))?
            .into_inner();

        let first = response_stream
            .message()
            .await
            .map_err(|status| crate::error::status_to_cache_error(&status))?
            .ok_or_else(|| CacheError::CASError("StageTree stream ended before a path was returned".to_owned()))?;

        Ok(StagedDirectory {
            path: first.path,
            done_tx: Some(tx),
        })
    }

    /// `required_blobs_for_directory(root_digest, excluded_subdirs?) → lazy sequence of Digest`
    /// (§4.4). Yields the root directory's own digest first, then file digests, recursing into
    /// every subdirectory whose name is not in `excluded_subdirs` (P3).
    pub fn required_blobs_for_directory(
        &self,
        root_digest: Digest,
        excluded_subdirs: Vec<String>,
    ) -> Pin<Box<dyn Stream<Item = Result<Digest, CacheError>> + Send + '_>> {
        Box::pin(async_stream::try_stream! {
            self.fetch_tree(&root_digest, false, &excluded_subdirs).await?;

            let mut stack = vec![root_digest];
            while let Some(dir_digest) = stack.pop() {
                yield dir_digest.clone();
                let directory = self.read_directory_proto(&dir_digest)?;
                for file in &directory.files {
                    yield require_digest(file.digest.as_ref()).map_err(CacheError::CASError)?;
                }
                for subdir in &directory.directories {
                    if excluded_subdirs.iter().any(|excluded| excluded == &subdir.name) {
                        continue;
                    }
                    stack.push(require_digest(subdir.digest.as_ref()).map_err(CacheError::CASError)?);
                }
            }
        })
    }

    /// `missing_blobs(digests, remote?) → [Digest]` (§4.4).
    pub async fn missing_blobs(
        &self,
        digests: &[Digest],
        remote: Option<&RemoteRef>,
    ) -> Result<Vec<Digest>, CacheError> {
        let remote_instance_name = RemoteRef::instance_name_of(self.resolve_remote(remote).as_ref());
        let mut missing = Vec::new();
        for chunk in digests.chunks(FETCH_MISSING_BATCH_SIZE) {
            let response = self.fetch_missing_chunk(chunk, &remote_instance_name).await?;
            for item in response.responses {
                let is_present = item.status.as_ref().map(|s| s.code == 0).unwrap_or(true);
                if !is_present {
                    missing.push(require_digest(item.digest.as_ref()).map_err(CacheError::CASError)?);
                }
            }
        }
        Ok(missing)
    }

    /// `fetch_blobs(remote, digests, allow_partial) → [Digest]` (§4.4).
    ///
    /// The local-presence check is deliberately a separate, remote-less `missing_blobs` call:
    /// `FetchMissingBlobs` fetches as a side effect of reporting presence whenever it's given a
    /// remote, so checking against the requested remote first would silently pull blobs in
    /// during the "check" and leave them out of the digests this function reports as fetched.
    pub async fn fetch_blobs(
        &self,
        remote: Option<&RemoteRef>,
        digests: &[Digest],
        allow_partial: bool,
    ) -> Result<Vec<Digest>, CacheError> {
        let resolved = self.resolve_remote(remote);
        let missing = self.missing_blobs(digests, None).await?;
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let remote_instance_name = RemoteRef::instance_name_of(resolved.as_ref());
        let mut fetched = Vec::new();
        for chunk in missing.chunks(FETCH_MISSING_BATCH_SIZE) {
            let response = self.fetch_missing_chunk(chunk, &remote_instance_name).await?;
            for item in response.responses {
                let digest = require_digest(item.digest.as_ref()).map_err(CacheError::CASError)?;
                let code = item.status.as_ref().map(|s| s.code).unwrap_or(0);
                if code == 0 {
                    fetched.push(digest);
                } else if code == tonic::Code::NotFound as i32 {
                    if !allow_partial {
                        return Err(CacheError::BlobNotFound(digest.hash));
                    }
                } else {
                    return Err(CacheError::CASError(format!(
                        "fetch failed for {digest}: {}",
                        item.status.map(|s| s.message).unwrap_or_default()
                    )));
                }
            }
        }

        // Direct remote-to-remote transfer is unavailable, so anything just pulled from an
        // explicitly-selected remote is re-uploaded into the daemon's own configured remote
        // cache, unless that *is* the remote we just fetched from (§4.4).
        if let Some(default_remote) = &self.default_remote {
            if resolved.as_ref() != Some(default_remote) && !fetched.is_empty() {
                self.send_blobs(Some(default_remote), &fetched).await?;
            }
        }

        Ok(fetched)
    }

    /// `send_blobs(remote, digests)` (§4.4): the inverse of `fetch_blobs`.
    pub async fn send_blobs(&self, remote: Option<&RemoteRef>, digests: &[Digest]) -> Result<(), CacheError> {
        if let Some(default_remote) = self.default_remote.clone() {
            let missing_locally = self.missing_blobs(digests, None).await?;
            if !missing_locally.is_empty() {
                self.fetch_blobs(Some(&default_remote), &missing_locally, false).await?;
            }
        }

        let resolved = self.resolve_remote(remote);
        let remote_instance_name = RemoteRef::instance_name_of(resolved.as_ref());
        for chunk in digests.chunks(FETCH_MISSING_BATCH_SIZE) {
            let request = local_cas_pb::UploadMissingBlobsRequest {
                instance_name: self.instance_name.clone(),
                remote_instance_name: remote_instance_name.clone(),
                blob_digests: chunk.iter().cloned().map(Into::into).collect(),
            };
            let response = self
                .channel
                .local_cas()
                .await?
                .upload_missing_blobs(Request::new(request))
                .await
                .map_err(|status| crate::error::status_to_cache_error(&status))?
                .into_inner();
            for item in response.responses {
                if let Some(status) = &item.status {
                    if status.code != 0 {
                        return Err(status_proto_to_cache_error(status));
                    }
                }
            }
        }
        Ok(())
    }

    async fn fetch_missing_chunk(
        &self,
        chunk: &[Digest],
        remote_instance_name: &str,
    ) -> Result<local_cas_pb::FetchMissingBlobsResponse, CacheError> {
        let request = local_cas_pb::FetchMissingBlobsRequest {
            instance_name: self.instance_name.clone(),
            remote_instance_name: remote_instance_name.to_owned(),
            blob_digests: chunk.iter().cloned().map(Into::into).collect(),
        };
        Ok(self
            .channel
            .local_cas()
            .await?
            .fetch_missing_blobs(Request::new(request))
            .await
            .map_err(|status| crate::error::status_to_cache_error(&status))?
            .into_inner())
    }

    async fn fetch_tree_present(
        &self,
        root_digest: &Digest,
        fetch_file_blobs: bool,
        excluded_subdirs: &[String],
    ) -> Result<bool, CacheError> {
        let request = local_cas_pb::FetchTreeRequest {
            instance_name: self.instance_name.clone(),
            remote_instance_name: RemoteRef::instance_name_of(self.default_remote.as_ref()),
            root_digest: Some(root_digest.clone().into()),
            fetch_file_blobs,
            excluded_subdirs: excluded_subdirs.to_vec(),
        };
        match self
            .channel
            .local_cas()
            .await?
            .fetch_tree(Request::new(request))
            .await
        {
            Ok(_) => Ok(true),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(false),
            Err(status) => Err(crate::error::status_to_cache_error(&status)),
        }
    }

    async fn fetch_tree(
        &self,
        root_digest: &Digest,
        fetch_file_blobs: bool,
        excluded_subdirs: &[String],
    ) -> Result<(), CacheError> {
        if !self
            .fetch_tree_present(root_digest, fetch_file_blobs, excluded_subdirs)
            .await?
        {
            return Err(CacheError::BlobNotFound(root_digest.hash.clone()));
        }
        Ok(())
    }

    fn read_directory_proto(&self, digest: &Digest) -> Result<remexec::Directory, CacheError> {
        let path = self.objpath(digest);
        let bytes = std::fs::read(&path)
            .map_err(|e| CacheError::CASError(format!("failed to read directory proto at {}: {e}", path.display())))?;
        remexec::Directory::decode(bytes.as_slice())
            .map_err(|e| CacheError::CASError(format!("failed to parse directory proto at {}: {e}", path.display())))
    }
}

fn status_proto_to_cache_error(status: &protos::pb::google::rpc::Status) -> CacheError {
    match tonic::Code::from_i32(status.code) {
        tonic::Code::ResourceExhausted => CacheError::CacheTooFull,
        tonic::Code::Unimplemented => CacheError::DaemonUnsupported(status.message.clone()),
        _ => CacheError::CASError(status.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use bytes::Bytes;

    use testutil::MockDaemon;

    use super::*;

    async fn local_cas(daemon: &MockDaemon, cas_root: &Path) -> LocalCas {
        LocalCas::new(daemon.channel(), cas_root.to_path_buf(), None)
    }

    #[tokio::test]
    async fn add_objects_from_buffers_round_trips_through_contains_files() {
        let cas_dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(cas_dir.path().to_path_buf()).await;
        let cas = local_cas(&daemon, cas_dir.path()).await;

        let digests = cas
            .add_objects(ObjectSource::Buffers(vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]))
            .await
            .unwrap();
        assert_eq!(digests.len(), 2);
        assert!(cas.contains_files(&digests).await.unwrap());
    }

    #[tokio::test]
    async fn contains_files_is_false_for_unknown_digest() {
        let cas_dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(cas_dir.path().to_path_buf()).await;
        let cas = local_cas(&daemon, cas_dir.path()).await;

        let unseen = Digest::of_bytes(b"never written");
        assert!(!cas.contains_files(&[unseen]).await.unwrap());
    }

    #[tokio::test]
    async fn import_directory_then_checkout_round_trips_tree_shape() {
        let cas_dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(cas_dir.path().to_path_buf()).await;
        let cas = local_cas(&daemon, cas_dir.path()).await;

        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir(src_dir.path().join("sub")).unwrap();
        std::fs::write(src_dir.path().join("sub").join("b.txt"), b"beta").unwrap();
        std::os::unix::fs::symlink("a.txt", src_dir.path().join("link")).unwrap();
        let mut perms = std::fs::metadata(src_dir.path().join("a.txt")).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(src_dir.path().join("a.txt"), perms).unwrap();

        let root_digest = cas
            .import_directory(src_dir.path(), CaptureProperties::default())
            .await
            .unwrap();

        let dest_dir = tempfile::tempdir().unwrap();
        cas.checkout(dest_dir.path(), &root_digest, false).await.unwrap();

        assert_eq!(std::fs::read(dest_dir.path().join("a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(dest_dir.path().join("sub").join("b.txt")).unwrap(), b"beta");
        assert_eq!(std::fs::read_link(dest_dir.path().join("link")).unwrap(), Path::new("a.txt"));

        let mode = std::fs::metadata(dest_dir.path().join("a.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "executable bit should survive checkout");
    }

    #[tokio::test]
    async fn required_blobs_for_directory_skips_excluded_subdirs() {
        let cas_dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(cas_dir.path().to_path_buf()).await;
        let cas = local_cas(&daemon, cas_dir.path()).await;

        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("top.txt"), b"top").unwrap();
        std::fs::create_dir(src_dir.path().join("keep")).unwrap();
        std::fs::write(src_dir.path().join("keep").join("k.txt"), b"keep").unwrap();
        std::fs::create_dir(src_dir.path().join("skip")).unwrap();
        std::fs::write(src_dir.path().join("skip").join("s.txt"), b"skip").unwrap();

        let root_digest = cas
            .import_directory(src_dir.path(), CaptureProperties::default())
            .await
            .unwrap();

        let digests: Vec<Digest> = cas
            .required_blobs_for_directory(root_digest, vec!["skip".to_owned()])
            .try_collect()
            .await
            .unwrap();

        let skip_digest = Digest::of_bytes(b"skip");
        assert!(!digests.contains(&skip_digest));
        let keep_digest = Digest::of_bytes(b"keep");
        assert!(digests.contains(&keep_digest));
    }

    #[tokio::test]
    async fn fetch_blobs_pulls_from_registered_remote_and_allows_partial() {
        let cas_dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(cas_dir.path().to_path_buf()).await;
        let cas = local_cas(&daemon, cas_dir.path()).await;

        let remote = cas.register_remote("grpc://example.invalid", None, None, None).await.unwrap();
        let present_digest = daemon.seed_remote_blob(&remote.instance_name, Bytes::from_static(b"present"));
        let absent_digest = Digest::of_bytes(b"absent, never seeded");

        let fetched = cas
            .fetch_blobs(Some(&remote), &[present_digest, absent_digest], true)
            .await
            .unwrap();
        assert_eq!(fetched, vec![present_digest]);
        assert!(cas.contains_files(&[present_digest]).await.unwrap());
    }

    #[tokio::test]
    async fn fetch_blobs_errors_on_missing_blob_unless_partial_allowed() {
        let cas_dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(cas_dir.path().to_path_buf()).await;
        let cas = local_cas(&daemon, cas_dir.path()).await;

        let remote = cas.register_remote("grpc://example.invalid", None, None, None).await.unwrap();
        let absent_digest = Digest::of_bytes(b"absent, never seeded");

        let err = cas
            .fetch_blobs(Some(&remote), &[absent_digest], false)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::BlobNotFound(hash) if hash == absent_digest.hash));
    }

    #[tokio::test]
    async fn send_blobs_surfaces_cache_too_full() {
        let cas_dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(cas_dir.path().to_path_buf()).await;
        let cas = local_cas(&daemon, cas_dir.path()).await;

        let remote = cas.register_remote("grpc://example.invalid", None, None, None).await.unwrap();
        let digests = cas
            .add_objects(ObjectSource::Buffers(vec![Bytes::from_static(b"too big for this remote")]))
            .await
            .unwrap();

        daemon.set_always_full(true);
        let err = cas.send_blobs(Some(&remote), &digests).await.unwrap_err();
        assert!(matches!(err, CacheError::CacheTooFull));
    }

    #[tokio::test]
    async fn stage_directory_materializes_then_cleans_up_on_finish() {
        let cas_dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(cas_dir.path().to_path_buf()).await;
        let cas = local_cas(&daemon, cas_dir.path()).await;

        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("f.txt"), b"staged").unwrap();
        let root_digest = cas
            .import_directory(src_dir.path(), CaptureProperties::default())
            .await
            .unwrap();

        let staged = cas.stage_directory(&root_digest).await.unwrap();
        let staged_path = PathBuf::from(staged.path());
        assert_eq!(std::fs::read(staged_path.join("f.txt")).unwrap(), b"staged");

        staged.finish().await.unwrap();
        // The daemon removes the staging directory asynchronously after seeing `is_done`; give
        // its background task a moment to run before checking.
        for _ in 0..50 {
            if !staged_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!staged_path.exists());
    }

    #[tokio::test]
    async fn contains_directory_without_files_ignores_missing_blobs() {
        let cas_dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(cas_dir.path().to_path_buf()).await;
        let cas = local_cas(&daemon, cas_dir.path()).await;

        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("f.txt"), b"content").unwrap();
        let root_digest = cas
            .import_directory(src_dir.path(), CaptureProperties::default())
            .await
            .unwrap();

        assert!(cas.contains_directory(&root_digest, false).await.unwrap());
        assert!(cas.contains_directory(&root_digest, true).await.unwrap());

        let unknown_root = Digest::of_bytes(b"not a real directory blob");
        assert!(!cas.contains_directory(&unknown_root, false).await.unwrap());
    }
}
