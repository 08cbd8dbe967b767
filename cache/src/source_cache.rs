//! Source Cache (§4.10): maps an opaque source `ref` to a `urn:fdc:...:source:<ref>` remote-asset
//! URI, committing/pushing/pulling the `Source` proto (a single `files` directory digest) that
//! URI resolves to.
//!
//! Grounded on `_elementsourcescache.py`'s `ElementSourcesCache.push`/`pull`/`_push_source_blobs`/
//! `_push_source_proto`/`_pull_source_storage` — the variant of the two retrieved BuildStream
//! source caches that goes through a `Source` proto (rather than resolving the URN straight to a
//! files digest), matching spec.md §4.10's "fetch the proto blob, parse it, persist it atomically
//! ... then fetch its `files` directory subtree".

use std::path::PathBuf;

use log::{info, warn};
use prost::Message;
use protos::pb::buildstream::Source;
use remote_provider_traits::RemoteAssetProvider;
use store::{CaptureProperties, LocalCas, ObjectSource};

use crate::asset_cache_core::AssetCacheCore;
use crate::atomic_file::save_atomic;
use crate::blob_transfer::{fetch_blobs, fetch_directory, push_directory};
use crate::error::SourceCacheError;
use crate::ref_store::ref_path;

/// `<namespace>` and `<year>` in the Remote-Asset URN scheme (§6): build-system constants, not
/// configurable per spec.md's glossary entry for "Remote Asset".
const URN_NAMESPACE: &str = "buildstream.build";
const URN_YEAR: &str = "2020";

/// The public URI for `ref` (§4.10: `urn:fdc:<namespace>:<year>:source:<ref>`).
pub fn source_urn(source_ref: &str) -> String {
    format!("urn:fdc:{URN_NAMESPACE}:{URN_YEAR}:source:{source_ref}")
}

pub struct SourceCache {
    core: AssetCacheCore<dyn RemoteAssetProvider>,
    local_cas: LocalCas,
    source_root: PathBuf,
}

impl SourceCache {
    pub fn new(core: AssetCacheCore<dyn RemoteAssetProvider>, local_cas: LocalCas, source_root: PathBuf) -> Self {
        SourceCache { core, local_cas, source_root }
    }

    /// `contains(source)`: the ref file exists locally and its `files` directory is locally
    /// complete (no remote cache is consulted here — that's `LocalCas::contains_directory`'s
    /// job, which this delegates to directly).
    pub async fn contains(&self, source_ref: &str) -> Result<bool, SourceCacheError> {
        let path = ref_path(&self.source_root, source_ref);
        if !path.is_file() {
            return Ok(false);
        }
        let source = self.load_proto(source_ref).await?;
        let digest = protos::require_digest(source.files.as_ref()).map_err(SourceCacheError::new)?;
        Ok(self.local_cas.contains_directory(&digest, true).await?)
    }

    /// `commit(source)` (§4.10 "Committing a source"): `staged_path` is a filesystem tree the
    /// caller has already staged the source's files into (mirroring `_sourcecache.py`'s "stage
    /// to a tempdir, then import" path). The resulting directory digest is wrapped in a `Source`
    /// proto and persisted atomically at `<source-root>/<ref>`.
    pub async fn commit(&self, source_ref: &str, staged_path: &PathBuf) -> Result<(), SourceCacheError> {
        let digest = self
            .local_cas
            .import_directory(staged_path, CaptureProperties::default())
            .await?;
        let source = Source { files: Some((&digest).into()) };
        self.persist_proto(source_ref, &source).await
    }

    /// `export(source)`: the digest of the committed source's `files` tree.
    pub async fn export(&self, source_ref: &str) -> Result<hashing::Digest, SourceCacheError> {
        let source = self.load_proto(source_ref).await?;
        protos::require_digest(source.files.as_ref()).map_err(SourceCacheError::new)
    }

    async fn load_proto(&self, source_ref: &str) -> Result<Source, SourceCacheError> {
        let path = ref_path(&self.source_root, source_ref);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| SourceCacheError::new(format!("attempted to access unavailable source {source_ref}: {e}")))?;
        Source::decode(bytes.as_slice())
            .map_err(|e| SourceCacheError::new(format!("failed to parse source proto {source_ref}: {e}")))
    }

    async fn persist_proto(&self, source_ref: &str, source: &Source) -> Result<(), SourceCacheError> {
        let path = ref_path(&self.source_root, source_ref);
        save_atomic(&path, &source.encode_to_vec())
            .await
            .map_err(|e| SourceCacheError::new(format!("failed to persist source {source_ref}: {e}")))
    }

    /// `push(source) → bool` (§4.10). The display key is computed once and reused for every log
    /// line of this push — per spec.md §9's "Open question" ruling, `display_key()` is never
    /// invoked a second time as if it were a function.
    pub async fn push(&self, project: &str, display_key: &str, source_ref: &str) -> Result<bool, SourceCacheError> {
        let source = self.load_proto(source_ref).await?;
        let files_digest = protos::require_digest(source.files.as_ref()).map_err(SourceCacheError::new)?;
        let proto_bytes = source.encode_to_vec();
        let proto_digest = hashing::Digest::of_bytes(&proto_bytes);
        self.local_cas
            .add_objects(ObjectSource::Buffers(vec![proto_bytes.into()]))
            .await?;

        for remote in self.core.storage_remotes(project).iter().filter(|r| r.push()) {
            let provider = remote.provider.as_ref();
            match push_directory(&self.local_cas, provider, files_digest).await {
                Ok(true) => info!("Pushed data from source {display_key} -> {}", remote.spec.url),
                Ok(false) => info!("Remote ({}) already has all data of source {display_key} cached", remote.spec.url),
                Err(store::CacheError::CacheTooFull) => {
                    warn!("Remote ({}) is too full to accept source {display_key}", remote.spec.url);
                }
                Err(e) => return Err(SourceCacheError::new(format!("failed to push source blobs: {e}"))),
            }
        }

        let uri = source_urn(source_ref);
        let mut pushed = false;
        for remote in self.core.index_remotes(project).iter().filter(|r| r.push()) {
            let already_present = remote
                .provider
                .fetch_blob(&uri)
                .await
                .map_err(|e| SourceCacheError::new(format!("error checking source cache: {e}")))?
                == Some(proto_digest);

            if already_present {
                info!("Remote ({}) already has source {display_key} cached", remote.spec.url);
                continue;
            }

            remote
                .provider
                .push_blob(&uri, proto_digest, vec![files_digest])
                .await
                .map_err(|e| SourceCacheError::new(format!("failed to push source: {e}")))?;
            info!("Pushed source {display_key} -> {}", remote.spec.url);
            pushed = true;
        }

        Ok(pushed)
    }

    /// `pull(source) → bool` (§4.10).
    pub async fn pull(&self, project: &str, display_key: &str, source_ref: &str) -> Result<bool, SourceCacheError> {
        let uri = source_urn(source_ref);
        let mut errors = Vec::new();
        let mut proto_digest = None;

        for remote in self.core.index_remotes(project) {
            match remote.provider.fetch_blob(&uri).await {
                Ok(Some(digest)) => {
                    proto_digest = Some(digest);
                    break;
                }
                Ok(None) => {
                    info!("Remote ({}) does not have source {display_key} cached", remote.spec.url);
                }
                Err(e) => {
                    warn!("Could not pull from remote {}: {e}", remote.spec.url);
                    errors.push(format!("{}: {e}", remote.spec.url));
                }
            }
        }

        let proto_digest = match proto_digest {
            Some(digest) => digest,
            None if !errors.is_empty() => {
                return Err(SourceCacheError::with_remote_errors(format!("Failed to pull source {display_key}"), &errors))
            }
            None => return Ok(false),
        };

        let mut errors = Vec::new();
        for remote in self.core.storage_remotes(project) {
            let provider = remote.provider.as_ref();
            match self.pull_source_storage(source_ref, proto_digest, provider).await {
                Ok(()) => {
                    info!("Pulled source {display_key} <- {}", remote.spec.url);
                    return Ok(true);
                }
                Err(store::CacheError::BlobNotFound(hash)) => {
                    info!("Remote cas ({}) does not have blob {hash} cached", remote.spec.url);
                }
                Err(e) => {
                    warn!("Could not pull from remote {}: {e}", remote.spec.url);
                    errors.push(format!("{}: {e}", remote.spec.url));
                }
            }
        }

        if !errors.is_empty() {
            return Err(SourceCacheError::with_remote_errors(format!("Failed to pull source {display_key}"), &errors));
        }
        Ok(false)
    }

    async fn pull_source_storage(
        &self,
        source_ref: &str,
        proto_digest: hashing::Digest,
        provider: &dyn remote_provider_traits::ByteStoreProvider,
    ) -> Result<(), store::CacheError> {
        fetch_blobs(&self.local_cas, provider, std::slice::from_ref(&proto_digest)).await?;

        let path = store::objpath(self.local_cas.cas_root(), &proto_digest);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| store::CacheError::CASError(format!("failed to read {}: {e}", path.display())))?;
        let source = Source::decode(bytes.as_slice())
            .map_err(|e| store::CacheError::CASError(format!("failed to parse source proto: {e}")))?;

        let path = ref_path(&self.source_root, source_ref);
        save_atomic(&path, &source.encode_to_vec())
            .await
            .map_err(|e| store::CacheError::CASError(format!("failed to persist source {source_ref}: {e}")))?;

        let files_digest = protos::require_digest(source.files.as_ref()).map_err(store::CacheError::CASError)?;
        fetch_directory(&self.local_cas, provider, files_digest).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use testutil::{FakeRemoteAsset, MockDaemon};

    use crate::remote_spec::{RemoteKind, RemoteSpec};

    use super::*;

    const PROJECT: &str = "proj";

    async fn local_cas_over(cas_root: &std::path::Path) -> (MockDaemon, LocalCas) {
        let daemon = MockDaemon::start(cas_root.to_path_buf()).await;
        let local_cas = LocalCas::new(daemon.channel(), cas_root.to_path_buf(), None);
        (daemon, local_cas)
    }

    async fn core_with(remote_asset: Arc<FakeRemoteAsset>) -> AssetCacheCore<dyn RemoteAssetProvider> {
        let spec = RemoteSpec {
            url: "fake://remote-asset".to_owned(),
            push: true,
            instance_name: None,
            server_cert: None,
            client_cert: None,
            client_key: None,
            kind: RemoteKind::All,
        };
        let mut project_specs = HashMap::new();
        project_specs.insert(PROJECT.to_owned(), vec![spec]);

        AssetCacheCore::setup(
            &project_specs,
            {
                let remote_asset = remote_asset.clone();
                move |_spec| {
                    let remote_asset = remote_asset.clone();
                    async move { Ok(remote_asset as Arc<dyn RemoteAssetProvider>) }
                }
            },
            |_spec| async { unreachable!("source cache never asks for a ByteStoreProvider") },
            |_, _| {},
        )
        .await
    }

    #[test]
    fn source_urn_follows_the_fdc_scheme() {
        assert_eq!(source_urn("abc123"), "urn:fdc:buildstream.build:2020:source:abc123");
    }

    #[tokio::test]
    async fn commit_then_export_round_trips_files_digest() {
        let cas_dir = tempfile::tempdir().unwrap();
        let (_daemon, local_cas) = local_cas_over(cas_dir.path()).await;
        let source_root = tempfile::tempdir().unwrap();
        let remote_asset = Arc::new(FakeRemoteAsset::new());
        let cache = SourceCache::new(core_with(remote_asset).await, local_cas, source_root.path().to_path_buf());

        let staged = tempfile::tempdir().unwrap();
        std::fs::write(staged.path().join("src.txt"), b"source bytes").unwrap();
        cache.commit("myref", &staged.path().to_path_buf()).await.unwrap();

        assert!(cache.contains("myref").await.unwrap());
        let digest = cache.export("myref").await.unwrap();
        assert_eq!(digest.size_bytes > 0, true);
    }

    #[tokio::test]
    async fn push_then_pull_round_trips_through_remote_asset() {
        let push_cas_dir = tempfile::tempdir().unwrap();
        let (_push_daemon, push_local_cas) = local_cas_over(push_cas_dir.path()).await;
        let push_source_root = tempfile::tempdir().unwrap();
        let remote_asset = Arc::new(FakeRemoteAsset::new());
        let push_cache =
            SourceCache::new(core_with(remote_asset.clone()).await, push_local_cas.clone(), push_source_root.path().to_path_buf());

        let staged = tempfile::tempdir().unwrap();
        std::fs::write(staged.path().join("a.txt"), b"committed source").unwrap();
        push_cache.commit("srcref", &staged.path().to_path_buf()).await.unwrap();
        let files_digest = push_cache.export("srcref").await.unwrap();

        let pushed = push_cache.push(PROJECT, "disp", "srcref").await.unwrap();
        assert!(pushed);

        let pull_cas_dir = tempfile::tempdir().unwrap();
        let (_pull_daemon, pull_local_cas) = local_cas_over(pull_cas_dir.path()).await;
        let pull_source_root = tempfile::tempdir().unwrap();
        let pull_cache =
            SourceCache::new(core_with(remote_asset.clone()).await, pull_local_cas.clone(), pull_source_root.path().to_path_buf());

        let pulled = pull_cache.pull(PROJECT, "disp", "srcref").await.unwrap();
        assert!(pulled);
        assert!(pull_cache.contains("srcref").await.unwrap());
        assert_eq!(pull_cache.export("srcref").await.unwrap(), files_digest);
    }

    #[tokio::test]
    async fn push_is_a_no_op_second_time_once_index_already_has_it() {
        let cas_dir = tempfile::tempdir().unwrap();
        let (_daemon, local_cas) = local_cas_over(cas_dir.path()).await;
        let source_root = tempfile::tempdir().unwrap();
        let remote_asset = Arc::new(FakeRemoteAsset::new());
        let cache = SourceCache::new(core_with(remote_asset).await, local_cas, source_root.path().to_path_buf());

        let staged = tempfile::tempdir().unwrap();
        std::fs::write(staged.path().join("a.txt"), b"content").unwrap();
        cache.commit("dupe", &staged.path().to_path_buf()).await.unwrap();

        assert!(cache.push(PROJECT, "disp", "dupe").await.unwrap());
        assert!(!cache.push(PROJECT, "disp", "dupe").await.unwrap(), "second push should find the urn already mapped");
    }
}
