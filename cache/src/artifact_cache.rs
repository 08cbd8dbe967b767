//! Artifact Cache (§4.9): maps an element's cache key to a named ref under `artifact-root`, and
//! pushes/pulls the blobs an `Artifact` proto references.
//!
//! Grounded on `_artifactcache.py`'s `ArtifactCache.push`/`pull`/`list_artifacts`/`link_key`. Per
//! that file's own `get_artifact` docstring ("this 'key' is actually the ref/name"), a ref and the
//! wire `cache_key` are the same opaque string here — callers compute it externally (§4.9's "an
//! opaque filesystem-safe string produced externally by the element object") and this type never
//! parses it beyond treating it as a relative path under `artifact-root`.

use std::path::PathBuf;

use log::{info, warn};
use prost::Message;
use protos::pb::buildstream::Artifact;
use remote_provider_traits::IndexProvider;
use store::LocalCas;

use crate::asset_cache_core::AssetCacheCore;
use crate::atomic_file::save_atomic;
use crate::blob_transfer::{fetch_blobs, fetch_directory, push_blobs, push_directory};
use crate::error::ArtifactCacheError;
use crate::ref_store::{dedupe_refs, list_refs_by_mtime, prune_empty_parents, ref_path};

pub struct ArtifactCache {
    core: AssetCacheCore<dyn IndexProvider>,
    local_cas: LocalCas,
    artifact_root: PathBuf,
}

impl ArtifactCache {
    pub fn new(core: AssetCacheCore<dyn IndexProvider>, local_cas: LocalCas, artifact_root: PathBuf) -> Self {
        ArtifactCache { core, local_cas, artifact_root }
    }

    /// `contains()`.
    pub fn contains(&self, ref_name: &str) -> bool {
        ref_path(&self.artifact_root, ref_name).is_file()
    }

    /// `update_mtime()`.
    pub fn update_mtime(&self, ref_name: &str) -> Result<(), ArtifactCacheError> {
        let path = ref_path(&self.artifact_root, ref_name);
        let file = std::fs::File::options()
            .write(true)
            .open(&path)
            .map_err(|e| ArtifactCacheError::new(format!("couldn't find artifact {ref_name}: {e}")))?;
        file.set_modified(std::time::SystemTime::now())
            .map_err(|e| ArtifactCacheError::new(format!("couldn't touch artifact {ref_name}: {e}")))
    }

    /// `remove()`: deletes the ref file, then prunes now-empty parent directories up to (but not
    /// including) `artifact-root` (§4.9).
    pub fn remove(&self, ref_name: &str) -> Result<(), ArtifactCacheError> {
        let path = ref_path(&self.artifact_root, ref_name);
        std::fs::remove_file(&path)
            .map_err(|e| ArtifactCacheError::new(format!("couldn't remove artifact {ref_name}: {e}")))?;
        prune_empty_parents(&path, &self.artifact_root);
        Ok(())
    }

    /// `list_artifacts(glob?)`: LRU order (P5).
    pub fn list_artifacts(&self, glob: Option<&str>) -> Result<Vec<String>, ArtifactCacheError> {
        list_refs_by_mtime(&self.artifact_root, glob).map_err(|e| ArtifactCacheError::new(e.to_string()))
    }

    /// `link_key(old, new)`: hard-links the proto file under a new ref name, a no-op if the new
    /// name already exists (§4.9, R3).
    pub fn link_key(&self, old_ref: &str, new_ref: &str) -> Result<(), ArtifactCacheError> {
        let new_path = ref_path(&self.artifact_root, new_ref);
        if new_path.exists() {
            return Ok(());
        }
        if let Some(dir) = new_path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| ArtifactCacheError::new(format!("couldn't create {}: {e}", dir.display())))?;
        }
        std::fs::hard_link(ref_path(&self.artifact_root, old_ref), &new_path)
            .map_err(|e| ArtifactCacheError::new(format!("couldn't link {old_ref} -> {new_ref}: {e}")))
    }

    /// `push(element, artifact) → bool` (§4.9). `refs` are the ref names the caller has already
    /// derived for the artifact's strong and weak keys (deduplicated on entry).
    pub async fn push(
        &self,
        project: &str,
        display_key: &str,
        artifact: &Artifact,
        refs: &[String],
    ) -> Result<bool, ArtifactCacheError> {
        let refs = dedupe_refs(refs);

        for remote in self.core.storage_remotes(project).iter().filter(|r| r.push()) {
            let provider = remote.provider.as_ref();
            match self.push_artifact_blobs(artifact, provider).await {
                Ok(true) => info!("Pushed data from artifact {display_key} -> {}", remote.spec.url),
                Ok(false) => info!("Remote ({}) already has all data of artifact {display_key} cached", remote.spec.url),
                Err(store::CacheError::CacheTooFull) => {
                    warn!("Remote ({}) is too full to accept artifact {display_key}", remote.spec.url);
                }
                Err(e) => return Err(ArtifactCacheError::new(format!("failed to push artifact blobs: {e}"))),
            }
        }

        let mut pushed = false;
        for remote in self.core.index_remotes(project).iter().filter(|r| r.push()) {
            let already_present = {
                let mut found = false;
                for ref_name in &refs {
                    match remote.provider.get_artifact(ref_name).await {
                        Ok(Some(_)) => {
                            found = true;
                            break;
                        }
                        Ok(None) => continue,
                        Err(e) => return Err(ArtifactCacheError::new(format!("error checking artifact cache: {e}"))),
                    }
                }
                found
            };

            if already_present {
                info!("Remote ({}) already has artifact {display_key} cached", remote.spec.url);
                continue;
            }

            remote
                .provider
                .update_artifact(&refs, artifact.clone())
                .await
                .map_err(|e| ArtifactCacheError::new(format!("failed to push artifact: {e}")))?;
            info!("Pushed artifact {display_key} -> {}", remote.spec.url);
            pushed = true;
        }

        Ok(pushed)
    }

    async fn push_artifact_blobs(
        &self,
        artifact: &Artifact,
        provider: &dyn remote_provider_traits::ByteStoreProvider,
    ) -> Result<bool, store::CacheError> {
        let mut uploaded = false;

        if let Some(files) = artifact.files.clone() {
            let digest = protos::require_digest(Some(&files)).map_err(store::CacheError::CASError)?;
            uploaded |= push_directory(&self.local_cas, provider, digest).await?;
        }

        if let Some(buildtree) = artifact.buildtree.clone() {
            let digest = protos::require_digest(Some(&buildtree)).map_err(store::CacheError::CASError)?;
            match push_directory(&self.local_cas, provider, digest).await {
                Ok(did) => uploaded |= did,
                // A missing local buildtree is routine (§4.9 step 1(b)): not every artifact
                // retains one.
                Err(store::CacheError::CASError(msg)) if msg.contains("No such file or directory") => {}
                Err(e) => return Err(e),
            }
        }

        let mut digests = Vec::new();
        if let Some(public_data) = &artifact.public_data {
            digests.push(protos::require_digest(Some(public_data)).map_err(store::CacheError::CASError)?);
        }
        for log in &artifact.logs {
            digests.push(protos::require_digest(Some(log)).map_err(store::CacheError::CASError)?);
        }
        uploaded |= push_blobs(&self.local_cas, provider, &digests).await?;

        Ok(uploaded)
    }

    /// `pull(element, key, pull_buildtrees) → bool` (§4.9).
    pub async fn pull(
        &self,
        project: &str,
        display_key: &str,
        ref_name: &str,
        pull_buildtrees: bool,
    ) -> Result<bool, ArtifactCacheError> {
        let mut errors = Vec::new();
        let mut artifact = None;

        for remote in self.core.index_remotes(project) {
            match remote.provider.get_artifact(ref_name).await {
                Ok(Some(found)) => {
                    artifact = Some(found);
                    break;
                }
                Ok(None) => {
                    info!("Remote ({}) does not have artifact {display_key} cached", remote.spec.url);
                }
                Err(e) => {
                    warn!("Could not pull from remote {}: {e}", remote.spec.url);
                    errors.push(format!("{}: {e}", remote.spec.url));
                }
            }
        }

        let artifact = match artifact {
            Some(artifact) => artifact,
            None if !errors.is_empty() => {
                return Err(ArtifactCacheError::with_remote_errors(
                    format!("Failed to pull artifact {display_key}"),
                    &errors,
                ))
            }
            None => return Ok(false),
        };

        let mut errors = Vec::new();
        for remote in self.core.storage_remotes(project) {
            let provider = remote.provider.as_ref();
            match self.pull_artifact_storage(&artifact, provider, pull_buildtrees).await {
                Ok(()) => {
                    info!("Pulled artifact {display_key} <- {}", remote.spec.url);
                    self.persist_proto(ref_name, &artifact).await?;
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
            return Err(ArtifactCacheError::with_remote_errors(format!("Failed to pull artifact {display_key}"), &errors));
        }
        Ok(false)
    }

    async fn pull_artifact_storage(
        &self,
        artifact: &Artifact,
        provider: &dyn remote_provider_traits::ByteStoreProvider,
        pull_buildtrees: bool,
    ) -> Result<(), store::CacheError> {
        if let Some(files) = &artifact.files {
            let digest = protos::require_digest(Some(files)).map_err(store::CacheError::CASError)?;
            fetch_directory(&self.local_cas, provider, digest).await?;
        }

        if pull_buildtrees {
            if let Some(buildtree) = &artifact.buildtree {
                let digest = protos::require_digest(Some(buildtree)).map_err(store::CacheError::CASError)?;
                fetch_directory(&self.local_cas, provider, digest).await?;
            }
        }

        let mut digests = Vec::new();
        if let Some(public_data) = &artifact.public_data {
            digests.push(protos::require_digest(Some(public_data)).map_err(store::CacheError::CASError)?);
        }
        for log in &artifact.logs {
            digests.push(protos::require_digest(Some(log)).map_err(store::CacheError::CASError)?);
        }
        fetch_blobs(&self.local_cas, provider, &digests).await
    }

    async fn persist_proto(&self, ref_name: &str, artifact: &Artifact) -> Result<(), ArtifactCacheError> {
        let path = ref_path(&self.artifact_root, ref_name);
        save_atomic(&path, &artifact.encode_to_vec())
            .await
            .map_err(|e| ArtifactCacheError::new(format!("failed to persist artifact {ref_name}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use remote_provider_traits::ByteStoreProvider;
    use testutil::{FakeByteStore, FakeIndex, MockDaemon};

    use crate::remote_spec::{RemoteKind, RemoteSpec};

    use super::*;

    const PROJECT: &str = "proj";

    async fn local_cas_over(cas_root: &std::path::Path) -> (MockDaemon, LocalCas) {
        let daemon = MockDaemon::start(cas_root.to_path_buf()).await;
        let local_cas = LocalCas::new(daemon.channel(), cas_root.to_path_buf(), None);
        (daemon, local_cas)
    }

    async fn core_with(
        index_remotes: Vec<(&str, Arc<FakeIndex>, bool)>,
        storage_remotes: Vec<(&str, Arc<FakeByteStore>, bool)>,
    ) -> AssetCacheCore<dyn IndexProvider> {
        let mut specs = Vec::new();
        let mut index_map: HashMap<String, Arc<dyn IndexProvider>> = HashMap::new();
        for (url, provider, push) in index_remotes {
            specs.push(RemoteSpec {
                url: url.to_owned(),
                push,
                instance_name: None,
                server_cert: None,
                client_cert: None,
                client_key: None,
                kind: RemoteKind::Index,
            });
            index_map.insert(url.to_owned(), provider);
        }
        let mut storage_map: HashMap<String, Arc<dyn ByteStoreProvider>> = HashMap::new();
        for (url, provider, push) in storage_remotes {
            specs.push(RemoteSpec {
                url: url.to_owned(),
                push,
                instance_name: None,
                server_cert: None,
                client_cert: None,
                client_key: None,
                kind: RemoteKind::Storage,
            });
            storage_map.insert(url.to_owned(), provider);
        }
        let mut project_specs = HashMap::new();
        project_specs.insert(PROJECT.to_owned(), specs);

        let index_map = Arc::new(index_map);
        let storage_map = Arc::new(storage_map);
        AssetCacheCore::setup(
            &project_specs,
            move |spec| {
                let index_map = index_map.clone();
                async move { Ok(index_map.get(&spec.url).cloned().expect("unknown index spec in test")) }
            },
            move |spec| {
                let storage_map = storage_map.clone();
                async move { Ok(storage_map.get(&spec.url).cloned().expect("unknown storage spec in test")) }
            },
            |_, _| {},
        )
        .await
    }

    async fn sample_artifact(local_cas: &LocalCas, ref_name: &str) -> Artifact {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("out.txt"), ref_name.as_bytes()).unwrap();
        let files_digest = local_cas
            .import_directory(src.path(), store::CaptureProperties::default())
            .await
            .unwrap();
        Artifact {
            files: Some((&files_digest).into()),
            buildtree: None,
            public_data: None,
            logs: vec![],
            strong_key: ref_name.to_owned(),
            weak_key: ref_name.to_owned(),
        }
    }

    #[tokio::test]
    async fn push_then_pull_round_trips_through_index_and_storage() {
        let push_cas_dir = tempfile::tempdir().unwrap();
        let (_push_daemon, push_local_cas) = local_cas_over(push_cas_dir.path()).await;

        let fake_index = Arc::new(FakeIndex::new());
        let fake_storage = Arc::new(FakeByteStore::new());
        let push_core = core_with(
            vec![("fake://index", fake_index.clone(), true)],
            vec![("fake://storage", fake_storage.clone(), true)],
        )
        .await;

        let artifact_root = tempfile::tempdir().unwrap();
        let push_cache = ArtifactCache::new(push_core, push_local_cas.clone(), artifact_root.path().to_path_buf());

        let artifact = sample_artifact(&push_local_cas, "strongref").await;
        let pushed = push_cache
            .push(PROJECT, "disp", &artifact, &["strongref".to_owned()])
            .await
            .unwrap();
        assert!(pushed);
        assert!(fake_index.get("strongref").is_some());

        let files_digest = protos::require_digest(artifact.files.as_ref()).unwrap();
        assert!(fake_storage.contains(&files_digest));

        // A second process with an empty local CAS, sharing only the two remotes above.
        let pull_cas_dir = tempfile::tempdir().unwrap();
        let (_pull_daemon, pull_local_cas) = local_cas_over(pull_cas_dir.path()).await;
        let pull_core = core_with(
            vec![("fake://index", fake_index.clone(), true)],
            vec![("fake://storage", fake_storage.clone(), true)],
        )
        .await;
        let pull_artifact_root = tempfile::tempdir().unwrap();
        let pull_cache = ArtifactCache::new(pull_core, pull_local_cas.clone(), pull_artifact_root.path().to_path_buf());

        let pulled = pull_cache.pull(PROJECT, "disp", "strongref", false).await.unwrap();
        assert!(pulled);
        assert!(pull_cache.contains("strongref"));
        assert!(pull_local_cas.contains_directory(&files_digest, true).await.unwrap());
    }

    #[tokio::test]
    async fn push_swallows_cache_too_full_from_storage_but_still_updates_index() {
        let cas_dir = tempfile::tempdir().unwrap();
        let (_daemon, local_cas) = local_cas_over(cas_dir.path()).await;

        let fake_index = Arc::new(FakeIndex::new());
        let fake_storage = Arc::new(FakeByteStore::new());
        fake_storage.set_full(true);
        let core = core_with(
            vec![("fake://index", fake_index.clone(), true)],
            vec![("fake://storage", fake_storage.clone(), true)],
        )
        .await;

        let artifact_root = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(core, local_cas.clone(), artifact_root.path().to_path_buf());
        let artifact = sample_artifact(&local_cas, "weakref").await;

        let pushed = cache
            .push(PROJECT, "disp", &artifact, &["weakref".to_owned()])
            .await
            .unwrap();
        assert!(pushed, "index update should still succeed even though the only storage remote is full");
        assert!(fake_index.get("weakref").is_some());
    }

    #[tokio::test]
    async fn pull_falls_through_storage_remotes_on_blob_not_found() {
        let push_cas_dir = tempfile::tempdir().unwrap();
        let (_push_daemon, push_local_cas) = local_cas_over(push_cas_dir.path()).await;

        let fake_index = Arc::new(FakeIndex::new());
        let empty_storage = Arc::new(FakeByteStore::new());
        let populated_storage = Arc::new(FakeByteStore::new());

        // Push only goes to the populated remote -- the empty one is wired up but never given
        // this artifact's blobs, simulating a remote that's reachable but simply doesn't have it.
        let push_core = core_with(
            vec![("fake://index", fake_index.clone(), true)],
            vec![("fake://populated", populated_storage.clone(), true)],
        )
        .await;
        let artifact_root = tempfile::tempdir().unwrap();
        let push_cache = ArtifactCache::new(push_core, push_local_cas.clone(), artifact_root.path().to_path_buf());
        let artifact = sample_artifact(&push_local_cas, "fallthrough-ref").await;
        push_cache
            .push(PROJECT, "disp", &artifact, &["fallthrough-ref".to_owned()])
            .await
            .unwrap();

        let pull_cas_dir = tempfile::tempdir().unwrap();
        let (_pull_daemon, pull_local_cas) = local_cas_over(pull_cas_dir.path()).await;
        let pull_core = core_with(
            vec![("fake://index", fake_index.clone(), true)],
            vec![
                ("fake://empty", empty_storage.clone(), true),
                ("fake://populated", populated_storage.clone(), true),
            ],
        )
        .await;
        let pull_artifact_root = tempfile::tempdir().unwrap();
        let pull_cache = ArtifactCache::new(pull_core, pull_local_cas.clone(), pull_artifact_root.path().to_path_buf());

        let pulled = pull_cache.pull(PROJECT, "disp", "fallthrough-ref", false).await.unwrap();
        assert!(pulled, "pull should fall through the empty remote to the populated one");
    }

    #[tokio::test]
    async fn link_key_hard_links_and_is_idempotent_for_existing_target() {
        let cas_dir = tempfile::tempdir().unwrap();
        let (_daemon, local_cas) = local_cas_over(cas_dir.path()).await;
        let root = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(core_with(vec![], vec![]).await, local_cas, root.path().to_path_buf());

        std::fs::write(root.path().join("strong"), b"artifact bytes").unwrap();
        cache.link_key("strong", "weak").unwrap();
        assert_eq!(std::fs::read(root.path().join("weak")).unwrap(), b"artifact bytes");

        // Linking again once "weak" already exists is a no-op, not an error.
        cache.link_key("strong", "weak").unwrap();
    }
}
