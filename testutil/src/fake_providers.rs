// In-memory stand-ins for the three `remote_provider_traits` traits (§4.6's index/storage
// remote split), used to exercise `cache`'s push/pull control flow without dialing a real gRPC
// remote. Error strings mirror `grpc_util::status_to_str`'s `"{Code:?}: {message:?}"` shape so
// callers that classify them (`blob_transfer::classify_provider_error`) see the same seam a real
// provider would produce.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use hashing::Digest;
use protos::pb::buildstream::Artifact;
use remote_provider_traits::{ByteStoreProvider, IndexProvider, LoadDestination, RemoteAssetProvider};

fn resource_exhausted(message: &str) -> String {
    format!("ResourceExhausted: {message:?}")
}

/// A remote storage endpoint (§4.6 "storage remote"): just a blob map, with an optional lever to
/// simulate a full remote (spec.md §7 `CacheTooFull`).
#[derive(Clone, Default)]
pub struct FakeByteStore {
    blobs: Arc<Mutex<HashMap<Digest, Bytes>>>,
    full: Arc<AtomicBool>,
}

impl FakeByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.lock().contains_key(digest)
    }

    pub fn seed(&self, bytes: Bytes) -> Digest {
        let digest = Digest::of_bytes(&bytes);
        self.blobs.lock().insert(digest, bytes);
        digest
    }
}

#[async_trait]
impl ByteStoreProvider for FakeByteStore {
    async fn check(&self, _require_push: bool) -> Result<(), String> {
        Ok(())
    }

    async fn store_file(&self, digest: Digest, mut file: tokio::fs::File) -> Result<(), String> {
        use tokio::io::AsyncReadExt;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await.map_err(|e| e.to_string())?;
        self.store_bytes(digest, Bytes::from(bytes)).await
    }

    async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        if self.full.load(Ordering::SeqCst) {
            return Err(resource_exhausted("fake remote is full"));
        }
        self.blobs.lock().insert(digest, bytes);
        Ok(())
    }

    async fn load(&self, digest: Digest, destination: &mut dyn LoadDestination) -> Result<bool, String> {
        let bytes = self.blobs.lock().get(&digest).cloned();
        match bytes {
            Some(bytes) => {
                destination.reset().await.map_err(|e| e.to_string())?;
                destination.write_all(&bytes).await.map_err(|e| e.to_string())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_missing_digests(
        &self,
        digests: &mut (dyn Iterator<Item = Digest> + Send),
    ) -> Result<HashSet<Digest>, String> {
        let blobs = self.blobs.lock();
        Ok(digests.filter(|digest| !blobs.contains_key(digest)).collect())
    }

    async fn store_bytes_batch(&self, items: Vec<(Digest, Bytes)>) -> Result<(), String> {
        if self.full.load(Ordering::SeqCst) {
            return Err(resource_exhausted("fake remote is full"));
        }
        let mut blobs = self.blobs.lock();
        for (digest, bytes) in items {
            blobs.insert(digest, bytes);
        }
        Ok(())
    }

    async fn load_batch(&self, digests: &[Digest]) -> Result<HashMap<Digest, Bytes>, String> {
        let blobs = self.blobs.lock();
        Ok(digests.iter().filter_map(|digest| blobs.get(digest).map(|b| (*digest, b.clone()))).collect())
    }
}

/// An index remote speaking the first-party Artifact service (§4.9).
#[derive(Clone, Default)]
pub struct FakeIndex {
    artifacts: Arc<Mutex<HashMap<String, Artifact>>>,
    allow_updates: Arc<AtomicBool>,
}

impl FakeIndex {
    pub fn new() -> Self {
        let index = Self::default();
        index.allow_updates.store(true, Ordering::SeqCst);
        index
    }

    pub fn set_allow_updates(&self, allow: bool) {
        self.allow_updates.store(allow, Ordering::SeqCst);
    }

    pub fn get(&self, cache_key: &str) -> Option<Artifact> {
        self.artifacts.lock().get(cache_key).cloned()
    }
}

#[async_trait]
impl IndexProvider for FakeIndex {
    async fn check(&self, require_push: bool) -> Result<(), String> {
        if require_push && !self.allow_updates.load(Ordering::SeqCst) {
            return Err("fake index does not accept updates".to_owned());
        }
        Ok(())
    }

    async fn get_artifact(&self, cache_key: &str) -> Result<Option<Artifact>, String> {
        Ok(self.artifacts.lock().get(cache_key).cloned())
    }

    async fn update_artifact(&self, cache_keys: &[String], artifact: Artifact) -> Result<(), String> {
        if !self.allow_updates.load(Ordering::SeqCst) {
            return Err("fake index does not accept updates".to_owned());
        }
        let mut artifacts = self.artifacts.lock();
        for cache_key in cache_keys {
            artifacts.insert(cache_key.clone(), artifact.clone());
        }
        Ok(())
    }
}

/// An index remote speaking Remote Asset (§4.10): URIs resolve to a digest, with an optional set
/// of "referenced" digests recorded alongside for inspection by tests.
#[derive(Clone, Default)]
pub struct FakeRemoteAsset {
    blobs: Arc<Mutex<HashMap<String, Digest>>>,
    directories: Arc<Mutex<HashMap<String, Digest>>>,
    allow_updates: Arc<AtomicBool>,
}

impl FakeRemoteAsset {
    pub fn new() -> Self {
        let asset = Self::default();
        asset.allow_updates.store(true, Ordering::SeqCst);
        asset
    }

    pub fn set_allow_updates(&self, allow: bool) {
        self.allow_updates.store(allow, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteAssetProvider for FakeRemoteAsset {
    async fn check(&self, require_push: bool) -> Result<(), String> {
        if require_push && !self.allow_updates.load(Ordering::SeqCst) {
            return Err("fake remote asset does not accept updates".to_owned());
        }
        Ok(())
    }

    async fn fetch_blob(&self, uri: &str) -> Result<Option<Digest>, String> {
        Ok(self.blobs.lock().get(uri).copied())
    }

    async fn fetch_directory(&self, uri: &str) -> Result<Option<Digest>, String> {
        Ok(self.directories.lock().get(uri).copied())
    }

    async fn push_blob(&self, uri: &str, digest: Digest, _referenced_blobs: Vec<Digest>) -> Result<(), String> {
        if !self.allow_updates.load(Ordering::SeqCst) {
            return Err("fake remote asset does not accept updates".to_owned());
        }
        self.blobs.lock().insert(uri.to_owned(), digest);
        Ok(())
    }

    async fn push_directory(
        &self,
        uri: &str,
        digest: Digest,
        _referenced_directories: Vec<Digest>,
    ) -> Result<(), String> {
        if !self.allow_updates.load(Ordering::SeqCst) {
            return Err("fake remote asset does not accept updates".to_owned());
        }
        self.directories.lock().insert(uri.to_owned(), digest);
        Ok(())
    }
}
