#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_oncecell::OnceCell;
use async_trait::async_trait;
use bytes::Bytes;
use hashing::Digest;
use protos::pb::build::bazel::remote::execution::v2 as remexec;
use protos::pb::buildstream::Artifact;
use remexec::ServerCapabilities;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite};

/// Connection options shared by every remote provider kind (§4.6 "allocates but does not
/// open a channel" — `init()` is a separate, explicit step on the providers built from this).
#[derive(Clone)]
pub struct RemoteOptions {
    pub cas_address: String,
    pub instance_name: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub tls_config: grpc_util::tls::Config,
    pub chunk_size_bytes: usize,
    pub rpc_timeout: Duration,
    pub rpc_concurrency_limit: usize,
    pub capabilities_cell_opt: Option<Arc<OnceCell<ServerCapabilities>>>,
    /// Clamp applied to `max_batch_total_size_bytes` as advertised by the server (§4.6 step 3).
    pub batch_api_size_limit: usize,
}

/// Connection options for the index half of a remote spec: either an artifact-service or a
/// remote-asset endpoint (§4.8's `index_remotes`).
#[derive(Clone)]
pub struct RemoteIndexOptions {
    pub instance_name: Option<String>,
    pub index_address: String,
    pub tls_config: grpc_util::tls::Config,
    pub headers: BTreeMap<String, String>,
    pub concurrency_limit: usize,
    pub rpc_timeout: Duration,
}

#[async_trait]
pub trait ByteStoreProvider: Sync + Send + 'static {
    /// Confirms the server advertises the capabilities service and supports the batch CAS RPCs
    /// this provider relies on. Called once during Asset Cache Core setup (§4.8 step 2), same as
    /// `IndexProvider::check`/`RemoteAssetProvider::check`.
    async fn check(&self, require_push: bool) -> Result<(), String>;

    /// Store the bytes readable from `file` into the remote store.
    async fn store_file(&self, digest: Digest, file: File) -> Result<(), String>;

    /// Store `bytes` into the remote store, as an optimisation of `store_file` when the bytes
    /// are already in memory.
    async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String>;

    /// Load the data stored (if any) for `digest` into `destination`. `true` when found, `false`
    /// when not.
    async fn load(
        &self,
        digest: Digest,
        destination: &mut dyn LoadDestination,
    ) -> Result<bool, String>;

    /// Return any digests from `digests` that are not (currently) available in the remote store.
    async fn list_missing_digests(
        &self,
        digests: &mut (dyn Iterator<Item = Digest> + Send),
    ) -> Result<HashSet<Digest>, String>;

    /// Store several small blobs in as few wire requests as the provider's batch protocol
    /// allows (§4.7 Batch Engine `UpdateBatch`). The default loops over `store_bytes`; a
    /// provider backed by `BatchUpdateBlobs` overrides this to pack them into size-bounded
    /// requests instead.
    async fn store_bytes_batch(&self, items: Vec<(Digest, Bytes)>) -> Result<(), String> {
        for (digest, bytes) in items {
            self.store_bytes(digest, bytes).await?;
        }
        Ok(())
    }

    /// Load several small blobs in as few wire requests as the provider's batch protocol
    /// allows (§4.7 Batch Engine `ReadBatch`). Digests absent from the result were not found;
    /// callers that need `BlobNotFound` semantics check for missing keys themselves, matching
    /// §4.4 `fetch_blobs`'s `allow_partial` branch. The default loops over `load`.
    async fn load_batch(&self, digests: &[Digest]) -> Result<std::collections::HashMap<Digest, Bytes>, String> {
        let mut found = std::collections::HashMap::new();
        for digest in digests {
            let mut destination = Vec::with_capacity(digest.size_bytes);
            if self.load(*digest, &mut destination as &mut dyn LoadDestination).await? {
                found.insert(*digest, Bytes::from(destination));
            }
        }
        Ok(found)
    }
}

/// Places that write the result of a remote `load`.
#[async_trait]
pub trait LoadDestination: AsyncWrite + Send + Sync + Unpin + 'static {
    /// Clear out the writer and start again, if there's been previous contents written.
    async fn reset(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl LoadDestination for tokio::fs::File {
    async fn reset(&mut self) -> std::io::Result<()> {
        self.rewind().await?;
        self.set_len(0).await
    }
}

#[async_trait]
impl LoadDestination for Vec<u8> {
    async fn reset(&mut self) -> std::io::Result<()> {
        self.clear();
        Ok(())
    }
}

/// The artifact-service half of an index remote (§4.6 "Artifact-service subinterface",
/// §4.9's `get_artifact`/`update_artifact`). Pants' `ActionCacheProvider` caches a single
/// action result per digest; this cache caches an `Artifact` proto per string key, so the
/// trait is reshaped to match rather than renamed in place.
#[async_trait]
pub trait IndexProvider: Sync + Send + 'static {
    /// Confirms the server advertises artifact capabilities, and (if `require_push` is set)
    /// that it accepts updates. Called once during Asset Cache Core setup (§4.8 step 2).
    async fn check(&self, require_push: bool) -> Result<(), String>;

    /// Fetches the artifact proto stored under `cache_key`, or `None` on NOT_FOUND.
    async fn get_artifact(&self, cache_key: &str) -> Result<Option<Artifact>, String>;

    /// Publishes `artifact` under every key in `cache_keys` in one call (§4.9 step 2:
    /// "publish the proto under *every* key").
    async fn update_artifact(&self, cache_keys: &[String], artifact: Artifact) -> Result<(), String>;
}

/// The remote-asset half of an index remote (§4.6 "Remote-Asset subinterface", §4.10's
/// push/pull by URN).
#[async_trait]
pub trait RemoteAssetProvider: Sync + Send + 'static {
    async fn check(&self, require_push: bool) -> Result<(), String>;

    /// Resolves `uri` to the digest registered for it, or `None` on NOT_FOUND.
    async fn fetch_blob(&self, uri: &str) -> Result<Option<Digest>, String>;

    /// Resolves `uri` to a directory digest registered for it, or `None` on NOT_FOUND.
    async fn fetch_directory(&self, uri: &str) -> Result<Option<Digest>, String>;

    /// Associates `uri` with `digest`. `referenced_blobs`/`referenced_directories` are hints
    /// the server may use to extend their retention window.
    async fn push_blob(
        &self,
        uri: &str,
        digest: Digest,
        referenced_blobs: Vec<Digest>,
    ) -> Result<(), String>;

    async fn push_directory(
        &self,
        uri: &str,
        digest: Digest,
        referenced_directories: Vec<Digest>,
    ) -> Result<(), String>;
}
