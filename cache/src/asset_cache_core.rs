//! Asset Cache Core (§4.8): collects, deduplicates, instantiates, and preflights the index and
//! storage remotes for every project, shared by `ArtifactCache` and `SourceCache`.
//!
//! Grounded on `process_execution/remote/src/remote_cache.rs`'s `choose_provider` idiom for the
//! "given a spec, build the right provider" step, re-cast here as a caller-supplied factory
//! closure instead of a hardcoded URL-scheme match, since this crate has no opinion on how an
//! index remote's wire protocol is chosen — that's `cas_util`'s job.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use remote_provider_traits::ByteStoreProvider;

use crate::error::AssetCacheError;
use crate::remote_spec::{dedupe_specs, RemoteSpec};

/// A remote paired with the spec that produced it, so callers can inspect `push`/`instance_name`
/// without re-deriving them from the provider object.
pub struct Remote<P: ?Sized> {
    pub spec: RemoteSpec,
    pub provider: Arc<P>,
}

impl<P: ?Sized> Remote<P> {
    pub fn push(&self) -> bool {
        self.spec.push
    }
}

/// Per-project lists of live index and storage remotes, plus the derived `has_fetch_remotes`/
/// `has_push_remotes` flags (§4.8). `I` is whichever index trait this core was built for —
/// `remote_provider_traits::IndexProvider` for the artifact cache, `RemoteAssetProvider` for the
/// source cache — the bookkeeping here doesn't care which.
pub struct AssetCacheCore<I: ?Sized> {
    index_remotes: HashMap<String, Vec<Remote<I>>>,
    storage_remotes: HashMap<String, Vec<Remote<dyn ByteStoreProvider>>>,
}

impl<I: ?Sized + Send + Sync + 'static> AssetCacheCore<I> {
    pub fn index_remotes(&self, project: &str) -> &[Remote<I>] {
        self.index_remotes.get(project).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn storage_remotes(&self, project: &str) -> &[Remote<dyn ByteStoreProvider>] {
        self.storage_remotes.get(project).map(Vec::as_slice).unwrap_or_default()
    }

    /// `has_fetch_remotes = ∃storage ∧ ∃index` (§4.8).
    pub fn has_fetch_remotes(&self, project: &str) -> bool {
        !self.storage_remotes(project).is_empty() && !self.index_remotes(project).is_empty()
    }

    /// `has_push_remotes = ∃storage with push ∧ ∃index with push` (§4.8).
    pub fn has_push_remotes(&self, project: &str) -> bool {
        self.storage_remotes(project).iter().any(Remote::push) && self.index_remotes(project).iter().any(Remote::push)
    }

    /// Builds a core from per-project spec lists (§4.8 "setup"): deduplicates specs across every
    /// project (so a remote shared by two projects is only dialed and checked once), instantiates
    /// an index remote for every spec with `kind ∈ {Index, All}` and a storage remote for every
    /// spec with `kind ∈ {Storage, All}`, and drops any spec whose factory returns an error after
    /// reporting it through `on_failure`. Factories are expected to run their own `check()` call
    /// (the §4.6 capability probe) before returning `Ok`, so a spec that connects but fails its
    /// probe is expected to surface as an `Err` here too.
    pub async fn setup<FI, FutI, FS, FutS>(
        project_specs: &HashMap<String, Vec<RemoteSpec>>,
        make_index: FI,
        make_storage: FS,
        mut on_failure: impl FnMut(&RemoteSpec, &AssetCacheError),
    ) -> Self
    where
        FI: Fn(RemoteSpec) -> FutI,
        FutI: Future<Output = Result<Arc<I>, AssetCacheError>>,
        FS: Fn(RemoteSpec) -> FutS,
        FutS: Future<Output = Result<Arc<dyn ByteStoreProvider>, AssetCacheError>>,
    {
        let mut unique = Vec::new();
        for specs in project_specs.values() {
            unique.extend(specs.iter().cloned());
        }
        let unique = dedupe_specs(unique);

        let mut index_survivors: HashMap<RemoteSpec, Arc<I>> = HashMap::new();
        let mut storage_survivors: HashMap<RemoteSpec, Arc<dyn ByteStoreProvider>> = HashMap::new();

        for spec in &unique {
            if spec.is_index() {
                match make_index(spec.clone()).await {
                    Ok(provider) => {
                        index_survivors.insert(spec.clone(), provider);
                    }
                    Err(err) => on_failure(spec, &err),
                }
            }
            if spec.is_storage() {
                match make_storage(spec.clone()).await {
                    Ok(provider) => {
                        storage_survivors.insert(spec.clone(), provider);
                    }
                    Err(err) => on_failure(spec, &err),
                }
            }
        }

        let mut index_remotes = HashMap::new();
        let mut storage_remotes = HashMap::new();
        for (project, specs) in project_specs {
            let mut idx = Vec::new();
            let mut sto = Vec::new();
            for spec in specs {
                if let Some(provider) = index_survivors.get(spec) {
                    idx.push(Remote { spec: spec.clone(), provider: provider.clone() });
                }
                if let Some(provider) = storage_survivors.get(spec) {
                    sto.push(Remote { spec: spec.clone(), provider: provider.clone() });
                }
            }
            index_remotes.insert(project.clone(), idx);
            storage_remotes.insert(project.clone(), sto);
        }

        AssetCacheCore { index_remotes, storage_remotes }
    }
}
