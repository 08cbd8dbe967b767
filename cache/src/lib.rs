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

mod atomic_file;
mod blob_transfer;
mod ref_store;

pub mod artifact_cache;
pub mod asset_cache_core;
pub mod error;
pub mod remote_spec;
pub mod source_cache;

pub use artifact_cache::ArtifactCache;
pub use asset_cache_core::{AssetCacheCore, Remote};
pub use error::{ArtifactCacheError, AssetCacheError, SourceCacheError};
pub use remote_spec::{RemoteKind, RemoteSpec, SpecSources};
pub use source_cache::{source_urn, SourceCache};
