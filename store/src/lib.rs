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

pub mod error;
pub mod local_cas;
pub mod objpath;
pub mod usage_monitor;

pub use error::CacheError;
pub use local_cas::{CaptureProperties, LocalCas, ObjectSource, RemoteRef, StagedDirectory};
pub use objpath::{message_digest, objpath};
pub use usage_monitor::{Usage, UsageMonitor};
