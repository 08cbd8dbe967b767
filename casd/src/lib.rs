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

pub mod channel;
pub mod config;
pub mod error;
pub mod supervisor;

pub use channel::DaemonChannel;
pub use config::{DaemonConfig, LogLevel, RemoteEndpoint, MIN_SUPPORTED_VERSION, N_LOG};
pub use error::DaemonError;
pub use supervisor::DaemonSupervisor;
