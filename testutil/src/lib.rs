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
// tonic-generated server trait impls below aren't held to the same bar.
#![allow(clippy::large_enum_variant, clippy::derive_partial_eq_without_eq)]

//! In-process test doubles for the CAS coordination core: a real tonic-served storage daemon
//! (`mock_daemon`) for exercising `store::LocalCas` over an actual UNIX socket, and in-memory
//! fakes of the three remote-provider traits (`fake_providers`) for exercising `cache`'s push/
//! pull control flow without a gRPC server on the other end.
//!
//! Grounded on `engine/testutil/mock/src/cas_service.rs`'s `StubCASResponder` (the in-memory
//! `blobs: Arc<Mutex<HashMap<Fingerprint, Bytes>>>` responder pattern), extended with the
//! daemon-only Local CAS surface that file has no analogue for.

pub mod fake_providers;
pub mod mock_daemon;

pub use fake_providers::{FakeByteStore, FakeIndex, FakeRemoteAsset};
pub use mock_daemon::MockDaemon;
