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
// tonic-generated code is not held to the same lint bar as the rest of the workspace.
#![allow(clippy::large_enum_variant, clippy::derive_partial_eq_without_eq)]

pub mod conversions;

/// Generated protobuf/gRPC bindings, namespaced the same way their `.proto` packages are.
pub mod pb {
    pub mod google {
        pub mod rpc {
            tonic::include_proto!("google.rpc");
        }
        pub mod bytestream {
            tonic::include_proto!("google.bytestream");
        }
    }

    pub mod build {
        pub mod bazel {
            pub mod remote {
                pub mod execution {
                    pub mod v2 {
                        tonic::include_proto!("build.bazel.remote.execution.v2");
                    }
                }
                pub mod asset {
                    pub mod v1 {
                        tonic::include_proto!("build.bazel.remote.asset.v1");
                    }
                }
            }
        }

        pub mod buildgrid {
            tonic::include_proto!("build.buildgrid");
        }
    }

    pub mod buildstream {
        tonic::include_proto!("buildstream");
    }
}

pub use conversions::require_digest;

/// The digest of the empty byte string, as a protobuf `Digest`. Useful as a sentinel for
/// "no buildtree/public_data/logs were set" without wrapping every optional digest field in
/// `Option`.
pub fn empty_digest() -> pb::build::bazel::remote::execution::v2::Digest {
    (&hashing::EMPTY_DIGEST).into()
}
