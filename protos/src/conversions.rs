// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::pb::build::bazel::remote::execution::v2 as remexec;

impl<'a> From<&'a hashing::Digest> for remexec::Digest {
    fn from(d: &'a hashing::Digest) -> Self {
        Self {
            hash: d.hash.to_hex(),
            size_bytes: d.size_bytes as i64,
        }
    }
}

impl From<hashing::Digest> for remexec::Digest {
    fn from(d: hashing::Digest) -> Self {
        Self {
            hash: d.hash.to_hex(),
            size_bytes: d.size_bytes as i64,
        }
    }
}

impl<'a> TryFrom<&'a remexec::Digest> for hashing::Digest {
    type Error = String;

    fn try_from(d: &remexec::Digest) -> Result<Self, Self::Error> {
        hashing::Fingerprint::from_hex_string(&d.hash)
            .map_err(|err| format!("Bad fingerprint in Digest {:?}: {:?}", &d.hash, err))
            .map(|fingerprint| hashing::Digest::new(fingerprint, d.size_bytes as usize))
    }
}

impl TryFrom<remexec::Digest> for hashing::Digest {
    type Error = String;

    fn try_from(d: remexec::Digest) -> Result<Self, Self::Error> {
        hashing::Digest::try_from(&d)
    }
}

///
/// Extracts a `hashing::Digest` from an optional protobuf `Digest` field, raising a protocol
/// violation error if it was unset. Every blob/directory reference on the wire is represented as
/// an `Option<Digest>` by prost regardless of whether the field is semantically required.
///
pub fn require_digest<'a, D: Into<Option<&'a remexec::Digest>>>(
    digest_opt: D,
) -> Result<hashing::Digest, String> {
    match digest_opt.into() {
        Some(digest) => hashing::Digest::try_from(digest),
        None => {
            Err("Protocol violation: Digest missing from a Remote Execution API protobuf.".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_round_trips_through_protobuf() {
        let original = hashing::Digest::of_bytes(b"round trip me");
        let wire: remexec::Digest = original.into();
        let recovered = hashing::Digest::try_from(&wire).unwrap();
        assert_eq!(original, recovered);
    }

    #[test]
    fn require_digest_rejects_missing_field() {
        let missing: Option<&remexec::Digest> = None;
        assert!(require_digest(missing).is_err());
    }

    #[test]
    fn require_digest_rejects_malformed_hash() {
        let bad = remexec::Digest {
            hash: "not-hex".to_owned(),
            size_bytes: 0,
        };
        assert!(require_digest(Some(&bad)).is_err());
    }
}
