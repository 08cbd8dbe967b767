use std::path::{Path, PathBuf};

use hashing::Digest;

/// `digest(bytes) = (hex(sha256(bytes)), len(bytes))` (§4.1). A thin, explicitly-named wrapper
/// around `hashing::Digest::of_bytes` so call sites read the way the spec's component design
/// does, and so a proto-message overload (`digest(serialize(message))`) has one obvious home.
pub fn message_digest(bytes: &[u8]) -> Digest {
    Digest::of_bytes(bytes)
}

/// `objpath(d) = cas_root/objects/d.hash[0:2]/d.hash[2:]` (§4.1, §6). No I/O: this only computes
/// the path a blob *would* live at, whether or not it has been written yet.
pub fn objpath(cas_root: &Path, digest: &Digest) -> PathBuf {
    let hex = digest.hash.to_hex();
    cas_root
        .join("objects")
        .join(&hex[0..2])
        .join(&hex[2..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashing::Fingerprint;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn message_digest_matches_hash_and_length() {
        let digest = message_digest(b"hello");
        assert_eq!(digest.size_bytes, 5);
        assert_eq!(digest.hash.to_hex(), HELLO_SHA256);
    }

    #[test]
    fn objpath_splits_hash_prefix() {
        let fingerprint = Fingerprint::from_hex_string(HELLO_SHA256).unwrap();
        let digest = Digest::new(fingerprint, 5);
        let path = objpath(Path::new("/cas"), &digest);
        assert_eq!(
            path,
            Path::new("/cas/objects/2c").join(&HELLO_SHA256[2..])
        );
    }
}
