use blake3;
use std::hash::{Hash, Hasher};

/// Feeds `std::hash::Hash` output into blake3 so that anything hashable
/// gets a stable content digest.
struct Blake3Writer<'a>(&'a mut blake3::Hasher);

impl<'a> Hasher for Blake3Writer<'a> {
    fn finish(&self) -> u64 {
        unreachable!("digests are read through blake3::Hasher::finalize")
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Hex digest of a build spec together with the version it is built for.
pub fn spec_digest<T: Hash>(spec: &T, version: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    spec.hash(&mut Blake3Writer(&mut hasher));
    version.hash(&mut Blake3Writer(&mut hasher));
    hasher.finalize().to_hex().to_string()
}
