use std::hash::Hash;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `tsumiki`, this serves two primary purposes:
/// 1. It is the fingerprint behind every asset id and request identity, so
///    identical inputs across builds always land on the same node.
/// 2. It records file contents, which lets an incremental rebuild skip files
///    whose bytes did not actually change.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    /// Fingerprint any `Hash` value through BLAKE3.
    pub fn of(value: &impl Hash) -> Self {
        let mut hasher = Blake3Hasher::default();
        value.hash(&mut hasher);
        hasher.into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// First 16 hex characters, enough to tell nodes apart in logs.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(16);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// The mode the assets are being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Fast, unoptimized output.
    #[default]
    Development,
    /// Optimized output.
    Production,
}

/// Options shared by every request issued during a build session.
///
/// Only part of these options reaches each kind of request: resolution sees
/// the mode and the export conditions, transformation sees everything that
/// can change the emitted code. Both subsets are folded into the request
/// identity, so changing an option produces fresh asset ids instead of
/// silently reusing stale results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildOptions {
    /// The current build mode.
    pub mode: Mode,
    /// Package export conditions used while resolving, in priority order.
    pub conditions: Vec<String>,
    /// Whether transformers should minify.
    pub minify: bool,
    /// Whether transformers should produce source maps.
    pub source_maps: bool,
    /// Public URL prefix for emitted references.
    pub public_url: String,
    /// Name of the transform pipeline; part of every asset id.
    pub pipeline: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Development,
            conditions: vec!["import".into(), "default".into()],
            minify: false,
            source_maps: true,
            public_url: "/".into(),
            pipeline: "default".into(),
        }
    }
}

impl BuildOptions {
    /// Fingerprint of the options that can change a resolution outcome.
    pub fn resolve_fingerprint(&self) -> Hash32 {
        Hash32::of(&(self.mode, &self.conditions))
    }

    /// Fingerprint of the options that can change a transform outcome.
    pub fn transform_fingerprint(&self) -> Hash32 {
        Hash32::of(&(
            self.mode,
            self.minify,
            self.source_maps,
            &self.public_url,
            &self.pipeline,
        ))
    }

    /// Identity of the asset built from `path` under these options. Stable
    /// across runs and processes.
    pub fn asset_id(&self, path: &Utf8Path) -> Hash32 {
        Hash32::of(&(path.as_str(), self.transform_fingerprint()))
    }

    /// Identity of resolving `specifier` from `resolve_from`.
    pub fn resolve_id(&self, specifier: &str, resolve_from: Option<&Utf8Path>) -> Hash32 {
        Hash32::of(&(
            specifier,
            resolve_from.map(Utf8Path::as_str),
            self.resolve_fingerprint(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_length() {
        let hash = Hash32::hash(b"tsumiki");
        assert_eq!(hash.to_hex().len(), 64);
        assert_eq!(hash.short().len(), 16);
        assert!(hash.to_hex().starts_with(&hash.short()));
    }

    #[test]
    fn test_hash_of_is_stable() {
        let a = Hash32::of(&("src/index.js", "default"));
        let b = Hash32::of(&("src/index.js", "default"));
        let c = Hash32::of(&("src/index.js", "other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprints_split_options() {
        let base = BuildOptions::default();

        let minified = BuildOptions {
            minify: true,
            ..base.clone()
        };
        assert_eq!(base.resolve_fingerprint(), minified.resolve_fingerprint());
        assert_ne!(base.transform_fingerprint(), minified.transform_fingerprint());

        let production = BuildOptions {
            mode: Mode::Production,
            ..base.clone()
        };
        assert_ne!(base.resolve_fingerprint(), production.resolve_fingerprint());
    }

    #[test]
    fn test_asset_id_follows_pipeline() {
        let base = BuildOptions::default();
        let other = BuildOptions {
            pipeline: "legacy".into(),
            ..base.clone()
        };
        let path = Utf8Path::new("src/index.js");

        assert_eq!(base.asset_id(path), base.asset_id(path));
        assert_ne!(base.asset_id(path), other.asset_id(path));
        assert_eq!(
            base.resolve_id("./a", Some(path)),
            other.resolve_id("./a", Some(path))
        );
    }
}
