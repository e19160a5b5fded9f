use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A type-erased, thread-safe container.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used for content-addressing recipe instances.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Adapter that lets any `Hash` value feed a BLAKE3 hasher, so that hashes
/// stay stable across processes (unlike `DefaultHasher`).
#[derive(Default, Clone)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Deterministic cache key of a recipe instance.
///
/// A sigil is the producer name plus a BLAKE3 digest of the concrete
/// arguments the instance was created with. Two recipes with equal sigils are
/// the same unit of work: the [`Cookbook`](crate::Cookbook) hands out a single
/// shared instance for both.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sigil {
    name: ArcStr,
    hash: Hash32,
}

impl Sigil {
    /// Derives a sigil from a name and any hashable argument set.
    pub fn new<A: Hash + ?Sized>(name: impl Into<Arc<str>>, args: &A) -> Self {
        let name = name.into();
        let mut hasher = Blake3Hasher::default();
        name.hash(&mut hasher);
        args.hash(&mut hasher);

        Self {
            name,
            hash: hasher.into(),
        }
    }

    pub(crate) fn from_parts(name: ArcStr, hasher: Blake3Hasher) -> Self {
        Self {
            name,
            hash: hasher.into(),
        }
    }

    /// Producer name part of the sigil.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full hex digest of the arguments.
    pub fn digest(&self) -> String {
        self.hash.to_hex()
    }
}

impl fmt::Display for Sigil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, &self.hash.to_hex()[..12])
    }
}

impl fmt::Debug for Sigil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sigil({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigil_is_deterministic() {
        let a = Sigil::new("compile", "test/json.cpp");
        let b = Sigil::new("compile", "test/json.cpp");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_sigil_depends_on_name_and_args() {
        let a = Sigil::new("compile", "test/json.cpp");
        let b = Sigil::new("compile", "test/ansi.cpp");
        let c = Sigil::new("link", "test/json.cpp");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sigil_display() {
        let sigil = Sigil::new("sh", &());
        let text = sigil.to_string();
        assert!(text.starts_with("sh@"));
        assert_eq!(text.len(), "sh@".len() + 12);
        assert_eq!(sigil.digest().len(), 64);
    }
}
