use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const HASH_LEN: usize = 32;

/// BLAKE3 digest identifying a file, a data chunk or a metadata record.
/// The canonical text form is lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub const MIN: ContentHash = ContentHash([0u8; HASH_LEN]);
    pub const MAX: ContentHash = ContentHash([0xffu8; HASH_LEN]);

    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        blake3::Hash::from_hex(s).ok().map(|h| Self(*h.as_bytes()))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(h: blake3::Hash) -> Self {
        Self(*h.as_bytes())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(s)
        }
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if d.is_human_readable() {
            let s = String::deserialize(d)?;
            ContentHash::from_hex(&s)
                .ok_or_else(|| de::Error::custom(format!("bad content hash {:?}", s)))
        } else {
            Ok(Self(<[u8; HASH_LEN]>::deserialize(d)?))
        }
    }
}

/// Contiguous, inclusive range of the hash space a server commits to store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashSpan {
    pub first: ContentHash,
    pub last: ContentHash,
}

impl HashSpan {
    pub fn new(first: ContentHash, last: ContentHash) -> Self {
        Self { first, last }
    }

    pub fn full() -> Self {
        Self { first: ContentHash::MIN, last: ContentHash::MAX }
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.first <= *hash && *hash <= self.last
    }
}
