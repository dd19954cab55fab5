#![no_std]

//! lbsync common primitives
//!
//! Hashing shared by every layer of the reconciler: shard selection for
//! queues and remote-client connections, and the structural checksum used to
//! decide whether a desired object differs from what was last applied.
//! Everything here is allocation-free so it can be used from any context.

/// Version mixed into every structural checksum.
///
/// Bumping it invalidates all applied checksums recorded on the remote side,
/// which forces one full re-apply of every object on the next reconcile.
pub const CHECKSUM_VERSION: u8 = 1;

const FNV32_OFFSET: u32 = 0x811c9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a, the hash behind [`bucket`] and [`Checksum`].
pub const fn fnv1a_hash32(bytes: &[u8]) -> u32 {
    fnv1a_extend32(FNV32_OFFSET, bytes)
}

const fn fnv1a_extend32(mut hash: u32, bytes: &[u8]) -> u32 {
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV32_PRIME);
        i += 1;
    }
    hash
}

/// Map a key to one of `num_shards` buckets.
///
/// Used for ingestion shards, reconcile shards, retry shards and
/// remote-client selection, so every piece of work for one key lands on the
/// same worker and the same connection.
///
/// The mapping depends on `num_shards`. Changing a shard count moves keys
/// between workers; in-flight work for a key may then be processed by two
/// workers until the old queues drain, so shard counts are only changed on
/// restart.
///
/// The FNV state is run through [`mix32`] first: FNV-1a low bits depend only
/// on the low bits of the input bytes, which skews power-of-two shard counts.
///
/// A shard count of zero maps everything to bucket 0.
pub const fn bucket(key: &str, num_shards: u32) -> u32 {
    if num_shards == 0 {
        return 0;
    }
    mix32(fnv1a_hash32(key.as_bytes())) % num_shards
}

/// murmur3 finalizer. Spreads low-entropy hashes before they are summed.
#[inline]
pub const fn mix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Node kinds that carry a structural checksum.
///
/// The tag is hashed first so two kinds with identical field values never
/// share a checksum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumKind {
    VirtualService = 1,
    Pool = 2,
    PoolGroup = 3,
    DataScript = 4,
    TlsCert = 5,
    Vrf = 6,
    Vip = 7,
}

/// Versioned structural hash over an explicit field list.
///
/// Every field is length-prefixed, so `("ab", "c")` and `("a", "bc")` hash
/// differently. Collections whose order carries no meaning go through
/// [`Checksum::set`], which is order-independent; ordered collections are fed
/// element by element.
///
/// ```
/// use common::{Checksum, ChecksumKind};
///
/// let a = Checksum::new(ChecksumKind::Pool).str("TCP").u32(80).set(["10.0.0.1:80", "10.0.0.2:80"]).finish();
/// let b = Checksum::new(ChecksumKind::Pool).str("TCP").u32(80).set(["10.0.0.2:80", "10.0.0.1:80"]).finish();
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Checksum {
    state: u32,
}

impl Checksum {
    pub const fn new(kind: ChecksumKind) -> Self {
        let state = fnv1a_extend32(FNV32_OFFSET, &[CHECKSUM_VERSION, kind as u8]);
        Self { state }
    }

    pub const fn bytes(self, bytes: &[u8]) -> Self {
        let len = (bytes.len() as u32).to_le_bytes();
        let state = fnv1a_extend32(self.state, &len);
        Self {
            state: fnv1a_extend32(state, bytes),
        }
    }

    pub const fn str(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    /// Absent and empty hash differently.
    pub const fn opt_str(self, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.bool(true).str(v),
            None => self.bool(false),
        }
    }

    pub const fn u32(self, value: u32) -> Self {
        Self {
            state: fnv1a_extend32(self.state, &value.to_le_bytes()),
        }
    }

    pub const fn bool(self, value: bool) -> Self {
        Self {
            state: fnv1a_extend32(self.state, &[value as u8]),
        }
    }

    /// Fold a child checksum into this one, position-sensitive.
    pub const fn child(self, checksum: u32) -> Self {
        self.u32(checksum)
    }

    /// Order-independent fold of string members.
    pub fn set<'a, I>(self, items: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut count = 0u32;
        let mut sum = 0u32;
        for item in items {
            count = count.wrapping_add(1);
            sum = sum.wrapping_add(mix32(fnv1a_hash32(item.as_bytes())));
        }
        self.u32(count).u32(sum)
    }

    /// Order-independent fold of already-computed checksums.
    pub fn checksum_set<I>(self, items: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        self.u32(fold_unordered(items))
    }

    pub const fn finish(self) -> u32 {
        mix32(self.state)
    }
}

/// Commutative combination of checksums, used for aggregate graph checksums.
pub fn fold_unordered<I>(items: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    let mut count = 0u32;
    let mut sum = 0u32;
    for item in items {
        count = count.wrapping_add(1);
        sum = sum.wrapping_add(mix32(item));
    }
    mix32(sum ^ count.rotate_left(16))
}
