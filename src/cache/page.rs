//! Page-level helpers
//!
//! Same-value detection, page fill, content checksums and the small header
//! embedded at the front of every compressed blob so writeback can resolve a
//! victim handle back to its owning address space and offset.

use std::fmt;

/// Size of one logical page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Machine word used for same-value detection
pub type Word = u64;

const WORD_SIZE: usize = std::mem::size_of::<Word>();

/// Page index within one address space
pub type PageOffset = u64;

/// Identity of one logical address space (one backing device)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(pub u32);

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "space-{}", self.0)
    }
}

impl From<u32> for SpaceId {
    fn from(id: u32) -> Self {
        SpaceId(id)
    }
}

#[inline]
fn words(page: &[u8]) -> impl Iterator<Item = Word> + '_ {
    page.chunks_exact(WORD_SIZE).map(|chunk| {
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(chunk);
        Word::from_ne_bytes(word)
    })
}

/// Returns the repeated word if every word of the page is identical
pub fn same_filled_value(page: &[u8]) -> Option<Word> {
    let mut iter = words(page);
    let first = iter.next()?;
    if iter.all(|w| w == first) {
        Some(first)
    } else {
        None
    }
}

/// Check whether a page is entirely zero
pub fn is_zero_filled(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Fill a page with a repeated word
pub fn fill_page(dst: &mut [u8], value: Word) {
    let bytes = value.to_ne_bytes();
    for chunk in dst.chunks_exact_mut(WORD_SIZE) {
        chunk.copy_from_slice(&bytes);
    }
}

/// Content checksum used as the dedup index key.
///
/// FxHash folded over machine words. Collisions are expected to be rare but
/// are tolerated: dedup always verifies byte equality before sharing.
pub fn checksum(page: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for word in words(page) {
        hash = (hash.rotate_left(5) ^ word).wrapping_mul(SEED);
    }
    hash
}

// =============================================================================
// Blob Header
// =============================================================================

/// Encoded length of [`BlobHeader`]
pub const HEADER_LEN: usize = 12;

/// Origin of a compressed blob, stored in front of the compressed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    pub space: SpaceId,
    pub offset: PageOffset,
}

impl BlobHeader {
    pub fn new(space: SpaceId, offset: PageOffset) -> Self {
        Self { space, offset }
    }

    /// Write the header into the first [`HEADER_LEN`] bytes of `dst`
    pub fn encode(&self, dst: &mut [u8]) {
        dst[..4].copy_from_slice(&self.space.0.to_le_bytes());
        dst[4..HEADER_LEN].copy_from_slice(&self.offset.to_le_bytes());
    }

    /// Read a header back from the front of a blob
    pub fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < HEADER_LEN {
            return None;
        }
        let mut space = [0u8; 4];
        space.copy_from_slice(&src[..4]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&src[4..HEADER_LEN]);
        Some(Self {
            space: SpaceId(u32::from_le_bytes(space)),
            offset: u64::from_le_bytes(offset),
        })
    }
}

/// Hex rendering of the first `max` bytes, for corruption diagnostics
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let shown = &data[..data.len().min(max)];
    let mut out = String::with_capacity(shown.len() * 3);
    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            out.push(if i % 16 == 0 { '\n' } else { ' ' });
        }
        out.push_str(&format!("{:02x}", byte));
    }
    if data.len() > max {
        out.push_str(" ...");
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
