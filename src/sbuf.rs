//! Zero-copy scan buffers.
//!
//! A [`ScanBuffer`] is a bounds-checked window onto immutable bytes held
//! behind an `Arc`. Slicing shares the storage and extends the forensic path;
//! nothing is copied. The first `pagesize` bytes are primary content, the rest
//! up to `bufsize` is look-ahead margin that scanners may read but should not
//! report features from.

use crate::entropy;
use crate::error::{Result, ScanError};
use crate::path::ForensicPath;
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Index;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static LIVE_BUFFERS: AtomicUsize = AtomicUsize::new(0);
static ZERO: u8 = 0;

/// Out-of-bounds behavior for indexed access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangePolicy {
    /// Out-of-range access is an error (a panic through `Index`).
    #[default]
    Strict,
    /// Out-of-range reads yield 0.
    Clamp,
}

enum Backing {
    Heap(Box<[u8]>),
    Mapped(Arc<Mmap>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Heap(b) => &b[..],
            Backing::Mapped(m) => &m[..],
        }
    }
}

pub struct ScanBuffer {
    storage: Arc<Backing>,
    start: usize,
    bufsize: usize,
    pagesize: usize,
    pos0: ForensicPath,
    policy: RangePolicy,
}

impl ScanBuffer {
    fn build(
        storage: Arc<Backing>,
        start: usize,
        bufsize: usize,
        pagesize: usize,
        pos0: ForensicPath,
        policy: RangePolicy,
    ) -> Self {
        debug_assert!(start + bufsize <= storage.bytes().len());
        debug_assert!(pagesize <= bufsize);
        LIVE_BUFFERS.fetch_add(1, Ordering::Relaxed);
        Self {
            storage,
            start,
            bufsize,
            pagesize,
            pos0,
            policy,
        }
    }

    /// Wrap owned bytes; the whole buffer is page content.
    pub fn from_vec(pos0: ForensicPath, data: Vec<u8>) -> Self {
        let len = data.len();
        Self::with_margin(pos0, data, len)
    }

    /// Wrap owned bytes where everything past `pagesize` is margin.
    pub fn with_margin(pos0: ForensicPath, data: Vec<u8>, pagesize: usize) -> Self {
        let bufsize = data.len();
        Self::build(
            Arc::new(Backing::Heap(data.into_boxed_slice())),
            0,
            bufsize,
            pagesize.min(bufsize),
            pos0,
            RangePolicy::default(),
        )
    }

    /// View a region of a shared memory map without copying.
    pub fn from_mapped(
        pos0: ForensicPath,
        map: Arc<Mmap>,
        start: usize,
        bufsize: usize,
        pagesize: usize,
    ) -> Result<Self> {
        let end = start.checked_add(bufsize).ok_or(ScanError::Range {
            offset: start,
            len: bufsize,
            bufsize: map.len(),
        })?;
        if end > map.len() {
            return Err(ScanError::Range {
                offset: start,
                len: bufsize,
                bufsize: map.len(),
            });
        }
        Ok(Self::build(
            Arc::new(Backing::Mapped(map)),
            start,
            bufsize,
            pagesize.min(bufsize),
            pos0,
            RangePolicy::default(),
        ))
    }

    pub fn with_range_policy(mut self, policy: RangePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of live buffers in the process (leak checks in tests).
    pub fn live_count() -> usize {
        LIVE_BUFFERS.load(Ordering::Relaxed)
    }

    pub fn pos0(&self) -> &ForensicPath {
        &self.pos0
    }

    pub fn pagesize(&self) -> usize {
        self.pagesize
    }

    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    pub fn range_policy(&self) -> RangePolicy {
        self.policy
    }

    /// Decoder nesting depth of this buffer.
    pub fn depth(&self) -> usize {
        self.pos0.depth()
    }

    /// All bytes, margin included.
    pub fn data(&self) -> &[u8] {
        &self.storage.bytes()[self.start..self.start + self.bufsize]
    }

    /// Primary content only.
    pub fn page(&self) -> &[u8] {
        &self.data()[..self.pagesize]
    }

    /// True when both buffers view the same underlying allocation.
    pub fn shares_storage_with(&self, other: &ScanBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// `len` bytes at `offset`, sharing storage; the path advances by `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<ScanBuffer> {
        let end = offset.checked_add(len).ok_or(ScanError::Range {
            offset,
            len,
            bufsize: self.bufsize,
        })?;
        if end > self.bufsize {
            return Err(ScanError::Range {
                offset,
                len,
                bufsize: self.bufsize,
            });
        }
        let pagesize = len.min(self.pagesize.saturating_sub(offset));
        Ok(Self::build(
            Arc::clone(&self.storage),
            self.start + offset,
            len,
            pagesize,
            &self.pos0 + offset as u64,
            self.policy,
        ))
    }

    /// Everything from `offset` to the end of the buffer.
    pub fn slice_from(&self, offset: usize) -> Result<ScanBuffer> {
        self.slice(offset, self.bufsize.saturating_sub(offset))
    }

    /// Byte at `i`, honoring the range policy.
    pub fn at(&self, i: usize) -> Result<u8> {
        match self.data().get(i) {
            Some(&b) => Ok(b),
            None if self.policy == RangePolicy::Clamp => Ok(0),
            None => Err(ScanError::Range {
                offset: i,
                len: 1,
                bufsize: self.bufsize,
            }),
        }
    }

    fn field<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        self.data().get(offset..end)?.try_into().ok()
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.data().get(offset).copied().unwrap_or(0)
    }

    pub fn get_i8(&self, offset: usize) -> i8 {
        self.get_u8(offset) as i8
    }

    /// First occurrence of `pattern` at or after `start`.
    pub fn find(&self, pattern: &[u8], start: usize) -> Option<usize> {
        if pattern.is_empty() || start >= self.bufsize {
            return None;
        }
        self.data()[start..]
            .windows(pattern.len())
            .position(|w| w == pattern)
            .map(|p| p + start)
    }

    /// Lossy text of `len` bytes at `offset`, truncated at the buffer end.
    pub fn substr(&self, offset: usize, len: usize) -> String {
        let start = offset.min(self.bufsize);
        let end = offset.saturating_add(len).min(self.bufsize);
        String::from_utf8_lossy(&self.data()[start..end]).into_owned()
    }

    pub fn distinct_byte_count(&self) -> usize {
        entropy::distinct_byte_count(self.data())
    }

    pub fn shannon_entropy(&self) -> f32 {
        entropy::shannon_entropy(self.data())
    }

    pub fn sha256_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.data());
        format!("{:x}", hasher.finalize())
    }
}

macro_rules! int_readers {
    ($($le:ident, $be:ident => $t:ty;)*) => {
        impl ScanBuffer {
            $(
                /// Little-endian read; 0 when the field runs past the buffer.
                pub fn $le(&self, offset: usize) -> $t {
                    self.field(offset).map(<$t>::from_le_bytes).unwrap_or(0)
                }

                /// Big-endian read; 0 when the field runs past the buffer.
                pub fn $be(&self, offset: usize) -> $t {
                    self.field(offset).map(<$t>::from_be_bytes).unwrap_or(0)
                }
            )*
        }
    };
}

int_readers! {
    get_u16_le, get_u16_be => u16;
    get_i16_le, get_i16_be => i16;
    get_u32_le, get_u32_be => u32;
    get_i32_le, get_i32_be => i32;
    get_u64_le, get_u64_be => u64;
    get_i64_le, get_i64_be => i64;
}

impl Clone for ScanBuffer {
    fn clone(&self) -> Self {
        Self::build(
            Arc::clone(&self.storage),
            self.start,
            self.bufsize,
            self.pagesize,
            self.pos0.clone(),
            self.policy,
        )
    }
}

impl Drop for ScanBuffer {
    fn drop(&mut self) {
        LIVE_BUFFERS.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Index<usize> for ScanBuffer {
    type Output = u8;

    fn index(&self, i: usize) -> &u8 {
        match self.data().get(i) {
            Some(b) => b,
            None if self.policy == RangePolicy::Clamp => &ZERO,
            None => panic!(
                "{}",
                ScanError::Range {
                    offset: i,
                    len: 1,
                    bufsize: self.bufsize
                }
            ),
        }
    }
}

impl fmt::Debug for ScanBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanBuffer")
            .field("pos0", &self.pos0.to_string())
            .field("pagesize", &self.pagesize)
            .field("bufsize", &self.bufsize)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ScanBuffer {
        ScanBuffer::with_margin(ForensicPath::new(1000), (0u8..64).collect(), 48)
    }

    #[test]
    fn test_slice_shares_storage() {
        let b = sample();
        let s = b.slice(10, 20).unwrap();
        assert!(s.shares_storage_with(&b));
        assert_eq!(s.data().as_ptr(), b.data()[10..].as_ptr());
        assert_eq!(s.pos0().to_string(), "1010");
        assert_eq!(s.bufsize(), 20);
        assert_eq!(s[0], 10);
    }

    #[test]
    fn test_slice_page_and_margin() {
        let b = sample();
        assert_eq!(b.page().len(), 48);
        assert_eq!(b.data().len(), 64);
        let s = b.slice(40, 24).unwrap();
        assert_eq!(s.pagesize(), 8);
        let m = b.slice(50, 10).unwrap();
        assert_eq!(m.pagesize(), 0);
    }

    #[test]
    fn test_slice_near_end_of_offset_space() {
        let b = ScanBuffer::from_vec(ForensicPath::new(u64::MAX - 4), vec![7u8; 16]);
        let s = b.slice(10, 4).unwrap();
        assert_eq!(s.pos0().root_offset(), u64::MAX);
        assert_eq!(s[0], 7);
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let b = sample();
        assert!(matches!(b.slice(60, 5), Err(ScanError::Range { .. })));
        assert!(matches!(b.slice(usize::MAX, 2), Err(ScanError::Range { .. })));
        assert!(b.slice(64, 0).is_ok());
    }

    #[test]
    fn test_at_policies() {
        let b = sample();
        assert_eq!(b.at(63).unwrap(), 63);
        assert!(b.at(64).is_err());
        let c = b.with_range_policy(RangePolicy::Clamp);
        assert_eq!(c.at(64).unwrap(), 0);
        assert_eq!(c[1000], 0);
    }

    #[test]
    #[should_panic]
    fn test_strict_index_panics() {
        let b = sample();
        let _ = b[64];
    }

    #[test]
    fn test_integer_readers() {
        let b = ScanBuffer::from_vec(
            ForensicPath::new(0),
            vec![0x01, 0x02, 0x03, 0x04, 0xff, 0xff, 0xff, 0xff, 0x80],
        );
        assert_eq!(b.get_u16_le(0), 0x0201);
        assert_eq!(b.get_u16_be(0), 0x0102);
        assert_eq!(b.get_u32_le(0), 0x0403_0201);
        assert_eq!(b.get_u32_be(0), 0x0102_0304);
        assert_eq!(b.get_i32_le(4), -1);
        assert_eq!(b.get_u64_le(0), 0xffff_ffff_0403_0201);
        assert_eq!(b.get_i8(8), -128);
        assert_eq!(b.get_u32_le(6), 0);
        assert_eq!(b.get_u64_be(2), 0);
        assert_eq!(b.get_u8(9), 0);
        assert_eq!(b.get_i16_be(usize::MAX), 0);
    }

    #[test]
    fn test_distinct_byte_count_constant_page() {
        let b = ScanBuffer::from_vec(ForensicPath::new(0), vec![0x41; 4096]);
        assert_eq!(b.distinct_byte_count(), 1);
    }

    #[test]
    fn test_find_and_substr() {
        let b = ScanBuffer::from_vec(ForensicPath::new(0), b"hello@world.com".to_vec());
        assert_eq!(b.find(b"@", 0), Some(5));
        assert_eq!(b.find(b"@", 6), None);
        assert_eq!(b.substr(6, 100), "world.com");
    }

    #[test]
    fn test_live_count_balances() {
        // Other tests run concurrently, so compare against our own allocations.
        let b = sample();
        let s1 = b.slice(0, 4).unwrap();
        let s2 = s1.clone();
        assert!(ScanBuffer::live_count() >= 3);
        drop((b, s1, s2));
    }
}
