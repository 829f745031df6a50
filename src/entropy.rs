//! Byte-frequency statistics used by scanner pre-filters
//!
//! - Byte frequency histogram (256 bins)
//! - Distinct byte count, the cheap prefilter used before expensive checks
//! - Shannon entropy formula: H = -Σ(p_i * log2(p_i))

/// Count byte frequencies
#[inline]
pub fn byte_histogram(data: &[u8]) -> [u32; 256] {
    let mut histogram = [0u32; 256];

    // Unrolled for auto-vectorization
    let chunks = data.chunks_exact(8);
    let remainder = chunks.remainder();
    for chunk in chunks {
        for &b in chunk {
            histogram[b as usize] += 1;
        }
    }
    for &b in remainder {
        histogram[b as usize] += 1;
    }

    histogram
}

/// Number of distinct byte values present in `data`
#[inline]
pub fn distinct_byte_count(data: &[u8]) -> usize {
    byte_histogram(data).iter().filter(|&&c| c > 0).count()
}

/// Calculate Shannon entropy of data
/// Returns value between 0.0 (no entropy, predictable) and 8.0 (maximum entropy, random)
pub fn shannon_entropy(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    entropy_from_histogram(&byte_histogram(data), data.len() as f32)
}

fn entropy_from_histogram(histogram: &[u32; 256], total_bytes: f32) -> f32 {
    let mut entropy = 0.0f32;

    for &count in histogram.iter() {
        if count > 0 {
            let probability = count as f32 / total_bytes;
            entropy -= probability * probability.log2();
        }
    }

    entropy
}

/// Rolling distinct-byte counter over a fixed window.
///
/// Scanners slide this across a page to skip windows that cannot hold
/// high-entropy material such as key schedules.
#[derive(Debug, Clone)]
pub struct DistinctWindow {
    counts: [u32; 256],
    distinct: usize,
}

impl DistinctWindow {
    pub fn new(initial: &[u8]) -> Self {
        let counts = byte_histogram(initial);
        let distinct = counts.iter().filter(|&&c| c > 0).count();
        Self { counts, distinct }
    }

    #[inline]
    pub fn push(&mut self, b: u8) {
        let slot = &mut self.counts[b as usize];
        *slot += 1;
        if *slot == 1 {
            self.distinct += 1;
        }
    }

    #[inline]
    pub fn pop(&mut self, b: u8) {
        let slot = &mut self.counts[b as usize];
        if *slot == 0 {
            return;
        }
        *slot -= 1;
        if *slot == 0 {
            self.distinct -= 1;
        }
    }

    #[inline]
    pub fn distinct(&self) -> usize {
        self.distinct
    }
}
