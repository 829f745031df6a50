//! GZIP member detection and decompression.
//!
//! Each member found in a page is inflated (up to `gzip_max_uncompr` bytes)
//! and handed back as a child buffer tagged `GZIP`, so every other scanner
//! sees the decompressed content at the path `<offset>-GZIP-<n>`.

use crate::error::Result;
use crate::sbuf::ScanBuffer;
use crate::scanner::{InitParams, ScanParams, Scanner, ScannerFlags};
use flate2::read::GzDecoder;
use std::io::Read;
use tracing::trace;

pub const GZIP_TAG: &str = "GZIP";

/// ID1 ID2 CM(deflate)
const MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// Reserved FLG bits must be clear.
const FLG_RESERVED: u8 = 0xe0;

/// Fixed header plus the smallest deflate block and trailer.
const MIN_MEMBER: usize = 18;

pub struct GzipScanner {
    max_uncompressed: usize,
}

impl Default for GzipScanner {
    fn default() -> Self {
        Self {
            max_uncompressed: 256 * 1024 * 1024,
        }
    }
}

impl GzipScanner {
    fn looks_like_header(data: &[u8]) -> bool {
        data.len() >= MIN_MEMBER && data[..3] == MAGIC && data[3] & FLG_RESERVED == 0
    }

    /// Inflate the member at the start of `data`. A truncated stream still
    /// yields whatever was decoded before the cut.
    fn inflate(&self, data: &[u8]) -> Option<Vec<u8>> {
        if !Self::looks_like_header(data) {
            return None;
        }
        let mut out = Vec::new();
        let limit = self.max_uncompressed as u64;
        if let Err(e) = GzDecoder::new(data).take(limit).read_to_end(&mut out) {
            trace!(error = %e, decoded = out.len(), "gzip stream ended early");
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

impl Scanner for GzipScanner {
    fn init(&mut self, sp: &mut InitParams<'_>) -> Result<()> {
        sp.info.name = "gzip".to_string();
        sp.info.author = "Simson Garfinkel".to_string();
        sp.info.description = "Searches for GZIP-compressed data".to_string();
        sp.info.version = "1.1".to_string();
        sp.info.flags = ScannerFlags {
            recurse: true,
            ..Default::default()
        };
        sp.info.path_prefix = Some(GZIP_TAG.to_string());
        sp.info.min_sbuf_size = MIN_MEMBER;
        self.max_uncompressed = sp.get_config(
            "gzip_max_uncompr",
            self.max_uncompressed,
            "maximum size for decompressing GZIP objects",
        )?;
        Ok(())
    }

    fn scan(&self, sp: &mut ScanParams<'_>) -> Result<()> {
        let sbuf = sp.sbuf();
        let data = sbuf.data();
        let mut pos = 0;
        while pos < sbuf.pagesize() {
            let Some(hit) = sbuf.find(&MAGIC, pos) else {
                break;
            };
            if hit >= sbuf.pagesize() {
                break;
            }
            if let Some(out) = self.inflate(&data[hit..]) {
                let path = (sbuf.pos0() + hit as u64).child(GZIP_TAG);
                sp.emit(ScanBuffer::from_vec(path, out).with_range_policy(sbuf.range_policy()));
            }
            pos = hit + MAGIC.len();
        }
        Ok(())
    }

    fn decode(&self, sbuf: &ScanBuffer) -> Option<ScanBuffer> {
        let out = self.inflate(sbuf.data())?;
        Some(ScanBuffer::from_vec(sbuf.pos0().child(GZIP_TAG), out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ForensicPath;
    use crate::recorder::RecorderSetConfig;
    use crate::scanner::ScannerSet;
    use crate::types::ScannerConfig;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::Arc;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    /// Records the path and content of every buffer it is shown.
    struct Capture(Arc<Mutex<Vec<(String, Vec<u8>)>>>);

    impl Scanner for Capture {
        fn init(&mut self, sp: &mut InitParams<'_>) -> Result<()> {
            sp.info.name = "capture".to_string();
            Ok(())
        }

        fn scan(&self, sp: &mut ScanParams<'_>) -> Result<()> {
            let sbuf = sp.sbuf();
            self.0
                .lock()
                .push((sbuf.pos0().to_string(), sbuf.data().to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_child_buffer_at_member_offset() {
        let mut data = vec![0u8; 2048];
        let member = gzip(b"hello@world.com\n");
        data[512..512 + member.len()].copy_from_slice(&member);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut set = ScannerSet::new(ScannerConfig::default(), RecorderSetConfig::default(), 7);
        set.add_scanner(Box::new(GzipScanner::default())).unwrap();
        set.add_scanner(Box::new(Capture(Arc::clone(&seen)))).unwrap();
        set.apply_commands().unwrap();
        set.process_buffer(ScanBuffer::from_vec(ForensicPath::new(0), data))
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0, "512-GZIP-0");
        assert_eq!(seen[1].1, b"hello@world.com\n");
    }

    #[test]
    fn test_output_is_bounded() {
        let mut config = ScannerConfig::default();
        config.set("gzip_max_uncompr", "10");
        let mut scanner = GzipScanner::default();
        let mut info = Default::default();
        scanner
            .init(&mut InitParams::new(&mut info, &config))
            .unwrap();
        let sbuf = ScanBuffer::from_vec(ForensicPath::new(7), gzip(&[b'a'; 100]));
        let child = scanner.decode(&sbuf).unwrap();
        assert_eq!(child.bufsize(), 10);
        assert_eq!(child.pos0().to_string(), "7-GZIP-0");
    }

    #[test]
    fn test_truncated_member_keeps_prefix() {
        let mut x = 12345u32;
        let text: Vec<u8> = (0..20_000)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12345);
                (x >> 16) as u8
            })
            .collect();
        let member = gzip(&text);
        let cut = &member[..member.len() / 2];
        let decoded = GzipScanner::default().inflate(cut).unwrap();
        assert!(!decoded.is_empty());
        assert_eq!(decoded[..], text[..decoded.len()]);
    }

    #[test]
    fn test_rejects_non_gzip() {
        let scanner = GzipScanner::default();
        let mut reserved = gzip(b"abc");
        reserved[3] = 0xe0;
        assert!(scanner.inflate(&reserved).is_none());
        assert!(scanner.inflate(b"plain text, nothing compressed").is_none());
    }
}
