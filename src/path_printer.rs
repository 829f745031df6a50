//! Print the bytes a forensic path points at.
//!
//! Decoded content is not stored anywhere, so each decoder hop is replayed:
//! the root bytes are read from the image and every hop's owning scanner
//! re-derives the child buffer through [`Scanner::decode`].
//!
//! [`Scanner::decode`]: crate::scanner::Scanner::decode

use crate::error::{Result, ScanError};
use crate::image::{ImageReader, PageRead};
use crate::path::{ForensicPath, RenderMode};
use crate::sbuf::ScanBuffer;
use crate::scanner::ScannerSet;
use std::io::Write;
use tracing::debug;

/// Bytes shown when no length is configured.
pub const DEFAULT_CONTENT_LENGTH: usize = 4096;

pub struct PathPrinter<'a, I> {
    registry: &'a ScannerSet,
    image: I,
    /// Bytes read from the image ahead of the first decoder.
    read_size: usize,
    content_length: usize,
}

impl<'a, I: ImageReader> PathPrinter<'a, I> {
    pub fn new(registry: &'a ScannerSet, image: I) -> Self {
        let read_size = image.pagesize();
        Self {
            registry,
            image,
            read_size,
            content_length: DEFAULT_CONTENT_LENGTH,
        }
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }

    pub fn with_content_length(mut self, len: usize) -> Self {
        self.content_length = len;
        self
    }

    /// Resolve `request` (a path with an optional `/h` or `/r` suffix) and write
    /// its content to `out`. Hex is the default rendering.
    pub fn process_path<W: Write>(&mut self, request: &str, out: &mut W) -> Result<()> {
        let (path, mode) = ForensicPath::parse_with_mode(request)?;
        let sbuf = self.resolve(&path)?;
        let len = sbuf.bufsize().min(self.content_length);
        let bytes = &sbuf.data()[..len];
        match mode.unwrap_or(RenderMode::Hex) {
            RenderMode::Hex => hex_dump(bytes, out)?,
            RenderMode::Raw => {
                write!(out, "{len}\r\n")?;
                out.write_all(bytes)?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// The buffer starting at `path`.
    pub fn resolve(&mut self, path: &ForensicPath) -> Result<ScanBuffer> {
        let shown = path.to_string();
        let hops = path.hops();
        if hops.is_empty() {
            return self.read(path.offset(), self.content_length, &shown);
        }

        let mut cur = self.read(hops[0].offset, self.read_size, &shown)?;
        for (i, hop) in hops.iter().enumerate() {
            if i > 0 {
                cur = cur.slice_from(hop.offset as usize)?;
            }
            let decoder = self
                .registry
                .decoder_for(&hop.decoder)
                .ok_or_else(|| ScanError::NoSuchScanner(hop.decoder.clone()))?;
            debug!(path = %cur.pos0(), decoder = %hop.decoder, "replaying decoder");
            cur = decoder
                .decode(&cur)
                .ok_or_else(|| ScanError::format(&shown, format!("{} decoder produced no data", hop.decoder)))?;
        }
        cur.slice_from(path.offset() as usize)
    }

    fn read(&mut self, offset: u64, len: usize, request: &str) -> Result<ScanBuffer> {
        match self.image.read_range(offset, len, len)? {
            PageRead::Page(sbuf) => Ok(sbuf),
            PageRead::EndOfInput => Err(ScanError::format(request, "offset past end of image")),
        }
    }
}

/// `0000: 6865 6c6c ... hello@world.com.` lines of 16 bytes.
pub fn hex_dump<W: Write>(data: &[u8], out: &mut W) -> std::io::Result<()> {
    for (row, chunk) in data.chunks(16).enumerate() {
        write!(out, "{:04x}: ", row * 16)?;
        for pair in 0..8 {
            for j in [pair * 2, pair * 2 + 1] {
                match chunk.get(j) {
                    Some(b) => write!(out, "{b:02x}")?,
                    None => out.write_all(b"  ")?,
                }
            }
            out.write_all(b" ")?;
        }
        let text: String = chunk
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        writeln!(out, "{text}")?;
    }
    Ok(())
}
