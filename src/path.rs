//! Recursive forensic positions.
//!
//! A [`ForensicPath`] locates a byte inside the source image or inside content
//! synthesized by decoders. The string form is a chain of
//! `OFFSET-DECODER-` components followed by the innermost offset:
//!
//! - `496`: byte 496 of the image
//! - `512-GZIP-0`: first byte of the gzip stream that starts at image byte 512
//! - `0-GZIP-10-ZIP-5`: two levels of decoding
//!
//! Display tooling may append a render mode (`512-GZIP-0/h`); only
//! [`ForensicPath::parse_with_mode`] accepts that suffix.

use crate::error::{Result, ScanError};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

/// One decoder hop: content produced by `decoder` at `offset` in the enclosing buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecoderHop {
    pub offset: u64,
    pub decoder: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ForensicPath {
    hops: Vec<DecoderHop>,
    offset: u64,
}

/// Display mode requested by a `/x` suffix on a path string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Hex,
    Raw,
}

impl ForensicPath {
    /// A top-level position in the image.
    pub fn new(offset: u64) -> Self {
        Self {
            hops: Vec::new(),
            offset,
        }
    }

    /// Offset of this position in the outermost (image) coordinate space.
    pub fn root_offset(&self) -> u64 {
        self.hops.first().map(|h| h.offset).unwrap_or(self.offset)
    }

    /// Offset inside the innermost buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of decoder components in the chain.
    pub fn depth(&self) -> usize {
        self.hops.len()
    }

    pub fn hops(&self) -> &[DecoderHop] {
        &self.hops
    }

    pub fn last_decoder(&self) -> Option<&str> {
        self.hops.last().map(|h| h.decoder.as_str())
    }

    /// Open a decoder component at the current position.
    ///
    /// `512` with `GZIP` becomes `512-GZIP-0`.
    pub fn child(&self, decoder: &str) -> Self {
        let mut hops = self.hops.clone();
        hops.push(DecoderHop {
            offset: self.offset,
            decoder: decoder.to_string(),
        });
        Self { hops, offset: 0 }
    }

    /// Append a component: a decimal offset shifts the innermost position,
    /// a decoder tag opens a new hop.
    pub fn append(&self, component: &str) -> Result<Self> {
        if component.bytes().all(|b| b.is_ascii_digit()) && !component.is_empty() {
            let delta = parse_offset(component, component)?;
            Ok(self.clone() + delta)
        } else {
            validate_decoder(component, component)?;
            Ok(self.child(component))
        }
    }

    /// Parse a canonical path string. Render suffixes are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(ScanError::format(s, "empty path"));
        }
        if s.contains('/') {
            return Err(ScanError::format(s, "unexpected render suffix"));
        }

        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() % 2 == 0 {
            return Err(ScanError::format(s, "dangling decoder component"));
        }

        let mut hops = Vec::with_capacity(parts.len() / 2);
        for pair in parts[..parts.len() - 1].chunks(2) {
            let offset = parse_offset(s, pair[0])?;
            validate_decoder(s, pair[1])?;
            hops.push(DecoderHop {
                offset,
                decoder: pair[1].to_string(),
            });
        }
        let offset = parse_offset(s, parts[parts.len() - 1])?;

        Ok(Self { hops, offset })
    }

    /// Parse a path that may carry a `/h` or `/r` render suffix.
    pub fn parse_with_mode(s: &str) -> Result<(Self, Option<RenderMode>)> {
        match s.split_once('/') {
            None => Ok((Self::parse(s)?, None)),
            Some((path, mode)) => {
                let mode = match mode {
                    "h" => RenderMode::Hex,
                    "r" => RenderMode::Raw,
                    other => {
                        return Err(ScanError::format(s, format!("unknown render mode '{other}'")))
                    }
                };
                Ok((Self::parse(path)?, Some(mode)))
            }
        }
    }
}

fn parse_offset(whole: &str, part: &str) -> Result<u64> {
    if part.is_empty() {
        return Err(ScanError::format(whole, "empty offset"));
    }
    if !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ScanError::format(whole, format!("malformed offset '{part}'")));
    }
    if part.len() > 1 && part.starts_with('0') {
        return Err(ScanError::format(whole, format!("non-canonical offset '{part}'")));
    }
    part.parse::<u64>()
        .map_err(|_| ScanError::format(whole, format!("offset '{part}' out of range")))
}

fn validate_decoder(whole: &str, tag: &str) -> Result<()> {
    let well_formed = !tag.is_empty()
        && tag.bytes().any(|b| b.is_ascii_uppercase())
        && tag
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');
    if well_formed {
        Ok(())
    } else {
        Err(ScanError::format(whole, format!("malformed decoder tag '{tag}'")))
    }
}

impl fmt::Display for ForensicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hop in &self.hops {
            write!(f, "{}-{}-", hop.offset, hop.decoder)?;
        }
        write!(f, "{}", self.offset)
    }
}

impl FromStr for ForensicPath {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Moves the innermost offset; saturates at `u64::MAX`.
impl Add<u64> for ForensicPath {
    type Output = ForensicPath;

    fn add(mut self, rhs: u64) -> ForensicPath {
        self.offset = self.offset.saturating_add(rhs);
        self
    }
}

impl Add<u64> for &ForensicPath {
    type Output = ForensicPath;

    fn add(self, rhs: u64) -> ForensicPath {
        self.clone() + rhs
    }
}

impl Ord for ForensicPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.root_offset()
            .cmp(&other.root_offset())
            .then_with(|| self.hops.cmp(&other.hops))
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for ForensicPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ForensicPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for s in ["0", "496", "512-GZIP-0", "0-GZIP-10-ZIP-5", "13259-RAR-0", "7-BASE_64-1"] {
            let p = ForensicPath::parse(s).unwrap();
            assert_eq!(p.to_string(), s);
            assert_eq!(ForensicPath::parse(&p.to_string()).unwrap(), p);
        }
    }

    #[test]
    fn test_malformed_paths() {
        for s in ["", "abc", "12-gzip-0", "12-GZIP", "12--0", "-5", "012", "5-GZIP-0/h", "1-GZ IP-0"] {
            let err = ForensicPath::parse(s).unwrap_err();
            assert!(matches!(err, ScanError::Format { .. }), "{s} -> {err}");
        }
    }

    #[test]
    fn test_root_offset_and_depth() {
        let p = ForensicPath::parse("512-GZIP-10-ZIP-3").unwrap();
        assert_eq!(p.root_offset(), 512);
        assert_eq!(p.offset(), 3);
        assert_eq!(p.depth(), 2);
        assert_eq!(p.last_decoder(), Some("ZIP"));
        assert_eq!(ForensicPath::new(77).root_offset(), 77);
    }

    #[test]
    fn test_child_and_add() {
        let p = ForensicPath::new(512).child("GZIP") + 2;
        assert_eq!(p.to_string(), "512-GZIP-2");
        let q = p.append("ZIP").unwrap().append("40").unwrap();
        assert_eq!(q.to_string(), "512-GZIP-2-ZIP-40");
        assert!(p.append("zip").is_err());
        assert_eq!((ForensicPath::new(u64::MAX - 1) + 8).offset(), u64::MAX);
    }

    #[test]
    fn test_ordering() {
        let mut paths: Vec<ForensicPath> = ["1000", "512-GZIP-7", "512-GZIP-0", "512", "20"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        paths.sort();
        let rendered: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, ["20", "512", "512-GZIP-0", "512-GZIP-7", "1000"]);
    }

    #[test]
    fn test_render_mode() {
        let (p, mode) = ForensicPath::parse_with_mode("512-GZIP-0/h").unwrap();
        assert_eq!(p.to_string(), "512-GZIP-0");
        assert_eq!(mode, Some(RenderMode::Hex));
        let (_, mode) = ForensicPath::parse_with_mode("512-GZIP-2/r").unwrap();
        assert_eq!(mode, Some(RenderMode::Raw));
        assert!(ForensicPath::parse_with_mode("5/q").is_err());
    }
}
