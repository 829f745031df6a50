//! EXIF metadata extraction and JPEG carving.
//!
//! A JPEG start-of-image followed by an APP1 `Exif` segment is parsed as a
//! TIFF structure; the ASCII and rational tags of IFD0 and its Exif and GPS
//! sub-IFDs become one XML feature on `exif`, keyed by the SHA-256 of the
//! first 4 KiB of the image. GPS fixes are also written as CSV on `gps`.
//! Every JPEG that validates (complete, or truncated but large enough) is
//! carved to `jpeg_carved`. Bare TIFF headers are parsed the same way but
//! have no file to hash or carve.

use crate::error::Result;
use crate::recorder::{xml_escape, FeatureRecorder, FeatureRecorderDef};
use crate::sbuf::ScanBuffer;
use crate::scanner::{Init2Params, InitParams, ScanParams, Scanner};
use std::sync::Arc;
use tracing::trace;

pub const MIN_JPEG_SIZE: usize = 200;

/// Values longer than this are cut.
pub const MAX_ENTRY_SIZE: usize = 1000;

/// IFDs claiming more entries than this are not TIFF.
const MAX_IFD_ENTRIES: u16 = 1000;

const MAX_RATIONALS: u32 = 16;

/// Bytes hashed to key an image.
const HASH_PREFIX: usize = 4096;

/// Placeholder key for TIFF data with no enclosing file.
pub const NO_HASH: &str = "00000000000000000000000000000000";

const EXIF_RECORDER: &str = "exif";
const GPS_RECORDER: &str = "gps";
const JPEG_RECORDER: &str = "jpeg_carved";

const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_GPS_IFD: u16 = 0x8825;

const TYPE_ASCII: u16 = 2;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;
const TYPE_SRATIONAL: u16 = 10;
const TYPE_IFD: u16 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfdKind {
    Tiff,
    Exif,
    Gps,
}

impl IfdKind {
    fn label(self) -> &'static str {
        match self {
            IfdKind::Tiff => "tiff",
            IfdKind::Exif => "exif",
            IfdKind::Gps => "gps",
        }
    }

    fn tag_name(self, tag: u16) -> Option<&'static str> {
        let name = match (self, tag) {
            (IfdKind::Tiff, 0x010e) => "ImageDescription",
            (IfdKind::Tiff, 0x010f) => "Make",
            (IfdKind::Tiff, 0x0110) => "Model",
            (IfdKind::Tiff, 0x0131) => "Software",
            (IfdKind::Tiff, 0x0132) => "DateTime",
            (IfdKind::Tiff, 0x013b) => "Artist",
            (IfdKind::Tiff, 0x8298) => "Copyright",
            (IfdKind::Exif, 0x9003) => "DateTimeOriginal",
            (IfdKind::Exif, 0x9004) => "DateTimeDigitized",
            (IfdKind::Exif, 0xa420) => "ImageUniqueID",
            (IfdKind::Exif, 0xa430) => "CameraOwnerName",
            (IfdKind::Exif, 0xa431) => "BodySerialNumber",
            (IfdKind::Gps, 0x0001) => "GPSLatitudeRef",
            (IfdKind::Gps, 0x0002) => "GPSLatitude",
            (IfdKind::Gps, 0x0003) => "GPSLongitudeRef",
            (IfdKind::Gps, 0x0004) => "GPSLongitude",
            (IfdKind::Gps, 0x0006) => "GPSAltitude",
            (IfdKind::Gps, 0x0007) => "GPSTimeStamp",
            (IfdKind::Gps, 0x000d) => "GPSSpeed",
            (IfdKind::Gps, 0x000f) => "GPSTrack",
            (IfdKind::Gps, 0x001d) => "GPSDateStamp",
            _ => return None,
        };
        Some(name)
    }
}

/// One decoded tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExifEntry {
    pub ifd: IfdKind,
    pub name: &'static str,
    pub value: String,
}

impl ExifEntry {
    pub fn full_name(&self) -> String {
        format!("ifd0.{}.{}", self.ifd.label(), self.name)
    }
}

/// Offset of the TIFF header inside a JPEG's APP1 `Exif` segment, if any.
pub fn tiff_offset_from_exif(data: &[u8]) -> Option<usize> {
    if data.len() < 4 || data[0] != 0xff || data[1] != 0xd8 {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xff || data[pos + 1] & 0xf0 != 0xe0 {
            return None;
        }
        let marker = data[pos + 1];
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        if len < 2 {
            return None;
        }
        if marker == 0xe1 && data.get(pos + 4..pos + 10) == Some(b"Exif\0\0".as_slice()) {
            return Some(pos + 10);
        }
        pos += 2 + len;
    }
    None
}

/// Bounds-checked TIFF field access in the header's byte order.
struct Tiff<'a> {
    data: &'a [u8],
    big_endian: bool,
}

impl<'a> Tiff<'a> {
    fn new(data: &'a [u8]) -> Option<Self> {
        let big_endian = match data.get(..4)? {
            [b'I', b'I', 42, 0] => false,
            [b'M', b'M', 0, 42] => true,
            _ => return None,
        };
        Some(Self { data, big_endian })
    }

    fn u16(&self, at: usize) -> Option<u16> {
        let b = self.data.get(at..at.checked_add(2)?)?;
        Some(if self.big_endian {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        })
    }

    fn u32(&self, at: usize) -> Option<u32> {
        let b = self.data.get(at..at.checked_add(4)?)?;
        let b = [b[0], b[1], b[2], b[3]];
        Some(if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    fn ifd0(&self) -> Option<usize> {
        let at = self.u32(4)? as usize;
        (at >= 8 && at < self.data.len()).then_some(at)
    }

    /// Plausible entry count of the IFD at `at`.
    fn entry_count(&self, at: usize) -> Option<u16> {
        let n = self.u16(at)?;
        (n > 0 && n <= MAX_IFD_ENTRIES).then_some(n)
    }

    /// Where an entry's value lives: inline when it fits in four bytes.
    fn value_offset(&self, entry: usize, size: usize) -> Option<usize> {
        if size <= 4 {
            Some(entry + 8)
        } else {
            Some(self.u32(entry + 8)? as usize)
        }
    }

    fn ascii(&self, entry: usize, count: u32) -> Option<String> {
        let count = count as usize;
        let at = self.value_offset(entry, count)?;
        let end = at.checked_add(count)?.min(self.data.len());
        let raw = self.data.get(at..end)?;
        let raw = raw.split(|&b| b == 0).next().unwrap_or_default();
        let raw = &raw[..raw.len().min(MAX_ENTRY_SIZE)];
        Some(String::from_utf8_lossy(raw).trim().to_string())
    }

    fn rationals(&self, entry: usize, count: u32, signed: bool) -> Option<String> {
        let count = count.min(MAX_RATIONALS) as usize;
        let at = self.value_offset(entry, count * 8)?;
        let mut parts = Vec::with_capacity(count);
        for i in 0..count {
            let num = self.u32(at + i * 8)?;
            let den = self.u32(at + i * 8 + 4)?;
            if signed {
                parts.push(format!("{}/{}", num as i32, den as i32));
            } else {
                parts.push(format!("{num}/{den}"));
            }
        }
        Some(parts.join(" "))
    }

    /// Decode the known tags of one IFD, returning the sub-IFD pointers.
    fn read_ifd(&self, at: usize, kind: IfdKind, out: &mut Vec<ExifEntry>) -> Vec<(usize, IfdKind)> {
        let mut children = Vec::new();
        let Some(count) = self.entry_count(at) else {
            return children;
        };
        for i in 0..count as usize {
            let entry = at + 2 + i * 12;
            let (Some(tag), Some(ty), Some(n)) =
                (self.u16(entry), self.u16(entry + 2), self.u32(entry + 4))
            else {
                // truncated directory: keep what was read
                break;
            };
            if kind == IfdKind::Tiff && (tag == TAG_EXIF_IFD || tag == TAG_GPS_IFD) {
                if matches!(ty, TYPE_LONG | TYPE_IFD) {
                    if let Some(ptr) = self.u32(entry + 8) {
                        let sub = if tag == TAG_EXIF_IFD { IfdKind::Exif } else { IfdKind::Gps };
                        children.push((ptr as usize, sub));
                    }
                }
                continue;
            }
            let Some(name) = kind.tag_name(tag) else {
                continue;
            };
            let value = match ty {
                TYPE_ASCII => self.ascii(entry, n),
                TYPE_RATIONAL => self.rationals(entry, n, false),
                TYPE_SRATIONAL => self.rationals(entry, n, true),
                _ => None,
            };
            if let Some(value) = value {
                out.push(ExifEntry { ifd: kind, name, value });
            }
        }
        children
    }
}

/// Cheap structural check before any entry is decoded.
pub fn is_maybe_valid_tiff(data: &[u8]) -> bool {
    let Some(tiff) = Tiff::new(data) else {
        return false;
    };
    tiff.ifd0()
        .and_then(|at| tiff.entry_count(at))
        .is_some()
}

/// Entries of IFD0 and its Exif and GPS sub-IFDs. Damage past the first
/// entries truncates the list rather than failing.
pub fn read_tiff_entries(data: &[u8]) -> Vec<ExifEntry> {
    let mut entries = Vec::new();
    let Some(tiff) = Tiff::new(data) else {
        return entries;
    };
    let Some(ifd0) = tiff.ifd0() else {
        return entries;
    };
    let children = tiff.read_ifd(ifd0, IfdKind::Tiff, &mut entries);
    for (at, kind) in children {
        // sub-IFDs do not nest further
        tiff.read_ifd(at, kind, &mut entries);
    }
    entries
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegEnd {
    /// End-of-image marker found.
    Complete,
    /// Data ran out first.
    Truncated,
}

/// Walk the JPEG segments to the scan data, then look for end-of-image.
/// Returns the image length and whether it is complete.
pub fn validate_jpeg(data: &[u8]) -> Option<(usize, JpegEnd)> {
    if data.len() < 4 || data[..3] != [0xff, 0xd8, 0xff] {
        return None;
    }
    let mut pos = 2;
    loop {
        if pos + 2 > data.len() {
            return Some((data.len(), JpegEnd::Truncated));
        }
        if data[pos] != 0xff {
            return None;
        }
        let marker = data[pos + 1];
        match marker {
            // fill byte
            0xff => pos += 1,
            0xd9 => return Some((pos + 2, JpegEnd::Complete)),
            0x01 | 0xd0..=0xd7 => pos += 2,
            0xd8 | 0x00 => return None,
            _ => {
                if pos + 4 > data.len() {
                    return Some((data.len(), JpegEnd::Truncated));
                }
                let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
                if len < 2 {
                    return None;
                }
                pos += 2 + len;
                if marker == 0xda {
                    break;
                }
            }
        }
    }
    let entropy = data.get(pos..).unwrap_or_default();
    match entropy.windows(2).position(|w| w == [0xff, 0xd9]) {
        Some(i) => Some((pos + i + 2, JpegEnd::Complete)),
        None => Some((data.len(), JpegEnd::Truncated)),
    }
}

/// `a/b` as a float; a plain number parses as itself.
fn rational(s: &str) -> f64 {
    match s.split_once('/') {
        Some((top, bot)) => {
            let top: f64 = top.trim().parse().unwrap_or(0.0);
            let bot: f64 = bot.trim().parse().unwrap_or(0.0);
            if bot > 0.0 {
                top / bot
            } else {
                top
            }
        }
        None => s.trim().parse().unwrap_or(0.0),
    }
}

/// Degrees, minutes, seconds to decimal degrees.
fn fix_gps(s: &str) -> String {
    let parts: Vec<&str> = s.split(' ').collect();
    if parts.len() != 3 {
        return s.to_string();
    }
    let deg = rational(parts[0]) + rational(parts[1]) / 60.0 + rational(parts[2]) / 3600.0;
    format!("{deg:.6}")
}

fn fix_gps_ref(s: &str) -> &'static str {
    if s == "W" || s == "S" {
        "-"
    } else {
        ""
    }
}

/// `2011:06:25 12:20:11` to `2011-06-25T12:20:11`.
fn iso_datetime(s: &str) -> String {
    let mut b = s.as_bytes().to_vec();
    if b.len() == 19 {
        for i in [4, 7] {
            if b[i] == b'/' || b[i] == b':' {
                b[i] = b'-';
            }
        }
        if b[10] == b' ' {
            b[10] = b'T';
        }
    }
    String::from_utf8_lossy(&b).into_owned()
}

/// `2011:06:25` to `2011-06-25`.
fn iso_date(s: &str) -> String {
    if s.len() == 10 && s.is_ascii() {
        let mut b = s.as_bytes().to_vec();
        for i in [4, 7] {
            if b[i] == b':' {
                b[i] = b'-';
            }
        }
        String::from_utf8_lossy(&b).into_owned()
    } else {
        s.to_string()
    }
}

/// Three rationals (hours, minutes, seconds) to `HH:MM:SS`.
fn gps_time(s: &str) -> String {
    let parts: Vec<f64> = s.split(' ').map(rational).collect();
    match parts.as_slice() {
        [h, m, sec] => format!("{:02}:{:02}:{:02}", *h as u32, *m as u32, *sec as u32),
        _ => s.to_string(),
    }
}

/// The `<exif>` XML context for a set of entries, or None if every value
/// is empty.
pub fn format_exif(entries: &[ExifEntry]) -> Option<String> {
    let mut xml = String::from("<exif>");
    let mut any = false;
    for e in entries {
        let value = xml_escape(&e.value);
        if value.is_empty() {
            continue;
        }
        let name = e.full_name();
        xml.push_str(&format!("<{name}>{value}</{name}>"));
        any = true;
    }
    xml.push_str("</exif>");
    any.then_some(xml)
}

/// GPS fix as `time,lat,lon,elevation,speed,course`, if the entries carry
/// anything beyond a timestamp.
pub fn format_gps(entries: &[ExifEntry]) -> Option<String> {
    let mut exif_time = String::new();
    let (mut time, mut date) = (String::new(), String::new());
    let (mut lat_ref, mut lat, mut lon_ref, mut lon) = ("", String::new(), "", String::new());
    let (mut ele, mut speed, mut course) = (String::new(), String::new(), String::new());
    let mut has_gps = false;
    let mut has_gps_date = false;

    for e in entries {
        if e.name == "DateTimeOriginal" {
            exif_time = iso_datetime(&e.value);
        }
        if e.ifd != IfdKind::Gps {
            continue;
        }
        match e.name {
            "GPSTimeStamp" => {
                has_gps_date = true;
                time = gps_time(&e.value);
            }
            "GPSDateStamp" => {
                has_gps_date = true;
                date = iso_date(&e.value);
            }
            "GPSLongitudeRef" => {
                has_gps = true;
                lon_ref = fix_gps_ref(&e.value);
            }
            "GPSLongitude" => {
                has_gps = true;
                lon = fix_gps(&e.value);
            }
            "GPSLatitudeRef" => {
                has_gps = true;
                lat_ref = fix_gps_ref(&e.value);
            }
            "GPSLatitude" => {
                has_gps = true;
                lat = fix_gps(&e.value);
            }
            "GPSAltitude" => {
                has_gps = true;
                ele = format!("{:.6}", rational(&e.value));
            }
            "GPSSpeed" => {
                has_gps = true;
                speed = format!("{:.6}", rational(&e.value));
            }
            "GPSTrack" => {
                has_gps = true;
                course = e.value.clone();
            }
            _ => {}
        }
    }

    if !has_gps {
        return None;
    }
    let when = if has_gps_date {
        format!("{date}T{time}")
    } else {
        exif_time
    };
    Some(format!(
        "{when},{lat_ref}{lat},{lon_ref}{lon},{ele},{speed},{course}"
    ))
}

struct Recorders {
    exif: Arc<FeatureRecorder>,
    gps: Arc<FeatureRecorder>,
    jpeg: Arc<FeatureRecorder>,
}

pub struct ExifScanner {
    carve_min: usize,
    recorders: Option<Recorders>,
}

impl Default for ExifScanner {
    fn default() -> Self {
        Self {
            carve_min: 1000,
            recorders: None,
        }
    }
}

impl ExifScanner {
    /// Validate, carve and record the image starting at `img`. Returns the
    /// number of bytes to skip.
    fn process_jpeg(&self, rec: &Recorders, img: &ScanBuffer, entries: &[ExifEntry]) -> Result<usize> {
        let Some((len, end)) = validate_jpeg(img.data()) else {
            return Ok(0);
        };
        let mut skip = 0;
        if end == JpegEnd::Complete || len > self.carve_min {
            rec.jpeg.carve(&img.slice(0, len)?, ".jpg", 0);
            skip = len;
        }
        let hash = img.slice(0, HASH_PREFIX.min(img.bufsize()))?.sha256_hex();
        self.record(rec, img, &hash, entries);
        Ok(skip)
    }

    fn record(&self, rec: &Recorders, at: &ScanBuffer, hash: &str, entries: &[ExifEntry]) {
        if let Some(xml) = format_exif(entries) {
            rec.exif.write(at.pos0(), hash, &xml);
        }
        if let Some(csv) = format_gps(entries) {
            rec.gps.write(at.pos0(), hash, &csv);
        }
    }
}

impl Scanner for ExifScanner {
    fn init(&mut self, sp: &mut InitParams<'_>) -> Result<()> {
        sp.info.name = "exif".to_string();
        sp.info.author = "Bruce Allen".to_string();
        sp.info.version = "1.1".to_string();
        sp.info.description = "Search for EXIF sections in JPEG files".to_string();
        sp.info.min_sbuf_size = MIN_JPEG_SIZE;
        // context is composed as escaped markup here
        sp.info.feature_defs.push(FeatureRecorderDef::new(EXIF_RECORDER));
        sp.info.feature_defs.push(FeatureRecorderDef::new(GPS_RECORDER));
        sp.info
            .feature_defs
            .push(FeatureRecorderDef::new(JPEG_RECORDER).carve());
        self.carve_min = sp.get_config(
            "jpeg_carve_min",
            self.carve_min,
            "do not carve truncated JPEGs smaller than this",
        )?;
        Ok(())
    }

    fn init2(&mut self, sp: &Init2Params<'_>) -> Result<()> {
        self.recorders = Some(Recorders {
            exif: sp.named_feature_recorder(EXIF_RECORDER)?,
            gps: sp.named_feature_recorder(GPS_RECORDER)?,
            jpeg: sp.named_feature_recorder(JPEG_RECORDER)?,
        });
        Ok(())
    }

    fn scan(&self, sp: &mut ScanParams<'_>) -> Result<()> {
        let Some(rec) = self.recorders.as_ref() else {
            return Ok(());
        };
        let sbuf = sp.sbuf();
        let data = sbuf.data();

        // keep a full header's worth of bytes ahead when the margin is thin
        let mut limit = sbuf.pagesize();
        if sbuf.bufsize() - sbuf.pagesize() < MIN_JPEG_SIZE {
            limit = sbuf.bufsize().saturating_sub(MIN_JPEG_SIZE);
        }

        let mut start = 0;
        while start < limit {
            let b = |i: usize| sbuf.get_u8(start + i);
            if b(0) == 0xff && b(1) == 0xd8 && b(2) == 0xff && b(3) & 0xf0 == 0xe0 {
                let entries = match tiff_offset_from_exif(&data[start..]) {
                    Some(off) if is_maybe_valid_tiff(&data[start + off..]) => {
                        read_tiff_entries(&data[start + off..])
                    }
                    _ => Vec::new(),
                };
                let img = sbuf.slice_from(start)?;
                let skip = self.process_jpeg(rec, &img, &entries)?;
                trace!(path = %img.pos0(), len = skip, entries = entries.len(), "jpeg");
                start += skip.max(1);
                continue;
            }
            let tiff_magic = (b(0) == b'I' && b(1) == b'I' && b(2) == 42 && b(3) == 0)
                || (b(0) == b'M' && b(1) == b'M' && b(2) == 0 && b(3) == 42);
            if tiff_magic && is_maybe_valid_tiff(&data[start..]) {
                let entries = read_tiff_entries(&data[start..]);
                self.record(rec, &sbuf.slice_from(start)?, NO_HASH, &entries);
            }
            start += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ForensicPath;
    use crate::recorder::RecorderSetConfig;
    use crate::scanner::ScannerSet;
    use crate::types::ScannerConfig;

    type RawEntry = (u16, u16, u32, Vec<u8>);

    fn ascii(tag: u16, s: &str) -> RawEntry {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        (tag, TYPE_ASCII, v.len() as u32, v)
    }

    fn rationals(tag: u16, values: &[(u32, u32)]) -> RawEntry {
        let mut v = Vec::new();
        for (n, d) in values {
            v.extend(n.to_le_bytes());
            v.extend(d.to_le_bytes());
        }
        (tag, TYPE_RATIONAL, values.len() as u32, v)
    }

    fn long(tag: u16, value: u32) -> RawEntry {
        (tag, TYPE_LONG, 1, value.to_le_bytes().to_vec())
    }

    /// Little-endian IFD at `at`; large values go to the end of `t`.
    fn put_ifd(t: &mut Vec<u8>, at: usize, entries: &[RawEntry]) {
        let end = at + 2 + entries.len() * 12 + 4;
        if t.len() < end.max(600) {
            t.resize(end.max(600), 0);
        }
        t[at..at + 2].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        for (i, (tag, ty, count, value)) in entries.iter().enumerate() {
            let e = at + 2 + i * 12;
            t[e..e + 2].copy_from_slice(&tag.to_le_bytes());
            t[e + 2..e + 4].copy_from_slice(&ty.to_le_bytes());
            t[e + 4..e + 8].copy_from_slice(&count.to_le_bytes());
            if value.len() <= 4 {
                t[e + 8..e + 8 + value.len()].copy_from_slice(value);
            } else {
                let off = t.len() as u32;
                t.extend_from_slice(value);
                t[e + 8..e + 12].copy_from_slice(&off.to_le_bytes());
            }
        }
    }

    fn tiff() -> Vec<u8> {
        let mut t = b"II*\0".to_vec();
        t.extend(8u32.to_le_bytes());
        put_ifd(
            &mut t,
            8,
            &[ascii(0x010f, "Canon"), long(TAG_EXIF_IFD, 200), long(TAG_GPS_IFD, 300)],
        );
        put_ifd(&mut t, 200, &[ascii(0x9003, "2011:06:25 12:20:11")]);
        put_ifd(
            &mut t,
            300,
            &[
                ascii(0x0001, "N"),
                rationals(0x0002, &[(40, 1), (26, 1), (46, 1)]),
                ascii(0x0003, "W"),
                rationals(0x0004, &[(79, 1), (58, 1), (56, 1)]),
                rationals(0x0007, &[(12, 1), (20, 1), (11, 1)]),
                ascii(0x001d, "2011:06:25"),
            ],
        );
        t
    }

    fn jpeg(tiff: &[u8]) -> Vec<u8> {
        let mut j = vec![0xff, 0xd8, 0xff, 0xe1];
        j.extend(((2 + 6 + tiff.len()) as u16).to_be_bytes());
        j.extend(b"Exif\0\0");
        j.extend(tiff);
        j.extend([0xff, 0xda, 0x00, 0x08, 0x01, 0x01, 0x00, 0x3f, 0x00, 0x00]);
        j.extend(vec![0x11u8; 200]);
        j.extend([0xff, 0xd9]);
        j
    }

    fn run(data: Vec<u8>) -> ScannerSet {
        let mut set = ScannerSet::new(ScannerConfig::default(), RecorderSetConfig::default(), 0);
        set.add_scanner(Box::new(ExifScanner::default())).unwrap();
        set.apply_commands().unwrap();
        set.process_buffer(ScanBuffer::from_vec(ForensicPath::new(0), data))
            .unwrap();
        set
    }

    #[test]
    fn test_reads_ifd_tags() {
        let entries = read_tiff_entries(&tiff());
        let names: Vec<String> = entries.iter().map(|e| e.full_name()).collect();
        assert_eq!(names[0], "ifd0.tiff.Make");
        assert_eq!(names[1], "ifd0.exif.DateTimeOriginal");
        assert!(names.contains(&"ifd0.gps.GPSLatitude".to_string()));
        assert_eq!(entries[0].value, "Canon");
        let lat = entries.iter().find(|e| e.name == "GPSLatitude").unwrap();
        assert_eq!(lat.value, "40/1 26/1 46/1");
    }

    #[test]
    fn test_tiff_sanity() {
        assert!(is_maybe_valid_tiff(&tiff()));
        assert!(!is_maybe_valid_tiff(b"II*\0\x04\0\0\0"));
        assert!(!is_maybe_valid_tiff(b"MM\0*\0\0\0\x08\0\0"));
        assert!(!is_maybe_valid_tiff(b"not a tiff"));
    }

    #[test]
    fn test_jpeg_validation() {
        let j = jpeg(&tiff());
        assert_eq!(validate_jpeg(&j), Some((j.len(), JpegEnd::Complete)));
        let cut = &j[..j.len() - 50];
        assert_eq!(validate_jpeg(cut), Some((cut.len(), JpegEnd::Truncated)));
        assert_eq!(validate_jpeg(&[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x00]), None);
        assert_eq!(tiff_offset_from_exif(&j), Some(12));
    }

    #[test]
    fn test_gps_formatting() {
        let csv = format_gps(&read_tiff_entries(&tiff())).unwrap();
        assert_eq!(csv, "2011-06-25T12:20:11,40.446111,-79.982222,,,");
        assert_eq!(iso_datetime("2011:06:25 12:20:11"), "2011-06-25T12:20:11");
        assert!(format_gps(&[]).is_none());
    }

    #[test]
    fn test_jpeg_with_exif_carved_and_recorded() {
        const S: usize = 1000;
        let img = jpeg(&tiff());
        let mut data = vec![0u8; 8192];
        data[S..S + img.len()].copy_from_slice(&img);
        let expected_hash = {
            let sbuf = ScanBuffer::from_vec(ForensicPath::new(0), data.clone());
            sbuf.slice(S, HASH_PREFIX).unwrap().sha256_hex()
        };

        let set = run(data);
        let recorders = set.recorders().unwrap();

        let carves = recorders.get(JPEG_RECORDER).unwrap().memory_carves();
        assert_eq!(carves.len(), 1);
        assert_eq!(carves[0].0, "000-1000.jpg");
        assert_eq!(carves[0].1, img);

        let exif = recorders.get(EXIF_RECORDER).unwrap().memory_lines();
        assert_eq!(exif.len(), 1);
        let fields: Vec<&str> = exif[0].split('\t').collect();
        assert_eq!(fields[0], "1000");
        assert_eq!(fields[1], expected_hash);
        assert!(fields[2].starts_with("<exif><ifd0.tiff.Make>Canon</ifd0.tiff.Make>"));

        let gps = recorders.get(GPS_RECORDER).unwrap().memory_lines();
        assert_eq!(gps.len(), 1);
        assert!(gps[0].ends_with("\t2011-06-25T12:20:11,40.446111,-79.982222,,,"));
    }

    #[test]
    fn test_bare_tiff_uses_placeholder_hash() {
        let mut data = vec![0u8; 4096];
        let t = tiff();
        data[64..64 + t.len()].copy_from_slice(&t);
        let set = run(data);
        let recorders = set.recorders().unwrap();
        let exif = recorders.get(EXIF_RECORDER).unwrap().memory_lines();
        assert_eq!(exif.len(), 1);
        assert!(exif[0].starts_with(&format!("64\t{NO_HASH}\t<exif>")));
        assert!(recorders.get(JPEG_RECORDER).unwrap().memory_carves().is_empty());
    }
}
