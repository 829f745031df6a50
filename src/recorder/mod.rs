//! Feature recorders: named output channels for features, carves and histograms.
//!
//! All mutable recorder state sits behind the recorder's own mutex, so one
//! writer at a time touches a stream while different recorders never contend.

pub mod histogram;
pub mod set;
pub mod sink;

pub use histogram::{HistogramDef, HistogramStore, MemoryHistogram, SpillHistogram};
pub use set::{FeatureRecorderSet, RecorderSetConfig, SetFlags};
pub use sink::{FeatureCallback, MemorySink, SinkEvent, SinkKind};

use crate::error::{Result, ScanError};
use crate::path::ForensicPath;
use crate::sbuf::ScanBuffer;
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sink::Sink;
use std::fmt::Write as _;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{error, warn};

/// Recorder behavior bits; mutable at runtime through `set_flag`/`unset_flag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct RecorderFlags(u32);

impl RecorderFlags {
    pub const NONE: RecorderFlags = RecorderFlags(0);
    /// Feature and context are XML-escaped.
    pub const XML: RecorderFlags = RecorderFlags(1);
    /// Recorder may carve byte ranges.
    pub const CARVE: RecorderFlags = RecorderFlags(1 << 1);
    /// Suppress feature lines (carving still happens).
    pub const NO_FEATURES: RecorderFlags = RecorderFlags(1 << 2);
    /// Drop the context column.
    pub const NO_CONTEXT: RecorderFlags = RecorderFlags(1 << 3);
    /// Repeated feature text is written once.
    pub const DEDUP: RecorderFlags = RecorderFlags(1 << 4);
    /// Keep histograms in memory instead of spilling to disk.
    pub const MEM_HISTOGRAM: RecorderFlags = RecorderFlags(1 << 5);
    /// No output at all.
    pub const DISABLED: RecorderFlags = RecorderFlags(1 << 6);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: RecorderFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RecorderFlags {
    type Output = RecorderFlags;

    fn bitor(self, rhs: RecorderFlags) -> RecorderFlags {
        RecorderFlags(self.0 | rhs.0)
    }
}

/// A recorder as declared by a scanner during INIT.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FeatureRecorderDef {
    pub name: String,
    pub flags: RecorderFlags,
}

impl FeatureRecorderDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flags: RecorderFlags::NONE,
        }
    }

    pub fn with_flags(mut self, flags: RecorderFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub fn xml(self) -> Self {
        self.with_flags(RecorderFlags::XML)
    }

    pub fn carve(self) -> Self {
        self.with_flags(RecorderFlags::CARVE)
    }

    pub fn dedup(self) -> Self {
        self.with_flags(RecorderFlags::DEDUP)
    }
}

/// Which buffers may be carved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum CarveMode {
    Never,
    /// Only content that came out of a decoder (depth > 0).
    EncodedOnly,
    #[default]
    All,
}

/// Escape control bytes, DEL and backslash as `\ooo` so a feature stays on one line.
pub fn quote_feature(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || c.is_ascii_control() {
            let _ = write!(out, "\\{:03o}", c as u32);
        } else {
            out.push(c);
        }
    }
    out
}

/// XML-escape text for recorders flagged `XML`.
pub fn xml_escape(s: &str) -> String {
    html_escape::encode_safe(s).into_owned()
}

struct RecorderState {
    sink: Sink,
    next_seq: u64,
    seen: AHashSet<String>,
    carved: AHashMap<String, String>,
    histograms: Vec<(HistogramDef, HistogramStore)>,
    failure: Option<String>,
}

pub struct FeatureRecorder {
    name: String,
    flags: AtomicU32,
    carve_mode: CarveMode,
    state: Mutex<RecorderState>,
    features_written: AtomicU64,
    bytes_carved: AtomicU64,
}

impl FeatureRecorder {
    pub(crate) fn new(def: &FeatureRecorderDef, kind: &SinkKind, carve_mode: CarveMode) -> Result<Self> {
        let sink = Sink::open(kind, &def.name).map_err(|e| ScanError::RecorderIo {
            recorder: def.name.clone(),
            message: e.to_string(),
        })?;
        let next_seq = sink.first_carve_seq();
        Ok(Self {
            name: def.name.clone(),
            flags: AtomicU32::new(def.flags.bits()),
            carve_mode,
            state: Mutex::new(RecorderState {
                sink,
                next_seq,
                seen: AHashSet::new(),
                carved: AHashMap::new(),
                histograms: Vec::new(),
                failure: None,
            }),
            features_written: AtomicU64::new(0),
            bytes_carved: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> RecorderFlags {
        RecorderFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: RecorderFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn unset_flag(&self, flag: RecorderFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn features_written(&self) -> u64 {
        self.features_written.load(Ordering::Relaxed)
    }

    pub fn bytes_carved(&self) -> u64 {
        self.bytes_carved.load(Ordering::Relaxed)
    }

    /// First I/O failure on this stream, if any.
    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    /// Attach a histogram; memory-backed unless `spill_threshold` is given
    /// and the sink has a directory to spill into.
    pub(crate) fn add_histogram(&self, def: HistogramDef, memhist_limit: usize, spill_threshold: Option<usize>) {
        let mut st = self.state.lock();
        let store = match (spill_threshold, st.sink.spill_dir()) {
            (Some(threshold), Some(dir)) if !self.flags().contains(RecorderFlags::MEM_HISTOGRAM) => {
                HistogramStore::Spill(SpillHistogram::new(dir, &def.name(), threshold))
            }
            _ => HistogramStore::Memory(MemoryHistogram::new(memhist_limit)),
        };
        st.histograms.push((def, store));
    }

    fn fail(&self, st: &mut RecorderState, e: std::io::Error) {
        error!(recorder = %self.name, error = %e, "feature stream failed");
        if st.failure.is_none() {
            st.failure = Some(e.to_string());
        }
    }

    /// Record one feature. Failures are kept for shutdown, never raised here.
    pub fn write(&self, path: &ForensicPath, feature: &str, context: &str) {
        let flags = self.flags();
        if flags.contains(RecorderFlags::DISABLED) || flags.contains(RecorderFlags::NO_FEATURES) {
            return;
        }

        let mut feature = quote_feature(feature);
        let mut context = if flags.contains(RecorderFlags::NO_CONTEXT) {
            String::new()
        } else {
            quote_feature(context)
        };
        if flags.contains(RecorderFlags::XML) {
            feature = xml_escape(&feature);
            context = xml_escape(&context);
        }

        let mut st = self.state.lock();
        if st.failure.is_some() {
            return;
        }
        if flags.contains(RecorderFlags::DEDUP) && !st.seen.insert(feature.clone()) {
            return;
        }

        let line = format_line(path, &feature, &context);
        if let Err(e) = st.sink.write_line(&line) {
            self.fail(&mut st, e);
            return;
        }
        self.features_written.fetch_add(1, Ordering::Relaxed);

        let mut spill_error = None;
        for (def, store) in st.histograms.iter_mut() {
            if let Some(value) = def.reduce(&feature) {
                if let Err(e) = store.add(value) {
                    spill_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = spill_error {
            self.fail(&mut st, e);
        }
    }

    /// Carve `sbuf` (from `custom_offset` on) into a numbered artifact.
    ///
    /// Returns the number of bytes written; 0 when carving is disabled for
    /// this recorder or buffer, the range is empty, or identical content was
    /// already carved.
    ///
    /// Identical content is owned by whichever carve arrives first; later
    /// ones are logged as `<CACHED />` against it. Under several workers that
    /// owner follows arrival order, like the sequence numbers.
    pub fn carve(&self, sbuf: &ScanBuffer, extension: &str, custom_offset: usize) -> usize {
        let flags = self.flags();
        if !flags.contains(RecorderFlags::CARVE) || flags.contains(RecorderFlags::DISABLED) {
            return 0;
        }
        match self.carve_mode {
            CarveMode::Never => return 0,
            CarveMode::EncodedOnly if sbuf.depth() == 0 => return 0,
            _ => {}
        }
        let Some(data) = sbuf.data().get(custom_offset..) else {
            return 0;
        };
        if data.is_empty() {
            return 0;
        }

        let path = sbuf.pos0() + custom_offset as u64;
        let digest = format!("{:x}", Sha256::digest(data));
        let extension = if extension.is_empty() || extension.starts_with('.') {
            extension.to_string()
        } else {
            format!(".{extension}")
        };

        let mut st = self.state.lock();
        if st.failure.is_some() {
            return 0;
        }

        if let Some(previous) = st.carved.get(&digest).cloned() {
            if !flags.contains(RecorderFlags::NO_FEATURES) {
                let line = format_line(&path, &previous, "<CACHED />");
                if let Err(e) = st.sink.write_line(&line) {
                    self.fail(&mut st, e);
                }
            }
            return 0;
        }

        let seq = st.next_seq;
        st.next_seq += 1;
        let file_name = format!("{seq:03}-{path}{extension}");
        let relative = format!("{}/{}", self.name, file_name);

        if let Err(e) = st.sink.write_carve(&path, &file_name, data) {
            warn!(recorder = %self.name, path = %path, "carve failed");
            self.fail(&mut st, e);
            return 0;
        }
        st.carved.insert(digest.clone(), relative.clone());
        self.bytes_carved.fetch_add(data.len() as u64, Ordering::Relaxed);

        if !flags.contains(RecorderFlags::NO_FEATURES) {
            let context = format!(
                "<fileobject><filename>{relative}</filename><filesize>{}</filesize>\
                 <hashdigest type='sha256'>{digest}</hashdigest></fileobject>",
                data.len()
            );
            let line = format_line(&path, &relative, &context);
            match st.sink.write_line(&line) {
                Ok(()) => {
                    self.features_written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => self.fail(&mut st, e),
            }
        }
        data.len()
    }

    /// Current counts for each attached histogram, named.
    pub(crate) fn histogram_counts(&self) -> Result<Vec<(String, Vec<(String, u64)>)>> {
        let st = self.state.lock();
        st.histograms
            .iter()
            .map(|(def, store)| {
                let counts = store.counts().map_err(|e| ScanError::RecorderIo {
                    recorder: self.name.clone(),
                    message: e.to_string(),
                })?;
                Ok((def.name(), counts))
            })
            .collect()
    }

    pub(crate) fn write_histogram(&self, hist_name: &str, entries: &[(String, u64)]) {
        let mut st = self.state.lock();
        if let Err(e) = st.sink.write_histogram(hist_name, entries) {
            self.fail(&mut st, e);
        }
    }

    pub fn flush(&self) {
        let mut st = self.state.lock();
        if let Err(e) = st.sink.flush() {
            self.fail(&mut st, e);
        }
    }

    /// Flush, optionally sort by path, and drop spill files.
    pub(crate) fn close(&self, sort: bool) {
        let mut st = self.state.lock();
        let result = st.sink.flush().and_then(|_| {
            if sort {
                st.sink.sort_features()
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            self.fail(&mut st, e);
        }
        for (_, store) in st.histograms.iter_mut() {
            store.cleanup();
        }
    }

    /// Feature lines captured by a memory sink (empty for other sinks).
    pub fn memory_lines(&self) -> Vec<String> {
        self.state
            .lock()
            .sink
            .memory()
            .map(|m| m.lines.clone())
            .unwrap_or_default()
    }

    /// Carved artifacts captured by a memory sink.
    pub fn memory_carves(&self) -> Vec<(String, Vec<u8>)> {
        self.state
            .lock()
            .sink
            .memory()
            .map(|m| m.carves.clone())
            .unwrap_or_default()
    }

    /// Histograms written to a memory sink at shutdown.
    pub fn memory_histograms(&self) -> Vec<(String, Vec<(String, u64)>)> {
        self.state
            .lock()
            .sink
            .memory()
            .map(|m| m.histograms.clone())
            .unwrap_or_default()
    }
}

fn format_line(path: &ForensicPath, feature: &str, context: &str) -> String {
    if context.is_empty() {
        format!("{path}\t{feature}")
    } else {
        format!("{path}\t{feature}\t{context}")
    }
}

impl std::fmt::Debug for FeatureRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureRecorder")
            .field("name", &self.name)
            .field("flags", &self.flags())
            .finish()
    }
}
