//! Feature histograms.
//!
//! Two backends share one contract: [`MemoryHistogram`] keeps a bounded table
//! in memory, [`SpillHistogram`] writes sorted partial counts to disk and
//! merges them when the histogram is dumped.

use crate::error::{Result, ScanError};
use ahash::AHashMap;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// How a recorder's feature text is reduced to a histogram key.
#[derive(Debug, Clone)]
pub struct HistogramDef {
    pub recorder: String,
    pub suffix: String,
    pub pattern: Option<Regex>,
    pub require: Option<String>,
    pub lowercase: bool,
    pub numeric: bool,
}

impl HistogramDef {
    pub fn new(recorder: &str, suffix: &str) -> Self {
        Self {
            recorder: recorder.to_string(),
            suffix: suffix.to_string(),
            pattern: None,
            require: None,
            lowercase: false,
            numeric: false,
        }
    }

    /// Key on the first capture group of `pattern` (or the whole match).
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| ScanError::Config(format!("histogram pattern '{pattern}': {e}")))?;
        self.pattern = Some(re);
        Ok(self)
    }

    /// Only count features containing `needle`.
    pub fn with_require(mut self, needle: &str) -> Self {
        self.require = Some(needle.to_string());
        self
    }

    pub fn lowercase(mut self) -> Self {
        self.lowercase = true;
        self
    }

    pub fn numeric(mut self) -> Self {
        self.numeric = true;
        self
    }

    /// Histogram name, also the stem of its output file.
    pub fn name(&self) -> String {
        if self.suffix.is_empty() {
            format!("{}_histogram", self.recorder)
        } else {
            format!("{}_{}", self.recorder, self.suffix)
        }
    }

    pub fn reduce(&self, feature: &str) -> Option<String> {
        if let Some(needle) = &self.require {
            if !feature.contains(needle.as_str()) {
                return None;
            }
        }

        let mut value = match &self.pattern {
            Some(re) => {
                let caps = re.captures(feature)?;
                caps.get(1).or_else(|| caps.get(0))?.as_str().to_string()
            }
            None => feature.to_string(),
        };

        if self.numeric {
            value.retain(|c| c.is_ascii_digit());
        }
        if self.lowercase {
            value = value.to_lowercase();
        }
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

/// Sort counted values: highest count first, ties by value.
pub fn sort_counts(entries: &mut [(String, u64)]) {
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}

/// In-memory histogram bounded by `limit` distinct values (0 = unbounded).
///
/// Past the limit the entry with the lowest count is evicted; among equal
/// counts the one inserted first goes.
#[derive(Debug, Default)]
pub struct MemoryHistogram {
    limit: usize,
    entries: AHashMap<String, (u64, u64)>,
    order: BTreeMap<(u64, u64), String>,
    next_seq: u64,
    evicted: u64,
}

impl MemoryHistogram {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn add(&mut self, value: String) {
        if let Some((count, seq)) = self.entries.get_mut(&value) {
            self.order.remove(&(*count, *seq));
            *count += 1;
            self.order.insert((*count, *seq), value);
            return;
        }

        if self.limit > 0 && self.entries.len() >= self.limit {
            if let Some((_, victim)) = self.order.pop_first() {
                self.entries.remove(&victim);
                self.evicted += 1;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(value.clone(), (1, seq));
        self.order.insert((1, seq), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct values dropped because of the limit.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn counts(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|(k, (c, _))| (k.clone(), *c))
            .collect();
        sort_counts(&mut out);
        out
    }
}

/// Disk-backed histogram: partial counts spill to sorted run files.
#[derive(Debug)]
pub struct SpillHistogram {
    dir: PathBuf,
    stem: String,
    threshold: usize,
    pending: AHashMap<String, u64>,
    parts: Vec<PathBuf>,
}

impl SpillHistogram {
    pub fn new(dir: &Path, stem: &str, threshold: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
            threshold: threshold.max(1),
            pending: AHashMap::new(),
            parts: Vec::new(),
        }
    }

    pub fn add(&mut self, value: String) -> std::io::Result<()> {
        *self.pending.entry(value).or_insert(0) += 1;
        if self.pending.len() >= self.threshold {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> std::io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut run: Vec<(String, u64)> = self.pending.drain().collect();
        run.sort_by(|a, b| a.0.cmp(&b.0));

        let path = self
            .dir
            .join(format!(".{}.part{}", self.stem, self.parts.len()));
        let mut out = BufWriter::new(File::create(&path)?);
        for (value, count) in &run {
            writeln!(out, "{count}\t{value}")?;
        }
        out.flush()?;
        self.parts.push(path);
        Ok(())
    }

    pub fn parts(&self) -> usize {
        self.parts.len()
    }

    /// Merge every spilled run with the in-memory remainder.
    pub fn counts(&self) -> std::io::Result<Vec<(String, u64)>> {
        let mut readers = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            readers.push(BufReader::new(File::open(part)?).lines());
        }

        let mut heap = BinaryHeap::new();
        for (idx, reader) in readers.iter_mut().enumerate() {
            if let Some(entry) = next_run_entry(reader)? {
                heap.push(Reverse((entry.0, idx, entry.1)));
            }
        }

        let mut merged: Vec<(String, u64)> = Vec::new();
        while let Some(Reverse((value, idx, count))) = heap.pop() {
            match merged.last_mut() {
                Some(last) if last.0 == value => last.1 += count,
                _ => merged.push((value, count)),
            }
            if let Some(entry) = next_run_entry(&mut readers[idx])? {
                heap.push(Reverse((entry.0, idx, entry.1)));
            }
        }

        // Runs are value-sorted, so the merge output is too.
        for (value, count) in &self.pending {
            match merged.binary_search_by(|probe| probe.0.as_str().cmp(value)) {
                Ok(pos) => merged[pos].1 += count,
                Err(pos) => merged.insert(pos, (value.clone(), *count)),
            }
        }

        sort_counts(&mut merged);
        Ok(merged)
    }

    pub fn remove_parts(&mut self) {
        for part in self.parts.drain(..) {
            let _ = fs::remove_file(part);
        }
    }
}

fn next_run_entry(
    lines: &mut std::io::Lines<BufReader<File>>,
) -> std::io::Result<Option<(String, u64)>> {
    match lines.next() {
        None => Ok(None),
        Some(line) => {
            let line = line?;
            let (count, value) = line.split_once('\t').ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt histogram run")
            })?;
            let count = count.parse::<u64>().map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?;
            Ok(Some((value.to_string(), count)))
        }
    }
}

/// Backend chosen for one histogram when its recorder is built.
#[derive(Debug)]
pub enum HistogramStore {
    Memory(MemoryHistogram),
    Spill(SpillHistogram),
}

impl HistogramStore {
    pub fn add(&mut self, value: String) -> std::io::Result<()> {
        match self {
            HistogramStore::Memory(h) => {
                h.add(value);
                Ok(())
            }
            HistogramStore::Spill(h) => h.add(value),
        }
    }

    pub fn counts(&self) -> std::io::Result<Vec<(String, u64)>> {
        match self {
            HistogramStore::Memory(h) => Ok(h.counts()),
            HistogramStore::Spill(h) => h.counts(),
        }
    }

    pub fn cleanup(&mut self) {
        if let HistogramStore::Spill(h) = self {
            h.remove_parts();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_with_pattern() {
        let def = HistogramDef::new("email", "domain")
            .with_pattern("@(.*)")
            .unwrap()
            .lowercase();
        assert_eq!(def.reduce("Bob@Example.COM").as_deref(), Some("example.com"));
        assert_eq!(def.reduce("no at sign"), None);
        assert_eq!(def.name(), "email_domain");
        assert_eq!(HistogramDef::new("ip", "").name(), "ip_histogram");
    }

    #[test]
    fn test_reduce_require_and_numeric() {
        let def = HistogramDef::new("tel", "").with_require("+1").numeric();
        assert_eq!(def.reduce("+1 (555) 010-9999").as_deref(), Some("15550109999"));
        assert_eq!(def.reduce("555 0100"), None);
        assert!(HistogramDef::new("x", "").with_pattern("(").is_err());
    }

    #[test]
    fn test_memory_counts_sorted() {
        let mut h = MemoryHistogram::new(0);
        for v in ["b", "a", "c", "a", "b", "a"] {
            h.add(v.to_string());
        }
        assert_eq!(
            h.counts(),
            vec![("a".to_string(), 3), ("b".to_string(), 2), ("c".to_string(), 1)]
        );
    }

    #[test]
    fn test_memory_eviction_lowest_then_oldest() {
        let mut h = MemoryHistogram::new(2);
        h.add("x".to_string());
        h.add("x".to_string());
        h.add("y".to_string());
        h.add("z".to_string()); // evicts y: count 1, older than z
        let keys: Vec<String> = h.counts().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["x", "z"]);
        assert_eq!(h.evicted(), 1);
        h.add("w".to_string()); // evicts z
        let keys: Vec<String> = h.counts().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["x", "w"]);
    }

    #[test]
    fn test_spill_merge_matches_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillHistogram::new(dir.path(), "email_histogram", 2);
        let mut mem = MemoryHistogram::new(0);
        for v in ["a", "b", "c", "a", "d", "a", "c", "e", "b", "a"] {
            spill.add(v.to_string()).unwrap();
            mem.add(v.to_string());
        }
        assert!(spill.parts() > 1);
        assert_eq!(spill.counts().unwrap(), mem.counts());
        spill.remove_parts();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
