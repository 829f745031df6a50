use super::{CarveMode, FeatureRecorder, FeatureRecorderDef, HistogramDef, RecorderFlags, SinkKind};
use crate::error::{Result, ScanError};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Set-wide switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetFlags {
    /// Asking for an unknown recorder is an error instead of a silent no-op.
    pub pedantic: bool,
    /// Keep every histogram in memory.
    pub mem_histogram: bool,
    /// Rewrite feature files in path order at shutdown.
    pub sort_features: bool,
    /// Output is suppressed entirely.
    pub disabled: bool,
}

#[derive(Debug, Clone)]
pub struct RecorderSetConfig {
    pub sink: SinkKind,
    pub flags: SetFlags,
    pub carve_mode: CarveMode,
    /// Distinct values a memory histogram keeps (0 = unbounded).
    pub memhist_limit: usize,
    /// Distinct values a spill histogram buffers before writing a run.
    pub spill_threshold: usize,
}

impl Default for RecorderSetConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Memory,
            flags: SetFlags::default(),
            carve_mode: CarveMode::default(),
            memhist_limit: 0,
            spill_threshold: 100_000,
        }
    }
}

/// All recorders of one run, keyed by name.
#[derive(Debug)]
pub struct FeatureRecorderSet {
    recorders: BTreeMap<String, Arc<FeatureRecorder>>,
    flags: SetFlags,
}

impl FeatureRecorderSet {
    /// Open one recorder per definition and attach the histograms.
    ///
    /// Definitions sharing a name are merged by OR-ing their flags.
    pub fn new(
        defs: &[FeatureRecorderDef],
        histograms: &[HistogramDef],
        config: &RecorderSetConfig,
    ) -> Result<Self> {
        if let SinkKind::File { outdir } = &config.sink {
            std::fs::create_dir_all(outdir)?;
        }

        let mut merged: BTreeMap<&str, RecorderFlags> = BTreeMap::new();
        for def in defs {
            let flags = merged.entry(def.name.as_str()).or_default();
            *flags = *flags | def.flags;
        }

        let mut recorders = BTreeMap::new();
        for (name, flags) in merged {
            let mut flags = flags;
            if config.flags.mem_histogram {
                flags = flags | RecorderFlags::MEM_HISTOGRAM;
            }
            if config.flags.disabled {
                flags = flags | RecorderFlags::DISABLED;
            }
            let def = FeatureRecorderDef::new(name).with_flags(flags);
            let recorder = FeatureRecorder::new(&def, &config.sink, config.carve_mode)?;
            recorders.insert(name.to_string(), Arc::new(recorder));
        }

        let set = Self {
            recorders,
            flags: config.flags,
        };

        let spill = match config.sink {
            SinkKind::File { .. } => Some(config.spill_threshold),
            _ => None,
        };
        for def in histograms {
            match set.recorders.get(&def.recorder) {
                Some(r) => r.add_histogram(def.clone(), config.memhist_limit, spill),
                None if set.flags.pedantic => {
                    return Err(ScanError::NoSuchRecorder(def.recorder.clone()));
                }
                None => debug!(histogram = %def.name(), "no recorder for histogram"),
            }
        }

        info!(recorders = set.recorders.len(), "feature recorders opened");
        Ok(set)
    }

    pub fn flags(&self) -> SetFlags {
        self.flags
    }

    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.recorders.keys().map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.recorders.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<FeatureRecorder>> {
        self.recorders.get(name).cloned()
    }

    /// Look up a recorder by name. Unknown names fail with `NoSuchRecorder`.
    pub fn named_feature_recorder(&self, name: &str) -> Result<Arc<FeatureRecorder>> {
        self.get(name)
            .ok_or_else(|| ScanError::NoSuchRecorder(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FeatureRecorder>> {
        self.recorders.values()
    }

    /// Compute every histogram and hand each `(count, name, value)` to `cb`.
    ///
    /// Histograms are computed in parallel, delivered in name order. Each is
    /// also written to its recorder's sink.
    pub fn dump_histograms<F>(&self, mut cb: F) -> Result<()>
    where
        F: FnMut(u64, &str, &str),
    {
        let computed: Vec<(Arc<FeatureRecorder>, Vec<(String, Vec<(String, u64)>)>)> = self
            .recorders
            .values()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|r| r.histogram_counts().map(|h| (Arc::clone(*r), h)))
            .collect::<Result<_>>()?;

        for (recorder, histograms) in computed {
            for (name, entries) in histograms {
                for (value, count) in &entries {
                    cb(*count, &name, value);
                }
                recorder.write_histogram(&name, &entries);
            }
        }
        Ok(())
    }

    /// Close every recorder; the first stream failure is returned.
    pub fn shutdown(&self) -> Result<()> {
        for r in self.recorders.values() {
            r.close(self.flags.sort_features);
        }
        match self
            .recorders
            .values()
            .find_map(|r| r.failure().map(|m| (r.name().to_string(), m)))
        {
            Some((recorder, message)) => Err(ScanError::RecorderIo { recorder, message }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ForensicPath;
    use crate::sbuf::ScanBuffer;

    fn defs() -> Vec<FeatureRecorderDef> {
        vec![
            FeatureRecorderDef::new("email"),
            FeatureRecorderDef::new("jpeg_carved").carve(),
            FeatureRecorderDef::new("email").dedup(),
        ]
    }

    #[test]
    fn test_duplicate_defs_merge() {
        let set = FeatureRecorderSet::new(&defs(), &[], &RecorderSetConfig::default()).unwrap();
        assert_eq!(set.len(), 2);
        let email = set.named_feature_recorder("email").unwrap();
        assert!(email.flags().contains(RecorderFlags::DEDUP));
        assert!(matches!(
            set.named_feature_recorder("nope"),
            Err(ScanError::NoSuchRecorder(_))
        ));
    }

    #[test]
    fn test_pedantic_rejects_orphan_histogram() {
        let hist = [HistogramDef::new("url", "")];
        let mut config = RecorderSetConfig::default();
        assert!(FeatureRecorderSet::new(&defs(), &hist, &config).is_ok());
        config.flags.pedantic = true;
        assert!(matches!(
            FeatureRecorderSet::new(&defs(), &hist, &config),
            Err(ScanError::NoSuchRecorder(_))
        ));
    }

    #[test]
    fn test_stream_failure_stays_with_its_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let config = RecorderSetConfig {
            sink: SinkKind::File { outdir: out.clone() },
            ..Default::default()
        };
        let set = FeatureRecorderSet::new(&defs(), &[], &config).unwrap();
        // a plain file where the carve directory belongs
        std::fs::write(out.join("jpeg_carved"), b"in the way").unwrap();

        let carved = set.named_feature_recorder("jpeg_carved").unwrap();
        let email = set.named_feature_recorder("email").unwrap();
        let sbuf = ScanBuffer::from_vec(ForensicPath::new(4096), b"\xff\xd8\xff\xe0 not really".to_vec());
        assert_eq!(carved.carve(&sbuf, ".jpg", 0), 0);
        assert!(carved.failure().is_some());

        carved.write(&ForensicPath::new(1), "after", "failure");
        assert_eq!(carved.features_written(), 0);
        email.write(&ForensicPath::new(10), "a@b.com", "");
        assert!(email.failure().is_none());

        match set.shutdown() {
            Err(ScanError::RecorderIo { recorder, .. }) => assert_eq!(recorder, "jpeg_carved"),
            other => panic!("expected a recorder failure, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(out.join("email.txt")).unwrap(), "10\ta@b.com\n");
        assert_eq!(std::fs::read_to_string(out.join("jpeg_carved.txt")).unwrap(), "");
    }

    #[test]
    fn test_file_sink_writes_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecorderSetConfig {
            sink: SinkKind::File {
                outdir: dir.path().join("out"),
            },
            flags: SetFlags {
                sort_features: true,
                ..Default::default()
            },
            spill_threshold: 1,
            ..Default::default()
        };
        let hist = [HistogramDef::new("email", "domain").with_pattern("@(.*)").unwrap()];
        let set = FeatureRecorderSet::new(&[FeatureRecorderDef::new("email")], &hist, &config).unwrap();
        let email = set.named_feature_recorder("email").unwrap();
        email.write(&ForensicPath::new(900), "z@b.com", "");
        email.write(&ForensicPath::new(10), "a@b.com", "");
        email.write(&ForensicPath::new(50), "q@c.org", "");

        let mut seen = Vec::new();
        set.dump_histograms(|count, name, value| seen.push(format!("{name} {count} {value}")))
            .unwrap();
        set.shutdown().unwrap();

        assert_eq!(seen, ["email_domain 2 b.com", "email_domain 1 c.org"]);
        let out = dir.path().join("out");
        let features = std::fs::read_to_string(out.join("email.txt")).unwrap();
        assert_eq!(features, "10\ta@b.com\n50\tq@c.org\n900\tz@b.com\n");
        let histogram = std::fs::read_to_string(out.join("email_domain.txt")).unwrap();
        assert_eq!(histogram, "2\tb.com\n1\tc.org\n");
        // spill runs are gone after shutdown
        let leftovers = std::fs::read_dir(&out)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".part"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_disabled_set_writes_nothing() {
        let config = RecorderSetConfig {
            flags: SetFlags {
                disabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let set = FeatureRecorderSet::new(&defs(), &[], &config).unwrap();
        let email = set.named_feature_recorder("email").unwrap();
        email.write(&ForensicPath::new(0), "a@b.c", "");
        assert!(email.memory_lines().is_empty());
    }
}
