use crate::error::{Result, ScanError};
use crate::recorder::{CarveMode, RecorderSetConfig, SetFlags, SinkKind};
use crate::sbuf::RangePolicy;
use serde::Serialize;
use std::collections::BTreeMap;

/// Image scan configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Primary bytes per page
    pub pagesize: usize,

    /// Look-ahead bytes appended to each page
    pub marginsize: usize,

    /// Derived buffers are scanned only while their decoder depth is below this
    pub max_depth: usize,

    /// Worker threads (0 = everything on the driver thread)
    pub num_threads: usize,

    /// Queue bound in buffers
    pub max_queue_buffers: usize,

    /// Queue bound in bytes
    pub max_queue_bytes: u64,

    /// Fraction of blocks to scan; >= 1.0 scans every page
    pub sample_fraction: f64,

    /// Seed for reproducible sampling
    pub sample_seed: Option<u64>,

    pub range_policy: RangePolicy,
    pub carve_mode: CarveMode,

    /// Distinct values per in-memory histogram (0 = unbounded)
    pub memhist_limit: usize,

    pub pedantic: bool,
    pub mem_histogram: bool,
    pub sort_features: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            pagesize: 16 * 1024 * 1024,
            marginsize: 4 * 1024 * 1024,
            max_depth: 7,
            num_threads: 0,
            max_queue_buffers: 0,
            max_queue_bytes: 0,
            sample_fraction: 1.0,
            sample_seed: None,
            range_policy: RangePolicy::Strict,
            carve_mode: CarveMode::All,
            memhist_limit: 0,
            pedantic: false,
            mem_histogram: false,
            sort_features: true,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pagesize == 0 {
            return Err(ScanError::Config("page size must be positive".to_string()));
        }
        if self.sample_fraction.is_nan() || self.sample_fraction <= 0.0 {
            return Err(ScanError::Config(format!(
                "sampling fraction {} must be > 0",
                self.sample_fraction
            )));
        }
        Ok(())
    }

    /// True when only a fraction of the blocks is visited.
    pub fn is_sampling(&self) -> bool {
        self.sample_fraction < 1.0
    }

    /// Queue bound in buffers; defaults to two per worker.
    pub fn queue_buffers(&self) -> usize {
        if self.max_queue_buffers > 0 {
            self.max_queue_buffers
        } else {
            (self.num_threads * 2).max(1)
        }
    }

    /// Queue bound in bytes; defaults to the buffer bound times one page.
    pub fn queue_bytes(&self) -> u64 {
        if self.max_queue_bytes > 0 {
            self.max_queue_bytes
        } else {
            self.queue_buffers() as u64 * (self.pagesize + self.marginsize) as u64
        }
    }

    pub fn recorder_config(&self, sink: SinkKind) -> RecorderSetConfig {
        RecorderSetConfig {
            sink,
            flags: SetFlags {
                pedantic: self.pedantic,
                mem_histogram: self.mem_histogram,
                sort_features: self.sort_features,
                disabled: false,
            },
            carve_mode: self.carve_mode,
            memhist_limit: self.memhist_limit,
            ..Default::default()
        }
    }
}

/// Enable/disable requests applied by `ScannerSet::apply_commands`, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerCommand {
    Enable(String),
    Disable(String),
    EnableAll,
    DisableAll,
    DisableRecorder(String),
}

/// Scanner selection and per-scanner option values
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    pub options: BTreeMap<String, String>,
    pub commands: Vec<ScannerCommand>,
}

impl ScannerConfig {
    pub fn set(&mut self, name: &str, value: &str) -> &mut Self {
        self.options.insert(name.to_string(), value.to_string());
        self
    }

    /// Parse a `name=value` option.
    pub fn set_pair(&mut self, pair: &str) -> Result<()> {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| ScanError::Config(format!("option '{pair}' is not name=value")))?;
        if name.is_empty() {
            return Err(ScanError::Config(format!("option '{pair}' has no name")));
        }
        self.set(name, value);
        Ok(())
    }

    pub fn enable(&mut self, name: &str) -> &mut Self {
        self.commands.push(ScannerCommand::Enable(name.to_string()));
        self
    }

    pub fn disable(&mut self, name: &str) -> &mut Self {
        self.commands.push(ScannerCommand::Disable(name.to_string()));
        self
    }

    /// Disable everything, then enable only `name`.
    pub fn enable_only(&mut self, name: &str) -> &mut Self {
        self.commands.push(ScannerCommand::DisableAll);
        self.enable(name)
    }

    pub fn disable_recorder(&mut self, name: &str) -> &mut Self {
        self.commands
            .push(ScannerCommand::DisableRecorder(name.to_string()));
        self
    }
}

/// Progress update sent via tokio channel
#[derive(Debug, Clone)]
pub enum ScanProgress {
    /// Page handed to the registry (or its work queue)
    PageSubmitted { path: String, bytes: u64 },
    /// Page could not be read (non-fatal)
    ReadError { path: String, message: String },
    /// Producer finished; totals follow in `RunStats`
    Finished { pages: u64 },
}

/// Counters the driver exposes to reporting
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub pages: u64,
    pub bytes: u64,
    pub read_errors: u64,
    pub scanner_faults: u64,
    pub elapsed_secs: f64,
    pub sampled: bool,
    pub stopped_early: bool,
}

impl RunStats {
    pub fn throughput_mb_s(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            0.0
        } else {
            self.bytes as f64 / (1024.0 * 1024.0) / self.elapsed_secs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut config = ScanConfig::default();
        assert!(config.validate().is_ok());
        config.sample_fraction = 0.0;
        assert!(config.validate().is_err());
        config.sample_fraction = 2.5;
        assert!(config.validate().is_ok());
        assert!(!config.is_sampling());
    }

    #[test]
    fn test_queue_defaults() {
        let config = ScanConfig {
            pagesize: 1000,
            marginsize: 24,
            num_threads: 3,
            ..Default::default()
        };
        assert_eq!(config.queue_buffers(), 6);
        assert_eq!(config.queue_bytes(), 6 * 1024);
    }

    #[test]
    fn test_option_pairs() {
        let mut sc = ScannerConfig::default();
        sc.set_pair("scan_aes_192=1").unwrap();
        sc.set_pair("x=a=b").unwrap();
        assert_eq!(sc.options["scan_aes_192"], "1");
        assert_eq!(sc.options["x"], "a=b");
        assert!(sc.set_pair("novalue").is_err());
        assert!(sc.set_pair("=1").is_err());
    }
}
