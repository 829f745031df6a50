use crate::recorder::CarveMode;
use crate::sbuf::RangePolicy;
use crate::types::{ScanConfig, ScannerConfig};
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;

/// Bulk forensic scanner
/// Scans a disk or memory image page by page and records the features found
#[derive(Parser, Debug, Clone)]
#[command(name = "bulk-scan")]
#[command(version)]
#[command(about = "Bulk forensic scanner for disk and memory images", long_about = None)]
pub struct Args {
    /// Disk or memory image to scan
    #[arg(value_name = "IMAGE", required_unless_present = "info")]
    pub image: Option<PathBuf>,

    /// Output directory for feature files, carves and report.json
    #[arg(short = 'o', long = "outdir")]
    pub outdir: Option<PathBuf>,

    /// Enable a scanner (repeatable)
    #[arg(short = 'e', long = "enable", value_name = "NAME")]
    pub enable: Vec<String>,

    /// Disable a scanner (repeatable)
    #[arg(short = 'x', long = "disable", value_name = "NAME")]
    pub disable: Vec<String>,

    /// Disable every scanner except this one
    #[arg(short = 'E', long = "enable-only", value_name = "NAME")]
    pub enable_only: Option<String>,

    /// Suppress a feature recorder (repeatable)
    #[arg(long = "disable-recorder", value_name = "NAME")]
    pub disable_recorder: Vec<String>,

    /// Scanner option as name=value (repeatable)
    #[arg(short = 'S', long = "set", value_name = "NAME=VALUE")]
    pub set: Vec<String>,

    /// Worker threads; 0 scans on the main thread (default: one per core)
    #[arg(short = 'j', long = "threads")]
    pub threads: Option<usize>,

    /// Page size; accepts k/m/g suffixes
    #[arg(short = 'G', long = "pagesize", default_value = "16m", value_parser = parse_size)]
    pub pagesize: usize,

    /// Margin size; accepts k/m/g suffixes
    #[arg(short = 'g', long = "marginsize", default_value = "4m", value_parser = parse_size)]
    pub marginsize: usize,

    /// Decoder nesting limit; derived buffers at this depth are dropped
    #[arg(short = 'M', long = "max-depth", default_value = "7")]
    pub max_depth: usize,

    /// Scan a random fraction of the pages, optionally seeded; 1 or more scans everything
    #[arg(short = 'Y', long = "sample", value_name = "FRAC[:SEED]", value_parser = parse_sample)]
    pub sample: Option<(f64, Option<u64>)>,

    /// Which buffers may be carved
    #[arg(long = "carve", value_enum, default_value_t = CarveArg::All)]
    pub carve: CarveArg,

    /// Out-of-range buffer reads yield 0 instead of faulting the scanner
    #[arg(long = "clamp-reads")]
    pub clamp_reads: bool,

    /// Keep histograms in memory instead of spilling to disk
    #[arg(long = "mem-histogram")]
    pub mem_histogram: bool,

    /// Distinct values kept per in-memory histogram (0 = unbounded)
    #[arg(long = "memhist-limit", default_value = "0")]
    pub memhist_limit: usize,

    /// Leave feature files in arrival order
    #[arg(long = "no-sort")]
    pub no_sort: bool,

    /// Treat unknown recorders and orphan histograms as errors
    #[arg(long = "pedantic")]
    pub pedantic: bool,

    /// List the registered scanners and their options, then exit
    #[arg(long = "info")]
    pub info: bool,

    /// Print the content at a forensic path (e.g. 512-GZIP-0/h) and exit
    #[arg(short = 'p', long = "path", value_name = "PATH")]
    pub paths: Vec<String>,

    /// More log output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CarveArg {
    Never,
    Encoded,
    All,
}

impl From<CarveArg> for CarveMode {
    fn from(c: CarveArg) -> Self {
        match c {
            CarveArg::Never => CarveMode::Never,
            CarveArg::Encoded => CarveMode::EncodedOnly,
            CarveArg::All => CarveMode::All,
        }
    }
}

/// `4096`, `64k`, `16m`, `1g`
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, mult) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let mult = match c.to_ascii_lowercase() {
                'k' => 1usize << 10,
                'm' => 1 << 20,
                'g' => 1 << 30,
                _ => return Err(format!("unknown size suffix in '{s}'")),
            };
            (&s[..i], mult)
        }
        _ => (s, 1),
    };
    let n: usize = digits
        .parse()
        .map_err(|e| format!("invalid size '{s}': {e}"))?;
    n.checked_mul(mult)
        .ok_or_else(|| format!("size '{s}' overflows"))
}

/// `FRAC` or `FRAC:SEED`
pub fn parse_sample(s: &str) -> Result<(f64, Option<u64>), String> {
    let (frac, seed) = match s.split_once(':') {
        Some((f, seed)) => {
            let seed = seed
                .parse()
                .map_err(|e| format!("invalid sampling seed '{seed}': {e}"))?;
            (f, Some(seed))
        }
        None => (s, None),
    };
    let frac: f64 = frac
        .parse()
        .map_err(|e| format!("invalid sampling fraction '{frac}': {e}"))?;
    Ok((frac, seed))
}

impl Args {
    /// Validate the arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.info {
            return Ok(());
        }
        match &self.image {
            Some(image) if !image.as_os_str().is_empty() => {}
            _ => return Err("Image path cannot be empty".to_string()),
        }
        if self.paths.is_empty() && self.outdir.is_none() {
            return Err("an output directory (-o) is required for a scan".to_string());
        }
        if self.pagesize == 0 {
            return Err("pagesize must be greater than 0".to_string());
        }
        if let Some((frac, _)) = self.sample {
            if frac.is_nan() || frac <= 0.0 {
                return Err(format!("sampling fraction {frac} must be positive"));
            }
        }
        for pair in &self.set {
            if !pair.contains('=') || pair.starts_with('=') {
                return Err(format!("-S expects name=value, got '{pair}'"));
            }
        }
        Ok(())
    }

    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn scan_config(&self) -> ScanConfig {
        let (sample_fraction, sample_seed) = self.sample.unwrap_or((1.0, None));
        ScanConfig {
            pagesize: self.pagesize,
            marginsize: self.marginsize,
            max_depth: self.max_depth,
            num_threads: self.threads(),
            sample_fraction,
            sample_seed,
            range_policy: if self.clamp_reads {
                RangePolicy::Clamp
            } else {
                RangePolicy::Strict
            },
            carve_mode: self.carve.into(),
            memhist_limit: self.memhist_limit,
            pedantic: self.pedantic,
            mem_histogram: self.mem_histogram,
            sort_features: !self.no_sort,
            ..Default::default()
        }
    }

    /// Scanner options and selection. `-E` applies first, then `-e`, then `-x`.
    pub fn scanner_config(&self) -> crate::error::Result<ScannerConfig> {
        let mut config = ScannerConfig::default();
        for pair in &self.set {
            config.set_pair(pair)?;
        }
        if let Some(name) = &self.enable_only {
            config.enable_only(name);
        }
        for name in &self.enable {
            config.enable(name);
        }
        for name in &self.disable {
            config.disable(name);
        }
        for name in &self.disable_recorder {
            config.disable_recorder(name);
        }
        Ok(config)
    }
}
