//! `report.json`: the machine-readable run summary.

use crate::error::Result;
use crate::scanner::registry::ScannerStatsSnapshot;
use crate::scanner::{Fault, ScannerSet};
use crate::types::{RunStats, ScanConfig};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub pagesize: usize,
    pub marginsize: usize,
    pub max_depth: usize,
    pub num_threads: usize,
    pub sample_fraction: f64,
    pub sample_seed: Option<u64>,
    pub enabled_scanners: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderSummary {
    pub name: String,
    pub features: u64,
    pub bytes_carved: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tool: String,
    pub version: String,
    pub image: String,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub config: ConfigSummary,
    pub stats: RunStats,
    pub throughput_mb_s: f64,
    pub dropped_too_deep: u64,
    pub scanners: Vec<ScannerStatsSnapshot>,
    pub recorders: Vec<RecorderSummary>,
    pub faults: Vec<Fault>,
}

impl RunReport {
    /// Snapshot the registry after a run. Call before shutdown so recorder
    /// counters are still reachable.
    pub fn collect(
        image: &Path,
        config: &ScanConfig,
        registry: &ScannerSet,
        stats: RunStats,
        started: DateTime<Local>,
    ) -> Self {
        let recorders = registry
            .recorders()
            .map(|set| {
                set.iter()
                    .map(|r| RecorderSummary {
                        name: r.name().to_string(),
                        features: r.features_written(),
                        bytes_carved: r.bytes_carved(),
                        failure: r.failure(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            tool: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            image: image.display().to_string(),
            started,
            finished: Local::now(),
            config: ConfigSummary {
                pagesize: config.pagesize,
                marginsize: config.marginsize,
                max_depth: config.max_depth,
                num_threads: config.num_threads,
                sample_fraction: config.sample_fraction,
                sample_seed: config.sample_seed,
                enabled_scanners: registry
                    .enabled_scanners()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            },
            throughput_mb_s: stats.throughput_mb_s(),
            stats,
            dropped_too_deep: registry.dropped_too_deep(),
            scanners: registry.stats(),
            recorders,
            faults: registry.faults().snapshot(),
        }
    }

    /// Recorder I/O failures seen during the run.
    pub fn recorder_failures(&self) -> usize {
        self.recorders.iter().filter(|r| r.failure.is_some()).count()
    }

    /// Write `report.json` into `outdir`.
    pub fn write(&self, outdir: &Path) -> Result<PathBuf> {
        let path = outdir.join(REPORT_FILE);
        let mut out = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut out, self).map_err(std::io::Error::from)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(path)
    }
}

/// Registration records of every scanner, as pretty JSON.
pub fn info_listing(registry: &ScannerSet) -> Result<String> {
    let infos = registry.info_list();
    Ok(serde_json::to_string_pretty(&infos).map_err(std::io::Error::from)?)
}
