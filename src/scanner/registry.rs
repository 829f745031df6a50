//! Scanner registry: registration, phase transitions and buffer dispatch.

use super::{Init2Params, InitParams, Phase, ScanParams, Scanner, ScannerInfo, WorkQueue};
use crate::error::{Result, ScanError};
use crate::recorder::{FeatureRecorderSet, RecorderFlags, RecorderSetConfig};
use crate::sbuf::ScanBuffer;
use crate::types::{ScannerCommand, ScannerConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A contained failure of one scanner on one buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub scanner: String,
    pub path: String,
    pub message: String,
}

impl From<Fault> for ScanError {
    fn from(f: Fault) -> Self {
        ScanError::ScannerFault {
            scanner: f.scanner,
            path: f.path,
            message: f.message,
        }
    }
}

/// Scanner faults collected over a run.
#[derive(Debug, Default)]
pub struct FaultLog {
    faults: Mutex<Vec<Fault>>,
}

impl FaultLog {
    pub fn record(&self, fault: Fault) {
        warn!(
            scanner = %fault.scanner,
            path = %fault.path,
            "scanner fault: {}",
            fault.message
        );
        self.faults.lock().push(fault);
    }

    pub fn len(&self) -> usize {
        self.faults.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Fault> {
        self.faults.lock().clone()
    }
}

/// Per-scanner counters.
#[derive(Debug, Default)]
pub struct ScannerStats {
    calls: AtomicU64,
    nanos: AtomicU64,
    faults: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatsSnapshot {
    pub name: String,
    pub calls: u64,
    pub nanos: u64,
    pub faults: u64,
}

struct Registered {
    scanner: Box<dyn Scanner>,
    info: ScannerInfo,
    enabled: bool,
    stats: ScannerStats,
}

/// Owns the scanners of one run and the recorders built from their declarations.
pub struct ScannerSet {
    scanners: Vec<Registered>,
    phase: Phase,
    config: ScannerConfig,
    recorder_config: RecorderSetConfig,
    recorders: Option<FeatureRecorderSet>,
    max_depth: usize,
    faults: FaultLog,
    queue: WorkQueue,
    dropped_too_deep: AtomicU64,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

impl ScannerSet {
    pub fn new(config: ScannerConfig, recorder_config: RecorderSetConfig, max_depth: usize) -> Self {
        Self {
            scanners: Vec::new(),
            phase: Phase::Init,
            config,
            recorder_config,
            recorders: None,
            max_depth,
            faults: FaultLog::default(),
            queue: WorkQueue::new(1, 1),
            dropped_too_deep: AtomicU64::new(0),
        }
    }

    /// Replace the work queue bounds; only meaningful before scanning starts.
    pub fn with_queue_limits(mut self, max_buffers: usize, max_bytes: u64) -> Self {
        self.queue = WorkQueue::new(max_buffers, max_bytes);
        self
    }

    fn expect_phase(&self, want: Phase) -> Result<()> {
        if self.phase != want {
            return Err(ScanError::Phase {
                phase: self.phase.to_string(),
                message: format!("expected {want}"),
            });
        }
        Ok(())
    }

    /// Register a scanner and run its INIT phase.
    pub fn add_scanner(&mut self, mut scanner: Box<dyn Scanner>) -> Result<()> {
        self.expect_phase(Phase::Init)?;
        let mut info = ScannerInfo::default();
        let outcome = {
            let mut sp = InitParams::new(&mut info, &self.config);
            catch_unwind(AssertUnwindSafe(|| scanner.init(&mut sp)))
        };
        let label = if info.name.is_empty() {
            format!("#{}", self.scanners.len())
        } else {
            info.name.clone()
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ScanError::StartupFault {
                    scanner: label,
                    message: e.to_string(),
                })
            }
            Err(p) => {
                return Err(ScanError::StartupFault {
                    scanner: label,
                    message: panic_message(p.as_ref()),
                })
            }
        }
        if info.name.is_empty() {
            return Err(ScanError::StartupFault {
                scanner: label,
                message: "scanner registered without a name".to_string(),
            });
        }
        if self.scanners.iter().any(|r| r.info.name == info.name) {
            return Err(ScanError::StartupFault {
                scanner: label,
                message: "scanner registered twice".to_string(),
            });
        }
        debug!(scanner = %info.name, version = %info.version, "registered");
        self.scanners.push(Registered {
            scanner,
            enabled: info.flags.default_enabled,
            info,
            stats: ScannerStats::default(),
        });
        Ok(())
    }

    pub fn enable_scanner(&mut self, name: &str) {
        self.config.enable(name);
    }

    pub fn disable_scanner(&mut self, name: &str) {
        self.config.disable(name);
    }

    pub fn disable_all(&mut self) {
        self.config.commands.push(ScannerCommand::DisableAll);
    }

    pub fn disable_recorder(&mut self, name: &str) {
        self.config.disable_recorder(name);
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        if name == "all" {
            self.scanners.iter_mut().for_each(|r| r.enabled = enabled);
            return Ok(());
        }
        let r = self
            .scanners
            .iter_mut()
            .find(|r| r.info.name == name)
            .ok_or_else(|| ScanError::NoSuchScanner(name.to_string()))?;
        r.enabled = enabled;
        Ok(())
    }

    /// Apply the queued enable/disable commands, build the recorders of the
    /// enabled scanners and run INIT2.
    pub fn apply_commands(&mut self) -> Result<()> {
        self.expect_phase(Phase::Init)?;

        let commands = std::mem::take(&mut self.config.commands);
        let mut disabled_recorders = Vec::new();
        for cmd in &commands {
            match cmd {
                ScannerCommand::Enable(name) => self.set_enabled(name, true)?,
                ScannerCommand::Disable(name) => self.set_enabled(name, false)?,
                ScannerCommand::EnableAll => self.set_enabled("all", true)?,
                ScannerCommand::DisableAll => self.set_enabled("all", false)?,
                ScannerCommand::DisableRecorder(name) => disabled_recorders.push(name.clone()),
            }
        }
        self.config.commands = commands;

        let (defs, histograms): (Vec<_>, Vec<_>) = self
            .scanners
            .iter()
            .filter(|r| r.enabled)
            .map(|r| (r.info.feature_defs.clone(), r.info.histogram_defs.clone()))
            .unzip();
        let defs: Vec<_> = defs.into_iter().flatten().collect();
        let histograms: Vec<_> = histograms.into_iter().flatten().collect();

        let recorders = FeatureRecorderSet::new(&defs, &histograms, &self.recorder_config)?;
        for name in &disabled_recorders {
            match recorders.get(name) {
                Some(r) => r.set_flag(RecorderFlags::DISABLED),
                None if recorders.flags().pedantic => {
                    return Err(ScanError::NoSuchRecorder(name.clone()))
                }
                None => warn!(recorder = %name, "cannot disable unknown recorder"),
            }
        }

        self.phase = Phase::Init2;
        for r in self.scanners.iter_mut().filter(|r| r.enabled) {
            let sp = Init2Params::new(&recorders);
            let outcome = catch_unwind(AssertUnwindSafe(|| r.scanner.init2(&sp)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(p) => panic_message(p.as_ref()),
            };
            return Err(ScanError::StartupFault {
                scanner: r.info.name.clone(),
                message,
            });
        }

        info!(
            enabled = ?self.enabled_scanners(),
            max_depth = self.max_depth,
            "scanners ready"
        );
        self.recorders = Some(recorders);
        self.phase = Phase::Scan;
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.scanners.iter().any(|r| r.enabled && r.info.name == name)
    }

    pub fn enabled_scanners(&self) -> Vec<&str> {
        self.scanners
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.info.name.as_str())
            .collect()
    }

    /// Registration records of every scanner, enabled or not.
    pub fn info_list(&self) -> Vec<&ScannerInfo> {
        self.scanners.iter().map(|r| &r.info).collect()
    }

    pub fn recorders(&self) -> Option<&FeatureRecorderSet> {
        self.recorders.as_ref()
    }

    pub fn faults(&self) -> &FaultLog {
        &self.faults
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// `(buffers, bytes)` waiting to be scanned.
    pub fn queue_depth(&self) -> (usize, u64) {
        self.queue.depth()
    }

    /// Child buffers dropped for reaching the depth limit.
    pub fn dropped_too_deep(&self) -> u64 {
        self.dropped_too_deep.load(Ordering::Relaxed)
    }

    /// The scanner whose child buffers carry decoder tag `tag`.
    pub fn decoder_for(&self, tag: &str) -> Option<&dyn Scanner> {
        self.scanners
            .iter()
            .find(|r| r.info.path_prefix.as_deref() == Some(tag))
            .map(|r| r.scanner.as_ref())
    }

    pub fn stats(&self) -> Vec<ScannerStatsSnapshot> {
        self.scanners
            .iter()
            .filter(|r| r.enabled)
            .map(|r| ScannerStatsSnapshot {
                name: r.info.name.clone(),
                calls: r.stats.calls.load(Ordering::Relaxed),
                nanos: r.stats.nanos.load(Ordering::Relaxed),
                faults: r.stats.faults.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Run every applicable scanner over `sbuf`, then over the buffers they
    /// derive, breadth first, until nothing is left within the depth limit.
    ///
    /// Safe to call from several threads on independent buffers.
    pub fn process_buffer(&self, sbuf: ScanBuffer) -> Result<()> {
        self.expect_phase(Phase::Scan)?;
        let recorders = self.recorders.as_ref().ok_or_else(|| ScanError::Phase {
            phase: self.phase.to_string(),
            message: "recorders not built".to_string(),
        })?;

        let mut work = VecDeque::from([sbuf]);
        while let Some(buf) = work.pop_front() {
            for r in self.scanners.iter().filter(|r| r.enabled) {
                if buf.pagesize() < r.info.min_sbuf_size {
                    continue;
                }
                if r.info.flags.depth0_only && buf.depth() > 0 {
                    continue;
                }

                let mut sp = ScanParams::new(&buf, recorders);
                let started = Instant::now();
                let outcome = catch_unwind(AssertUnwindSafe(|| r.scanner.scan(&mut sp)));
                r.stats.calls.fetch_add(1, Ordering::Relaxed);
                r.stats
                    .nanos
                    .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

                let message = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(p) => Some(panic_message(p.as_ref())),
                };
                if let Some(message) = message {
                    r.stats.faults.fetch_add(1, Ordering::Relaxed);
                    self.faults.record(Fault {
                        scanner: r.info.name.clone(),
                        path: buf.pos0().to_string(),
                        message,
                    });
                    continue;
                }

                for child in sp.take_derived() {
                    if !r.info.flags.recurse {
                        debug!(scanner = %r.info.name, "ignoring child from non-recursive scanner");
                    } else if child.depth() >= self.max_depth {
                        self.dropped_too_deep.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            path = %child.pos0(),
                            max_depth = self.max_depth,
                            "dropping buffer past depth limit"
                        );
                    } else {
                        work.push_back(child);
                    }
                }
            }
        }
        Ok(())
    }

    /// Pull buffers off the work queue until it is closed and drained.
    pub fn worker_loop(&self) -> Result<u64> {
        let mut processed = 0;
        while let Some(sbuf) = self.queue.pop() {
            if let Err(e) = self.process_buffer(sbuf) {
                // unblock the producer; the run is over
                self.queue.close();
                return Err(e);
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Compute histograms, passing each `(count, name, value)` to `cb`.
    pub fn dump_histograms<F>(&self, cb: F) -> Result<()>
    where
        F: FnMut(u64, &str, &str),
    {
        match &self.recorders {
            Some(recorders) => recorders.dump_histograms(cb),
            None => Ok(()),
        }
    }

    /// Shut scanners down, write histograms and close every recorder.
    ///
    /// The first histogram or recorder failure is returned after all streams
    /// have been closed.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.phase == Phase::Shutdown {
            return Ok(());
        }
        self.queue.close();
        let leftover = self.queue.clear();
        if leftover > 0 {
            warn!(buffers = leftover, "discarding unscanned buffers at shutdown");
        }

        for r in self.scanners.iter_mut().filter(|r| r.enabled) {
            r.scanner.shutdown();
        }
        self.phase = Phase::Shutdown;

        let Some(recorders) = self.recorders.as_ref() else {
            return Ok(());
        };
        let dumped = recorders.dump_histograms(|count, name, value| {
            debug!(histogram = name, count, value, "histogram entry");
        });
        let closed = recorders.shutdown();
        info!(faults = self.faults.len(), "scanners shut down");
        dumped.and(closed)
    }
}

impl std::fmt::Debug for ScannerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerSet")
            .field("phase", &self.phase)
            .field("scanners", &self.enabled_scanners())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}
