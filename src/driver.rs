//! Image scan driver: turns an image into pages and feeds the registry.
//!
//! With `num_threads == 0` every page is processed on the calling thread.
//! Otherwise the calling thread only reads: pages go through the registry's
//! bounded work queue to scoped worker threads.

use crate::error::{Result, ScanError};
use crate::image::{ImageReader, PageRead};
use crate::path::ForensicPath;
use crate::sbuf::ScanBuffer;
use crate::scanner::ScannerSet;
use crate::types::{RunStats, ScanConfig, ScanProgress};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag shared with the driver.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Distinct block indices covering `frac` of `max_blocks`, ascending.
pub fn make_sorted_random_blocklist(max_blocks: u64, frac: f64, seed: Option<u64>) -> BTreeSet<u64> {
    if frac >= 1.0 {
        return (0..max_blocks).collect();
    }
    if max_blocks == 0 || frac <= 0.0 {
        return BTreeSet::new();
    }
    let wanted = ((max_blocks as f64 * frac).round() as u64).clamp(1, max_blocks);
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    rand::seq::index::sample(&mut rng, max_blocks as usize, wanted as usize)
        .into_iter()
        .map(|i| i as u64)
        .collect()
}

pub struct ImageScanDriver<'a, I> {
    image: I,
    registry: &'a ScannerSet,
    config: ScanConfig,
    progress: Option<Sender<ScanProgress>>,
    stop: StopHandle,
}

impl<'a, I: ImageReader> ImageScanDriver<'a, I> {
    pub fn new(image: I, registry: &'a ScannerSet, config: ScanConfig) -> Self {
        Self {
            image,
            registry,
            config,
            progress: None,
            stop: StopHandle::default(),
        }
    }

    /// Stream progress events through a tokio channel
    pub fn with_progress(mut self, sender: Sender<ScanProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn send(&self, event: ScanProgress) {
        if let Some(ref s) = self.progress {
            if !s.is_closed() {
                let _ = s.blocking_send(event);
            }
        }
    }

    /// Blocks to visit, ascending.
    pub fn block_plan(&self) -> Vec<u64> {
        let max_blocks = self.image.max_blocks();
        if self.config.is_sampling() {
            make_sorted_random_blocklist(max_blocks, self.config.sample_fraction, self.config.sample_seed)
                .into_iter()
                .collect()
        } else {
            (0..max_blocks).collect()
        }
    }

    /// Scan the image. Unreadable pages are reported and skipped.
    pub fn run(&mut self) -> Result<RunStats> {
        self.config.validate()?;
        if self.image.pagesize() != self.config.pagesize {
            return Err(ScanError::Config(format!(
                "image page size {} does not match configured {}",
                self.image.pagesize(),
                self.config.pagesize
            )));
        }

        let started = Instant::now();
        let blocks = self.block_plan();
        info!(
            blocks = blocks.len(),
            threads = self.config.num_threads,
            sampled = self.config.is_sampling(),
            "starting image scan"
        );

        let mut stats = if self.config.num_threads == 0 {
            self.run_inline(&blocks)?
        } else {
            self.run_threaded(&blocks)?
        };

        stats.sampled = self.config.is_sampling();
        stats.scanner_faults = self.registry.faults().len() as u64;
        stats.elapsed_secs = started.elapsed().as_secs_f64();
        self.send(ScanProgress::Finished { pages: stats.pages });
        info!(
            pages = stats.pages,
            bytes = stats.bytes,
            read_errors = stats.read_errors,
            "image scan finished in {:.2}s",
            stats.elapsed_secs
        );
        Ok(stats)
    }

    /// Read every planned page, handing each to `submit`. Stops early when
    /// `submit` returns false.
    fn produce<F>(&mut self, blocks: &[u64], stats: &mut RunStats, mut submit: F) -> Result<()>
    where
        F: FnMut(ScanBuffer) -> Result<bool>,
    {
        let margin = self.config.marginsize;
        let range_policy = self.config.range_policy;
        for &block in blocks {
            if self.stop.is_stopped() {
                stats.stopped_early = true;
                debug!(block, "stop requested");
                break;
            }
            match self.image.read_block(block, margin) {
                Ok(PageRead::Page(sbuf)) => {
                    let sbuf = sbuf.with_range_policy(range_policy);
                    stats.pages += 1;
                    stats.bytes += sbuf.pagesize() as u64;
                    self.send(ScanProgress::PageSubmitted {
                        path: sbuf.pos0().to_string(),
                        bytes: sbuf.pagesize() as u64,
                    });
                    if !submit(sbuf)? {
                        break;
                    }
                }
                Ok(PageRead::EndOfInput) => break,
                Err(e) => {
                    let path = ForensicPath::new(block.saturating_mul(self.config.pagesize as u64));
                    warn!(path = %path, error = %e, "page read failed");
                    stats.read_errors += 1;
                    self.send(ScanProgress::ReadError {
                        path: path.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn run_inline(&mut self, blocks: &[u64]) -> Result<RunStats> {
        let mut stats = RunStats::default();
        let registry = self.registry;
        self.produce(blocks, &mut stats, |sbuf| {
            registry.process_buffer(sbuf)?;
            Ok(true)
        })?;
        Ok(stats)
    }

    fn run_threaded(&mut self, blocks: &[u64]) -> Result<RunStats> {
        let mut stats = RunStats::default();
        let registry = self.registry;
        let queue = registry.queue();
        queue.reopen();

        let outcome = std::thread::scope(|s| {
            let workers: Vec<_> = (0..self.config.num_threads)
                .map(|_| s.spawn(move || registry.worker_loop()))
                .collect();

            let produced = self.produce(blocks, &mut stats, |sbuf| Ok(queue.push(sbuf).is_ok()));
            queue.close();

            let mut first_error = produced.err();
            for worker in workers {
                let result = worker.join().unwrap_or_else(|_| {
                    Err(ScanError::Phase {
                        phase: "SCAN".to_string(),
                        message: "worker thread panicked".to_string(),
                    })
                });
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
            first_error
        });

        match outcome {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::StreamImage;
    use crate::recorder::{FeatureRecorder, FeatureRecorderDef, RecorderSetConfig};
    use crate::scanner::{Init2Params, InitParams, ScanParams, Scanner};
    use crate::types::ScannerConfig;
    use std::io::Cursor;

    /// Records the first byte of every page.
    #[derive(Default)]
    struct FirstByte {
        out: Option<Arc<FeatureRecorder>>,
    }

    impl Scanner for FirstByte {
        fn init(&mut self, sp: &mut InitParams<'_>) -> Result<()> {
            sp.info.name = "first".to_string();
            sp.info.feature_defs.push(FeatureRecorderDef::new("first"));
            Ok(())
        }

        fn init2(&mut self, sp: &Init2Params<'_>) -> Result<()> {
            self.out = Some(sp.named_feature_recorder("first")?);
            Ok(())
        }

        fn scan(&self, sp: &mut ScanParams<'_>) -> Result<()> {
            let sbuf = sp.sbuf();
            if let Some(out) = &self.out {
                out.write(sbuf.pos0(), &format!("{:02x}", sbuf.get_u8(0)), "");
            }
            Ok(())
        }
    }

    fn config(threads: usize) -> ScanConfig {
        ScanConfig {
            pagesize: 16,
            marginsize: 4,
            num_threads: threads,
            ..Default::default()
        }
    }

    fn registry(config: &ScanConfig) -> ScannerSet {
        let mut set = ScannerSet::new(ScannerConfig::default(), RecorderSetConfig::default(), 1)
            .with_queue_limits(config.queue_buffers(), config.queue_bytes());
        set.add_scanner(Box::new(FirstByte::default())).unwrap();
        set.apply_commands().unwrap();
        set
    }

    fn image() -> StreamImage<Cursor<Vec<u8>>> {
        let bytes: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        StreamImage::new(Cursor::new(bytes), 16).unwrap()
    }

    fn sorted_lines(set: &ScannerSet) -> Vec<String> {
        let mut lines = set.recorders().unwrap().get("first").unwrap().memory_lines();
        crate::recorder::sink::sort_lines(&mut lines);
        lines
    }

    #[test]
    fn test_sampling_full_fraction_visits_all() {
        assert_eq!(
            make_sorted_random_blocklist(5, 1.0, None).into_iter().collect::<Vec<_>>(),
            [0, 1, 2, 3, 4]
        );
        let half = make_sorted_random_blocklist(100, 0.25, Some(7));
        assert_eq!(half.len(), 25);
        assert!(half.iter().all(|&b| b < 100));
        assert_eq!(half, make_sorted_random_blocklist(100, 0.25, Some(7)));
        assert_eq!(make_sorted_random_blocklist(10, 0.01, Some(1)).len(), 1);
        assert!(make_sorted_random_blocklist(0, 0.5, None).is_empty());
    }

    #[test]
    fn test_inline_run_covers_every_page() {
        let cfg = config(0);
        let set = registry(&cfg);
        let stats = ImageScanDriver::new(image(), &set, cfg).run().unwrap();
        assert_eq!(stats.pages, 13);
        assert_eq!(stats.bytes, 200);
        assert_eq!(stats.read_errors, 0);
        let lines = sorted_lines(&set);
        assert_eq!(lines.len(), 13);
        assert_eq!(lines[1], "16\t10");
    }

    #[test]
    fn test_threaded_matches_inline_and_drains() {
        let inline_cfg = config(0);
        let inline = registry(&inline_cfg);
        ImageScanDriver::new(image(), &inline, inline_cfg).run().unwrap();

        let threaded_cfg = config(3);
        let mut threaded = registry(&threaded_cfg);
        let stats = ImageScanDriver::new(image(), &threaded, threaded_cfg)
            .run()
            .unwrap();
        assert_eq!(stats.pages, 13);
        assert_eq!(threaded.queue_depth(), (0, 0));
        assert_eq!(sorted_lines(&inline), sorted_lines(&threaded));
        threaded.shutdown().unwrap();
        assert_eq!(threaded.queue_depth(), (0, 0));
    }

    #[test]
    fn test_sampled_run_is_subset() {
        let cfg = ScanConfig {
            sample_fraction: 0.5,
            sample_seed: Some(42),
            ..config(0)
        };
        let set = registry(&cfg);
        let stats = ImageScanDriver::new(image(), &set, cfg).run().unwrap();
        assert!(stats.sampled);
        assert_eq!(stats.pages, 7);
    }

    struct FlakyImage {
        inner: StreamImage<Cursor<Vec<u8>>>,
    }

    impl ImageReader for FlakyImage {
        fn image_size(&self) -> u64 {
            self.inner.image_size()
        }

        fn pagesize(&self) -> usize {
            self.inner.pagesize()
        }

        fn read_block(&mut self, block: u64, margin: usize) -> Result<PageRead> {
            if block == 2 {
                return Err(ScanError::Io(std::io::Error::other("bad sector")));
            }
            self.inner.read_block(block, margin)
        }

        fn read_range(&mut self, offset: u64, len: usize, pagesize: usize) -> Result<PageRead> {
            self.inner.read_range(offset, len, pagesize)
        }
    }

    #[test]
    fn test_read_errors_reported_and_skipped() {
        let cfg = config(0);
        let set = registry(&cfg);
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let stats = ImageScanDriver::new(FlakyImage { inner: image() }, &set, cfg)
            .with_progress(tx)
            .run()
            .unwrap();
        assert_eq!(stats.read_errors, 1);
        assert_eq!(stats.pages, 12);

        let mut errors = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ScanProgress::ReadError { path, .. } = event {
                errors.push(path);
            }
        }
        assert_eq!(errors, ["32"]);
    }

    #[test]
    fn test_stop_handle_ends_run() {
        let cfg = config(2);
        let set = registry(&cfg);
        let mut driver = ImageScanDriver::new(image(), &set, cfg);
        driver.stop_handle().stop();
        let stats = driver.run().unwrap();
        assert!(stats.stopped_early);
        assert_eq!(stats.pages, 0);
        assert_eq!(set.queue_depth(), (0, 0));
    }

    #[test]
    fn test_page_size_mismatch_rejected() {
        let cfg = ScanConfig {
            pagesize: 32,
            ..config(0)
        };
        let set = registry(&cfg);
        assert!(matches!(
            ImageScanDriver::new(image(), &set, cfg).run(),
            Err(ScanError::Config(_))
        ));
    }
}
