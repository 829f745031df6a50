use anyhow::{Context, Result};
use bulk_scan::cli::Args;
use bulk_scan::driver::ImageScanDriver;
use bulk_scan::image::{DiskImage, ImageReader};
use bulk_scan::logging;
use bulk_scan::path_printer::PathPrinter;
use bulk_scan::recorder::{RecorderSetConfig, SinkKind};
use bulk_scan::report::{info_listing, RunReport};
use bulk_scan::scanner::ScannerSet;
use bulk_scan::scanners::register_builtins;
use bulk_scan::types::ScanProgress;
use chrono::Local;
use clap::Parser;
use std::io::Write;
use std::process::ExitCode;
use tracing::{debug, error, info};

/// Exit status when the scan completed but something was lost along the way.
const EXIT_FAULTS: u8 = 2;

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    if let Err(e) = args.validate() {
        eprintln!("Invalid arguments: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let config = args.scan_config();
    let scanner_config = args
        .scanner_config()
        .context("invalid scanner option")?;

    if args.info {
        let mut set = ScannerSet::new(scanner_config, RecorderSetConfig::default(), config.max_depth);
        register_builtins(&mut set)?;
        println!("{}", info_listing(&set)?);
        return Ok(ExitCode::SUCCESS);
    }

    let image_path = args.image.as_deref().context("no image given")?;
    let image = DiskImage::open(image_path, config.pagesize)
        .with_context(|| format!("opening {}", image_path.display()))?;

    if !args.paths.is_empty() {
        let mut set = ScannerSet::new(scanner_config, RecorderSetConfig::default(), config.max_depth);
        register_builtins(&mut set)?;
        let mut printer =
            PathPrinter::new(&set, image).with_read_size(config.pagesize + config.marginsize);
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for path in &args.paths {
            printer
                .process_path(path, &mut out)
                .with_context(|| format!("printing {path}"))?;
        }
        out.flush()?;
        return Ok(ExitCode::SUCCESS);
    }

    let outdir = args.outdir.as_deref().context("no output directory given")?;
    println!("bulk-scan v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", "=".repeat(60));
    println!("  Image:              {}", image_path.display());
    println!(
        "  Image size:         {} bytes ({:.2} GB)",
        image.image_size(),
        image.image_size() as f64 / (1024.0 * 1024.0 * 1024.0)
    );
    println!("  Output directory:   {}", outdir.display());
    println!("  Threads:            {}", config.num_threads);
    println!("  Page / margin:      {} / {} bytes", config.pagesize, config.marginsize);
    if config.is_sampling() {
        println!("  Sampling:           {:.1}% of pages", config.sample_fraction * 100.0);
    }
    println!();

    let sink = SinkKind::File {
        outdir: outdir.to_path_buf(),
    };
    let mut set = ScannerSet::new(scanner_config, config.recorder_config(sink), config.max_depth)
        .with_queue_limits(config.queue_buffers(), config.queue_bytes());
    register_builtins(&mut set)?;
    set.apply_commands().context("starting scanners")?;
    println!("  Scanners:           {}", set.enabled_scanners().join(", "));

    let started = Local::now();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ScanProgress>(1024);
    let progress = std::thread::spawn(move || {
        let mut pages = 0u64;
        while let Some(event) = rx.blocking_recv() {
            match event {
                ScanProgress::PageSubmitted { path, bytes } => {
                    pages += 1;
                    debug!(path = %path, bytes, "page submitted");
                    if pages % 64 == 0 {
                        info!(pages, "pages submitted");
                    }
                }
                ScanProgress::ReadError { .. } => {}
                ScanProgress::Finished { pages } => debug!(pages, "producer finished"),
            }
        }
    });

    let scanned = {
        let mut driver = ImageScanDriver::new(image, &set, config.clone()).with_progress(tx);
        driver.run()
    };
    let _ = progress.join();
    let stats = scanned.context("scan failed")?;

    let report = RunReport::collect(image_path, &config, &set, stats, started);
    let closed = set.shutdown();
    let report_path = report.write(outdir)?;

    println!();
    println!("Scan complete:");
    println!("  Pages:              {}", report.stats.pages);
    println!("  Read errors:        {}", report.stats.read_errors);
    println!("  Scanner faults:     {}", report.faults.len());
    println!(
        "  Elapsed:            {:.2}s ({:.1} MB/s)",
        report.stats.elapsed_secs, report.throughput_mb_s
    );
    println!("  Report:             {}", report_path.display());

    let mut faulted = !report.faults.is_empty() || report.recorder_failures() > 0;
    if let Err(e) = closed {
        error!(error = %e, "closing feature recorders");
        eprintln!("Error: {e}");
        faulted = true;
    }
    Ok(if faulted {
        ExitCode::from(EXIT_FAULTS)
    } else {
        ExitCode::SUCCESS
    })
}
