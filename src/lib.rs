//! Bulk forensic scanning engine
//!
//! This library scans disk and memory images in large overlapping pages:
//! - Recursive forensic paths locating bytes inside decoded content
//! - Page buffers over a shared memory map (zero-copy) or the heap
//! - Pluggable scanners with INIT / INIT2 / SCAN / SHUTDOWN phases
//! - Panic isolation with catch_unwind, one fault per scanner per buffer
//! - Thread-safe feature recorders, carving and histograms
//! - Bounded work queue with scoped worker threads
//! - Progress streaming via tokio::sync::mpsc

pub mod cli;
pub mod driver;
pub mod entropy;
pub mod error;
pub mod image;
pub mod logging;
pub mod path;
pub mod path_printer;
pub mod recorder;
pub mod report;
pub mod sbuf;
pub mod scanner;
pub mod scanners;
pub mod types;

// Re-export commonly used types
pub use driver::{make_sorted_random_blocklist, ImageScanDriver, StopHandle};
pub use error::{Result, ScanError};
pub use image::{DiskImage, ImageReader, PageRead, StreamImage};
pub use path::{DecoderHop, ForensicPath, RenderMode};
pub use path_printer::PathPrinter;
pub use recorder::{CarveMode, FeatureRecorder, FeatureRecorderDef, FeatureRecorderSet, RecorderFlags};
pub use sbuf::{RangePolicy, ScanBuffer};
pub use scanner::{Phase, Scanner, ScannerInfo, ScannerSet};
pub use types::{RunStats, ScanConfig, ScanProgress, ScannerConfig};
