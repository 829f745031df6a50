use thiserror::Error;

/// Main error type for the scanning runtime
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory mapping error: {0}")]
    Mmap(String),

    #[error("Range error: offset {offset} + length {len} exceeds buffer size {bufsize}")]
    Range {
        offset: usize,
        len: usize,
        bufsize: usize,
    },

    #[error("Malformed forensic path '{path}': {reason}")]
    Format { path: String, reason: String },

    #[error("Scanner '{scanner}' failed at {path}: {message}")]
    ScannerFault {
        scanner: String,
        path: String,
        message: String,
    },

    #[error("Feature recorder '{recorder}' I/O failure: {message}")]
    RecorderIo { recorder: String, message: String },

    #[error("Startup failure in scanner '{scanner}': {message}")]
    StartupFault { scanner: String, message: String },

    #[error("No feature recorder named '{0}'")]
    NoSuchRecorder(String),

    #[error("No scanner named '{0}'")]
    NoSuchScanner(String),

    #[error("Operation not allowed in phase {phase}: {message}")]
    Phase { phase: String, message: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ScanError {
    pub(crate) fn format(path: &str, reason: impl Into<String>) -> Self {
        ScanError::Format {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for scanning operations
pub type Result<T> = std::result::Result<T, ScanError>;
