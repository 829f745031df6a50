//! The scanner plugin contract.
//!
//! A scanner is visited once per phase, in registration order:
//!
//! - `init`: fill in the [`ScannerInfo`] registration record and read options.
//!   Recorders do not exist yet.
//! - `init2`: resolve and cache the named recorders declared in `init`.
//! - `scan`: called once per dispatched buffer whose page meets
//!   `min_sbuf_size`. Features go to the cached recorders; decoded content is
//!   handed back through [`ScanParams::emit`] for recursive dispatch.
//! - `shutdown`: release resources. Nothing is called afterwards.
//!
//! Errors and panics from `scan` are contained per buffer by the registry;
//! errors from `init`/`init2` abort startup.

pub mod queue;
pub mod registry;

pub use queue::WorkQueue;
pub use registry::{Fault, FaultLog, ScannerSet, ScannerStats};

use crate::error::{Result, ScanError};
use crate::recorder::{FeatureRecorder, FeatureRecorderDef, FeatureRecorderSet, HistogramDef};
use crate::sbuf::ScanBuffer;
use crate::types::ScannerConfig;
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

/// Lifecycle phase of a [`ScannerSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Phase {
    /// Scanners are being registered and initialized.
    Init,
    /// Recorders exist; scanners are resolving handles.
    Init2,
    Scan,
    Shutdown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::Init2 => "INIT2",
            Phase::Scan => "SCAN",
            Phase::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScannerFlags {
    pub default_enabled: bool,
    /// Useful on memory images.
    pub wants_memory: bool,
    /// Useful on filesystem structures.
    pub wants_filesystems: bool,
    /// Only scan top-level pages.
    pub depth0_only: bool,
    /// Produces decoded child buffers.
    pub recurse: bool,
}

impl Default for ScannerFlags {
    fn default() -> Self {
        Self {
            default_enabled: true,
            wants_memory: false,
            wants_filesystems: false,
            depth0_only: false,
            recurse: false,
        }
    }
}

/// An option a scanner read during INIT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigOption {
    pub name: String,
    pub default: String,
    pub value: String,
    pub help: String,
}

/// Registration record filled in by a scanner during INIT.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScannerInfo {
    pub name: String,
    pub author: String,
    pub description: String,
    pub version: String,
    pub feature_defs: Vec<FeatureRecorderDef>,
    #[serde(skip)]
    pub histogram_defs: Vec<HistogramDef>,
    /// Smallest page worth scanning.
    pub min_sbuf_size: usize,
    pub flags: ScannerFlags,
    /// Decoder tag of child buffers this scanner emits.
    pub path_prefix: Option<String>,
    pub options: Vec<ConfigOption>,
}

/// INIT parameters: the registration record and the option values.
pub struct InitParams<'a> {
    pub info: &'a mut ScannerInfo,
    config: &'a ScannerConfig,
}

impl<'a> InitParams<'a> {
    pub(crate) fn new(info: &'a mut ScannerInfo, config: &'a ScannerConfig) -> Self {
        Self { info, config }
    }

    /// Read option `name`, falling back to `default`. The option is listed in
    /// the registration record either way.
    pub fn get_config<T>(&mut self, name: &str, default: T, help: &str) -> Result<T>
    where
        T: FromStr + Display,
        T::Err: Display,
    {
        let default_text = default.to_string();
        let (value, text) = match self.config.options.get(name) {
            Some(raw) => {
                let parsed = raw.parse::<T>().map_err(|e| {
                    ScanError::Config(format!("{}: option {name}={raw}: {e}", self.info.name))
                })?;
                (parsed, raw.clone())
            }
            None => (default, default_text.clone()),
        };
        self.info.options.push(ConfigOption {
            name: name.to_string(),
            default: default_text,
            value: text,
            help: help.to_string(),
        });
        Ok(value)
    }
}

/// INIT2 parameters: recorder lookup.
pub struct Init2Params<'a> {
    recorders: &'a FeatureRecorderSet,
}

impl<'a> Init2Params<'a> {
    pub(crate) fn new(recorders: &'a FeatureRecorderSet) -> Self {
        Self { recorders }
    }

    pub fn named_feature_recorder(&self, name: &str) -> Result<Arc<FeatureRecorder>> {
        self.recorders.named_feature_recorder(name)
    }
}

/// SCAN parameters: the buffer under inspection and the derived-buffer outbox.
pub struct ScanParams<'a> {
    sbuf: &'a ScanBuffer,
    recorders: &'a FeatureRecorderSet,
    derived: Vec<ScanBuffer>,
}

impl<'a> ScanParams<'a> {
    pub(crate) fn new(sbuf: &'a ScanBuffer, recorders: &'a FeatureRecorderSet) -> Self {
        Self {
            sbuf,
            recorders,
            derived: Vec::new(),
        }
    }

    pub fn sbuf(&self) -> &'a ScanBuffer {
        self.sbuf
    }

    /// Recorder lookup for scanners that did not cache a handle in INIT2.
    pub fn named_feature_recorder(&self, name: &str) -> Result<Arc<FeatureRecorder>> {
        self.recorders.named_feature_recorder(name)
    }

    /// Queue decoded content for recursive dispatch.
    pub fn emit(&mut self, child: ScanBuffer) {
        self.derived.push(child);
    }

    pub(crate) fn take_derived(&mut self) -> Vec<ScanBuffer> {
        std::mem::take(&mut self.derived)
    }
}

pub trait Scanner: Send + Sync {
    fn init(&mut self, sp: &mut InitParams<'_>) -> Result<()>;

    fn init2(&mut self, _sp: &Init2Params<'_>) -> Result<()> {
        Ok(())
    }

    fn scan(&self, sp: &mut ScanParams<'_>) -> Result<()>;

    fn shutdown(&mut self) {}

    /// Re-derive the child buffer this scanner emits for content starting at
    /// `sbuf`. Only decoder scanners implement this; the path printer uses it.
    fn decode(&self, _sbuf: &ScanBuffer) -> Option<ScanBuffer> {
        None
    }
}
