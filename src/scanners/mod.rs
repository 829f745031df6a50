//! Built-in scanners.

pub mod aes;
pub mod exif;
pub mod gzip;
pub mod ntfsindx;
pub mod utmp;

pub use aes::AesScanner;
pub use exif::ExifScanner;
pub use gzip::GzipScanner;
pub use ntfsindx::NtfsIndxScanner;
pub use utmp::UtmpScanner;

use crate::error::Result;
use crate::scanner::{Scanner, ScannerSet};

/// Fresh instances of every built-in scanner, in registration order.
pub fn builtin_scanners() -> Vec<Box<dyn Scanner>> {
    vec![
        Box::new(GzipScanner::default()),
        Box::new(AesScanner::default()),
        Box::new(ExifScanner::default()),
        Box::new(UtmpScanner::default()),
        Box::new(NtfsIndxScanner::default()),
    ]
}

/// Register (and INIT) every built-in scanner.
pub fn register_builtins(set: &mut ScannerSet) -> Result<()> {
    for scanner in builtin_scanners() {
        set.add_scanner(scanner)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RecorderSetConfig;
    use crate::types::ScannerConfig;

    #[test]
    fn test_builtin_registration() {
        let mut set = ScannerSet::new(ScannerConfig::default(), RecorderSetConfig::default(), 7);
        register_builtins(&mut set).unwrap();
        set.apply_commands().unwrap();
        assert_eq!(set.enabled_scanners(), ["gzip", "aes", "exif", "utmp"]);
        assert!(set.decoder_for("GZIP").is_some());

        let names: Vec<&str> = set.recorders().unwrap().names().collect();
        assert_eq!(names, ["aes_keys", "exif", "gps", "jpeg_carved", "utmp_carved"]);
    }
}
