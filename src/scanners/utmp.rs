//! utmp/wtmp login record carving.
//!
//! Records are the 384-byte glibc `struct utmp` layout. Each record that
//! passes the field checks is carved on its own to `utmp_carved`.

use crate::error::Result;
use crate::recorder::{FeatureRecorder, FeatureRecorderDef};
use crate::sbuf::ScanBuffer;
use crate::scanner::{Init2Params, InitParams, ScanParams, Scanner};
use std::sync::Arc;

pub const UTMP_RECORD: usize = 384;
const RECORDER: &str = "utmp_carved";

const LINE: (usize, usize) = (8, 32);
const USER: (usize, usize) = (44, 32);
const HOST: (usize, usize) = (76, 256);
const TV_SEC: usize = 340;
const TV_USEC: usize = 344;
const UNUSED: (usize, usize) = (364, 20);

/// Once a field hits NUL, the rest of it must be NUL too.
fn nul_padded(sbuf: &ScanBuffer, start: usize, len: usize) -> bool {
    match (0..len).find(|&i| sbuf.get_u8(start + i) == 0) {
        Some(first_nul) => (first_nul..len).all(|i| sbuf.get_u8(start + i) == 0),
        None => true,
    }
}

fn printable(c: u8) -> bool {
    (32..=126).contains(&c)
}

/// Host names are held to the RFC 3986 character set.
fn host_char(c: u8) -> bool {
    (35..=126).contains(&c) || matches!(c, 33 | 37 | 60 | 62 | 92 | 94 | 123 | 124 | 125)
}

pub fn is_utmp_record(sbuf: &ScanBuffer, offset: usize) -> bool {
    // UT_UNKNOWN (0) and ACCOUNTING (9) are not worth carving
    let ut_type = sbuf.get_i32_le(offset);
    if !(1..=8).contains(&ut_type) {
        return false;
    }

    let line = sbuf.get_u8(offset + LINE.0);
    if line != 0 && !printable(line) {
        return false;
    }
    if !nul_padded(sbuf, offset + LINE.0, LINE.1) {
        return false;
    }

    let user = sbuf.get_u8(offset + USER.0);
    if user != 0 && !printable(user) {
        return false;
    }
    if !nul_padded(sbuf, offset + USER.0, USER.1) {
        return false;
    }

    let host = sbuf.get_u8(offset + HOST.0);
    if host != 0 && !host_char(host) {
        return false;
    }
    if !nul_padded(sbuf, offset + HOST.0, HOST.1) {
        return false;
    }

    if sbuf.get_i32_le(offset + TV_SEC) <= 0 {
        return false;
    }
    let usec = sbuf.get_i32_le(offset + TV_USEC);
    if !(0..1_000_000).contains(&usec) {
        return false;
    }

    (0..UNUSED.1).all(|i| sbuf.get_u8(offset + UNUSED.0 + i) == 0)
}

#[derive(Default)]
pub struct UtmpScanner {
    recorder: Option<Arc<FeatureRecorder>>,
}

impl Scanner for UtmpScanner {
    fn init(&mut self, sp: &mut InitParams<'_>) -> Result<()> {
        sp.info.name = "utmp".to_string();
        sp.info.author = "Teru Yamazaki".to_string();
        sp.info.description = "Scans for utmp record".to_string();
        sp.info.version = "1.1".to_string();
        sp.info.feature_defs.push(FeatureRecorderDef::new(RECORDER).carve());
        sp.info.min_sbuf_size = UTMP_RECORD;
        Ok(())
    }

    fn init2(&mut self, sp: &Init2Params<'_>) -> Result<()> {
        self.recorder = Some(sp.named_feature_recorder(RECORDER)?);
        Ok(())
    }

    fn scan(&self, sp: &mut ScanParams<'_>) -> Result<()> {
        let Some(recorder) = self.recorder.as_ref() else {
            return Ok(());
        };
        let sbuf = sp.sbuf();
        let stop = sbuf.pagesize();
        if stop < UTMP_RECORD {
            return Ok(());
        }

        let mut offset = 0;
        while offset < stop - UTMP_RECORD {
            if is_utmp_record(sbuf, offset) {
                recorder.carve(&sbuf.slice(offset, UTMP_RECORD)?, "utmp", 0);
                offset += UTMP_RECORD;
            } else {
                offset += 8;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ForensicPath;
    use crate::recorder::RecorderSetConfig;
    use crate::scanner::ScannerSet;
    use crate::types::ScannerConfig;

    fn record(user: &str, tv_sec: i32) -> Vec<u8> {
        let mut r = vec![0u8; UTMP_RECORD];
        r[0..4].copy_from_slice(&7i32.to_le_bytes()); // USER_PROCESS
        r[4..8].copy_from_slice(&4242i32.to_le_bytes());
        r[LINE.0..LINE.0 + 5].copy_from_slice(b"pts/0");
        r[USER.0..USER.0 + user.len()].copy_from_slice(user.as_bytes());
        r[HOST.0..HOST.0 + 9].copy_from_slice(b"10.0.0.17");
        r[TV_SEC..TV_SEC + 4].copy_from_slice(&tv_sec.to_le_bytes());
        r[TV_USEC..TV_USEC + 4].copy_from_slice(&51_000i32.to_le_bytes());
        r
    }

    #[test]
    fn test_record_checks() {
        let good = ScanBuffer::from_vec(ForensicPath::new(0), record("root", 1_600_000_000));
        assert!(is_utmp_record(&good, 0));

        let mut bad = record("root", 1_600_000_000);
        bad[USER.0 + 10] = b'x'; // text after the terminator
        assert!(!is_utmp_record(&ScanBuffer::from_vec(ForensicPath::new(0), bad), 0));

        let stale = record("root", 0);
        assert!(!is_utmp_record(&ScanBuffer::from_vec(ForensicPath::new(0), stale), 0));

        let mut unused = record("root", 1_600_000_000);
        unused[UNUSED.0 + 3] = 1;
        assert!(!is_utmp_record(&ScanBuffer::from_vec(ForensicPath::new(0), unused), 0));

        assert!(!is_utmp_record(&ScanBuffer::from_vec(ForensicPath::new(0), vec![0u8; UTMP_RECORD]), 0));
    }

    #[test]
    fn test_carves_each_record() {
        let mut data = vec![0u8; 4096];
        data[800..800 + UTMP_RECORD].copy_from_slice(&record("root", 1_600_000_000));
        data[1184..1184 + UTMP_RECORD].copy_from_slice(&record("alice", 1_600_000_100));

        let mut set = ScannerSet::new(ScannerConfig::default(), RecorderSetConfig::default(), 0);
        set.add_scanner(Box::new(UtmpScanner::default())).unwrap();
        set.apply_commands().unwrap();
        set.process_buffer(ScanBuffer::from_vec(ForensicPath::new(0), data))
            .unwrap();

        let carves = set.recorders().unwrap().get(RECORDER).unwrap().memory_carves();
        let names: Vec<&str> = carves.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["000-800.utmp", "001-1184.utmp"]);
        assert!(carves.iter().all(|(_, d)| d.len() == UTMP_RECORD));
    }
}
