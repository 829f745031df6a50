//! AES key schedule recognition.
//!
//! Keys themselves look like noise; expanded key schedules do not. Every
//! candidate position is re-expanded from its first `key_size` bytes and
//! compared against memory, bailing out at the first mismatch.

use crate::entropy::DistinctWindow;
use crate::error::Result;
use crate::recorder::{FeatureRecorder, FeatureRecorderDef};
use crate::scanner::{Init2Params, InitParams, ScanParams, Scanner, ScannerFlags};
use lazy_static::lazy_static;
use std::fmt::Write as _;
use std::sync::Arc;

pub const AES128_KEY_SIZE: usize = 16;
pub const AES192_KEY_SIZE: usize = 24;
pub const AES256_KEY_SIZE: usize = 32;

pub const AES128_SCHEDULE_SIZE: usize = 176;
pub const AES192_SCHEDULE_SIZE: usize = 208;
pub const AES256_SCHEDULE_SIZE: usize = 240;

/// Windows with fewer distinct bytes than this cannot hold a schedule.
const MIN_DISTINCT: usize = 11;

const RECORDER: &str = "aes_keys";

/// GF(2^8) multiply with the AES polynomial.
fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0u8;
    for _ in 0..8 {
        if b & 1 == 1 {
            p ^= a;
        }
        let hi = a & 0x80;
        a <<= 1;
        if hi != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    p
}

fn build_sbox() -> [u8; 256] {
    let mut inverse = [0u8; 256];
    for a in 1..=255u8 {
        if let Some(b) = (1..=255u8).find(|&b| gmul(a, b) == 1) {
            inverse[a as usize] = b;
        }
    }
    let mut sbox = [0u8; 256];
    for (i, slot) in sbox.iter_mut().enumerate() {
        let mut s = inverse[i];
        let mut x = s;
        for _ in 0..4 {
            s = s.rotate_left(1);
            x ^= s;
        }
        *slot = x ^ 0x63;
    }
    sbox
}

fn build_rcon() -> [u8; 16] {
    let mut rcon = [0u8; 16];
    let mut c = 1u8;
    for slot in rcon.iter_mut().skip(1) {
        *slot = c;
        c = gmul(c, 2);
    }
    rcon
}

lazy_static! {
    static ref SBOX: [u8; 256] = build_sbox();
    static ref RCON: [u8; 16] = build_rcon();
}

fn schedule_core(t: &mut [u8; 4], round: usize) {
    t.rotate_left(1);
    for b in t.iter_mut() {
        *b = SBOX[*b as usize];
    }
    t[0] ^= RCON[round];
}

fn schedule_size(key_size: usize) -> Option<usize> {
    match key_size {
        AES128_KEY_SIZE => Some(AES128_SCHEDULE_SIZE),
        AES192_KEY_SIZE => Some(AES192_SCHEDULE_SIZE),
        AES256_KEY_SIZE => Some(AES256_SCHEDULE_SIZE),
        _ => None,
    }
}

/// Next 4-byte word of the schedule, derived from the previous word.
fn next_word(prev: &[u8], pos: usize, key_size: usize, round: &mut usize) -> [u8; 4] {
    let mut t = [prev[0], prev[1], prev[2], prev[3]];
    if pos % key_size == 0 {
        schedule_core(&mut t, *round);
        *round += 1;
    } else if key_size == AES256_KEY_SIZE && pos % key_size == 16 {
        for b in t.iter_mut() {
            *b = SBOX[*b as usize];
        }
    }
    t
}

/// Expand `key` (16, 24 or 32 bytes) into its full key schedule.
pub fn expand_key(key: &[u8]) -> Option<Vec<u8>> {
    let size = schedule_size(key.len())?;
    let key_size = key.len();
    let mut out = key.to_vec();
    out.resize(size, 0);
    let mut round = 1;
    for pos in (key_size..size).step_by(4) {
        let t = next_word(&out[pos - 4..pos], pos, key_size, &mut round);
        for a in 0..4 {
            out[pos + a] = out[pos + a - key_size] ^ t[a];
        }
    }
    Some(out)
}

/// True if `input` starts with a valid schedule for a `key_size`-byte key.
pub fn valid_schedule(input: &[u8], key_size: usize) -> bool {
    let Some(size) = schedule_size(key_size) else {
        return false;
    };
    if input.len() < size {
        return false;
    }
    let mut round = 1;
    for pos in (key_size..size).step_by(4) {
        let t = next_word(&input[pos - 4..pos], pos, key_size, &mut round);
        for a in 0..4 {
            if input[pos + a - key_size] ^ t[a] != input[pos + a] {
                return false;
            }
        }
    }
    true
}

/// Key bytes as space-separated lowercase hex.
pub fn key_to_string(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len() * 3);
    for (i, b) in key.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    out
}

pub struct AesScanner {
    scan_128: bool,
    scan_192: bool,
    scan_256: bool,
    recorder: Option<Arc<FeatureRecorder>>,
}

impl Default for AesScanner {
    fn default() -> Self {
        Self {
            scan_128: true,
            scan_192: false,
            scan_256: true,
            recorder: None,
        }
    }
}

impl Scanner for AesScanner {
    fn init(&mut self, sp: &mut InitParams<'_>) -> Result<()> {
        sp.info.name = "aes".to_string();
        sp.info.author = "Sam Trenholme, Jesse Kornblum and Simson Garfinkel".to_string();
        sp.info.description = "Search for AES key schedules".to_string();
        sp.info.version = "1.2".to_string();
        sp.info.flags = ScannerFlags {
            wants_memory: true,
            ..Default::default()
        };
        sp.info.feature_defs.push(FeatureRecorderDef::new(RECORDER));
        sp.info.min_sbuf_size = AES128_SCHEDULE_SIZE;

        self.scan_128 = sp.get_config::<u8>("scan_aes_128", 1, "Scan for 128-bit AES keys; 0=No, 1=Yes")? != 0;
        self.scan_192 = sp.get_config::<u8>("scan_aes_192", 0, "Scan for 192-bit AES keys; 0=No, 1=Yes")? != 0;
        self.scan_256 = sp.get_config::<u8>("scan_aes_256", 1, "Scan for 256-bit AES keys; 0=No, 1=Yes")? != 0;

        // force table construction before any worker needs it
        lazy_static::initialize(&SBOX);
        lazy_static::initialize(&RCON);
        Ok(())
    }

    fn init2(&mut self, sp: &Init2Params<'_>) -> Result<()> {
        self.recorder = Some(sp.named_feature_recorder(RECORDER)?);
        Ok(())
    }

    fn scan(&self, sp: &mut ScanParams<'_>) -> Result<()> {
        if !(self.scan_128 || self.scan_192 || self.scan_256) {
            return Ok(());
        }
        let Some(recorder) = self.recorder.as_ref() else {
            return Ok(());
        };
        let sbuf = sp.sbuf();
        let data = sbuf.data();
        if sbuf.pagesize() < AES128_SCHEDULE_SIZE || data.len() < AES128_SCHEDULE_SIZE {
            return Ok(());
        }

        // Window covers data[pos..pos + AES128_SCHEDULE_SIZE].
        let mut window = DistinctWindow::new(&data[..AES128_SCHEDULE_SIZE]);
        let last = (sbuf.pagesize() - 1).min(data.len() - AES128_SCHEDULE_SIZE);
        for pos in 0..=last {
            if pos > 0 {
                window.pop(data[pos - 1]);
                window.push(data[pos + AES128_SCHEDULE_SIZE - 1]);
            }
            if window.distinct() < MIN_DISTINCT {
                continue;
            }

            let candidate = &data[pos..];
            let candidates = [
                (self.scan_128, AES128_KEY_SIZE, "AES128"),
                (self.scan_192, AES192_KEY_SIZE, "AES192"),
                (self.scan_256, AES256_KEY_SIZE, "AES256"),
            ];
            for (enabled, key_size, label) in candidates {
                if enabled && valid_schedule(candidate, key_size) {
                    recorder.write(
                        &(sbuf.pos0() + pos as u64),
                        &key_to_string(&candidate[..key_size]),
                        label,
                    );
                }
            }
        }
        Ok(())
    }
}
