//! NTFS `$INDEX_ALLOCATION` INDX record carving.
//!
//! Records are cluster aligned. Runs of consecutive valid file-name index
//! records are carved as one artifact; other record kinds are carved one
//! cluster at a time with an extension naming their kind.

use crate::error::Result;
use crate::recorder::{FeatureRecorder, FeatureRecorderDef};
use crate::sbuf::ScanBuffer;
use crate::scanner::{Init2Params, InitParams, ScanParams, Scanner, ScannerFlags};
use std::sync::Arc;

pub const SECTOR_SIZE: usize = 512;
pub const CLUSTER_SIZE: usize = 4096;
const RECORDER: &str = "ntfsindx_carved";
const SIGNATURE: &[u8; 4] = b"INDX";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndxCheck {
    NotIndx,
    Valid,
    /// Signature present but the update sequence does not match.
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndxKind {
    FileName,
    ObjId,
    /// Secure-SDH, Secure-SII and the like
    Other,
}

impl IndxKind {
    fn extension(self) -> &'static str {
        match self {
            IndxKind::FileName => ".INDX",
            IndxKind::ObjId => ".INDX_ObjId-O",
            IndxKind::Other => ".INDX_Misc",
        }
    }
}

pub fn check_signature(sbuf: &ScanBuffer, offset: usize) -> IndxCheck {
    if (0..4).any(|i| sbuf.get_u8(offset + i) != SIGNATURE[i]) {
        return IndxCheck::NotIndx;
    }
    let fixup_offset = sbuf.get_i16_le(offset + 4);
    if fixup_offset <= 0 || fixup_offset as usize >= SECTOR_SIZE {
        return IndxCheck::NotIndx;
    }
    let fixup_count = sbuf.get_i16_le(offset + 6);
    if fixup_count <= 0 || fixup_count as usize >= SECTOR_SIZE {
        return IndxCheck::NotIndx;
    }

    // every sector ends with the update sequence number
    let usn = sbuf.get_i16_le(offset + fixup_offset as usize);
    for i in 1..fixup_count as usize {
        if sbuf.get_i16_le(offset + SECTOR_SIZE * i - 2) != usn {
            return IndxCheck::Corrupt;
        }
    }
    IndxCheck::Valid
}

pub fn record_kind(sbuf: &ScanBuffer, offset: usize) -> IndxKind {
    // high bytes of the four FILETIMEs of the first entry
    if [95, 103, 111, 119]
        .iter()
        .all(|&i| sbuf.get_u8(offset + i) == 0x01)
    {
        IndxKind::FileName
    } else if sbuf.get_u8(offset + 64) == 0x20 && sbuf.get_u8(offset + 72) == 0x58 {
        IndxKind::ObjId
    } else {
        IndxKind::Other
    }
}

#[derive(Default)]
pub struct NtfsIndxScanner {
    recorder: Option<Arc<FeatureRecorder>>,
}

impl NtfsIndxScanner {
    fn carve(recorder: &FeatureRecorder, sbuf: &ScanBuffer, offset: usize, len: usize, ext: &str) -> Result<()> {
        let len = len.min(sbuf.bufsize() - offset);
        recorder.carve(&sbuf.slice(offset, len)?, ext, 0);
        Ok(())
    }
}

impl Scanner for NtfsIndxScanner {
    fn init(&mut self, sp: &mut InitParams<'_>) -> Result<()> {
        sp.info.name = "ntfsindx".to_string();
        sp.info.author = "Teru Yamazaki".to_string();
        sp.info.description = "Scans for NTFS $INDEX_ALLOCATION INDX record".to_string();
        sp.info.version = "1.1".to_string();
        sp.info.flags = ScannerFlags {
            default_enabled: false,
            wants_filesystems: true,
            ..Default::default()
        };
        sp.info.feature_defs.push(FeatureRecorderDef::new(RECORDER).carve());
        sp.info.min_sbuf_size = SECTOR_SIZE;
        Ok(())
    }

    fn init2(&mut self, sp: &Init2Params<'_>) -> Result<()> {
        self.recorder = Some(sp.named_feature_recorder(RECORDER)?);
        Ok(())
    }

    fn scan(&self, sp: &mut ScanParams<'_>) -> Result<()> {
        let Some(recorder) = self.recorder.as_deref() else {
            return Ok(());
        };
        let sbuf = sp.sbuf();
        let stop = sbuf.pagesize();

        let mut offset = 0;
        while offset < stop {
            let mut total = CLUSTER_SIZE;
            match check_signature(sbuf, offset) {
                IndxCheck::Valid => {
                    let kind = record_kind(sbuf, offset);
                    if kind == IndxKind::FileName {
                        while offset + total < stop
                            && check_signature(sbuf, offset + total) == IndxCheck::Valid
                            && record_kind(sbuf, offset + total) == IndxKind::FileName
                        {
                            total += CLUSTER_SIZE;
                        }
                    }
                    Self::carve(recorder, sbuf, offset, total, kind.extension())?;
                }
                IndxCheck::Corrupt => {
                    Self::carve(recorder, sbuf, offset, total, ".INDX_corrupted")?;
                }
                IndxCheck::NotIndx => {}
            }
            offset += total;
        }
        Ok(())
    }
}
