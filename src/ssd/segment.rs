//! Segment files: sequential append and restart scanning.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::Result;

use super::io::segment_path;
use super::layout::{
    decode_segment_header, encode_segment_header, record_bytes, RecordHeader, RECORD_HEADER_SIZE,
    SEGMENT_HEADER_SIZE,
};

/// The current write segment. Appends are buffered in `scratch` per
/// record and written with a single `write_all`; durability comes from
/// the explicit `sync` at batch boundaries.
pub struct SegmentWriter {
    pub id: u64,
    file: File,
    len: u64,
    scratch: Vec<u8>,
}

impl SegmentWriter {
    pub fn create(dir: &Path, id: u64) -> Result<SegmentWriter> {
        let path = segment_path(dir, id);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut header = [0u8; SEGMENT_HEADER_SIZE];
        encode_segment_header(&mut header);
        file.write_all(&header)?;
        Ok(SegmentWriter {
            id,
            file,
            len: SEGMENT_HEADER_SIZE as u64,
            scratch: Vec::new(),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Appends one record, returning its offset within the segment.
    pub fn append(&mut self, header: &RecordHeader, payload: &[u8]) -> Result<u64> {
        let offset = self.len;
        self.scratch.clear();
        self.scratch.resize(RECORD_HEADER_SIZE, 0);
        header.encode(&mut self.scratch);
        self.scratch.extend_from_slice(payload);
        self.file.write_all(&self.scratch)?;
        self.len += self.scratch.len() as u64;
        Ok(offset)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Result of scanning one segment on startup.
pub struct ScanOutcome {
    /// Valid records, in file order.
    pub records: usize,
    /// Checksum-failing records skipped mid-file.
    pub corrupt_dropped: usize,
    /// When set, the file had a torn tail and was truncated to this length.
    pub truncated_to: Option<u64>,
}

/// Walks the records of a sealed or recovered segment in offset order.
///
/// `f` receives `(offset, header, payload_bytes)` for every record whose
/// checksum verifies. A short or checksum-failing trailing record is
/// treated as a torn tail and truncated away; a checksum failure with
/// further full records behind it is dropped and counted.
pub fn scan_segment(
    dir: &Path,
    segment: u64,
    total_dims: usize,
    mut f: impl FnMut(u64, RecordHeader, &[u8]),
) -> Result<Option<ScanOutcome>> {
    let path = segment_path(dir, segment);
    let mut file = File::open(&path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    if decode_segment_header(&bytes).is_none() {
        log::warn!("[ssd] segment {segment}: bad magic, skipping file");
        return Ok(None);
    }

    let rec = record_bytes(total_dims);
    let mut outcome = ScanOutcome {
        records: 0,
        corrupt_dropped: 0,
        truncated_to: None,
    };

    let mut offset = SEGMENT_HEADER_SIZE;
    let mut valid_end = offset;
    while offset < bytes.len() {
        if bytes.len() - offset < rec {
            // Torn tail: the crash landed mid-record.
            outcome.truncated_to = Some(valid_end as u64);
            break;
        }
        let header = RecordHeader::decode(&bytes[offset..]);
        let payload = &bytes[offset + RECORD_HEADER_SIZE..offset + rec];
        if header.checksum_matches(payload) {
            f(offset as u64, header, payload);
            outcome.records += 1;
            valid_end = offset + rec;
        } else if offset + rec == bytes.len() {
            // Full-length but checksum-failing final record: torn tail.
            outcome.truncated_to = Some(valid_end as u64);
            break;
        } else {
            log::warn!(
                "[ssd] segment {segment}: dropping corrupt record at offset {offset} (key {})",
                header.key
            );
            outcome.corrupt_dropped += 1;
        }
        offset += rec;
    }

    if let Some(end) = outcome.truncated_to {
        log::warn!("[ssd] segment {segment}: truncating torn tail to {end} bytes");
        OpenOptions::new().write(true).open(&path)?.set_len(end)?;
    }
    Ok(Some(outcome))
}

/// Lists existing segment ids under `dir`, ascending.
pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".seg") {
            if let Ok(id) = stem.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
