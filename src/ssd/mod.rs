//! Append-only, compacted persistence for slots whose id set vastly
//! exceeds memory.
//!
//! Records are written sequentially into numbered segment files and
//! indexed by an in-memory manifest. Appends and manifest publication
//! happen under one writer mutex, for both fresh commits and compaction
//! copies, so disk order always matches publication order and a restart
//! scan in ascending (segment, offset) order rebuilds the exact manifest.
//!
//! Reads go through one of three I/O schemes (`SSDHASH_IO_SCHEME`);
//! compaction runs inline or on a dedicated task
//! (`SSDHASH_ASYNC_COMPACTION`).

pub mod compactor;
pub mod io;
pub mod layout;
pub mod manifest;
pub mod segment;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{EmbeddingConfig, IoScheme};
use crate::error::{Error, Result};

use compactor::CompactorHandle;
use io::{segment_path, SegmentReader};
use layout::{bytes_to_floats, floats_as_bytes, record_bytes, RecordHeader, RECORD_HEADER_SIZE};
use manifest::{Manifest, RecordLocation};
use segment::{list_segments, scan_segment, SegmentWriter};

/// Consecutive write failures on the current segment before the log
/// refuses further commits.
const FATAL_IO_STREAK: u32 = 3;

/// Compaction copies are appended in batches of this many records.
const COMPACTION_BATCH: usize = 256;

#[derive(Debug, Clone)]
pub struct SsdLogOptions {
    pub total_dims: usize,
    pub segment_bytes: u64,
    pub compaction_threshold: f64,
    pub max_sealed_segments: usize,
    pub async_compaction: bool,
    pub io_scheme: IoScheme,
}

impl SsdLogOptions {
    pub fn from_config(cfg: &EmbeddingConfig, total_dims: usize) -> SsdLogOptions {
        SsdLogOptions {
            total_dims,
            segment_bytes: cfg.segment_bytes,
            compaction_threshold: cfg.compaction_threshold,
            max_sealed_segments: cfg.max_sealed_segments,
            async_compaction: cfg.async_compaction,
            io_scheme: cfg.io_scheme,
        }
    }
}

/// One record headed for disk.
pub struct SsdRecord<'a> {
    pub key: i64,
    pub flags: u64,
    pub version: i64,
    pub frequency: i64,
    pub payload: &'a [f32],
}

/// Header fields read back with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub flags: u64,
    pub version: i64,
    pub frequency: i64,
}

/// What a restart scan recovered.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryStats {
    pub recovered_ids: usize,
    pub corrupt_dropped: usize,
    pub truncated_segments: usize,
}

struct SealedSegment {
    id: u64,
    bytes: u64,
}

struct WriterState {
    current: SegmentWriter,
    sealed: Vec<SealedSegment>,
}

pub(crate) struct LogCore {
    dir: PathBuf,
    opts: SsdLogOptions,
    writer: Mutex<WriterState>,
    manifest: Manifest,
    reader: SegmentReader,
    io_error_streak: AtomicU32,
    fatal: AtomicBool,
}

impl LogCore {
    fn record_len(&self) -> u32 {
        record_bytes(self.opts.total_dims) as u32
    }

    fn check_fatal(&self) -> Result<()> {
        if self.fatal.load(Ordering::Acquire) {
            return Err(Error::precondition(
                "ssd log shut down after repeated i/o errors",
            ));
        }
        Ok(())
    }

    fn note_io_error(&self, what: &str, err: &Error) {
        let streak = self.io_error_streak.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= FATAL_IO_STREAK {
            self.fatal.store(true, Ordering::Release);
            log::error!("[ssd] {what} failed {streak} times, going fatal: {err}");
        } else {
            log::warn!("[ssd] {what} failed (streak {streak}): {err}");
        }
    }

    /// Seals the current segment and opens the next one when the upcoming
    /// record would overflow it.
    fn rotate_if_needed(&self, st: &mut WriterState, upcoming: usize) -> Result<()> {
        let header = layout::SEGMENT_HEADER_SIZE as u64;
        if st.current.len() > header && st.current.len() + upcoming as u64 > self.opts.segment_bytes
        {
            st.current.sync()?;
            let sealed_id = st.current.id;
            let sealed_bytes = st.current.len();
            let next = SegmentWriter::create(&self.dir, sealed_id + 1)?;
            self.manifest.register_segment(next.id);
            st.sealed.push(SealedSegment {
                id: sealed_id,
                bytes: sealed_bytes,
            });
            st.current = next;
        }
        Ok(())
    }

    fn append_locked(&self, st: &mut WriterState, rec: &SsdRecord<'_>) -> Result<RecordLocation> {
        debug_assert_eq!(rec.payload.len(), self.opts.total_dims);
        let payload = floats_as_bytes(rec.payload);
        let rec_len = self.record_len();
        self.rotate_if_needed(st, rec_len as usize)?;
        let header = RecordHeader::new(rec.key, rec.flags, rec.version, rec.frequency, payload);
        let offset = st.current.append(&header, payload)?;
        Ok(RecordLocation {
            segment: st.current.id,
            offset,
            length: rec_len,
        })
    }

    /// Appends the batch, fsyncs once, then publishes every record into
    /// the manifest — all under the writer lock so publication order
    /// matches disk order.
    fn flush_batch(&self, records: &[SsdRecord<'_>]) -> Result<Vec<RecordLocation>> {
        self.check_fatal()?;
        let mut st = self.writer.lock();
        let mut locations = Vec::with_capacity(records.len());
        for rec in records {
            match self.append_locked(&mut st, rec) {
                Ok(loc) => locations.push(loc),
                Err(e) => {
                    self.note_io_error("append", &e);
                    return Err(e);
                }
            }
        }
        if let Err(e) = st.current.sync() {
            self.note_io_error("fsync", &e);
            return Err(e);
        }
        self.io_error_streak.store(0, Ordering::Release);
        for (rec, loc) in records.iter().zip(&locations) {
            self.manifest.publish(rec.key, *loc);
        }
        Ok(locations)
    }

    fn get(&self, id: i64, out: &mut [f32]) -> Result<Option<RecordMeta>> {
        debug_assert_eq!(out.len(), self.opts.total_dims);
        for attempt in 0..2 {
            let Some(loc) = self.manifest.get(id) else {
                return Ok(None);
            };
            let mut buf = vec![0u8; loc.length as usize];
            match self.reader.read(loc.segment, loc.offset, &mut buf) {
                Ok(()) => {
                    let header = RecordHeader::decode(&buf);
                    let payload = &buf[RECORD_HEADER_SIZE..];
                    if header.key != id || !header.checksum_matches(payload) {
                        self.manifest.remove(id);
                        log::error!(
                            "[ssd] dropping corrupt record for id {id} at segment {} offset {}",
                            loc.segment,
                            loc.offset
                        );
                        return Err(Error::corruption(format!("record for id {id}")));
                    }
                    bytes_to_floats(payload, out);
                    return Ok(Some(RecordMeta {
                        flags: header.flags,
                        version: header.version,
                        frequency: header.frequency,
                    }));
                }
                Err(Error::Io(e))
                    if e.kind() == std::io::ErrorKind::NotFound && attempt == 0 =>
                {
                    // The segment was unlinked under us; the manifest
                    // already points at the compacted copy.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::corruption(format!(
            "id {id}: segment vanished twice during read"
        )))
    }

    /// A sealed segment worth compacting: live fraction below the
    /// threshold, or — once too many segments are sealed — the oldest
    /// one with anything dead in it. A fully live segment is never a
    /// victim; rewriting it reclaims nothing.
    fn pick_victim(&self) -> Option<u64> {
        let st = self.writer.lock();
        let header = layout::SEGMENT_HEADER_SIZE as u64;
        let mut oldest_reclaimable = None;
        for s in &st.sealed {
            let data = s.bytes.saturating_sub(header);
            if data == 0 {
                return Some(s.id);
            }
            let live = self.manifest.live_bytes(s.id);
            if (live as f64) < self.opts.compaction_threshold * data as f64 {
                return Some(s.id);
            }
            if live < data && oldest_reclaimable.is_none() {
                oldest_reclaimable = Some(s.id);
            }
        }
        if st.sealed.len() > self.opts.max_sealed_segments {
            return oldest_reclaimable;
        }
        None
    }

    fn flush_compaction_batch(
        &self,
        source: u64,
        batch: &mut Vec<(u64, RecordHeader, Vec<u8>)>,
    ) -> Result<()> {
        let mut st = self.writer.lock();
        let rec_len = self.record_len();
        let mut appended = false;
        for (src_offset, header, payload) in batch.drain(..) {
            let at = self.manifest.get(header.key);
            if at
                != Some(RecordLocation {
                    segment: source,
                    offset: src_offset,
                    length: rec_len,
                })
            {
                // A fresh commit superseded this record mid-pass.
                continue;
            }
            self.rotate_if_needed(&mut st, rec_len as usize)?;
            let offset = st.current.append(&header, &payload)?;
            appended = true;
            let loc = RecordLocation {
                segment: st.current.id,
                offset,
                length: rec_len,
            };
            // Publication can still lose to a commit that slipped in
            // between the check above and here on another pass; a lost
            // copy just becomes dead bytes in the new segment.
            self.manifest
                .publish_if_segment(header.key, source, src_offset, loc);
        }
        if appended {
            st.current.sync()?;
        }
        Ok(())
    }

    /// Rewrites the live records of `segment` into the current write
    /// segment, then unlinks it.
    fn compact_segment(&self, segment: u64) -> Result<()> {
        let rec_len = self.record_len();
        let mut batch: Vec<(u64, RecordHeader, Vec<u8>)> = Vec::new();
        let mut pending: Result<()> = Ok(());
        scan_segment(&self.dir, segment, self.opts.total_dims, |off, h, payload| {
            if pending.is_err() {
                return;
            }
            let live = self.manifest.get(h.key)
                == Some(RecordLocation {
                    segment,
                    offset: off,
                    length: rec_len,
                });
            if live {
                batch.push((off, h, payload.to_vec()));
                if batch.len() >= COMPACTION_BATCH {
                    pending = self.flush_compaction_batch(segment, &mut batch);
                }
            }
        })?;
        pending?;
        self.flush_compaction_batch(segment, &mut batch)?;

        {
            let mut st = self.writer.lock();
            st.sealed.retain(|s| s.id != segment);
        }
        let leftover = self.manifest.drop_segment(segment);
        if leftover != 0 {
            log::warn!("[compactor] segment {segment} retired with {leftover} live bytes");
        }
        self.reader.invalidate(segment);
        std::fs::remove_file(segment_path(&self.dir, segment))?;
        log::debug!("[compactor] segment {segment} compacted and unlinked");
        Ok(())
    }

    /// Drains every eligible segment. Transient errors are logged and end
    /// the pass; the next wake retries.
    pub(crate) fn run_compaction_passes(&self) {
        while let Some(victim) = self.pick_victim() {
            if let Err(e) = self.compact_segment(victim) {
                log::warn!("[compactor] compaction of segment {victim} failed: {e}");
                break;
            }
        }
    }
}

pub struct SsdLog {
    core: Arc<LogCore>,
    compactor: Mutex<Option<CompactorHandle>>,
    recovery: RecoveryStats,
}

impl SsdLog {
    /// Opens (or creates) the log under `dir`, rebuilding the manifest by
    /// scanning existing segments in ascending order. A new write segment
    /// is always started; recovered segments are sealed as-is.
    pub fn open(dir: &Path, opts: SsdLogOptions) -> Result<SsdLog> {
        std::fs::create_dir_all(dir)?;
        let manifest = Manifest::new();
        let mut sealed = Vec::new();
        let mut recovery = RecoveryStats::default();
        let rec_len = record_bytes(opts.total_dims) as u32;

        let segments = list_segments(dir)?;
        for seg in &segments {
            let seg = *seg;
            manifest.register_segment(seg);
            let outcome = scan_segment(dir, seg, opts.total_dims, |offset, header, _payload| {
                manifest.publish(
                    header.key,
                    RecordLocation {
                        segment: seg,
                        offset,
                        length: rec_len,
                    },
                );
            })?;
            match outcome {
                Some(o) => {
                    recovery.corrupt_dropped += o.corrupt_dropped;
                    if o.truncated_to.is_some() {
                        recovery.truncated_segments += 1;
                    }
                    let bytes = std::fs::metadata(segment_path(dir, seg))?.len();
                    sealed.push(SealedSegment { id: seg, bytes });
                }
                None => {
                    // Unrecognized file; leave it alone.
                    manifest.drop_segment(seg);
                }
            }
        }
        recovery.recovered_ids = manifest.len();

        let next_id = segments.last().map(|s| s + 1).unwrap_or(0);
        let current = SegmentWriter::create(dir, next_id)?;
        manifest.register_segment(next_id);

        let core = Arc::new(LogCore {
            dir: dir.to_path_buf(),
            reader: SegmentReader::new(dir.to_path_buf(), opts.io_scheme),
            writer: Mutex::new(WriterState { current, sealed }),
            manifest,
            opts,
            io_error_streak: AtomicU32::new(0),
            fatal: AtomicBool::new(false),
        });
        let compactor = core
            .opts
            .async_compaction
            .then(|| compactor::spawn(Arc::clone(&core)));
        Ok(SsdLog {
            core,
            compactor: Mutex::new(compactor),
            recovery,
        })
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    /// Appends and fsyncs the batch, then triggers compaction if a sealed
    /// segment became eligible.
    pub fn flush_batch(&self, records: &[SsdRecord<'_>]) -> Result<Vec<RecordLocation>> {
        let locations = self.core.flush_batch(records)?;
        self.maybe_compact();
        Ok(locations)
    }

    pub fn commit(
        &self,
        key: i64,
        flags: u64,
        version: i64,
        frequency: i64,
        payload: &[f32],
    ) -> Result<()> {
        self.flush_batch(&[SsdRecord {
            key,
            flags,
            version,
            frequency,
            payload,
        }])?;
        Ok(())
    }

    pub fn get(&self, id: i64, out: &mut [f32]) -> Result<Option<RecordMeta>> {
        self.core.get(id, out)
    }

    pub fn remove(&self, id: i64) -> bool {
        self.core.manifest.remove(id).is_some()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.core.manifest.contains(id)
    }

    pub fn len(&self) -> usize {
        self.core.manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<i64> {
        self.core.manifest.keys()
    }

    pub fn sealed_segments(&self) -> usize {
        self.core.writer.lock().sealed.len()
    }

    /// Syncs the current write segment.
    pub fn flush(&self) -> Result<()> {
        self.core.writer.lock().current.sync()
    }

    fn maybe_compact(&self) {
        if self.core.pick_victim().is_none() {
            return;
        }
        match &*self.compactor.lock() {
            Some(handle) => handle.wake(),
            None => self.core.run_compaction_passes(),
        }
    }

    /// Stops the compactor (draining at a segment boundary) and seals
    /// the write segment.
    pub fn close(&self) -> Result<()> {
        if let Some(handle) = self.compactor.lock().take() {
            handle.shutdown();
        }
        self.flush()
    }
}

impl Drop for SsdLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
