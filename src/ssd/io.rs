//! Segment read schemes.
//!
//! One of three I/O paths, chosen at startup and fixed for the process:
//! aligned `pread` on a cached fd, a lazy per-segment mmap, or mmap plus
//! `madvise(WILLNEED)` on the touched range. All three must yield
//! byte-identical results.
//!
//! Handles are cached per segment behind `Arc`, so a read that raced a
//! compaction unlink still completes against the old inode.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use memmap2::{Advice, Mmap};
use parking_lot::Mutex;

use crate::config::IoScheme;
use crate::error::{Error, Result};

/// Alignment unit for the directio path.
const PREAD_ALIGN: usize = 4096;

pub fn segment_file_name(segment: u64) -> String {
    format!("{segment:08}.seg")
}

pub fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(segment_file_name(segment))
}

pub struct SegmentReader {
    dir: PathBuf,
    scheme: IoScheme,
    files: Mutex<HashMap<u64, Arc<File>>>,
    maps: Mutex<HashMap<u64, Arc<Mmap>>>,
}

impl SegmentReader {
    pub fn new(dir: PathBuf, scheme: IoScheme) -> SegmentReader {
        SegmentReader {
            dir,
            scheme,
            files: Mutex::new(HashMap::new()),
            maps: Mutex::new(HashMap::new()),
        }
    }

    pub fn scheme(&self) -> IoScheme {
        self.scheme
    }

    /// Reads `buf.len()` bytes at `offset` of `segment`.
    pub fn read(&self, segment: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.scheme {
            IoScheme::DirectIo => self.pread(segment, offset, buf),
            IoScheme::Mmap => self.mmap_read(segment, offset, buf, false),
            IoScheme::MmapAndMadvise => self.mmap_read(segment, offset, buf, true),
        }
    }

    /// Drops cached handles for a segment about to be unlinked. In-flight
    /// reads keep their `Arc` and finish against the old inode.
    pub fn invalidate(&self, segment: u64) {
        self.files.lock().remove(&segment);
        self.maps.lock().remove(&segment);
    }

    fn file(&self, segment: u64) -> Result<Arc<File>> {
        if let Some(f) = self.files.lock().get(&segment) {
            return Ok(Arc::clone(f));
        }
        let f = Arc::new(File::open(segment_path(&self.dir, segment))?);
        self.files.lock().insert(segment, Arc::clone(&f));
        Ok(f)
    }

    fn map(&self, segment: u64) -> Result<Arc<Mmap>> {
        if let Some(m) = self.maps.lock().get(&segment) {
            return Ok(Arc::clone(m));
        }
        let file = File::open(segment_path(&self.dir, segment))?;
        // The writer only appends; the mapped prefix is immutable.
        let map = Arc::new(unsafe { Mmap::map(&file)? });
        self.maps.lock().insert(segment, Arc::clone(&map));
        Ok(map)
    }

    fn pread(&self, segment: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.file(segment)?;
        let fd = file.as_raw_fd();

        // Widen the window to the alignment unit on both ends.
        let start = (offset as usize / PREAD_ALIGN) * PREAD_ALIGN;
        let end = (offset as usize + buf.len()).div_ceil(PREAD_ALIGN) * PREAD_ALIGN;
        let mut scratch = vec![0u8; end - start];

        let mut done = 0usize;
        while done < scratch.len() {
            let n = unsafe {
                libc::pread(
                    fd,
                    scratch.as_mut_ptr().add(done) as *mut libc::c_void,
                    scratch.len() - done,
                    (start + done) as libc::off_t,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if n == 0 {
                // The aligned window may extend past EOF; the requested
                // range itself must be fully on disk.
                break;
            }
            done += n as usize;
        }

        let skip = offset as usize - start;
        if done < skip + buf.len() {
            return Err(Error::corruption(format!(
                "segment {segment}: short read at offset {offset}"
            )));
        }
        buf.copy_from_slice(&scratch[skip..skip + buf.len()]);
        Ok(())
    }

    fn mmap_read(&self, segment: u64, offset: u64, buf: &mut [u8], madvise: bool) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        let mut map = self.map(segment)?;
        if end > map.len() {
            // The mapping predates appends to this segment; remap once.
            self.maps.lock().remove(&segment);
            map = self.map(segment)?;
        }
        if end > map.len() {
            return Err(Error::corruption(format!(
                "segment {segment}: read past end ({end} > {})",
                map.len()
            )));
        }
        if madvise {
            // Best effort; a failed hint must not fail the read.
            let page_start = (start / PREAD_ALIGN) * PREAD_ALIGN;
            let page_len = end - page_start;
            if let Err(e) = map.advise_range(Advice::WillNeed, page_start, page_len) {
                log::debug!("[ssd] madvise(WILLNEED) failed: {e}");
            }
        }
        buf.copy_from_slice(&map[start..end]);
        Ok(())
    }
}
