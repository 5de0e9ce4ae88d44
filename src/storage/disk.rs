// # Disk Manager - Synchronous Page I/O
//
// Reads and writes fixed-size pages to a single data file, addressed by
// page id. All I/O is synchronous; callers (the buffer pool) serialize
// access per instance.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::common::{PageId, PAGE_SIZE};
use crate::error::Result;

/// Point-in-time copy of the disk I/O counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStats {
    pub reads: u64,
    pub writes: u64,
}

/// File-backed page store.
///
/// Pages live at offset `page_id * PAGE_SIZE`. Reading a page that was never
/// written yields zeroed bytes, so freshly allocated pages round-trip without
/// a priming write.
pub struct DiskManager {
    file: Mutex<File>,
    path: PathBuf,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl DiskManager {
    /// Open (or create) the data file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        debug!(path = %path.display(), "opened data file");

        Ok(Self {
            file: Mutex::new(file),
            path,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Read the page `page_id` into `buf`.
    ///
    /// `buf` must be exactly `PAGE_SIZE` bytes. A read past the end of the
    /// file (a page that was allocated but never flushed) fills `buf` with
    /// zeros.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let mut file = self.file.lock();
        let offset = page_id * PAGE_SIZE as u64;
        let len = file.metadata()?.len();

        if offset >= len {
            buf.fill(0);
        } else {
            file.seek(SeekFrom::Start(offset))?;
            let avail = ((len - offset) as usize).min(PAGE_SIZE);
            file.read_exact(&mut buf[..avail])?;
            buf[avail..].fill(0);
        }

        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write `buf` as the on-disk image of page `page_id`.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let mut file = self.file.lock();
        let offset = page_id * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Force all written pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Number of whole pages currently in the file.
    pub fn num_pages(&self) -> u64 {
        let file = self.file.lock();
        file.metadata().map(|m| m.len() / PAGE_SIZE as u64).unwrap_or(0)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// I/O counters since the manager was opened.
    pub fn stats(&self) -> DiskStats {
        DiskStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}
