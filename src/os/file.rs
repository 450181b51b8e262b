//! Random-access database file.
//!
//! A thin, page-oriented wrapper over `std::fs::File`: positional reads and
//! writes, growth in whole pages, and durable sync. Single-process access
//! only, so no byte-range locking.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::types::{OpenMode, PageNr, PAGE_SIZE};

// ============================================================================
// Platform-specific positional I/O
// ============================================================================

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

// ============================================================================
// FileIo
// ============================================================================

/// Random-access page file.
pub struct FileIo {
    file: File,
    /// Current file length; updated by `extend`.
    len: AtomicU64,
    /// Whether the open call created the file.
    created: bool,
}

impl FileIo {
    /// Open the database file per `mode`. A freshly created file is extended
    /// to 8 pages; the caller initializes page 0.
    pub fn open(path: &Path, mode: OpenMode) -> Result<FileIo> {
        let exists = path.exists();
        match mode {
            OpenMode::CreateNew if exists => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "database file already exists",
                )))
            }
            OpenMode::OpenExisting if !exists => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "database file not found",
                )))
            }
            _ => {}
        }

        let truncate = mode == OpenMode::CreateAlways;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?;

        let created = !exists || truncate;
        let len = if created {
            let initial = (PAGE_SIZE * 8) as u64;
            file.set_len(initial)?;
            initial
        } else {
            file.metadata()?.len()
        };

        Ok(FileIo {
            file,
            len: AtomicU64::new(len),
            created,
        })
    }

    /// True if the open call created (or truncated) the file.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Current file length in bytes.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Read one page. Reading past the end of the file means the caller
    /// followed a dangling address.
    pub fn read_page(&self, nr: PageNr, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let offset = nr * PAGE_SIZE as u64;
        if offset + PAGE_SIZE as u64 > self.len() {
            return Err(Error::Corrupt("page read past end of file"));
        }
        read_exact_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Write bytes at an absolute offset, within the current length.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        write_all_at(&self.file, data, offset)?;
        Ok(())
    }

    /// Grow the file to `new_len` bytes (a multiple of the page size). New
    /// bytes read as zero.
    pub fn extend(&self, new_len: u64) -> Result<()> {
        debug_assert_eq!(new_len % PAGE_SIZE as u64, 0);
        if new_len <= self.len() {
            return Ok(());
        }
        self.file.set_len(new_len)?;
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_new_fails_on_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let first = FileIo::open(&path, OpenMode::CreateNew).unwrap();
        assert!(first.created());
        assert_eq!(first.len(), (PAGE_SIZE * 8) as u64);
        drop(first);
        assert!(FileIo::open(&path, OpenMode::CreateNew).is_err());
    }

    #[test]
    fn test_open_existing_fails_on_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        assert!(FileIo::open(&path, OpenMode::OpenExisting).is_err());
    }

    #[test]
    fn test_page_roundtrip_and_extend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let io = FileIo::open(&path, OpenMode::CreateAlways).unwrap();

        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        io.write_at(3 * PAGE_SIZE as u64, &page).unwrap();

        let mut back = [0u8; PAGE_SIZE];
        io.read_page(3, &mut back).unwrap();
        assert_eq!(back[0], 0xAB);
        assert_eq!(back[PAGE_SIZE - 1], 0xCD);

        // page 9 is past the initial 8 pages until the file grows
        assert!(io.read_page(9, &mut back).is_err());
        io.extend(16 * PAGE_SIZE as u64).unwrap();
        io.read_page(9, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0));
    }
}
