//! Backing File
//!
//! Positional reads and writes on the store file. Every access carries its
//! own offset, so readers and the writer share one handle without a cursor.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// The single store file
#[derive(Debug)]
pub struct BackingFile {
    file: File,
    path: PathBuf,
    read_only: bool,
}

impl BackingFile {
    /// Open (or create) the store file
    ///
    /// Returns the handle and whether the file is new (empty).
    pub fn open(path: &Path, create: bool, read_only: bool) -> Result<(Self, bool)> {
        let file = if read_only {
            OpenOptions::new().read(true).open(path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(false)
                .open(path)?
        };
        let is_new = file.metadata()?.len() == 0;

        Ok((
            Self {
                file,
                path: path.to_path_buf(),
                read_only,
            },
            is_new,
        ))
    }

    /// Fill `buf` from `offset`; a short file is an `UnexpectedEof` error
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        read_exact_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Write all of `buf` at `offset`, extending the file if needed
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "store file opened read-only",
            )
            .into());
        }
        write_all_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Force written data and metadata to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Current file length
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

// =============================================================================
// Platform Helpers
// =============================================================================

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut total = 0usize;
    while total < buf.len() {
        let n = file.seek_read(&mut buf[total..], offset + total as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        total += n;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut total = 0usize;
    while total < buf.len() {
        let n = file.seek_write(&buf[total..], offset + total as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "seek_write returned 0",
            ));
        }
        total += n;
    }
    Ok(())
}
