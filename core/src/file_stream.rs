use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::stream::{Capabilities, StorageStream};

/// Direct-path stream over an ordinary file opened for reading and writing.
#[derive(Debug)]
pub struct FileStream {
    file: Option<File>,
    path: PathBuf,
    writable: bool,
}

impl FileStream {
    /// Opens an existing file without truncating it.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            writable: true,
        })
    }

    /// Opens an existing file for reading only; writes fail with the OS error.
    pub fn open_read_only(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            writable: false,
        })
    }

    /// Opens the file, creating it when missing. Existing content is kept.
    pub fn create(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            writable: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> CoreResult<&mut File> {
        self.file.as_mut().ok_or(CoreError::Closed)
    }
}

impl StorageStream for FileStream {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            write: self.writable,
            set_length: self.writable,
            ..Capabilities::random_access()
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        self.file()?
            .read(buf)
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    fn skip(&mut self, amount: u64) -> CoreResult<u64> {
        let file = self.file()?;
        let position = file
            .stream_position()
            .map_err(|err| CoreError::Io(err.to_string()))?;
        let length = file
            .metadata()
            .map_err(|err| CoreError::Io(err.to_string()))?
            .len();
        let skipped = amount.min(length.saturating_sub(position));
        file.seek(SeekFrom::Start(position + skipped))
            .map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(skipped)
    }

    fn available(&mut self) -> CoreResult<u64> {
        let file = self.file()?;
        let position = file
            .stream_position()
            .map_err(|err| CoreError::Io(err.to_string()))?;
        let length = file
            .metadata()
            .map_err(|err| CoreError::Io(err.to_string()))?
            .len();
        Ok(length.saturating_sub(position))
    }

    fn write(&mut self, buf: &[u8]) -> CoreResult<()> {
        self.file()?
            .write_all(buf)
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    fn flush(&mut self) -> CoreResult<()> {
        self.file()?
            .flush()
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    fn seek(&mut self, offset: u64) -> CoreResult<()> {
        self.file()?
            .seek(SeekFrom::Start(offset))
            .map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(())
    }

    fn rewind(&mut self) -> CoreResult<()> {
        self.seek(0)
    }

    fn set_length(&mut self, length: u64) -> CoreResult<()> {
        self.file()?
            .set_len(length)
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    fn length(&mut self) -> CoreResult<u64> {
        Ok(self
            .file()?
            .metadata()
            .map_err(|err| CoreError::Io(err.to_string()))?
            .len())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}
