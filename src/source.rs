// Byte-source and object-writer collaborators.
//
// The core never touches files directly: hashing and matching consume a
// `ByteSource`, reconstruction writes through an `ObjectWriter`. In-memory
// and file-backed implementations live here.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Seekable, sized byte stream.
///
/// `read` returns fewer bytes than requested only at end of stream.
pub trait ByteSource {
    /// Name used in events and error messages.
    fn name(&self) -> &str;
    fn exists(&self) -> bool;
    fn open(&mut self) -> Result<()>;
    fn size(&mut self) -> Result<u64>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;
    fn close(&mut self);

    fn seek_to(&mut self, offset: u64) -> Result<u64> {
        self.seek(SeekFrom::Start(offset))
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek_to(offset)?;
        let n = self.read(buf)?;
        if n < buf.len() {
            return Err(SyncError::io(
                format!("{}: short read at offset {offset}", self.name()),
                io::Error::from(io::ErrorKind::UnexpectedEof),
            ));
        }
        Ok(())
    }
}

/// Positional writer for reconstructed objects.
pub trait ObjectWriter {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    /// Truncate or extend to exactly `len` bytes.
    fn set_len(&mut self, len: u64) -> Result<()>;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: ByteSource + ?Sized> ByteSource for &mut T {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn exists(&self) -> bool {
        (**self).exists()
    }
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }
    fn size(&mut self) -> Result<u64> {
        (**self).size()
    }
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }
    fn close(&mut self) {
        (**self).close()
    }
}

impl ObjectWriter for Vec<u8> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[start..end].copy_from_slice(data);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.resize(len as usize, 0);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory object
// ---------------------------------------------------------------------------

/// An object held in memory, optionally absent.
///
/// Also an `ObjectWriter`, so it can serve as both sides of an in-place
/// reconstruction.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Option<Vec<u8>>,
    pos: u64,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: Some(data.into()),
            pos: 0,
        }
    }

    /// An object that does not exist.
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
            pos: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data.unwrap_or_default()
    }

    fn bytes(&self) -> Result<&[u8]> {
        self.data.as_deref().ok_or_else(|| SyncError::NotFound {
            name: self.name.clone(),
        })
    }
}

impl ByteSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> bool {
        self.data.is_some()
    }

    fn open(&mut self) -> Result<()> {
        self.bytes()?;
        self.pos = 0;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.bytes()?.len() as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.pos;
        let data = self.bytes()?;
        let start = (pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.bytes()?.len() as i128;
        let target = match pos {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::End(delta) => len + delta as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
        };
        if target < 0 {
            return Err(SyncError::io(
                format!("{}: seek before start", self.name),
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    fn close(&mut self) {
        self.pos = 0;
    }
}

impl ObjectWriter for MemorySource {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.data.get_or_insert_with(Vec::new).write_at(offset, data)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        ObjectWriter::set_len(self.data.get_or_insert_with(Vec::new), len)
    }
}

// ---------------------------------------------------------------------------
// File-backed object
// ---------------------------------------------------------------------------

/// A file on disk, opened lazily.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    writable: bool,
    file: Option<File>,
}

impl FileSource {
    /// Read-only handle.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            writable: false,
            file: None,
        }
    }

    /// Read-write handle, for in-place reconstruction. The file is created
    /// if it does not exist.
    pub fn read_write(path: impl AsRef<Path>) -> Self {
        Self {
            writable: true,
            ..Self::new(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            self.open()?;
        }
        self.file
            .as_mut()
            .ok_or_else(|| SyncError::protocol("file handle missing after open"))
    }

    fn err(&self, op: &str, e: io::Error) -> SyncError {
        SyncError::io(format!("{}: {op}", self.name), e)
    }
}

impl ByteSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn open(&mut self) -> Result<()> {
        let file = if self.writable {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
        } else {
            File::open(&self.path)
        }
        .map_err(|e| self.err("open", e))?;
        self.file = Some(file);
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        match &self.file {
            Some(f) => f.metadata().map(|m| m.len()),
            None => fs::metadata(&self.path).map(|m| m.len()),
        }
        .map_err(|e| self.err("stat", e))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        let result = {
            let file = self.file()?;
            loop {
                match file.read(&mut buf[total..]) {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        total += n;
                        if total == buf.len() {
                            break Ok(());
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break Err(e),
                }
            }
        };
        result.map_err(|e| self.err("read", e))?;
        Ok(total)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let result = self.file()?.seek(pos);
        result.map_err(|e| self.err("seek", e))
    }

    fn close(&mut self) {
        self.file = None;
    }
}

impl ObjectWriter for FileSource {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let result = {
            let file = self.file()?;
            file.seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(data))
        };
        result.map_err(|e| self.err("write", e))
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let result = self.file()?.set_len(len);
        result.map_err(|e| self.err("truncate", e))
    }

    fn flush(&mut self) -> Result<()> {
        let result = self.file()?.flush();
        result.map_err(|e| self.err("flush", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_read_and_seek() {
        let mut src = MemorySource::new("m", b"0123456789".to_vec());
        src.open().unwrap();
        assert_eq!(src.size().unwrap(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(src.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(src.seek(SeekFrom::End(-2)).unwrap(), 8);
        assert_eq!(src.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(src.read(&mut buf).unwrap(), 0);
        assert!(src.seek(SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn absent_memory_object_reports_not_found() {
        let mut src = MemorySource::absent("gone");
        assert!(!src.exists());
        let err = src.open().unwrap_err();
        assert!(err.is_no_object_error());
    }

    #[test]
    fn read_exact_at_short_read_is_io_error() {
        let mut src = MemorySource::new("m", b"abc".to_vec());
        let mut buf = [0u8; 4];
        let err = src.read_exact_at(1, &mut buf).unwrap_err();
        assert!(!err.is_no_object_error());
    }

    #[test]
    fn vec_writer_extends_and_truncates() {
        let mut out = Vec::new();
        out.write_at(4, b"xy").unwrap();
        assert_eq!(out, b"\0\0\0\0xy");
        ObjectWriter::set_len(&mut out, 3).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn file_source_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.bin");
        std::fs::write(&path, b"hello file").unwrap();

        let mut src = FileSource::new(&path);
        assert!(src.exists());
        assert_eq!(src.size().unwrap(), 10);
        let mut buf = [0u8; 4];
        src.read_exact_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"file");
        src.close();

        let missing = FileSource::new(dir.path().join("nope"));
        assert!(!missing.exists());
        let mut missing = missing;
        assert!(missing.open().unwrap_err().is_no_object_error());
    }

    #[test]
    fn file_writer_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.bin");
        std::fs::write(&path, b"AAAABBBB").unwrap();

        let mut obj = FileSource::read_write(&path);
        obj.write_at(0, b"CC").unwrap();
        obj.set_len(6).unwrap();
        obj.flush().unwrap();
        obj.close();
        assert_eq!(std::fs::read(&path).unwrap(), b"CCAABB");
    }
}
