//! File-system collaborator
//!
//! The runtime never touches `std::fs` directly: bank loading, resident
//! file reads and the async reader all go through [`FileSystem`], so hosts
//! can serve banks from archives or memory.

mod async_reader;

pub use async_reader::{AsyncFileReader, ReadTarget, ReadToken, ReaderFileHandle};

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Open file: read, seek, tell (`stream_position`) and size
pub trait FileHandle: Read + Seek + Send {
    fn size(&mut self) -> io::Result<u64>;
}

/// Opens files by path
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FileHandle>>;

    /// Read a whole file
    fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut file = self.open(path)?;
        let mut data = Vec::with_capacity(file.size()? as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Read exactly `len` bytes at `offset`
    fn read_range(&self, path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = self.open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;
        Ok(data)
    }
}

impl FileHandle for File {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// Plain `std::fs` access
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        Ok(Box::new(File::open(path)?))
    }
}

struct MemoryFile(Cursor<Arc<[u8]>>);

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl FileHandle for MemoryFile {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.0.get_ref().len() as u64)
    }
}

/// In-memory file system keyed by path
#[derive(Default)]
pub struct MemoryFileSystem {
    files: RwLock<HashMap<PathBuf, Arc<[u8]>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, data: impl Into<Arc<[u8]>>) {
        self.files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(path.into(), data.into());
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        let files = self
            .files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let data = files.get(path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
        })?;
        Ok(Box::new(MemoryFile(Cursor::new(data))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_fs_read_range() {
        let fs = MemoryFileSystem::new();
        fs.insert("a.bin", (0u8..100).collect::<Vec<_>>());
        assert_eq!(fs.read_range(Path::new("a.bin"), 10, 3).unwrap(), vec![10, 11, 12]);
        assert_eq!(fs.read_all(Path::new("a.bin")).unwrap().len(), 100);
        assert!(fs.read_range(Path::new("a.bin"), 99, 5).is_err());
        assert!(fs.open(Path::new("missing")).is_err());
    }

    #[test]
    fn test_std_fs_handle_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, [1u8; 37]).unwrap();
        let mut handle = StdFileSystem.open(&path).unwrap();
        assert_eq!(handle.size().unwrap(), 37);
        assert_eq!(StdFileSystem.read_range(&path, 30, 7).unwrap(), vec![1u8; 7]);
    }
}
