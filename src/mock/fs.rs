use core::cell::RefCell;
use std::{collections::BTreeMap, rc::Rc, string::String, vec::Vec};

use embedded_io::{ErrorKind, ErrorType, Read, Seek, SeekFrom, Write};

use crate::loader::{FileSystem, OpenMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    Full,
}

impl embedded_io::Error for FsError {
    fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound => ErrorKind::NotFound,
            FsError::Full => ErrorKind::Other,
        }
    }
}

type Files = Rc<RefCell<BTreeMap<String, Vec<u8>>>>;

/// Flat in-memory filesystem.
#[derive(Default)]
pub struct MockFileSystem {
    pub files: Files,
    /// Writes to this path fail as if the medium were full.
    pub full_path: Option<String>,
}

impl MockFileSystem {
    pub fn with_file(mut self, path: &str, contents: &[u8]) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: &str, contents: &[u8]) {
        self.files
            .borrow_mut()
            .insert(String::from(path), contents.to_vec());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }
}

pub struct MockFile {
    files: Files,
    path: String,
    pos: usize,
    full: bool,
}

impl ErrorType for MockFile {
    type Error = FsError;
}

impl Read for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let files = self.files.borrow();
        let data = files.get(&self.path).ok_or(FsError::NotFound)?;
        let available = data.len().saturating_sub(self.pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for MockFile {
    fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        if self.full {
            return Err(FsError::Full);
        }
        let mut files = self.files.borrow_mut();
        let data = files.get_mut(&self.path).ok_or(FsError::NotFound)?;
        if data.len() < self.pos + buf.len() {
            data.resize(self.pos + buf.len(), 0);
        }
        data[self.pos..self.pos + buf.len()].copy_from_slice(buf);
        self.pos += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), FsError> {
        Ok(())
    }
}

impl Seek for MockFile {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        let len = self
            .files
            .borrow()
            .get(&self.path)
            .map_or(0, |data| data.len()) as i64;
        let pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => len + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        self.pos = pos.max(0) as usize;
        Ok(self.pos as u64)
    }
}

impl FileSystem for MockFileSystem {
    type Error = FsError;
    type File = MockFile;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<MockFile, FsError> {
        match mode {
            OpenMode::Read => {
                if !self.exists(path) {
                    return Err(FsError::NotFound);
                }
            }
            OpenMode::Write => self.insert(path, &[]),
        }

        Ok(MockFile {
            files: self.files.clone(),
            path: String::from(path),
            pos: 0,
            full: self.full_path.as_deref() == Some(path),
        })
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        self.files
            .borrow_mut()
            .remove(path)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }
}
