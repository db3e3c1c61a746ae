//! Append-mostly random-access table files.
//!
//! Headers, cumulative tx counts and tx hashes live in flat files rather
//! than the key-value store. Writes are positioned, so a crash between a
//! file append and the state flush leaves bytes past the persisted height
//! that the next flush simply overwrites.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::DbError;

pub struct TableFile {
    file: Mutex<File>,
}

impl TableFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn len(&self) -> Result<u64, DbError> {
        let file = self.file.lock().expect("table file lock");
        Ok(file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.len()? == 0)
    }

    pub fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>, DbError> {
        let mut file = self.file.lock().expect("table file lock");
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), DbError> {
        let mut file = self.file.lock().expect("table file lock");
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positioned_reads_and_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = TableFile::open(dir.path().join("table.dat")).expect("open");
        assert!(table.is_empty().expect("empty"));

        table.write(0, b"aaaabbbb").expect("write");
        table.write(4, b"cccc").expect("overwrite");
        assert_eq!(table.len().expect("len"), 8);
        assert_eq!(table.read(0, 8).expect("read"), b"aaaacccc".to_vec());
        assert_eq!(table.read(4, 4).expect("read"), b"cccc".to_vec());
        assert!(table.read(6, 4).is_err());
    }
}
