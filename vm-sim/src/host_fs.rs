//! Swap files on the host file system

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use vm_kernel::mm::{SwapFile, SwapFileSystem};

/// A host file used as the swap file
pub struct HostSwapFile(Mutex<File>);

impl SwapFile for HostSwapFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let mut file = self.0.lock().unwrap();
        if file.seek(SeekFrom::Start(offset as u64)).is_err() {
            return 0;
        }
        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]) {
                Ok(0) | Err(_) => break,
                Ok(n) => read += n,
            }
        }
        read
    }
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut file = self.0.lock().unwrap();
        if file.seek(SeekFrom::Start(offset as u64)).is_err() {
            return 0;
        }
        match file.write_all(buf) {
            Ok(()) => buf.len(),
            Err(err) => {
                log::error!("host swap: write of {} bytes at {:#x}: {}", buf.len(), offset, err);
                0
            }
        }
    }
    fn close(&self) {
        if let Err(err) = self.0.lock().unwrap().sync_all() {
            log::warn!("host swap: sync failed: {}", err);
        }
    }
}

/// Files in one host directory
pub struct HostFileSystem {
    dir: PathBuf,
}

impl HostFileSystem {
    /// Files live in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SwapFileSystem for HostFileSystem {
    fn open(&self, name: &str, create: bool) -> Option<Arc<dyn SwapFile>> {
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(create)
            .open(&path)
            .ok()?;
        Some(Arc::new(HostSwapFile(Mutex::new(file))))
    }
    fn remove(&self, name: &str) -> bool {
        fs::remove_file(self.dir.join(name)).is_ok()
    }
}
