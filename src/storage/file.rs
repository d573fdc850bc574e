//! Storage File
//!
//! Owns the OS file handle, the superblock and block allocation.
//!
//! ## Concurrency:
//! - All state sits behind one `parking_lot::Mutex`
//! - Methods take `&self`; the file is shared as `Arc<StorageFile>`
//!   between every dataset opened from it

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::codec::{ByteOrder, Codec};
use crate::config::Config;
use crate::error::{ChunkError, Result};

use super::free_space::FreeSpace;
use super::{MAGIC, SUPERBLOCK_SIZE, VERSION};

/// Mutable file state
struct FileInner {
    file: File,
    /// End of allocation: first byte past the last allocated block
    eoa: u64,
    /// Physical file length (grown with `set_len` so allocated blocks read back)
    len: u64,
    /// Address of the root dataset header, if one was registered
    root: Option<u64>,
    free: FreeSpace,
    /// Superblock needs rewriting
    dirty: bool,
}

/// A chunkstore container file
pub struct StorageFile {
    path: PathBuf,
    codec: Codec,
    writable: bool,
    /// Upper bound on EOA (`None` = limited only by the address width)
    max_size: Option<u64>,
    inner: Mutex<FileInner>,
}

impl StorageFile {
    /// Create (or truncate) a container file
    pub fn create(path: &Path, config: &Config) -> Result<Self> {
        let codec = Codec::new(config.byte_order, config.address_size)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let storage = Self {
            path: path.to_path_buf(),
            codec,
            writable: true,
            max_size: config.max_file_size,
            inner: Mutex::new(FileInner {
                file,
                eoa: SUPERBLOCK_SIZE,
                len: 0,
                root: None,
                free: FreeSpace::default(),
                dirty: true,
            }),
        };

        {
            let mut inner = storage.inner.lock();
            inner.file.set_len(SUPERBLOCK_SIZE)?;
            inner.len = SUPERBLOCK_SIZE;
            storage.write_superblock(&mut inner)?;
        }

        tracing::info!("Created container file {}", path.display());
        Ok(storage)
    }

    /// Open an existing container file for reading and writing
    pub fn open(path: &Path, config: &Config) -> Result<Self> {
        Self::open_inner(path, true, config.max_file_size)
    }

    /// Open an existing container file without write access
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::open_inner(path, false, None)
    }

    fn open_inner(path: &Path, writable: bool, max_size: Option<u64>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();

        let mut raw = [0u8; SUPERBLOCK_SIZE as usize];
        if len < SUPERBLOCK_SIZE {
            return Err(ChunkError::cannot_load("superblock", "file too small"));
        }
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw)?;

        if &raw[0..4] != MAGIC {
            return Err(ChunkError::cannot_load("superblock", "bad magic"));
        }
        if raw[4] != VERSION {
            return Err(ChunkError::cannot_load(
                "superblock",
                format!("unsupported version {}", raw[4]),
            ));
        }
        let order = ByteOrder::from_byte(raw[5])
            .ok_or_else(|| ChunkError::cannot_load("superblock", "bad byte order"))?;
        let codec = Codec::new(order, raw[6])
            .map_err(|_| ChunkError::cannot_load("superblock", "bad address size"))?;

        let mut dec = codec.decoder(&raw[8..], "superblock");
        let eoa = dec.get_u64()?;
        let root = dec.get_u64()?;
        let stored_crc = dec.get_u32()?;
        if crc32fast::hash(&raw[0..24]) != stored_crc {
            return Err(ChunkError::cannot_load("superblock", "checksum mismatch"));
        }
        if eoa < SUPERBLOCK_SIZE || eoa > len {
            return Err(ChunkError::cannot_load(
                "superblock",
                format!("end of allocation {eoa} outside file of {len} bytes"),
            ));
        }

        tracing::info!("Opened container file {} (eoa={})", path.display(), eoa);

        Ok(Self {
            path: path.to_path_buf(),
            codec,
            writable,
            max_size,
            inner: Mutex::new(FileInner {
                file,
                eoa,
                len,
                root: if root == u64::MAX { None } else { Some(root) },
                free: FreeSpace::default(),
                dirty: false,
            }),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Current end of allocation
    pub fn eoa(&self) -> u64 {
        self.inner.lock().eoa
    }

    /// Bytes sitting on the in-memory free list
    pub fn free_bytes(&self) -> u64 {
        self.inner.lock().free.total()
    }

    pub fn root(&self) -> Option<u64> {
        self.inner.lock().root
    }

    /// Register the address tools should open by default
    pub fn set_root(&self, addr: Option<u64>) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.root = addr;
        inner.dirty = true;
        Ok(())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes, reusing freed space first-fit
    pub fn allocate(&self, size: u64) -> Result<u64> {
        self.check_writable()?;
        if size == 0 {
            return Err(ChunkError::Resource("zero-length allocation".into()));
        }

        let mut inner = self.inner.lock();
        if let Some(addr) = inner.free.take(size) {
            return Ok(addr);
        }

        let limit = self.max_size.unwrap_or(u64::MAX).min(self.codec.addr_limit());
        let new_eoa = inner
            .eoa
            .checked_add(size)
            .filter(|&end| end <= limit)
            .ok_or(ChunkError::OutOfSpace {
                requested: size,
                limit,
            })?;

        let addr = inner.eoa;
        if new_eoa > inner.len {
            inner.file.set_len(new_eoa)?;
            inner.len = new_eoa;
        }
        inner.eoa = new_eoa;
        inner.dirty = true;
        Ok(addr)
    }

    /// Release a block previously returned by `allocate`
    pub fn free(&self, addr: u64, size: u64) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        if addr < SUPERBLOCK_SIZE || addr.saturating_add(size) > inner.eoa {
            return Err(ChunkError::Resource(format!(
                "free of [{addr}, +{size}) outside allocated space"
            )));
        }
        inner.free.release(addr, size);

        // Give trailing free space back to the end of allocation
        let eoa = inner.eoa;
        if let Some(new_eoa) = inner.free.take_tail(eoa) {
            inner.eoa = new_eoa;
            inner.dirty = true;
        }
        Ok(())
    }

    // =========================================================================
    // Positional I/O
    // =========================================================================

    pub fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let end = addr.saturating_add(buf.len() as u64);
        if addr < SUPERBLOCK_SIZE || end > inner.eoa {
            return Err(ChunkError::cannot_load(
                "file block",
                format!("read of [{addr}, {end}) outside allocated space"),
            ));
        }
        inner.file.seek(SeekFrom::Start(addr))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_at(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let end = addr.saturating_add(data.len() as u64);
        if addr < SUPERBLOCK_SIZE || end > inner.eoa {
            return Err(ChunkError::Resource(format!(
                "write of [{addr}, {end}) outside allocated space"
            )));
        }
        inner.file.seek(SeekFrom::Start(addr))?;
        inner.file.write_all(data)?;
        Ok(())
    }

    /// Persist the superblock and sync file data to disk
    pub fn flush(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        self.write_superblock(&mut inner)?;
        inner.file.sync_data()?;
        Ok(())
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(ChunkError::Resource(format!(
                "{} is opened read-only",
                self.path.display()
            )))
        }
    }

    fn write_superblock(&self, inner: &mut FileInner) -> Result<()> {
        let mut enc = self.codec.encoder(SUPERBLOCK_SIZE as usize);
        enc.put_slice(MAGIC);
        enc.put_u8(VERSION);
        enc.put_u8(self.codec.order().to_byte());
        enc.put_u8(self.codec.addr_size() as u8);
        enc.put_u8(0);
        enc.put_u64(inner.eoa);
        enc.put_u64(inner.root.unwrap_or(u64::MAX));
        let crc = crc32fast::hash(enc.as_slice());
        enc.put_u32(crc);
        enc.pad_to(SUPERBLOCK_SIZE as usize);

        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&enc.finish())?;
        inner.dirty = false;
        Ok(())
    }
}

impl Drop for StorageFile {
    fn drop(&mut self) {
        if !self.writable {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.dirty {
            if let Err(e) = self.write_superblock(&mut inner) {
                tracing::warn!("Failed to write superblock of {}: {}", self.path.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for StorageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFile")
            .field("path", &self.path)
            .field("codec", &self.codec)
            .field("writable", &self.writable)
            .finish()
    }
}
