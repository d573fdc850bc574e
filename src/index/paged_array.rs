//! Paged Array Index
//!
//! One record slot per chunk of the maximum extent, addressed by the chunk's
//! row-major linear index. Small arrays live in a single unpaged data block;
//! larger ones are split into pages of `2^page_bits` records that are only
//! written on first use. Reads of a page that was never written synthesize
//! an unallocated record without touching disk.
//!
//! ## Header
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Magic: "FAHD" (4) | Version (1) | PageBits (1) | RecSize (1) │
//! │ Reserved (1) | NElmts: u64 | DataBlock: addr                 │
//! │ BitmapLen: u32 | Presence bitmap (1 bit per page)            │
//! │ CRC32 of everything above (4)                                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data block
//! ```text
//! page p at data + p * stride, stride = 4 + page_nelmts * RecSize
//! ┌──────────────────────┬─────────────────────────────────────┐
//! │ ByteLen: u32         │ [Addr | NBytes: u32 | Mask: u32] ×n │
//! └──────────────────────┴─────────────────────────────────────┘
//! ```

use crate::codec::Codec;
use crate::error::{ChunkError, Result};
use crate::layout::{ChunkCoord, ChunkLayout};
use crate::storage::StorageFile;

use super::ChunkRecord;

const HEADER_MAGIC: &[u8; 4] = b"FAHD";
const HEADER_VERSION: u8 = 1;

/// Fixed header bytes before the bitmap (excluding the data block address)
const HEADER_FIXED: usize = 4 + 1 + 1 + 1 + 1 + 8;

pub struct PagedArrayIndex {
    addr: u64,
    codec: Codec,
    page_bits: u8,
    /// Capacity in records
    nelmts: u64,
    data_addr: Option<u64>,
    /// Presence bitmap (empty when unpaged)
    bitmap: Vec<u8>,
    layout: ChunkLayout,
}

impl PagedArrayIndex {
    pub(crate) fn create(file: &StorageFile, layout: &ChunkLayout, page_bits: u8) -> Result<Self> {
        if page_bits == 0 || page_bits > 32 {
            return Err(ChunkError::Config(format!(
                "paged array page bits must be in 1..=32, got {page_bits}"
            )));
        }
        let nelmts = layout.max_nchunks().ok_or_else(|| {
            ChunkError::Config("paged array index needs fixed maximum dimensions".into())
        })?;

        let mut index = Self {
            addr: 0,
            codec: file.codec(),
            page_bits,
            nelmts,
            data_addr: None,
            bitmap: Vec::new(),
            layout: layout.clone(),
        };

        if index.is_paged() {
            index.bitmap = vec![0u8; index.npages().div_ceil(8) as usize];
        }
        let data_size = index.data_block_size();
        if data_size > 0 {
            let data_addr = file.allocate(data_size)?;
            index.data_addr = Some(data_addr);
            if !index.is_paged() {
                file.write_at(data_addr, &index.blank_page(0))?;
            }
        }

        index.addr = file.allocate(index.header_size() as u64)?;
        index.write_header(file)?;
        Ok(index)
    }

    pub(crate) fn open(file: &StorageFile, layout: &ChunkLayout, page_bits: u8, addr: u64) -> Result<Self> {
        let codec = file.codec();
        let nelmts = layout
            .max_nchunks()
            .ok_or_else(|| ChunkError::cannot_load("paged array header", "dataset has unlimited dimensions"))?;

        let mut index = Self {
            addr,
            codec,
            page_bits,
            nelmts,
            data_addr: None,
            bitmap: Vec::new(),
            layout: layout.clone(),
        };
        let bitmap_len = if index.is_paged() {
            index.npages().div_ceil(8) as usize
        } else {
            0
        };

        let mut buf = vec![0u8; HEADER_FIXED + codec.addr_size() + 4 + bitmap_len + 4];
        file.read_at(addr, &mut buf)?;
        let body_len = buf.len() - 4;
        let mut dec = codec.decoder(&buf, "paged array header");

        if dec.get_bytes(4)? != HEADER_MAGIC {
            return Err(dec.corrupt("bad magic"));
        }
        if dec.get_u8()? != HEADER_VERSION {
            return Err(dec.corrupt("unsupported version"));
        }
        if dec.get_u8()? != page_bits {
            return Err(dec.corrupt("page size does not match the dataset header"));
        }
        if dec.get_u8()? as usize != index.record_size() {
            return Err(dec.corrupt("record size does not match the file address width"));
        }
        dec.skip(1)?;
        let stored_nelmts = dec.get_u64()?;
        if stored_nelmts != nelmts {
            return Err(dec.corrupt(format!(
                "capacity {stored_nelmts} does not match the dataset's {nelmts} chunks"
            )));
        }
        index.data_addr = dec.get_addr()?;
        let stored_bitmap_len = dec.get_u32()? as usize;
        if stored_bitmap_len != bitmap_len {
            return Err(dec.corrupt(format!(
                "bitmap of {stored_bitmap_len} bytes, expected {bitmap_len}"
            )));
        }
        index.bitmap = dec.get_bytes(bitmap_len)?.to_vec();
        let stored_crc = dec.get_u32()?;
        if crc32fast::hash(&buf[..body_len]) != stored_crc {
            return Err(ChunkError::cannot_load("paged array header", "checksum mismatch"));
        }
        if index.data_addr.is_none() && index.data_block_size() > 0 {
            return Err(ChunkError::cannot_load("paged array header", "missing data block"));
        }
        Ok(index)
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn page_bits(&self) -> u8 {
        self.page_bits
    }

    /// Record capacity (chunks in the maximum extent)
    pub fn capacity(&self) -> u64 {
        self.nelmts
    }

    fn page_nelmts(&self) -> u64 {
        1u64 << self.page_bits
    }

    fn is_paged(&self) -> bool {
        self.nelmts > self.page_nelmts()
    }

    fn npages(&self) -> u64 {
        if self.is_paged() {
            self.nelmts.div_ceil(self.page_nelmts())
        } else {
            1
        }
    }

    fn record_size(&self) -> usize {
        self.codec.addr_size() + 4 + 4
    }

    /// Records held by page `page` (the last one may be short)
    fn page_len(&self, page: u64) -> u64 {
        if self.is_paged() {
            (self.nelmts - page * self.page_nelmts()).min(self.page_nelmts())
        } else {
            self.nelmts
        }
    }

    fn page_stride(&self) -> u64 {
        4 + self.page_nelmts().min(self.nelmts) * self.record_size() as u64
    }

    fn data_block_size(&self) -> u64 {
        if self.nelmts == 0 {
            0
        } else {
            self.npages() * self.page_stride()
        }
    }

    fn header_size(&self) -> usize {
        HEADER_FIXED + self.codec.addr_size() + 4 + self.bitmap.len() + 4
    }

    fn page_present(&self, page: u64) -> bool {
        !self.is_paged() || self.bitmap[(page / 8) as usize] & (1 << (page % 8)) != 0
    }

    /// (page, slot) of a coordinate, rejecting coordinates past the capacity
    fn locate(&self, coord: &ChunkCoord) -> Result<(u64, u64)> {
        let scaled = self.layout.scaled(coord);
        if scaled.iter().zip(self.layout.max_chunks()).any(|(&s, &m)| s >= m) {
            return Err(ChunkError::Selection(format!(
                "chunk {coord} is beyond the paged array's maximum extent"
            )));
        }
        let idx = self.layout.max_linear_index(&scaled);
        debug_assert!(idx < self.nelmts);
        if self.is_paged() {
            Ok((idx >> self.page_bits, idx & (self.page_nelmts() - 1)))
        } else {
            Ok((0, idx))
        }
    }

    fn page_addr(&self, page: u64) -> Result<u64> {
        let data = self
            .data_addr
            .ok_or_else(|| ChunkError::cannot_load("paged array", "no data block"))?;
        Ok(data + page * self.page_stride())
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    fn write_header(&self, file: &StorageFile) -> Result<()> {
        let mut enc = self.codec.encoder(self.header_size());
        enc.put_slice(HEADER_MAGIC);
        enc.put_u8(HEADER_VERSION);
        enc.put_u8(self.page_bits);
        enc.put_u8(self.record_size() as u8);
        enc.put_u8(0);
        enc.put_u64(self.nelmts);
        enc.put_addr(self.data_addr);
        enc.put_u32(self.bitmap.len() as u32);
        enc.put_slice(&self.bitmap);
        let crc = crc32fast::hash(enc.as_slice());
        enc.put_u32(crc);
        file.write_at(self.addr, &enc.finish())
    }

    /// A page image with every record undefined
    fn blank_page(&self, page: u64) -> Vec<u8> {
        let n = self.page_len(page);
        let mut enc = self.codec.encoder(4 + n as usize * self.record_size());
        enc.put_u32((n as usize * self.record_size()) as u32);
        for _ in 0..n {
            enc.put_addr(None);
            enc.put_u32(0);
            enc.put_u32(0);
        }
        enc.finish()
    }

    fn encode_record(&self, record: &ChunkRecord) -> Vec<u8> {
        let mut enc = self.codec.encoder(self.record_size());
        enc.put_addr(record.addr);
        enc.put_u32(record.nbytes as u32);
        enc.put_u32(record.filter_mask);
        enc.finish()
    }

    /// Read and check a page's length prefix
    fn check_prefix(&self, file: &StorageFile, page: u64) -> Result<u64> {
        let page_addr = self.page_addr(page)?;
        let mut prefix = [0u8; 4];
        file.read_at(page_addr, &mut prefix)?;
        let len = self.codec.decoder(&prefix, "paged array page").get_u32()? as u64;
        let expected = self.page_len(page) * self.record_size() as u64;
        if len != expected {
            return Err(ChunkError::cannot_load(
                "paged array page",
                format!("page {page} length prefix {len}, expected {expected}"),
            ));
        }
        Ok(page_addr)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub(crate) fn get(&self, file: &StorageFile, coord: &ChunkCoord) -> Result<ChunkRecord> {
        let (page, slot) = self.locate(coord)?;
        if !self.page_present(page) {
            return Ok(ChunkRecord::unallocated(coord.clone()));
        }

        let page_addr = self.check_prefix(file, page)?;
        let mut raw = vec![0u8; self.record_size()];
        file.read_at(page_addr + 4 + slot * self.record_size() as u64, &mut raw)?;
        let mut dec = self.codec.decoder(&raw, "paged array record");
        let addr = dec.get_addr()?;
        let nbytes = dec.get_u32()? as u64;
        let filter_mask = dec.get_u32()?;

        Ok(match addr {
            Some(_) => ChunkRecord {
                coord: coord.clone(),
                addr,
                nbytes,
                filter_mask,
            },
            None => ChunkRecord::unallocated(coord.clone()),
        })
    }

    pub(crate) fn set(&mut self, file: &StorageFile, record: &ChunkRecord) -> Result<()> {
        let (page, slot) = self.locate(&record.coord)?;
        let page_addr = self.page_addr(page)?;
        let offset = 4 + slot as usize * self.record_size();

        if !self.page_present(page) {
            let mut image = self.blank_page(page);
            image[offset..offset + self.record_size()].copy_from_slice(&self.encode_record(record));
            file.write_at(page_addr, &image)?;

            self.bitmap[(page / 8) as usize] |= 1 << (page % 8);
            self.write_header(file)?;
            tracing::debug!("Paged array created page {} at {}", page, page_addr);
            return Ok(());
        }

        file.write_at(page_addr + offset as u64, &self.encode_record(record))
    }

    pub(crate) fn remove(&mut self, file: &StorageFile, coord: &ChunkCoord) -> Result<()> {
        let (page, _) = self.locate(coord)?;
        if !self.page_present(page) {
            return Ok(());
        }
        self.set(file, &ChunkRecord::unallocated(coord.clone()))
    }

    pub(crate) fn records<'a>(&'a self, file: &'a StorageFile) -> PageRecords<'a> {
        PageRecords {
            index: self,
            file,
            page: 0,
            buf: Vec::new(),
            slot: 0,
            done: self.nelmts == 0,
        }
    }

    /// Free the data block and header (chunk blocks are freed by the caller)
    pub(crate) fn delete(self, file: &StorageFile) -> Result<()> {
        if let Some(data) = self.data_addr {
            file.free(data, self.data_block_size())?;
        }
        file.free(self.addr, self.header_size() as u64)
    }
}

/// Iterates present pages in order, yielding allocated records
pub struct PageRecords<'a> {
    index: &'a PagedArrayIndex,
    file: &'a StorageFile,
    /// Page currently loaded in `buf` (or next to load when `buf` is empty)
    page: u64,
    buf: Vec<u8>,
    slot: u64,
    done: bool,
}

impl PageRecords<'_> {
    fn load_next_page(&mut self) -> Result<bool> {
        let idx = self.index;
        while self.page < idx.npages() {
            if idx.page_present(self.page) {
                let page_addr = idx.check_prefix(self.file, self.page)?;
                self.buf = vec![0u8; idx.page_len(self.page) as usize * idx.record_size()];
                self.file.read_at(page_addr + 4, &mut self.buf)?;
                self.slot = 0;
                return Ok(true);
            }
            self.page += 1;
        }
        Ok(false)
    }
}

impl Iterator for PageRecords<'_> {
    type Item = Result<ChunkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.index;
        loop {
            if self.done {
                return None;
            }
            if self.buf.is_empty() {
                match self.load_next_page() {
                    Ok(true) => {}
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            let page_len = idx.page_len(self.page);
            while self.slot < page_len {
                let slot = self.slot;
                self.slot += 1;
                let start = slot as usize * idx.record_size();
                let mut dec = idx
                    .codec
                    .decoder(&self.buf[start..start + idx.record_size()], "paged array record");
                let decoded = (|| Ok::<_, ChunkError>((dec.get_addr()?, dec.get_u32()?, dec.get_u32()?)))();
                let (addr, nbytes, filter_mask) = match decoded {
                    Ok(fields) => fields,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };
                if addr.is_some() {
                    let linear = self.page * idx.page_nelmts() + slot;
                    let scaled = idx.layout.scaled_from_max_linear(linear);
                    return Some(Ok(ChunkRecord {
                        coord: idx.layout.coord_from_scaled(&scaled),
                        addr,
                        nbytes: nbytes as u64,
                        filter_mask,
                    }));
                }
            }

            self.buf.clear();
            self.page += 1;
        }
    }
}
