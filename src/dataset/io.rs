//! Selection-based read and write
//!
//! Every transfer is split into chunk units first, so a bad selection fails
//! before any storage is touched. Each unit then takes one of three paths:
//!
//! ```text
//!                     ┌───────────────┐
//!  unit ──► record ──►│  cacheable?   │── yes ──► lock ─► copy ─► unlock
//!                     └──────┬────────┘
//!                            no
//!                            ├── allocated ──► positional I/O per run
//!                            └── unallocated ─► fill pattern (read)
//!                                              insert_or_resize (write)
//! ```

use crate::convert::TypeConversion;
use crate::error::{ChunkError, Result};
use crate::index::ChunkRecord;
use crate::selection::{copy_runs, fill_runs, gather, scatter, Dataspace, Selection};

use super::chunk_map::{self, ChunkUnit};
use super::Dataset;

/// One side of a transfer: which elements of which buffer, at what width
#[derive(Clone, Copy)]
struct Elements<'a> {
    sel: &'a Selection,
    space: &'a Dataspace,
    elem: usize,
}

impl Dataset {
    // =========================================================================
    // Public Interface
    // =========================================================================

    /// Read `file_sel` of the dataset into `mem_sel` of `buf`
    ///
    /// `buf` is laid out as `mem_space` with the dataset's element size.
    /// Elements of never-written chunks read as the fill value, unless the
    /// fill time is `Never`, in which case they are left untouched.
    pub fn read(
        &mut self,
        file_sel: &Selection,
        mem_space: &Dataspace,
        mem_sel: &Selection,
        buf: &mut [u8],
    ) -> Result<()> {
        self.read_inner(file_sel, mem_space, mem_sel, buf, None)
    }

    /// Like [`read`](Self::read), converting each element from the stored
    /// type (`conv.src_size()`) to the memory type (`conv.dst_size()`)
    pub fn read_converted(
        &mut self,
        file_sel: &Selection,
        mem_space: &Dataspace,
        mem_sel: &Selection,
        buf: &mut [u8],
        conv: &dyn TypeConversion,
    ) -> Result<()> {
        self.read_inner(file_sel, mem_space, mem_sel, buf, Some(conv))
    }

    /// Write `mem_sel` of `buf` into `file_sel` of the dataset
    pub fn write(
        &mut self,
        file_sel: &Selection,
        mem_space: &Dataspace,
        mem_sel: &Selection,
        buf: &[u8],
    ) -> Result<()> {
        self.write_inner(file_sel, mem_space, mem_sel, buf, None)
    }

    /// Like [`write`](Self::write), converting each element from the memory
    /// type (`conv.src_size()`) to the stored type (`conv.dst_size()`)
    pub fn write_converted(
        &mut self,
        file_sel: &Selection,
        mem_space: &Dataspace,
        mem_sel: &Selection,
        buf: &[u8],
        conv: &dyn TypeConversion,
    ) -> Result<()> {
        self.write_inner(file_sel, mem_space, mem_sel, buf, Some(conv))
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    fn read_inner(
        &mut self,
        file_sel: &Selection,
        mem_space: &Dataspace,
        mem_sel: &Selection,
        buf: &mut [u8],
        conv: Option<&dyn TypeConversion>,
    ) -> Result<()> {
        let elem = self.layout.elem_size();
        let mem_elem = match conv {
            Some(c) => {
                check_conversion(c.src_size(), elem, "source")?;
                c.dst_size()
            }
            None => elem,
        };
        check_buffer(mem_space, mem_elem, buf.len())?;
        let units = chunk_map::build(&self.layout, &self.space, file_sel, mem_space, mem_sel)?;
        let chunk_space = self.layout.chunk_space();

        for unit in &units {
            let record = self.index.get(&self.file, &unit.coord)?;
            let cached = self.cached(&unit.coord, &unit.scaled).is_some();
            if !record.is_allocated() && !cached && !self.fill.reads_as_fill() {
                continue;
            }

            let file_side = Elements {
                sel: &unit.file_sel,
                space: &chunk_space,
                elem,
            };
            let mem_side = Elements {
                sel: &unit.mem_sel,
                space: mem_space,
                elem: mem_elem,
            };

            if cached || self.is_cacheable(&record, false) {
                let locked = self.lock_chunk(&unit.coord, &unit.scaled, &record, false)?;
                let result = self
                    .locked_buf(&locked)
                    .and_then(|chunk| transfer(chunk, file_side, buf, mem_side, unit.nelmts, conv));
                // Unlock even when the copy failed
                self.unlock_chunk(locked, false, unit.nelmts as usize * elem, false)?;
                result?;
            } else if let Some(addr) = record.addr {
                let packed = self.read_runs(addr, unit, &chunk_space)?;
                let packed_space = Dataspace::simple(&[unit.nelmts]);
                let packed_side = Elements {
                    sel: &Selection::All,
                    space: &packed_space,
                    elem,
                };
                transfer(&packed, packed_side, buf, mem_side, unit.nelmts, conv)?;
            } else {
                let mut pattern = self.fill.pattern(elem);
                if let Some(conv) = conv {
                    pattern = convert_one(conv, pattern)?;
                }
                fill_runs(buf, unit.mem_sel.runs(mem_space), &pattern)?;
            }
        }

        tracing::trace!("Read {} chunk units", units.len());
        Ok(())
    }

    /// Positional reads of the selected runs of an unfiltered chunk, packed
    fn read_runs(&self, addr: u64, unit: &ChunkUnit, chunk_space: &Dataspace) -> Result<Vec<u8>> {
        let elem = self.layout.elem_size();
        let mut packed = vec![0u8; unit.nelmts as usize * elem];
        let mut pos = 0usize;
        for (off, len) in unit.file_sel.runs(chunk_space) {
            let nbytes = len as usize * elem;
            let Some(dst) = packed.get_mut(pos..pos + nbytes) else {
                return Err(ChunkError::Selection(format!(
                    "chunk {} selection holds more than {} elements",
                    unit.coord, unit.nelmts
                )));
            };
            self.file.read_at(addr + off * elem as u64, dst)?;
            pos += nbytes;
        }
        Ok(packed)
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    fn write_inner(
        &mut self,
        file_sel: &Selection,
        mem_space: &Dataspace,
        mem_sel: &Selection,
        buf: &[u8],
        conv: Option<&dyn TypeConversion>,
    ) -> Result<()> {
        self.check_writable()?;
        let elem = self.layout.elem_size();
        let mem_elem = match conv {
            Some(c) => {
                check_conversion(c.dst_size(), elem, "destination")?;
                c.src_size()
            }
            None => elem,
        };
        check_buffer(mem_space, mem_elem, buf.len())?;
        let units = chunk_map::build(&self.layout, &self.space, file_sel, mem_space, mem_sel)?;
        let chunk_space = self.layout.chunk_space();
        let chunk_bytes = self.layout.chunk_bytes();

        for unit in &units {
            let record = self.index.get(&self.file, &unit.coord)?;
            let cached = self.cached(&unit.coord, &unit.scaled).is_some();
            let nelmts = unit.nelmts as usize;

            let mem_side = Elements {
                sel: &unit.mem_sel,
                space: mem_space,
                elem: mem_elem,
            };
            let file_side = Elements {
                sel: &unit.file_sel,
                space: &chunk_space,
                elem,
            };

            if cached || self.is_cacheable(&record, true) {
                let whole = !unit.file_sel.is_points()
                    && nelmts * elem == chunk_bytes
                    && nelmts * mem_elem == chunk_bytes;
                let mut locked = self.lock_chunk(&unit.coord, &unit.scaled, &record, whole)?;
                let result = self
                    .locked_buf_mut(&mut locked)
                    .and_then(|chunk| transfer(buf, mem_side, chunk, file_side, unit.nelmts, conv));
                self.unlock_chunk(locked, result.is_ok(), nelmts * elem, true)?;
                result?;
            } else {
                let record = if record.is_allocated() {
                    record
                } else {
                    let record = self
                        .index
                        .insert_or_resize(&self.file, &unit.coord, chunk_bytes as u64, 0)?;
                    // Elements outside the selection must read back as fill
                    if nelmts * elem < chunk_bytes && self.fill.reads_as_fill() {
                        if let Some(addr) = record.addr {
                            let image = self.fill.buffer(elem, self.layout.chunk_nelmts());
                            self.file.write_at(addr, &image)?;
                        }
                    }
                    record
                };
                self.write_runs(&record, unit, &chunk_space, buf, mem_side, conv)?;
            }
        }

        tracing::trace!("Wrote {} chunk units", units.len());
        self.sync_header()
    }

    /// Pack the memory side and write it run by run into an unfiltered chunk
    fn write_runs(
        &self,
        record: &ChunkRecord,
        unit: &ChunkUnit,
        chunk_space: &Dataspace,
        buf: &[u8],
        mem_side: Elements<'_>,
        conv: Option<&dyn TypeConversion>,
    ) -> Result<()> {
        let Some(addr) = record.addr else {
            return Err(ChunkError::ChunkNotAllocated);
        };
        let elem = self.layout.elem_size();
        let mut packed = vec![0u8; unit.nelmts as usize * elem];
        let packed_space = Dataspace::simple(&[unit.nelmts]);
        let packed_side = Elements {
            sel: &Selection::All,
            space: &packed_space,
            elem,
        };
        transfer(buf, mem_side, &mut packed, packed_side, unit.nelmts, conv)?;

        let mut pos = 0usize;
        for (off, len) in unit.file_sel.runs(chunk_space) {
            let nbytes = len as usize * elem;
            let Some(src) = packed.get(pos..pos + nbytes) else {
                return Err(ChunkError::Selection(format!(
                    "chunk {} selection holds more than {} elements",
                    unit.coord, unit.nelmts
                )));
            };
            self.file.write_at(addr + off * elem as u64, src)?;
            pos += nbytes;
        }
        Ok(())
    }
}

// =============================================================================
// Element Transfer
// =============================================================================

/// Move `nelmts` elements from one buffer to another, converting if asked
fn transfer(
    src: &[u8],
    from: Elements<'_>,
    dst: &mut [u8],
    to: Elements<'_>,
    nelmts: u64,
    conv: Option<&dyn TypeConversion>,
) -> Result<()> {
    let Some(conv) = conv else {
        debug_assert_eq!(from.elem, to.elem);
        let copied = copy_runs(
            src,
            from.sel.runs(from.space),
            dst,
            to.sel.runs(to.space),
            from.elem,
        )?;
        debug_assert_eq!(copied, nelmts);
        return Ok(());
    };

    // Stage: gather, convert in place, scatter
    let n = nelmts as usize;
    let width = conv.src_size().max(conv.dst_size());
    let mut stage = Vec::with_capacity(n * width);
    gather(src, from.sel.runs(from.space), from.elem, &mut stage)?;
    stage.resize(n * width, 0);

    let mut background = if conv.needs_background() {
        let mut bg = Vec::with_capacity(n * to.elem);
        gather(dst, to.sel.runs(to.space), to.elem, &mut bg)?;
        Some(bg)
    } else {
        None
    };
    conv.convert(n, &mut stage, background.as_deref_mut())?;
    stage.truncate(n * to.elem);
    scatter(&stage, to.sel.runs(to.space), to.elem, dst)
}

/// Convert a single element (fill values)
pub(crate) fn convert_one(conv: &dyn TypeConversion, value: Vec<u8>) -> Result<Vec<u8>> {
    let mut stage = value;
    stage.resize(conv.src_size().max(conv.dst_size()), 0);
    let mut background = conv.needs_background().then(|| vec![0u8; conv.dst_size()]);
    conv.convert(1, &mut stage, background.as_deref_mut())?;
    stage.truncate(conv.dst_size());
    Ok(stage)
}

fn check_conversion(size: usize, elem: usize, side: &str) -> Result<()> {
    if size != elem {
        return Err(ChunkError::Conversion(format!(
            "conversion {side} size {size} does not match element size {elem}"
        )));
    }
    Ok(())
}

fn check_buffer(space: &Dataspace, elem: usize, len: usize) -> Result<()> {
    let needed = space.npoints() * elem as u64;
    if (len as u64) < needed {
        return Err(ChunkError::Selection(format!(
            "buffer holds {len} bytes, memory dataspace needs {needed}"
        )));
    }
    Ok(())
}
