//! Selection to chunk mapping
//!
//! Splits a (file selection, memory selection) pair into per-chunk units.
//! Each unit carries the file side in chunk-local coordinates and the
//! matching memory side, with elements paired in order.
//!
//! ```text
//! file selection                chunk grid (4x4)
//! ┌─────────────────┐           ┌────┬────┬────┐
//! │   ┌──────────┐  │           │ u0 │ u1 │    │
//! │   │ selected │  │    ──►    ├────┼────┼────┤
//! │   └──────────┘  │           │ u2 │ u3 │    │
//! └─────────────────┘           └────┴────┴────┘
//! ```
//!
//! Three strategies:
//! - one element: a single point unit, no walking
//! - both sides one box of the same shape (ignoring unit dimensions): the
//!   memory box of each unit is the file box shifted by a constant delta
//! - anything else: the file side is partitioned by chunk and the memory
//!   side is walked element by element in lockstep

use std::collections::HashMap;

use crate::error::{ChunkError, Result};
use crate::layout::{ChunkCoord, ChunkLayout};
use crate::selection::{Dataspace, Selection};

/// Work for one chunk
#[derive(Debug, Clone)]
pub(crate) struct ChunkUnit {
    pub coord: ChunkCoord,
    pub scaled: Vec<u64>,
    /// Selected elements, relative to the chunk origin
    pub file_sel: Selection,
    /// Matching elements of the caller's buffer
    pub mem_sel: Selection,
    pub nelmts: u64,
}

pub(crate) fn build(
    layout: &ChunkLayout,
    file_space: &Dataspace,
    file_sel: &Selection,
    mem_space: &Dataspace,
    mem_sel: &Selection,
) -> Result<Vec<ChunkUnit>> {
    if file_space.rank() != layout.rank() {
        return Err(ChunkError::Selection(format!(
            "file dataspace rank {} does not match dataset rank {}",
            file_space.rank(),
            layout.rank()
        )));
    }
    file_sel.validate(file_space)?;
    mem_sel.validate(mem_space)?;

    let nfile = file_sel.npoints(file_space);
    let nmem = mem_sel.npoints(mem_space);
    if nfile != nmem {
        return Err(ChunkError::Selection(format!(
            "file selection has {nfile} elements, memory selection has {nmem}"
        )));
    }

    match nfile {
        0 => Ok(Vec::new()),
        1 => Ok(vec![single_point(layout, file_space, file_sel, mem_space, mem_sel)]),
        _ => {
            if let Some(units) = matching_blocks(layout, file_space, file_sel, mem_space, mem_sel)? {
                return Ok(units);
            }
            lockstep(layout, file_space, file_sel, mem_space, mem_sel)
        }
    }
}

// =============================================================================
// Strategies
// =============================================================================

fn single_point(
    layout: &ChunkLayout,
    file_space: &Dataspace,
    file_sel: &Selection,
    mem_space: &Dataspace,
    mem_sel: &Selection,
) -> ChunkUnit {
    let first = |sel: &Selection, space: &Dataspace| {
        let off = sel.runs(space).next().map_or(0, |(o, _)| o);
        space.point_of(off)
    };
    let fp = first(file_sel, file_space);
    let mp = first(mem_sel, mem_space);

    let scaled = layout.scaled_of_element(&fp);
    let coord = layout.coord_from_scaled(&scaled);
    let local = local_point(&fp, &coord);
    ChunkUnit {
        coord,
        scaled,
        file_sel: Selection::Points(vec![local]),
        mem_sel: Selection::Points(vec![mp]),
        nelmts: 1,
    }
}

/// Constant-delta mapping when both sides are one box of equivalent shape
fn matching_blocks(
    layout: &ChunkLayout,
    file_space: &Dataspace,
    file_sel: &Selection,
    mem_space: &Dataspace,
    mem_sel: &Selection,
) -> Result<Option<Vec<ChunkUnit>>> {
    let (Some((fstart, fcount)), Some((mstart, mcount))) =
        (file_sel.single_block(file_space), mem_sel.single_block(mem_space))
    else {
        return Ok(None);
    };

    let fdims: Vec<usize> = (0..fcount.len()).filter(|&d| fcount[d] != 1).collect();
    let mdims: Vec<usize> = (0..mcount.len()).filter(|&d| mcount[d] != 1).collect();
    if fdims.len() != mdims.len()
        || fdims.iter().zip(&mdims).any(|(&f, &m)| fcount[f] != mcount[m])
    {
        return Ok(None);
    }

    let fend: Vec<u64> = fstart.iter().zip(&fcount).map(|(s, c)| s + c).collect();
    let mut units = Vec::new();
    walk_chunks(layout, &fstart, &fend, |scaled| {
        let coord = layout.coord_from_scaled(scaled);
        let chunk_lo = coord.offsets();

        // File box clipped to this chunk
        let mut lo = Vec::with_capacity(fstart.len());
        let mut count = Vec::with_capacity(fstart.len());
        for d in 0..fstart.len() {
            let start = fstart[d].max(chunk_lo[d]);
            let end = fend[d].min(chunk_lo[d] + layout.chunk_dims()[d]);
            lo.push(start);
            count.push(end - start);
        }

        let mut mlo = mstart.clone();
        let mut mcnt = vec![1u64; mcount.len()];
        for (&f, &m) in fdims.iter().zip(&mdims) {
            mlo[m] = mstart[m] + (lo[f] - fstart[f]);
            mcnt[m] = count[f];
        }

        let local: Vec<u64> = lo.iter().zip(chunk_lo).map(|(l, c)| l - c).collect();
        let nelmts = count.iter().product();
        units.push(ChunkUnit {
            file_sel: Selection::block(&local, &count)?,
            mem_sel: Selection::block(&mlo, &mcnt)?,
            coord,
            scaled: scaled.to_vec(),
            nelmts,
        });
        Ok(())
    })?;
    Ok(Some(units))
}

/// General mapping: partition the file side, pair memory elements in order
fn lockstep(
    layout: &ChunkLayout,
    file_space: &Dataspace,
    file_sel: &Selection,
    mem_space: &Dataspace,
    mem_sel: &Selection,
) -> Result<Vec<ChunkUnit>> {
    let mut units: Vec<ChunkUnit> = Vec::new();
    let mut by_chunk: HashMap<Vec<u64>, usize> = HashMap::new();
    let chunk_space = layout.chunk_space();

    // Hyperslab-like file selections are clipped chunk by chunk up front;
    // a chunk's local row-major order is the global order restricted to it
    if !file_sel.is_points() {
        if let Some((lo, hi)) = file_sel.bounds(file_space) {
            walk_chunks(layout, &lo, &hi, |scaled| {
                let coord = layout.coord_from_scaled(scaled);
                let chunk_hi: Vec<u64> = coord
                    .offsets()
                    .iter()
                    .zip(layout.chunk_dims())
                    .map(|(o, c)| o + c)
                    .collect();
                let clipped = file_sel.clip(file_space, coord.offsets(), &chunk_hi);
                let nelmts = clipped.npoints(&chunk_space);
                if nelmts > 0 {
                    by_chunk.insert(scaled.to_vec(), units.len());
                    units.push(ChunkUnit {
                        coord,
                        scaled: scaled.to_vec(),
                        file_sel: clipped,
                        mem_sel: Selection::Points(Vec::new()),
                        nelmts,
                    });
                }
                Ok(())
            })?;
        }
    }

    let mut file_points: Vec<Vec<Vec<u64>>> = vec![Vec::new(); units.len()];
    let mut mem_points: Vec<Vec<Vec<u64>>> = vec![Vec::new(); units.len()];

    let file_elems = file_sel.runs(file_space).flat_map(|(o, n)| o..o + n);
    let mem_elems = mem_sel.runs(mem_space).flat_map(|(o, n)| o..o + n);
    for (foff, moff) in file_elems.zip(mem_elems) {
        let fp = file_space.point_of(foff);
        let scaled = layout.scaled_of_element(&fp);
        let idx = match by_chunk.get(&scaled) {
            Some(&idx) => idx,
            None => {
                // Point selections create units on first appearance
                let idx = units.len();
                units.push(ChunkUnit {
                    coord: layout.coord_from_scaled(&scaled),
                    scaled: scaled.clone(),
                    file_sel: Selection::None,
                    mem_sel: Selection::None,
                    nelmts: 0,
                });
                file_points.push(Vec::new());
                mem_points.push(Vec::new());
                by_chunk.insert(scaled, idx);
                idx
            }
        };
        if file_sel.is_points() {
            file_points[idx].push(local_point(&fp, &units[idx].coord));
        }
        mem_points[idx].push(mem_space.point_of(moff));
    }

    for (idx, unit) in units.iter_mut().enumerate() {
        let mem = std::mem::take(&mut mem_points[idx]);
        debug_assert!(file_sel.is_points() || mem.len() as u64 == unit.nelmts);
        if file_sel.is_points() {
            unit.nelmts = file_points[idx].len() as u64;
            unit.file_sel = Selection::Points(std::mem::take(&mut file_points[idx]));
        }
        unit.mem_sel = Selection::Points(mem);
    }
    Ok(units)
}

// =============================================================================
// Helpers
// =============================================================================

fn local_point(point: &[u64], coord: &ChunkCoord) -> Vec<u64> {
    point.iter().zip(coord.offsets()).map(|(p, o)| p - o).collect()
}

/// Visit every chunk overlapping `[lo, hi)` in row-major order
fn walk_chunks<F>(layout: &ChunkLayout, lo: &[u64], hi: &[u64], mut visit: F) -> Result<()>
where
    F: FnMut(&[u64]) -> Result<()>,
{
    let rank = layout.rank();
    let dims = layout.chunk_dims();
    if (0..rank).any(|d| hi[d] <= lo[d]) {
        return Ok(());
    }
    let first: Vec<u64> = (0..rank).map(|d| lo[d] / dims[d]).collect();
    let last: Vec<u64> = (0..rank).map(|d| (hi[d] - 1) / dims[d]).collect();

    let mut scaled = first.clone();
    loop {
        visit(&scaled)?;

        // Increment with carry, fastest dimension last
        let mut d = rank;
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            scaled[d] += 1;
            if scaled[d] <= last[d] {
                break;
            }
            scaled[d] = first[d];
        }
    }
}
