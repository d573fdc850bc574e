//! Run iteration and run-driven copies
//!
//! A run is `(element offset, element count)` in a row-major buffer.
//! Consecutive runs that touch are merged, so a full-row hyperslab over a
//! whole buffer comes out as one run.

use crate::error::{ChunkError, Result};

use super::{Dataspace, Selection, Span};

/// Iterator over merged row-major runs of a selection
pub struct Runs<'a> {
    source: RunSource<'a>,
    pending: Option<(u64, u64)>,
}

enum RunSource<'a> {
    Empty,
    Single(Option<(u64, u64)>),
    Slab(SlabRuns<'a>),
    Points {
        points: &'a [Vec<u64>],
        strides: Vec<u64>,
        pos: usize,
    },
}

/// Odometer over the outer dimensions, emitting one run per span of the
/// fastest dimension
struct SlabRuns<'a> {
    spans: &'a [Vec<Span>],
    strides: Vec<u64>,
    /// Current span per outer dimension
    span_idx: Vec<usize>,
    /// Offset inside that span per outer dimension
    pos: Vec<u64>,
    /// Next span of the fastest dimension
    last_idx: usize,
    /// Element offset contributed by the outer dimensions
    base: u64,
    done: bool,
}

impl<'a> SlabRuns<'a> {
    fn new(spans: &'a [Vec<Span>], strides: Vec<u64>) -> Self {
        let outer = spans.len() - 1;
        let mut runs = Self {
            spans,
            strides,
            span_idx: vec![0; outer],
            pos: vec![0; outer],
            last_idx: 0,
            base: 0,
            done: spans.iter().any(|d| d.is_empty()),
        };
        runs.recompute_base();
        runs
    }

    fn recompute_base(&mut self) {
        self.base = (0..self.span_idx.len())
            .map(|d| (self.spans[d][self.span_idx[d]].start + self.pos[d]) * self.strides[d])
            .sum();
    }

    fn advance_outer(&mut self) {
        let mut d = self.span_idx.len();
        loop {
            if d == 0 {
                self.done = true;
                return;
            }
            d -= 1;
            self.pos[d] += 1;
            if self.pos[d] < self.spans[d][self.span_idx[d]].len {
                break;
            }
            self.pos[d] = 0;
            self.span_idx[d] += 1;
            if self.span_idx[d] < self.spans[d].len() {
                break;
            }
            self.span_idx[d] = 0;
        }
        self.recompute_base();
    }

    fn next_run(&mut self) -> Option<(u64, u64)> {
        if self.done {
            return None;
        }
        let last = &self.spans[self.spans.len() - 1];
        let span = last[self.last_idx];
        let run = (self.base + span.start, span.len);

        self.last_idx += 1;
        if self.last_idx == last.len() {
            self.last_idx = 0;
            self.advance_outer();
        }
        Some(run)
    }
}

impl<'a> Runs<'a> {
    pub(crate) fn new(selection: &'a Selection, space: &Dataspace) -> Self {
        let source = match selection {
            Selection::None => RunSource::Empty,
            Selection::All => {
                let n = space.npoints();
                RunSource::Single((n > 0).then_some((0, n)))
            }
            Selection::Hyperslab(spans) if spans.is_empty() => RunSource::Empty,
            Selection::Hyperslab(spans) => RunSource::Slab(SlabRuns::new(spans, space.strides())),
            Selection::Points(points) => RunSource::Points {
                points,
                strides: space.strides(),
                pos: 0,
            },
        };
        Self {
            source,
            pending: None,
        }
    }

    fn next_raw(&mut self) -> Option<(u64, u64)> {
        match &mut self.source {
            RunSource::Empty => None,
            RunSource::Single(run) => run.take(),
            RunSource::Slab(slab) => slab.next_run(),
            RunSource::Points {
                points,
                strides,
                pos,
            } => {
                let p = points.get(*pos)?;
                *pos += 1;
                let off = p.iter().zip(strides.iter()).map(|(&c, &s)| c * s).sum();
                Some((off, 1))
            }
        }
    }
}

impl Iterator for Runs<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match (self.next_raw(), self.pending) {
                (Some((off, len)), Some((p_off, p_len))) if p_off + p_len == off => {
                    self.pending = Some((p_off, p_len + len));
                }
                (Some(run), Some(prev)) => {
                    self.pending = Some(run);
                    return Some(prev);
                }
                (Some(run), None) => self.pending = Some(run),
                (None, _) => return self.pending.take(),
            }
        }
    }
}

// =============================================================================
// Run-driven copies
// =============================================================================

fn byte_range(run_off: u64, n: u64, elem: usize, len: usize) -> Result<std::ops::Range<usize>> {
    let start = run_off as usize * elem;
    let end = start + n as usize * elem;
    if end > len {
        return Err(ChunkError::Selection(format!(
            "selection reaches byte {end} of a {len}-byte buffer"
        )));
    }
    Ok(start..end)
}

/// Copy elements from `src` runs to `dst` runs pairwise; returns elements copied
pub(crate) fn copy_runs(
    src: &[u8],
    src_runs: impl IntoIterator<Item = (u64, u64)>,
    dst: &mut [u8],
    dst_runs: impl IntoIterator<Item = (u64, u64)>,
    elem: usize,
) -> Result<u64> {
    let mut src_it = src_runs.into_iter();
    let mut dst_it = dst_runs.into_iter();
    let mut s = None;
    let mut d = None;
    let mut copied = 0u64;

    loop {
        if s.is_none() {
            s = src_it.next();
        }
        if d.is_none() {
            d = dst_it.next();
        }
        let (Some((s_off, s_len)), Some((d_off, d_len))) = (s, d) else {
            break;
        };
        let n = s_len.min(d_len);
        let from = byte_range(s_off, n, elem, src.len())?;
        let to = byte_range(d_off, n, elem, dst.len())?;
        dst[to].copy_from_slice(&src[from]);
        copied += n;

        s = (s_len > n).then_some((s_off + n, s_len - n));
        d = (d_len > n).then_some((d_off + n, d_len - n));
    }
    Ok(copied)
}

/// Append the elements under `runs` to `out`, packed
pub(crate) fn gather(
    src: &[u8],
    runs: impl IntoIterator<Item = (u64, u64)>,
    elem: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    for (off, len) in runs {
        let range = byte_range(off, len, elem, src.len())?;
        out.extend_from_slice(&src[range]);
    }
    Ok(())
}

/// Spread packed elements over `runs` in `dst`
pub(crate) fn scatter(
    packed: &[u8],
    runs: impl IntoIterator<Item = (u64, u64)>,
    elem: usize,
    dst: &mut [u8],
) -> Result<()> {
    let mut consumed = 0usize;
    for (off, len) in runs {
        let range = byte_range(off, len, elem, dst.len())?;
        let n = range.len();
        if consumed + n > packed.len() {
            return Err(ChunkError::Selection(
                "destination selection is larger than the packed data".into(),
            ));
        }
        dst[range].copy_from_slice(&packed[consumed..consumed + n]);
        consumed += n;
    }
    Ok(())
}

/// Write `pattern` (one element) into every element under `runs`
pub(crate) fn fill_runs(
    dst: &mut [u8],
    runs: impl IntoIterator<Item = (u64, u64)>,
    pattern: &[u8],
) -> Result<()> {
    let elem = pattern.len();
    for (off, len) in runs {
        let range = byte_range(off, len, elem, dst.len())?;
        for slot in dst[range].chunks_exact_mut(elem) {
            slot.copy_from_slice(pattern);
        }
    }
    Ok(())
}
