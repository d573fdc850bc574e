//! Dataspaces and Selections
//!
//! A [`Dataspace`] is the shape of a dataset or of a caller's buffer. A
//! [`Selection`] picks a subset of its elements. Everything downstream
//! consumes selections as row-major *runs*: `(linear element offset, length)`
//! pairs that are contiguous in the underlying buffer.
//!
//! ## Hyperslab representation
//! ```text
//! start=(1,0) stride=(4,3) count=(2,2) block=(2,2)
//!
//!   dim 0 spans: [1,3) [5,7)
//!   dim 1 spans: [0,2) [3,5)
//!
//!   selection = product of the per-dimension span lists
//! ```
//! Adjacent blocks (stride == block) collapse into a single span.

mod runs;

use serde::{Deserialize, Serialize};

use crate::error::{ChunkError, Result};

pub use runs::Runs;
pub(crate) use runs::{copy_runs, fill_runs, gather, scatter};

// =============================================================================
// Dataspace
// =============================================================================

/// Shape of an array: current extent plus per-dimension maximum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataspace {
    dims: Vec<u64>,
    /// `None` = unlimited
    max_dims: Vec<Option<u64>>,
}

impl Dataspace {
    /// Fixed-size dataspace (max == current)
    pub fn simple(dims: &[u64]) -> Self {
        Self {
            dims: dims.to_vec(),
            max_dims: dims.iter().map(|&d| Some(d)).collect(),
        }
    }

    /// Extendible dataspace
    pub fn new(dims: &[u64], max_dims: &[Option<u64>]) -> Result<Self> {
        if dims.len() != max_dims.len() {
            return Err(ChunkError::Selection(format!(
                "dims has rank {}, max dims has rank {}",
                dims.len(),
                max_dims.len()
            )));
        }
        let space = Self {
            dims: dims.to_vec(),
            max_dims: max_dims.to_vec(),
        };
        space.check_within_max(dims)?;
        Ok(space)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    pub fn max_dims(&self) -> &[Option<u64>] {
        &self.max_dims
    }

    pub fn npoints(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Change the current extent within the max extent
    pub(crate) fn set_dims(&mut self, dims: &[u64]) -> Result<()> {
        if dims.len() != self.rank() {
            return Err(ChunkError::Selection(format!(
                "new extent has rank {}, dataspace rank is {}",
                dims.len(),
                self.rank()
            )));
        }
        self.check_within_max(dims)?;
        self.dims = dims.to_vec();
        Ok(())
    }

    fn check_within_max(&self, dims: &[u64]) -> Result<()> {
        for (d, (&cur, max)) in dims.iter().zip(&self.max_dims).enumerate() {
            if let Some(max) = max {
                if cur > *max {
                    return Err(ChunkError::Selection(format!(
                        "dimension {d} extent {cur} exceeds maximum {max}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Row-major element strides
    pub(crate) fn strides(&self) -> Vec<u64> {
        let mut strides = vec![1u64; self.rank()];
        for d in (0..self.rank().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.dims[d + 1];
        }
        strides
    }

    pub(crate) fn point_of(&self, mut offset: u64) -> Vec<u64> {
        self.strides()
            .into_iter()
            .map(|s| {
                let p = offset / s;
                offset %= s;
                p
            })
            .collect()
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Half-open `[start, start + len)` range along one dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub len: u64,
}

impl Span {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    None,
    All,
    /// Per-dimension sorted, disjoint span lists; the selection is their product
    Hyperslab(Vec<Vec<Span>>),
    /// Explicit element coordinates, transferred in list order
    Points(Vec<Vec<u64>>),
}

impl Selection {
    /// Regular hyperslab; `stride` and `block` default to all ones
    pub fn hyperslab(
        start: &[u64],
        stride: Option<&[u64]>,
        count: &[u64],
        block: Option<&[u64]>,
    ) -> Result<Self> {
        let rank = start.len();
        let ones = vec![1u64; rank];
        let stride = stride.unwrap_or(ones.as_slice());
        let block = block.unwrap_or(ones.as_slice());
        if count.len() != rank || stride.len() != rank || block.len() != rank {
            return Err(ChunkError::Selection(
                "hyperslab start, stride, count and block must have equal rank".into(),
            ));
        }
        if count.iter().chain(block).any(|&n| n == 0) {
            return Ok(Selection::None);
        }

        let mut spans = Vec::with_capacity(rank);
        for d in 0..rank {
            if count[d] > 1 && stride[d] < block[d] {
                return Err(ChunkError::Selection(format!(
                    "dimension {d}: stride {} is smaller than block {}",
                    stride[d], block[d]
                )));
            }
            let mut dim_spans: Vec<Span> = Vec::new();
            for i in 0..count[d] {
                let s = start[d] + i * stride[d];
                match dim_spans.last_mut() {
                    Some(prev) if prev.end() == s => prev.len += block[d],
                    _ => dim_spans.push(Span { start: s, len: block[d] }),
                }
            }
            spans.push(dim_spans);
        }
        Ok(Selection::Hyperslab(spans))
    }

    /// Contiguous box `[start, start + count)`
    pub fn block(start: &[u64], count: &[u64]) -> Result<Self> {
        Self::hyperslab(start, None, count, None)
    }

    /// Point list; all points must share one rank
    pub fn points(points: Vec<Vec<u64>>) -> Result<Self> {
        let Some(first) = points.first() else {
            return Ok(Selection::None);
        };
        let rank = first.len();
        if points.iter().any(|p| p.len() != rank) {
            return Err(ChunkError::Selection("points have mixed ranks".into()));
        }
        Ok(Selection::Points(points))
    }

    pub fn is_points(&self) -> bool {
        matches!(self, Selection::Points(_))
    }

    /// Number of selected elements
    pub fn npoints(&self, space: &Dataspace) -> u64 {
        match self {
            Selection::None => 0,
            Selection::All => space.npoints(),
            Selection::Hyperslab(spans) => spans
                .iter()
                .map(|dim| dim.iter().map(|s| s.len).sum::<u64>())
                .product(),
            Selection::Points(points) => points.len() as u64,
        }
    }

    /// Rank and bounds check against a dataspace
    pub fn validate(&self, space: &Dataspace) -> Result<()> {
        let dims = space.dims();
        match self {
            Selection::None | Selection::All => Ok(()),
            Selection::Hyperslab(spans) => {
                if spans.len() != space.rank() {
                    return Err(rank_mismatch(spans.len(), space.rank()));
                }
                for (d, dim) in spans.iter().enumerate() {
                    if let Some(last) = dim.last() {
                        if last.end() > dims[d] {
                            return Err(ChunkError::Selection(format!(
                                "dimension {d}: selection ends at {}, extent is {}",
                                last.end(),
                                dims[d]
                            )));
                        }
                    }
                }
                Ok(())
            }
            Selection::Points(points) => {
                for p in points {
                    if p.len() != space.rank() {
                        return Err(rank_mismatch(p.len(), space.rank()));
                    }
                    if p.iter().zip(dims).any(|(&c, &d)| c >= d) {
                        return Err(ChunkError::Selection(format!(
                            "point {p:?} is outside extent {dims:?}"
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Bounding box as `(low, high)` with exclusive high; `None` if empty
    pub fn bounds(&self, space: &Dataspace) -> Option<(Vec<u64>, Vec<u64>)> {
        if self.npoints(space) == 0 {
            return None;
        }
        match self {
            Selection::None => None,
            Selection::All => Some((vec![0; space.rank()], space.dims().to_vec())),
            Selection::Hyperslab(spans) => Some((
                spans.iter().map(|d| d[0].start).collect(),
                spans.iter().filter_map(|d| d.last().map(Span::end)).collect(),
            )),
            Selection::Points(points) => {
                let rank = points[0].len();
                let mut lo = vec![u64::MAX; rank];
                let mut hi = vec![0u64; rank];
                for p in points {
                    for d in 0..rank {
                        lo[d] = lo[d].min(p[d]);
                        hi[d] = hi[d].max(p[d] + 1);
                    }
                }
                Some((lo, hi))
            }
        }
    }

    /// `(start, count)` if the selection is one contiguous box
    pub fn single_block(&self, space: &Dataspace) -> Option<(Vec<u64>, Vec<u64>)> {
        match self {
            Selection::All if space.npoints() > 0 => {
                Some((vec![0; space.rank()], space.dims().to_vec()))
            }
            Selection::Hyperslab(spans) if spans.iter().all(|d| d.len() == 1) => Some((
                spans.iter().map(|d| d[0].start).collect(),
                spans.iter().map(|d| d[0].len).collect(),
            )),
            _ => None,
        }
    }

    /// Intersect with the box `[lo, hi)` and rebase onto `lo`
    pub fn clip(&self, space: &Dataspace, lo: &[u64], hi: &[u64]) -> Selection {
        let clipped = match self {
            Selection::None => return Selection::None,
            Selection::All => (0..space.rank())
                .map(|d| {
                    let whole = Span {
                        start: 0,
                        len: space.dims()[d],
                    };
                    clip_spans(std::slice::from_ref(&whole), lo[d], hi[d])
                })
                .collect::<Vec<_>>(),
            Selection::Hyperslab(spans) => spans
                .iter()
                .enumerate()
                .map(|(d, dim)| clip_spans(dim, lo[d], hi[d]))
                .collect(),
            Selection::Points(points) => {
                let inside: Vec<Vec<u64>> = points
                    .iter()
                    .filter(|p| p.iter().enumerate().all(|(d, &c)| c >= lo[d] && c < hi[d]))
                    .map(|p| p.iter().zip(lo).map(|(&c, &l)| c - l).collect())
                    .collect();
                return if inside.is_empty() {
                    Selection::None
                } else {
                    Selection::Points(inside)
                };
            }
        };

        if clipped.iter().any(|d| d.is_empty()) {
            Selection::None
        } else {
            Selection::Hyperslab(clipped)
        }
    }

    /// Row-major contiguous runs over `space`
    pub fn runs<'a>(&'a self, space: &Dataspace) -> Runs<'a> {
        Runs::new(self, space)
    }
}

/// Intersect spans with `[lo, hi)`, rebased onto `lo`
fn clip_spans(spans: &[Span], lo: u64, hi: u64) -> Vec<Span> {
    spans
        .iter()
        .filter_map(|s| {
            let start = s.start.max(lo);
            let end = s.end().min(hi);
            (start < end).then(|| Span {
                start: start - lo,
                len: end - start,
            })
        })
        .collect()
}

fn rank_mismatch(sel: usize, space: usize) -> ChunkError {
    ChunkError::Selection(format!(
        "selection rank {sel} does not match dataspace rank {space}"
    ))
}
