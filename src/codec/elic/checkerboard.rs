//! Checkerboard spatial partition
//!
//! Every slice is coded in two passes over a fixed parity pattern:
//!
//! ```text
//!   A N A N        A = anchor      (even row, even col) or (odd row, odd col)
//!   N A N A        N = non-anchor  the complement
//!   A N A N
//! ```
//!
//! Besides the zero-filled split/merge pair, one parity class can be packed
//! into a dense grid of half the width. Row `r` of a packed anchor grid holds
//! the anchor columns of row `r` of the full grid, in order:
//!
//! ```text
//!   packed[.., 0::2, :] = grid[.., 0::2, 0::2]      (anchor)
//!   packed[.., 1::2, :] = grid[.., 1::2, 1::2]
//!   packed[.., 0::2, :] = grid[.., 0::2, 1::2]      (non-anchor)
//!   packed[.., 1::2, :] = grid[.., 1::2, 0::2]
//! ```
//!
//! Packing requires an even width.

use ndarray::{s, Array2, Array4, ArrayView4};
use std::fmt;

use super::error::ElicError;

/// One of the two checkerboard classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    /// Coded first, without spatial context
    Anchor,
    /// Coded second, conditioned on the decoded anchors
    NonAnchor,
}

impl Parity {
    /// Both classes in coding order
    pub const ORDER: [Parity; 2] = [Parity::Anchor, Parity::NonAnchor];

    /// Whether position `(row, col)` belongs to this class
    #[inline]
    pub fn contains(&self, row: usize, col: usize) -> bool {
        let anchor = (row + col) % 2 == 0;
        match self {
            Parity::Anchor => anchor,
            Parity::NonAnchor => !anchor,
        }
    }

    /// First column of this class in a row of the given parity
    #[inline]
    pub fn column_offset(&self, row_parity: usize) -> usize {
        match self {
            Parity::Anchor => row_parity,
            Parity::NonAnchor => 1 - row_parity,
        }
    }

    /// The other class
    pub fn complement(&self) -> Parity {
        match self {
            Parity::Anchor => Parity::NonAnchor,
            Parity::NonAnchor => Parity::Anchor,
        }
    }

    /// Name used in logs and profiler stages
    pub fn name(&self) -> &'static str {
        match self {
            Parity::Anchor => "anchor",
            Parity::NonAnchor => "non_anchor",
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Keep only the positions of `parity`, zeroing the rest
pub fn mask(grid: &ArrayView4<f32>, parity: Parity) -> Array4<f32> {
    let mut out = grid.to_owned();
    out.indexed_iter_mut().for_each(|((_, _, row, col), v)| {
        if !parity.contains(row, col) {
            *v = 0.0;
        }
    });
    out
}

/// Split a grid into its zero-filled anchor and non-anchor parts
pub fn split(grid: &ArrayView4<f32>) -> (Array4<f32>, Array4<f32>) {
    (mask(grid, Parity::Anchor), mask(grid, Parity::NonAnchor))
}

/// Merge two disjoint-support grids by addition
pub fn merge(anchor: &ArrayView4<f32>, non_anchor: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
    if anchor.shape() != non_anchor.shape() {
        return Err(ElicError::shape_mismatch(
            "checkerboard merge",
            anchor.shape(),
            non_anchor.shape(),
        ));
    }
    Ok(anchor + non_anchor)
}

/// Compact one parity class into a half-width grid
pub fn pack(grid: &ArrayView4<f32>, parity: Parity) -> Result<Array4<f32>, ElicError> {
    let (b, c, h, w) = grid.dim();
    if w % 2 != 0 {
        return Err(ElicError::shape_mismatch(
            "checkerboard pack (width must be even)",
            &[b, c, h, w + 1],
            &[b, c, h, w],
        ));
    }

    let mut packed = Array4::<f32>::zeros((b, c, h, w / 2));
    for row_parity in 0..2 {
        let col = parity.column_offset(row_parity);
        packed
            .slice_mut(s![.., .., row_parity..;2, ..])
            .assign(&grid.slice(s![.., .., row_parity..;2, col..;2]));
    }
    Ok(packed)
}

/// Expand a half-width grid back to full width, zero at the other class
pub fn unpack(
    packed: &ArrayView4<f32>,
    parity: Parity,
    width: usize,
) -> Result<Array4<f32>, ElicError> {
    let (b, c, h, half) = packed.dim();
    if width != 2 * half {
        return Err(ElicError::shape_mismatch(
            "checkerboard unpack",
            &[b, c, h, width / 2],
            &[b, c, h, half],
        ));
    }

    let mut grid = Array4::<f32>::zeros((b, c, h, width));
    for row_parity in 0..2 {
        let col = parity.column_offset(row_parity);
        grid.slice_mut(s![.., .., row_parity..;2, col..;2])
            .assign(&packed.slice(s![.., .., row_parity..;2, ..]));
    }
    Ok(grid)
}

/// Kernel mask of the checkerboard context predictor
///
/// A kernel centred on a non-anchor position only sees anchor neighbours, so
/// the mask is 1 where `(i + j)` is odd.
pub fn kernel_mask(kernel: usize) -> Array2<f32> {
    Array2::from_shape_fn((kernel, kernel), |(i, j)| ((i + j) % 2) as f32)
}
