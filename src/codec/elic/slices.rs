//! Channel slice schedule
//!
//! The latent grid is cut along the channel axis into the slices of a
//! [`GroupTable`]. Slices are coded strictly in order, and slice `i` may read
//! only two earlier reconstructions as cross-slice context:
//!
//! | slice | context sources |
//! |-------|-----------------|
//! | 0     | none (side information only) |
//! | 1     | slice 0 |
//! | i > 1 | slice 0 and slice i-1 |
//!
//! Slices `2..i-2` are never read by slice `i`. Changing this widens the
//! cross-slice transforms and changes the bitstream.
//!
//! The scheduler also knows every channel arity that follows from the table,
//! which the model uses to check its learned functions at construction time.

use ndarray::{concatenate, s, Array4, ArrayView4, Axis};
use std::ops::Range;

use super::config::GroupTable;
use super::error::ElicError;

/// Slice partition and cross-slice dependency rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceScheduler {
    groups: GroupTable,
}

impl SliceScheduler {
    /// Create a scheduler over a validated group table
    pub fn new(groups: GroupTable) -> Self {
        SliceScheduler { groups }
    }

    /// The group table
    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    /// Number of slices (k)
    pub fn num_slices(&self) -> usize {
        self.groups.num_slices()
    }

    /// Total latent channels (M)
    pub fn total_channels(&self) -> usize {
        self.groups.total()
    }

    /// Channel width of slice `index`
    pub fn width(&self, index: usize) -> usize {
        self.groups.width(index)
    }

    /// Channel range of slice `index` inside the latent grid
    pub fn channel_range(&self, index: usize) -> Range<usize> {
        self.groups.channel_range(index)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dependency rule
    // ─────────────────────────────────────────────────────────────────────────

    /// Earlier slices whose reconstructions feed slice `index`
    pub fn context_sources(&self, index: usize) -> Vec<usize> {
        match index {
            0 => Vec::new(),
            1 => vec![0],
            i => vec![0, i - 1],
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Arities
    // ─────────────────────────────────────────────────────────────────────────

    /// Input channels of the cross-slice transform feeding slice `index` (> 0)
    pub fn cc_input_channels(&self, index: usize) -> usize {
        self.context_sources(index)
            .iter()
            .map(|&source| self.width(source))
            .sum()
    }

    /// Output channels of the cross-slice transform feeding slice `index` (> 0)
    pub fn cc_output_channels(&self, index: usize) -> usize {
        2 * self.width(index)
    }

    /// Channels of the spatial context for slice `index`
    pub fn context_channels(&self, index: usize) -> usize {
        2 * self.width(index)
    }

    /// Channels of the support for slice `index`
    pub fn support_channels(&self, index: usize) -> usize {
        let priors = 2 * self.total_channels();
        if index == 0 {
            priors
        } else {
            priors + self.cc_output_channels(index)
        }
    }

    /// Input channels of the parameter aggregation for slice `index`
    pub fn aggregation_input_channels(&self, index: usize) -> usize {
        self.context_channels(index) + self.support_channels(index)
    }

    /// Output channels of the parameter aggregation for slice `index`
    pub fn aggregation_output_channels(&self, index: usize) -> usize {
        2 * self.width(index)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Grid handling
    // ─────────────────────────────────────────────────────────────────────────

    /// Check that a grid carries exactly M channels
    pub fn check_latent(&self, y: &ArrayView4<f32>) -> Result<(), ElicError> {
        let (b, c, h, w) = y.dim();
        if c != self.total_channels() {
            return Err(ElicError::shape_mismatch(
                "latent channels",
                &[b, self.total_channels(), h, w],
                y.shape(),
            ));
        }
        Ok(())
    }

    /// View of slice `index` inside a full latent grid
    pub fn slice<'a>(&self, y: &ArrayView4<'a, f32>, index: usize) -> ArrayView4<'a, f32> {
        let range = self.channel_range(index);
        y.clone().slice_move(s![.., range, .., ..])
    }

    /// Cut a full latent grid into its slices
    pub fn split(&self, y: &ArrayView4<f32>) -> Result<Vec<Array4<f32>>, ElicError> {
        self.check_latent(y)?;
        Ok((0..self.num_slices())
            .map(|i| self.slice(y, i).to_owned())
            .collect())
    }

    /// Concatenate decoded slices back into a latent grid
    pub fn concat(&self, slices: &[Array4<f32>]) -> Result<Array4<f32>, ElicError> {
        if slices.len() != self.num_slices() {
            return Err(ElicError::shape_mismatch(
                "slice count",
                &[self.num_slices()],
                &[slices.len()],
            ));
        }
        for (i, slice) in slices.iter().enumerate() {
            if slice.dim().1 != self.width(i) {
                return Err(ElicError::shape_mismatch(
                    format!("slice {} width", i),
                    &[self.width(i)],
                    &[slice.dim().1],
                ));
            }
        }
        concat_channels(&slices.iter().map(|s| s.view()).collect::<Vec<_>>())
    }

    /// Input of the cross-slice transform for slice `index`
    ///
    /// `decoded` holds the reconstructions of slices `0..index`. Returns
    /// `None` for slice 0, which has no cross-slice context.
    pub fn cross_slice_input(
        &self,
        index: usize,
        decoded: &[Array4<f32>],
    ) -> Result<Option<Array4<f32>>, ElicError> {
        if decoded.len() < index {
            return Err(ElicError::shape_mismatch(
                format!("decoded slices before slice {}", index),
                &[index],
                &[decoded.len()],
            ));
        }

        let sources = self.context_sources(index);
        if sources.is_empty() {
            return Ok(None);
        }
        let views: Vec<_> = sources.iter().map(|&s| decoded[s].view()).collect();
        concat_channels(&views).map(Some)
    }
}

impl Default for SliceScheduler {
    fn default() -> Self {
        SliceScheduler::new(GroupTable::default())
    }
}

/// Concatenate grids along the channel axis
pub fn concat_channels(parts: &[ArrayView4<f32>]) -> Result<Array4<f32>, ElicError> {
    if parts.len() == 1 {
        return Ok(parts[0].to_owned());
    }
    Ok(concatenate(Axis(1), parts)?)
}

/// Split a grid in two halves along the channel axis
pub fn chunk_channels(grid: &ArrayView4<f32>) -> Result<(Array4<f32>, Array4<f32>), ElicError> {
    let c = grid.dim().1;
    if c % 2 != 0 {
        return Err(ElicError::shape_mismatch(
            "channel chunk (count must be even)",
            &[c + 1],
            &[c],
        ));
    }
    let half = c / 2;
    Ok((
        grid.slice(s![.., ..half, .., ..]).to_owned(),
        grid.slice(s![.., half.., .., ..]).to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SliceScheduler {
        SliceScheduler::new(GroupTable::new(vec![0, 2, 2, 4, 8]).unwrap())
    }

    #[test]
    fn test_context_sources() {
        let s = SliceScheduler::default();
        assert!(s.context_sources(0).is_empty());
        assert_eq!(s.context_sources(1), vec![0]);
        assert_eq!(s.context_sources(2), vec![0, 1]);
        assert_eq!(s.context_sources(4), vec![0, 3]);
    }

    #[test]
    fn test_default_arities() {
        let s = SliceScheduler::default();
        // cc transforms: g1 + g_i -> 2 g_{i+1}
        assert_eq!(s.cc_input_channels(1), 16);
        assert_eq!(s.cc_output_channels(1), 32);
        assert_eq!(s.cc_input_channels(2), 32);
        assert_eq!(s.cc_input_channels(3), 48);
        assert_eq!(s.cc_input_channels(4), 80);
        assert_eq!(s.cc_output_channels(4), 384);

        // aggregation: 2M + cc + ctx
        assert_eq!(s.aggregation_input_channels(0), 640 + 32);
        assert_eq!(s.aggregation_input_channels(1), 640 + 32 + 32);
        assert_eq!(s.aggregation_input_channels(4), 640 + 384 + 384);
        assert_eq!(s.aggregation_output_channels(4), 384);
    }

    #[test]
    fn test_split_concat_identity() {
        let s = small();
        let y = Array4::from_shape_fn((1, 16, 2, 2), |(_, c, h, w)| (c * 4 + h * 2 + w) as f32);
        let slices = s.split(&y.view()).unwrap();
        assert_eq!(slices.len(), 4);
        assert_eq!(slices[3].dim(), (1, 8, 2, 2));
        assert_eq!(slices[2][[0, 0, 0, 0]], 16.0);
        assert_eq!(s.concat(&slices).unwrap(), y);
    }

    #[test]
    fn test_split_rejects_wrong_channels() {
        let s = small();
        let y = Array4::<f32>::zeros((1, 15, 2, 2));
        assert!(s.split(&y.view()).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_cross_slice_input_is_bounded() {
        let s = small();
        let decoded: Vec<Array4<f32>> = (0..3)
            .map(|i| Array4::from_elem((1, s.width(i), 2, 2), i as f32 + 1.0))
            .collect();

        assert!(s.cross_slice_input(0, &decoded).unwrap().is_none());

        let one = s.cross_slice_input(1, &decoded).unwrap().unwrap();
        assert_eq!(one.dim().1, 2);

        // slice 3 reads slice 0 and slice 2, never slice 1
        let three = s.cross_slice_input(3, &decoded).unwrap().unwrap();
        assert_eq!(three.dim().1, s.cc_input_channels(3));
        assert!(three.iter().all(|&v| v == 1.0 || v == 3.0));
    }

    #[test]
    fn test_chunk_channels() {
        let g = Array4::from_shape_fn((1, 4, 1, 1), |(_, c, _, _)| c as f32);
        let (a, b) = chunk_channels(&g.view()).unwrap();
        assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0]);
        assert_eq!(b.iter().copied().collect::<Vec<_>>(), vec![2.0, 3.0]);

        let odd = Array4::<f32>::zeros((1, 3, 1, 1));
        assert!(chunk_channels(&odd.view()).is_err());
    }
}
