//! Learned-function interface
//!
//! Every learned function of the codec (analysis, synthesis, the two hyper
//! transforms, the cross-slice transforms, the context predictors and the
//! parameter aggregators) is a [`Transform`]: a deterministic grid-to-grid map
//! with fixed input and output channel counts. The coding schedule only relies
//! on those arities, so trained weights can be plugged in through
//! [`Conv2d::from_weights`] or any other implementation of the trait.
//!
//! The layers here are plain CPU implementations:
//!
//! - [`Conv2d`]: k x k convolution with stride and zero padding (im2col + GEMM)
//! - [`CheckerboardMaskedConv2d`]: convolution that only sees anchor neighbours
//! - [`Relu`], [`Upsample`] (nearest neighbour)
//! - [`Sequential`]: a chain with arities checked at construction
//!
//! Batch items are convolved in parallel with rayon; the arithmetic of each
//! item is sequential, so outputs do not depend on the thread count.

use ndarray::{stack, Array1, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis};
use probability::distribution::{Gaussian, Inverse};
use rand::Rng;
use rayon::prelude::*;

use super::checkerboard::kernel_mask;
use super::error::ElicError;

/// A deterministic learned function over 4-D grids (batch, channel, height, width)
pub trait Transform: Send + Sync {
    /// Name used in errors and logs
    fn name(&self) -> &str;

    /// Expected input channel count
    fn in_channels(&self) -> usize;

    /// Produced output channel count
    fn out_channels(&self) -> usize;

    /// Apply the function
    fn forward(&self, x: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError>;
}

impl std::fmt::Debug for dyn Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({} -> {})",
            self.name(),
            self.in_channels(),
            self.out_channels()
        )
    }
}

/// Reject inputs whose channel count differs from `expected`
fn check_input(name: &str, expected: usize, x: &ArrayView4<f32>) -> Result<(), ElicError> {
    let (b, c, h, w) = x.dim();
    if c != expected {
        return Err(ElicError::shape_mismatch(
            format!("input of '{}'", name),
            &[b, expected, h, w],
            x.shape(),
        ));
    }
    Ok(())
}

/// Draw a Kaiming-normal tensor (`std = sqrt(2 / fan_in)`)
pub fn kaiming_normal<R: Rng>(shape: (usize, usize, usize, usize), rng: &mut R) -> Array4<f32> {
    let fan_in = (shape.1 * shape.2 * shape.3).max(1);
    let gaussian = Gaussian::new(0.0, (2.0 / fan_in as f64).sqrt());
    Array4::from_shape_simple_fn(shape, || {
        let u: f64 = rng.gen_range(f64::EPSILON..1.0);
        gaussian.inverse(u) as f32
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Convolution
// ─────────────────────────────────────────────────────────────────────────────

/// 2-D convolution with square kernel, stride and symmetric zero padding
#[derive(Debug, Clone)]
pub struct Conv2d {
    name: String,
    /// Weights `[out, in, k, k]`
    weight: Array4<f32>,
    /// Weights flattened to `[out, in * k * k]`
    matrix: Array2<f32>,
    bias: Array1<f32>,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    /// Build a convolution from explicit weights
    pub fn from_weights(
        name: impl Into<String>,
        weight: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
    ) -> Result<Self, ElicError> {
        let name = name.into();
        let (out_ch, _, kh, kw) = weight.dim();
        if kh != kw || kh == 0 {
            return Err(ElicError::transform(
                &name,
                format!("kernel must be square and non-empty, got {}x{}", kh, kw),
            ));
        }
        if bias.len() != out_ch {
            return Err(ElicError::transform(
                &name,
                format!("bias has {} entries for {} outputs", bias.len(), out_ch),
            ));
        }
        if stride == 0 {
            return Err(ElicError::transform(&name, "stride cannot be zero"));
        }
        let weight = weight.as_standard_layout().into_owned();
        let (_, in_ch, k, _) = weight.dim();
        let matrix = weight
            .clone()
            .into_shape_with_order((out_ch, in_ch * k * k))?;
        Ok(Conv2d {
            name,
            weight,
            matrix,
            bias,
            stride,
            padding,
        })
    }

    /// Kaiming-initialized convolution with zero bias
    pub fn kaiming<R: Rng>(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Result<Self, ElicError> {
        let weight = kaiming_normal((out_channels, in_channels, kernel, kernel), rng);
        Conv2d::from_weights(name, weight, Array1::zeros(out_channels), stride, padding)
    }

    /// Kernel size
    pub fn kernel(&self) -> usize {
        self.weight.dim().2
    }

    /// Weights `[out, in, k, k]`
    pub fn weight(&self) -> &Array4<f32> {
        &self.weight
    }

    /// Output spatial size for an input of `(h, w)`
    pub fn output_size(&self, h: usize, w: usize) -> Result<(usize, usize), ElicError> {
        let k = self.kernel();
        let (ph, pw) = (h + 2 * self.padding, w + 2 * self.padding);
        if ph < k || pw < k {
            return Err(ElicError::transform(
                &self.name,
                format!("input {}x{} smaller than kernel {}", h, w, k),
            ));
        }
        Ok(((ph - k) / self.stride + 1, (pw - k) / self.stride + 1))
    }

    /// Unfold one batch item into `[in * k * k, oh * ow]` patches
    fn im2col(&self, x: &ArrayView3<f32>, oh: usize, ow: usize) -> Array2<f32> {
        let (cin, h, w) = x.dim();
        let k = self.kernel();
        let mut cols = Array2::<f32>::zeros((cin * k * k, oh * ow));

        for c in 0..cin {
            for ki in 0..k {
                for kj in 0..k {
                    let mut row = cols.row_mut((c * k + ki) * k + kj);
                    for oy in 0..oh {
                        let iy = (oy * self.stride + ki) as isize - self.padding as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for ox in 0..ow {
                            let ix = (ox * self.stride + kj) as isize - self.padding as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            row[oy * ow + ox] = x[[c, iy as usize, ix as usize]];
                        }
                    }
                }
            }
        }
        cols
    }

    fn forward_item(&self, x: &ArrayView3<f32>, oh: usize, ow: usize) -> Array3<f32> {
        let out_ch = self.out_channels();
        let cols = self.im2col(x, oh, ow);
        let mut out = self.matrix.dot(&cols);
        for (mut row, &b) in out.outer_iter_mut().zip(self.bias.iter()) {
            row += b;
        }
        // (out, oh * ow) -> (out, oh, ow)
        Array3::from_shape_fn((out_ch, oh, ow), |(o, y, xx)| out[[o, y * ow + xx]])
    }
}

impl Transform for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    fn forward(&self, x: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
        check_input(&self.name, self.in_channels(), x)?;
        let (_, _, h, w) = x.dim();
        let (oh, ow) = self.output_size(h, w)?;

        let items: Vec<Array3<f32>> = (0..x.dim().0)
            .into_par_iter()
            .map(|n| self.forward_item(&x.index_axis(Axis(0), n), oh, ow))
            .collect();
        let views: Vec<_> = items.iter().map(|a| a.view()).collect();
        Ok(stack(Axis(0), &views)?)
    }
}

/// Convolution whose kernel only covers checkerboard anchor neighbours
///
/// The weight is masked once at construction: taps at `(i + j)` even are
/// zeroed, so an output at a non-anchor position is a function of anchor
/// inputs only.
#[derive(Debug, Clone)]
pub struct CheckerboardMaskedConv2d {
    conv: Conv2d,
}

impl CheckerboardMaskedConv2d {
    /// Mask explicit weights; padding is `kernel / 2`
    pub fn from_weights(
        name: impl Into<String>,
        weight: Array4<f32>,
        bias: Array1<f32>,
    ) -> Result<Self, ElicError> {
        let k = weight.dim().2;
        let mask = kernel_mask(k);
        let mut weight = weight;
        for mut kernel in weight.outer_iter_mut() {
            for mut plane in kernel.outer_iter_mut() {
                plane *= &mask;
            }
        }
        Ok(CheckerboardMaskedConv2d {
            conv: Conv2d::from_weights(name, weight, bias, 1, k / 2)?,
        })
    }

    /// Kaiming-initialized masked convolution
    pub fn kaiming<R: Rng>(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        rng: &mut R,
    ) -> Result<Self, ElicError> {
        let weight = kaiming_normal((out_channels, in_channels, kernel, kernel), rng);
        Self::from_weights(name, weight, Array1::zeros(out_channels))
    }

    /// Masked weights
    pub fn weight(&self) -> &Array4<f32> {
        self.conv.weight()
    }
}

impl Transform for CheckerboardMaskedConv2d {
    fn name(&self) -> &str {
        self.conv.name()
    }

    fn in_channels(&self) -> usize {
        self.conv.in_channels()
    }

    fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }

    fn forward(&self, x: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
        self.conv.forward(x)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pointwise and resampling layers
// ─────────────────────────────────────────────────────────────────────────────

/// Rectified linear unit
#[derive(Debug, Clone)]
pub struct Relu {
    channels: usize,
}

impl Relu {
    /// ReLU over `channels` channels
    pub fn new(channels: usize) -> Self {
        Relu { channels }
    }
}

impl Transform for Relu {
    fn name(&self) -> &str {
        "relu"
    }

    fn in_channels(&self) -> usize {
        self.channels
    }

    fn out_channels(&self) -> usize {
        self.channels
    }

    fn forward(&self, x: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
        check_input(self.name(), self.channels, x)?;
        Ok(x.mapv(|v| v.max(0.0)))
    }
}

/// Nearest-neighbour upsampling by an integer factor
#[derive(Debug, Clone)]
pub struct Upsample {
    channels: usize,
    factor: usize,
}

impl Upsample {
    /// Upsample `channels` channels by `factor`
    pub fn new(channels: usize, factor: usize) -> Self {
        Upsample { channels, factor }
    }
}

impl Transform for Upsample {
    fn name(&self) -> &str {
        "upsample"
    }

    fn in_channels(&self) -> usize {
        self.channels
    }

    fn out_channels(&self) -> usize {
        self.channels
    }

    fn forward(&self, x: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
        check_input(self.name(), self.channels, x)?;
        let f = self.factor;
        let (b, c, h, w) = x.dim();
        Ok(Array4::from_shape_fn((b, c, h * f, w * f), |(n, ch, y, xx)| {
            x[[n, ch, y / f, xx / f]]
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sequential
// ─────────────────────────────────────────────────────────────────────────────

/// A chain of transforms applied in order
pub struct Sequential {
    name: String,
    layers: Vec<Box<dyn Transform>>,
}

impl Sequential {
    /// Chain `layers`, checking that adjacent arities agree
    pub fn new(name: impl Into<String>, layers: Vec<Box<dyn Transform>>) -> Result<Self, ElicError> {
        let name = name.into();
        if layers.is_empty() {
            return Err(ElicError::transform(&name, "empty layer list"));
        }
        for pair in layers.windows(2) {
            if pair[0].out_channels() != pair[1].in_channels() {
                return Err(ElicError::transform(
                    &name,
                    format!(
                        "'{}' produces {} channels but '{}' expects {}",
                        pair[0].name(),
                        pair[0].out_channels(),
                        pair[1].name(),
                        pair[1].in_channels()
                    ),
                ));
            }
        }
        Ok(Sequential { name, layers })
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain is empty (never true after construction)
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl std::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequential")
            .field("name", &self.name)
            .field("layers", &self.layers)
            .finish()
    }
}

impl Transform for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_channels(&self) -> usize {
        self.layers.first().map_or(0, |l| l.in_channels())
    }

    fn out_channels(&self) -> usize {
        self.layers.last().map_or(0, |l| l.out_channels())
    }

    fn forward(&self, x: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
        check_input(&self.name, self.in_channels(), x)?;
        let mut current: Option<Array4<f32>> = None;
        for layer in &self.layers {
            let next = match &current {
                Some(t) => layer.forward(&t.view())?,
                None => layer.forward(x)?,
            };
            current = Some(next);
        }
        current.ok_or_else(|| ElicError::transform(&self.name, "empty layer list"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    fn rng() -> Xoshiro256StarStar {
        Xoshiro256StarStar::seed_from_u64(11)
    }

    #[test]
    fn test_identity_kernel() {
        // 3x3 kernel with a single 1 in the centre copies the input
        let mut weight = Array4::<f32>::zeros((1, 1, 3, 3));
        weight[[0, 0, 1, 1]] = 1.0;
        let conv = Conv2d::from_weights("id", weight, Array1::zeros(1), 1, 1).unwrap();
        let x = Array::from_shape_fn((2, 1, 4, 5), |(b, _, h, w)| (b * 100 + h * 10 + w) as f32);
        assert_eq!(conv.forward(&x.view()).unwrap(), x);
    }

    #[test]
    fn test_box_filter_with_padding() {
        let weight = Array4::<f32>::ones((1, 1, 3, 3));
        let conv = Conv2d::from_weights("box", weight, Array1::from_elem(1, 0.5), 1, 1).unwrap();
        let x = Array4::<f32>::ones((1, 1, 3, 3));
        let y = conv.forward(&x.view()).unwrap();
        assert_eq!(y[[0, 0, 1, 1]], 9.5);
        assert_eq!(y[[0, 0, 0, 0]], 4.5);
        assert_eq!(y[[0, 0, 0, 1]], 6.5);
    }

    #[test]
    fn test_strided_output_size() {
        let conv = Conv2d::kaiming("down", 3, 4, 5, 2, 2, &mut rng()).unwrap();
        let x = Array4::<f32>::zeros((1, 3, 16, 12));
        let y = conv.forward(&x.view()).unwrap();
        assert_eq!(y.dim(), (1, 4, 8, 6));
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let conv = Conv2d::kaiming("c", 3, 4, 1, 1, 0, &mut rng()).unwrap();
        let x = Array4::<f32>::zeros((1, 2, 4, 4));
        assert!(conv.forward(&x.view()).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_masked_conv_ignores_non_anchor_inputs() {
        let conv = CheckerboardMaskedConv2d::kaiming("ctx", 2, 4, 5, &mut rng()).unwrap();
        let w = conv.weight();
        for i in 0..5 {
            for j in 0..5 {
                if (i + j) % 2 == 0 {
                    assert!(w.slice(s![.., .., i, j]).iter().all(|&v| v == 0.0));
                }
            }
        }

        // changing a non-anchor input never moves a non-anchor output
        let base = Array4::<f32>::zeros((1, 2, 6, 6));
        let mut moved = base.clone();
        moved[[0, 1, 2, 3]] = 5.0;
        let a = conv.forward(&base.view()).unwrap();
        let b = conv.forward(&moved.view()).unwrap();
        for ((idx, &va), &vb) in a.indexed_iter().zip(b.iter()) {
            if (idx.2 + idx.3) % 2 == 1 {
                assert_eq!(va, vb, "non-anchor output {:?} changed", idx);
            }
        }
    }

    #[test]
    fn test_upsample_and_relu() {
        let x = Array::from_shape_vec((1, 1, 1, 2), vec![-1.0f32, 2.0]).unwrap();
        let up = Upsample::new(1, 2).forward(&x.view()).unwrap();
        assert_eq!(up.dim(), (1, 1, 2, 4));
        assert_eq!(up[[0, 0, 1, 3]], 2.0);
        let r = Relu::new(1).forward(&up.view()).unwrap();
        assert_eq!(r[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_sequential_checks_arities() {
        let mut r = rng();
        let ok = Sequential::new(
            "ok",
            vec![
                Box::new(Conv2d::kaiming("a", 2, 4, 3, 1, 1, &mut r).unwrap()),
                Box::new(Relu::new(4)),
                Box::new(Conv2d::kaiming("b", 4, 6, 1, 1, 0, &mut r).unwrap()),
            ],
        )
        .unwrap();
        assert_eq!(ok.in_channels(), 2);
        assert_eq!(ok.out_channels(), 6);
        let y = ok.forward(&Array4::<f32>::ones((1, 2, 3, 3)).view()).unwrap();
        assert_eq!(y.dim(), (1, 6, 3, 3));

        let bad = Sequential::new(
            "bad",
            vec![
                Box::new(Conv2d::kaiming("a", 2, 4, 3, 1, 1, &mut r).unwrap()),
                Box::new(Relu::new(5)),
            ],
        );
        assert!(bad.unwrap_err().is_shape_error());
    }

    #[test]
    fn test_kaiming_is_seeded() {
        let a = kaiming_normal((4, 3, 3, 3), &mut rng());
        let b = kaiming_normal((4, 3, 3, 3), &mut rng());
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite()));
    }
}
