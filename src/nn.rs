// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Neural network layers with explicit forward and backward passes.
//!
//! Every layer caches whatever its backward pass needs during `forward`, so a
//! `backward` call must follow the matching `forward`. Gradients accumulate into
//! [`Param::grad`] until [`Param::zero_grad`] is called.

use ndarray::{Array1, Array2, Array4, ArrayD, Axis, IxDyn, Zip};
use rand::Rng;

use crate::error::{OpenSetError, Result};

/// A learnable tensor and its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Param {
    /// Current value.
    pub value: ArrayD<f32>,
    /// Gradient of the loss with respect to `value`.
    pub grad: ArrayD<f32>,
}

impl Param {
    /// Wrap a value with a zeroed gradient.
    #[must_use]
    pub fn new(value: ArrayD<f32>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self { value, grad }
    }

    /// Uniform initialisation in `[-bound, bound)`.
    pub fn uniform<R: Rng + ?Sized>(shape: &[usize], bound: f32, rng: &mut R) -> Self {
        let value = ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.random_range(-bound..bound));
        Self::new(value)
    }

    /// Reset the gradient to zero.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Replace the value, keeping the shape.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` has a different shape.
    pub fn assign(&mut self, value: ArrayD<f32>) -> Result<()> {
        if value.shape() != self.value.shape() {
            return Err(OpenSetError::CheckpointError(format!(
                "shape {:?} does not match parameter shape {:?}",
                value.shape(),
                self.value.shape()
            )));
        }
        self.value = value;
        Ok(())
    }
}

/// Anything holding learnable parameters.
pub trait Module {
    /// Named parameters in a stable order.
    fn named_params(&self) -> Vec<(String, &Param)>;

    /// Mutable parameters, in the same order as [`Module::named_params`].
    fn params_mut(&mut self) -> Vec<&mut Param>;

    /// Zero every gradient.
    fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.zero_grad();
        }
    }
}

fn init_bound(fan_in: usize) -> f32 {
    #[allow(clippy::cast_precision_loss)]
    let fan_in = fan_in.max(1) as f32;
    1.0 / fan_in.sqrt()
}

/// 2-D convolution with stride 1 and symmetric zero padding.
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// Kernel as `(out, in, k, k)`.
    pub weight: Param,
    /// Per-output-channel bias.
    pub bias: Param,
    kernel: usize,
    padding: usize,
    cache: Option<(Array2<f32>, (usize, usize, usize, usize))>,
}

impl Conv2d {
    /// Create a convolution with `kernel x kernel` filters.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let bound = init_bound(in_channels * kernel * kernel);
        Self {
            weight: Param::uniform(&[out_channels, in_channels, kernel, kernel], bound, rng),
            bias: Param::uniform(&[out_channels], bound, rng),
            kernel,
            padding,
            cache: None,
        }
    }

    fn out_channels(&self) -> usize {
        self.weight.value.shape()[0]
    }

    fn in_channels(&self) -> usize {
        self.weight.value.shape()[1]
    }

    fn output_size(&self, h: usize, w: usize) -> (usize, usize) {
        (
            (h + 2 * self.padding + 1).saturating_sub(self.kernel),
            (w + 2 * self.padding + 1).saturating_sub(self.kernel),
        )
    }

    /// Weight viewed as `(out, in * k * k)`.
    fn weight_matrix(&self) -> Array2<f32> {
        let out = self.out_channels();
        let cols = self.weight.value.len() / out;
        let flat: Vec<f32> = self.weight.value.iter().copied().collect();
        Array2::from_shape_fn((out, cols), |(o, j)| flat[o * cols + j])
    }

    /// Unfold every receptive field into a row: `(N * OH * OW, C * k * k)`.
    fn im2col(&self, x: &Array4<f32>) -> Array2<f32> {
        let (n, c, h, w) = x.dim();
        let (oh, ow) = self.output_size(h, w);
        let k = self.kernel;
        let p = self.padding;
        Array2::from_shape_fn((n * oh * ow, c * k * k), |(row, col)| {
            let b = row / (oh * ow);
            let oy = (row / ow) % oh;
            let ox = row % ow;
            let ch = col / (k * k);
            let ky = (col / k) % k;
            let kx = col % k;
            let iy = oy + ky;
            let ix = ox + kx;
            if iy < p || ix < p || iy - p >= h || ix - p >= w {
                0.0
            } else {
                x[[b, ch, iy - p, ix - p]]
            }
        })
    }

    /// Forward pass on `(N, C, H, W)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input channel count does not match the kernel.
    pub fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = x.dim();
        if c != self.in_channels() {
            return Err(OpenSetError::ModelError(format!(
                "conv expects {} input channels, got {c}",
                self.in_channels()
            )));
        }
        let (oh, ow) = self.output_size(h, w);
        let cols = self.im2col(x);
        let out = cols.dot(&self.weight_matrix().t());
        let bias = &self.bias.value;
        let y = Array4::from_shape_fn((n, self.out_channels(), oh, ow), |(b, o, oy, ox)| {
            out[[(b * oh + oy) * ow + ox, o]] + bias[[o]]
        });
        self.cache = Some((cols, (n, c, h, w)));
        Ok(y)
    }

    /// Backward pass; returns the gradient with respect to the input.
    ///
    /// # Errors
    ///
    /// Returns an error if called before `forward`.
    pub fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let (cols, (n, c, h, w)) = self
            .cache
            .as_ref()
            .ok_or_else(|| OpenSetError::ModelError("conv backward before forward".into()))?;
        let (n, c, h, w) = (*n, *c, *h, *w);
        let (gn, o, oh, ow) = grad.dim();
        if gn != n || o != self.out_channels() || (oh, ow) != self.output_size(h, w) {
            return Err(OpenSetError::ModelError(format!(
                "conv gradient shape {:?} does not match output",
                grad.dim()
            )));
        }
        let g = Array2::from_shape_fn((n * oh * ow, o), |(row, oc)| {
            grad[[row / (oh * ow), oc, (row / ow) % oh, row % ow]]
        });

        let dw = g.t().dot(cols);
        let dw = dw
            .into_shape_with_order(self.weight.value.raw_dim())
            .map_err(|e| OpenSetError::ModelError(e.to_string()))?;
        self.weight.grad += &dw;
        let db = g.sum_axis(Axis(0)).into_dyn();
        self.bias.grad += &db;

        let dcols = g.dot(&self.weight_matrix());
        let k = self.kernel;
        let p = self.padding;
        let mut dx = Array4::<f32>::zeros((n, c, h, w));
        for row in 0..n * oh * ow {
            let b = row / (oh * ow);
            let oy = (row / ow) % oh;
            let ox = row % ow;
            for col in 0..c * k * k {
                let ch = col / (k * k);
                let iy = oy + (col / k) % k;
                let ix = ox + col % k;
                if iy >= p && ix >= p && iy - p < h && ix - p < w {
                    dx[[b, ch, iy - p, ix - p]] += dcols[[row, col]];
                }
            }
        }
        Ok(dx)
    }
}

/// Parametric ReLU with a single learnable negative slope.
#[derive(Debug, Clone)]
pub struct PRelu {
    /// Negative slope, shape `(1,)`.
    pub weight: Param,
    input: Option<ArrayD<f32>>,
}

impl Default for PRelu {
    fn default() -> Self {
        Self::new()
    }
}

impl PRelu {
    /// Create with the conventional initial slope of 0.25.
    #[must_use]
    pub fn new() -> Self {
        Self {
            weight: Param::new(ArrayD::from_elem(IxDyn(&[1]), 0.25)),
            input: None,
        }
    }

    fn slope(&self) -> f32 {
        self.weight.value.iter().next().copied().unwrap_or(0.25)
    }

    /// Forward pass on any shape.
    pub fn forward(&mut self, x: ArrayD<f32>) -> ArrayD<f32> {
        let a = self.slope();
        let y = x.mapv(|v| if v > 0.0 { v } else { a * v });
        self.input = Some(x);
        y
    }

    /// Backward pass; returns the gradient with respect to the input.
    ///
    /// # Errors
    ///
    /// Returns an error if called before `forward`.
    pub fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = self
            .input
            .as_ref()
            .ok_or_else(|| OpenSetError::ModelError("prelu backward before forward".into()))?;
        let a = self.slope();
        let mut da = 0.0;
        let mut dx = ArrayD::zeros(x.raw_dim());
        Zip::from(&mut dx).and(x).and(grad).for_each(|d, &v, &g| {
            if v > 0.0 {
                *d = g;
            } else {
                *d = a * g;
                da += v * g;
            }
        });
        self.weight.grad[[0]] += da;
        Ok(dx)
    }
}

/// 2x2 max pooling with stride 2. Odd trailing rows and columns are dropped.
#[derive(Debug, Clone, Default)]
pub struct MaxPool2d {
    cache: Option<((usize, usize, usize, usize), Vec<usize>)>,
}

impl MaxPool2d {
    /// Create a pooling layer.
    #[must_use]
    pub const fn new() -> Self {
        Self { cache: None }
    }

    /// Forward pass on `(N, C, H, W)`.
    pub fn forward(&mut self, x: &Array4<f32>) -> Array4<f32> {
        let (n, c, h, w) = x.dim();
        let (oh, ow) = (h / 2, w / 2);
        let mut argmax = Vec::with_capacity(n * c * oh * ow);
        let mut y = Array4::<f32>::zeros((n, c, oh, ow));
        for b in 0..n {
            for ch in 0..c {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = (2 * oy, 2 * ox);
                        for (dy, dx) in [(0, 1), (1, 0), (1, 1)] {
                            let (iy, ix) = (2 * oy + dy, 2 * ox + dx);
                            if x[[b, ch, iy, ix]] > x[[b, ch, best.0, best.1]] {
                                best = (iy, ix);
                            }
                        }
                        y[[b, ch, oy, ox]] = x[[b, ch, best.0, best.1]];
                        argmax.push(best.0 * w + best.1);
                    }
                }
            }
        }
        self.cache = Some(((n, c, h, w), argmax));
        y
    }

    /// Backward pass; routes each gradient to the position that won the max.
    ///
    /// # Errors
    ///
    /// Returns an error if called before `forward`.
    pub fn backward(&self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let ((n, c, h, w), argmax) = self
            .cache
            .as_ref()
            .ok_or_else(|| OpenSetError::ModelError("pool backward before forward".into()))?;
        let (_, _, oh, ow) = grad.dim();
        let mut dx = Array4::<f32>::zeros((*n, *c, *h, *w));
        let mut i = 0;
        for b in 0..*n {
            for ch in 0..*c {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let pos = argmax[i];
                        dx[[b, ch, pos / w, pos % w]] += grad[[b, ch, oy, ox]];
                        i += 1;
                    }
                }
            }
        }
        Ok(dx)
    }
}

/// Fully connected layer `y = x W^T + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight as `(out, in)`.
    pub weight: Param,
    /// Bias as `(out,)`.
    pub bias: Param,
    input: Option<Array2<f32>>,
}

impl Linear {
    /// Create a layer mapping `in_features` to `out_features`.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = init_bound(in_features);
        Self {
            weight: Param::uniform(&[out_features, in_features], bound, rng),
            bias: Param::uniform(&[out_features], bound, rng),
            input: None,
        }
    }

    fn weight2(&self) -> Result<ndarray::ArrayView2<'_, f32>> {
        self.weight
            .value
            .view()
            .into_dimensionality()
            .map_err(|e| OpenSetError::ModelError(e.to_string()))
    }

    /// Forward pass on `(N, in)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the feature count does not match.
    pub fn forward(&mut self, x: Array2<f32>) -> Result<Array2<f32>> {
        let w = self.weight2()?;
        if x.ncols() != w.ncols() {
            return Err(OpenSetError::ModelError(format!(
                "linear expects {} features, got {}",
                w.ncols(),
                x.ncols()
            )));
        }
        let bias: ndarray::ArrayView1<'_, f32> = self
            .bias
            .value
            .view()
            .into_dimensionality()
            .map_err(|e| OpenSetError::ModelError(e.to_string()))?;
        let y = x.dot(&w.t()) + &bias;
        self.input = Some(x);
        Ok(y)
    }

    /// Backward pass; returns the gradient with respect to the input.
    ///
    /// # Errors
    ///
    /// Returns an error if called before `forward`.
    pub fn backward(&mut self, grad: &Array2<f32>) -> Result<Array2<f32>> {
        let x = self
            .input
            .as_ref()
            .ok_or_else(|| OpenSetError::ModelError("linear backward before forward".into()))?;
        if grad.dim() != (x.nrows(), self.weight.value.shape()[0]) {
            return Err(OpenSetError::ModelError(format!(
                "linear gradient shape {:?} does not match output",
                grad.dim()
            )));
        }
        let dw = grad.t().dot(x).into_dyn();
        self.weight.grad += &dw;
        let db: Array1<f32> = grad.sum_axis(Axis(0));
        self.bias.grad += &db.into_dyn();
        let dx = grad.dot(&self.weight2()?);
        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Loss used for gradient checks: sum(y * r) for a fixed `r`.
    fn weighted_sum<D: ndarray::Dimension>(y: &Array<f32, D>, r: &Array<f32, D>) -> f32 {
        (y * r).sum()
    }

    #[test]
    fn test_linear_forward() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut fc = Linear::new(2, 1, &mut rng);
        fc.weight.assign(array![[2.0, -1.0]].into_dyn()).unwrap();
        fc.bias.assign(array![0.5].into_dyn()).unwrap();
        let y = fc.forward(array![[1.0, 3.0], [0.0, 0.0]]).unwrap();
        assert_eq!(y, array![[-0.5], [0.5]]);
        assert!(fc.forward(array![[1.0, 2.0, 3.0]]).is_err());
    }

    #[test]
    fn test_linear_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut fc = Linear::new(3, 2, &mut rng);
        let x = array![[0.3, -0.7, 1.1], [0.5, 0.2, -0.4]];
        let r = array![[1.0, -2.0], [0.5, 0.25]];

        fc.forward(x.clone()).unwrap();
        let dx = fc.backward(&r).unwrap();

        let eps = 1e-2;
        let mut probe = fc.clone();
        let base = weighted_sum(&probe.forward(x.clone()).unwrap(), &r);
        probe.weight.value[[1, 2]] += eps;
        let bumped = weighted_sum(&probe.forward(x.clone()).unwrap(), &r);
        assert!(((bumped - base) / eps - fc.weight.grad[[1, 2]]).abs() < 1e-2);

        let mut xb = x.clone();
        xb[[0, 1]] += eps;
        let mut probe = fc.clone();
        let bumped = weighted_sum(&probe.forward(xb).unwrap(), &r);
        assert!(((bumped - base) / eps - dx[[0, 1]]).abs() < 1e-2);
    }

    #[test]
    fn test_conv_output_shape_and_identity_kernel() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut conv = Conv2d::new(1, 1, 3, 1, &mut rng);
        let mut kernel = ArrayD::zeros(IxDyn(&[1, 1, 3, 3]));
        kernel[[0, 0, 1, 1]] = 1.0;
        conv.weight.assign(kernel).unwrap();
        conv.bias.assign(ArrayD::zeros(IxDyn(&[1]))).unwrap();

        let x = Array4::from_shape_fn((2, 1, 4, 5), |(n, _, y, x)| (n * 20 + y * 5 + x) as f32);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn test_conv_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut conv = Conv2d::new(2, 3, 3, 1, &mut rng);
        let x = Array4::from_shape_fn((1, 2, 4, 4), |(_, c, y, x)| {
            ((c * 16 + y * 4 + x) as f32 * 0.37).sin()
        });
        let r = Array4::from_shape_fn((1, 3, 4, 4), |(_, o, y, x)| {
            ((o * 16 + y * 4 + x) as f32 * 0.11).cos()
        });

        conv.forward(&x).unwrap();
        let dx = conv.backward(&r).unwrap();

        let eps = 1e-2;
        let mut probe = conv.clone();
        let base = weighted_sum(&probe.forward(&x).unwrap(), &r);

        probe.weight.value[[2, 1, 0, 2]] += eps;
        let bumped = weighted_sum(&probe.forward(&x).unwrap(), &r);
        assert!(((bumped - base) / eps - conv.weight.grad[[2, 1, 0, 2]]).abs() < 2e-2);

        let mut probe = conv.clone();
        probe.bias.value[[1]] += eps;
        let bumped = weighted_sum(&probe.forward(&x).unwrap(), &r);
        assert!(((bumped - base) / eps - conv.bias.grad[[1]]).abs() < 2e-2);

        let mut xb = x.clone();
        xb[[0, 1, 0, 3]] += eps;
        let mut probe = conv.clone();
        let bumped = weighted_sum(&probe.forward(&xb).unwrap(), &r);
        assert!(((bumped - base) / eps - dx[[0, 1, 0, 3]]).abs() < 2e-2);
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut conv = Conv2d::new(3, 1, 3, 1, &mut rng);
        assert!(conv.forward(&Array4::zeros((1, 1, 4, 4))).is_err());
        assert!(Conv2d::new(1, 1, 3, 1, &mut rng)
            .backward(&Array4::zeros((1, 1, 4, 4)))
            .is_err());
    }

    #[test]
    fn test_prelu() {
        let mut act = PRelu::new();
        let y = act.forward(array![-2.0, 0.0, 3.0].into_dyn());
        assert_eq!(y, array![-0.5, 0.0, 3.0].into_dyn());
        let dx = act.backward(&array![1.0, 1.0, 1.0].into_dyn()).unwrap();
        assert_eq!(dx, array![0.25, 0.25, 1.0].into_dyn());
        // d/da = sum of non-positive inputs times upstream gradient
        assert!((act.weight.grad[[0]] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_maxpool_routes_gradient_to_max() {
        let mut pool = MaxPool2d::new();
        let x = Array4::from_shape_vec(
            (1, 1, 3, 3),
            vec![1.0, 5.0, 9.0, 2.0, 3.0, 9.0, 9.0, 9.0, 9.0],
        )
        .unwrap();
        let y = pool.forward(&x);
        assert_eq!(y.dim(), (1, 1, 1, 1));
        assert!((y[[0, 0, 0, 0]] - 5.0).abs() < f32::EPSILON);

        let dx = pool.backward(&Array4::from_elem((1, 1, 1, 1), 2.0)).unwrap();
        assert!((dx[[0, 0, 0, 1]] - 2.0).abs() < f32::EPSILON);
        assert!((dx.sum() - 2.0).abs() < f32::EPSILON);
    }
}
