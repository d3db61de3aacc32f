use super::{he_normal, into_dimensionality, invalid_sequence, Backward, Forward};
use crate::error::{Error, Result};
use ndarray::{Array, Array2, Array4, ArrayD, ArrayView2, ArrayView4, Axis, Ix4};
use rand::{distributions::Distribution, Rng};
use std::fmt::{self, Debug};

/// Convolutional layer.
///
/// Valid (no padding), stride 1 cross-correlation with a square kernel. The weight has shape
/// `[outputs, inputs, kernel, kernel]` and the bias `[outputs, 1]`.
#[derive(Clone)]
pub struct Conv2 {
    pub(super) weight: Array4<f32>,
    pub(super) bias: Array2<f32>,
    cache: Option<ConvCache>,
}

#[derive(Clone)]
struct ConvCache {
    cols: Array2<f32>,
    input_dim: (usize, usize, usize, usize),
}

impl Conv2 {
    /// Creates a new [`Conv2`] for `inputs`, `outputs`, and `kernel`.
    ///
    /// The weight is initialized with a normal distribution with
    /// std = sqrt(2 / (inputs * kernel * kernel)), the bias with zeros.
    pub fn from_inputs_outputs_kernel<R: Rng + ?Sized>(
        inputs: usize,
        outputs: usize,
        kernel: usize,
        rng: &mut R,
    ) -> Self {
        let dist = he_normal(inputs * kernel * kernel);
        let weight = Array::from_shape_simple_fn([outputs, inputs, kernel, kernel], || {
            dist.sample(rng)
        });
        let bias = Array::zeros([outputs, 1]);
        Self {
            weight,
            bias,
            cache: None,
        }
    }
    /// Creates a new [`Conv2`] from `weight` and `bias`.
    ///
    /// **Errors**
    /// - The kernel must be square and not empty.
    /// - The bias must have shape `[outputs, 1]`.
    pub fn from_weight_bias(weight: Array4<f32>, bias: Array2<f32>) -> Result<Self> {
        let (outputs, _, kh, kw) = weight.dim();
        if kh != kw || kh == 0 {
            return Err(Error::dimension_mismatch(
                "Conv2",
                "square kernel",
                format!("{:?}", weight.shape()),
            ));
        }
        if bias.dim() != (outputs, 1) {
            return Err(Error::dimension_mismatch(
                "Conv2",
                format!("bias [{outputs}, 1]"),
                format!("{:?}", bias.shape()),
            ));
        }
        Ok(Self {
            weight: weight.as_standard_layout().into_owned(),
            bias,
            cache: None,
        })
    }
    /// The number of input channels.
    pub fn inputs(&self) -> usize {
        self.weight.dim().1
    }
    /// The number of output channels.
    pub fn outputs(&self) -> usize {
        self.weight.dim().0
    }
    /// The kernel size.
    pub fn kernel(&self) -> usize {
        self.weight.dim().2
    }
    /// The weight.
    pub fn weight(&self) -> ArrayView4<f32> {
        self.weight.view()
    }
    /// The bias.
    pub fn bias(&self) -> ArrayView2<f32> {
        self.bias.view()
    }
    fn weight_matrix(&self) -> Result<ArrayView2<f32>> {
        let (outputs, inputs, kernel, _) = self.weight.dim();
        Ok(self
            .weight
            .view()
            .into_shape([outputs, inputs * kernel * kernel])?)
    }
    fn check_input(&self, input: ArrayD<f32>) -> Result<Array4<f32>> {
        let input = into_dimensionality::<Ix4>("Conv2", input)?;
        let (_, channels, ih, iw) = input.dim();
        let kernel = self.kernel();
        if channels != self.inputs() || ih < kernel || iw < kernel {
            return Err(Error::dimension_mismatch(
                "Conv2",
                format!(
                    "{} channels of at least {kernel} x {kernel}",
                    self.inputs()
                ),
                format!("{:?}", input.shape()),
            ));
        }
        Ok(input)
    }
    /// Returns the output and the im2col matrix of the input.
    fn conv(&self, input: ArrayView4<f32>) -> Result<(Array4<f32>, Array2<f32>)> {
        let (batch_size, _, ih, iw) = input.dim();
        let kernel = self.kernel();
        let (oh, ow) = (ih + 1 - kernel, iw + 1 - kernel);
        let cols = im2col(input, kernel)?;
        let output = cols.dot(&self.weight_matrix()?.t()) + &self.bias.t();
        let output = output
            .into_shape([batch_size, oh, ow, self.outputs()])?
            .permuted_axes([0, 3, 1, 2]);
        Ok((output.as_standard_layout().into_owned(), cols))
    }
}

/// Unfolds every kernel sized patch of `input` into a row.
///
/// `[batch_size, channels, ih, iw]` -> `[batch_size * oh * ow, channels * kernel * kernel]`.
fn im2col(input: ArrayView4<f32>, kernel: usize) -> Result<Array2<f32>> {
    let (batch_size, channels, ih, iw) = input.dim();
    let (oh, ow) = (ih + 1 - kernel, iw + 1 - kernel);
    let mut output = Array::zeros([batch_size, oh, ow, channels, kernel * kernel]);
    for (input, mut output) in input.outer_iter().zip(output.outer_iter_mut()) {
        for (input, mut output) in input.outer_iter().zip(output.axis_iter_mut(Axis(2))) {
            for ((hid, wid, fidx), y) in output.indexed_iter_mut() {
                *y = input[(hid + fidx / kernel, wid + fidx % kernel)];
            }
        }
    }
    Ok(output.into_shape([batch_size * oh * ow, channels * kernel * kernel])?)
}

/// Folds the rows of `input` back into the patches they came from, accumulating overlaps.
fn col2im(
    input: Array2<f32>,
    (batch_size, channels, ih, iw): (usize, usize, usize, usize),
    kernel: usize,
) -> Result<Array4<f32>> {
    let (oh, ow) = (ih + 1 - kernel, iw + 1 - kernel);
    let input = input.into_shape([batch_size, oh, ow, channels, kernel * kernel])?;
    let mut output = Array::zeros([batch_size, channels, ih, iw]);
    for (input, mut output) in input.outer_iter().zip(output.outer_iter_mut()) {
        for (input, mut output) in input.axis_iter(Axis(2)).zip(output.outer_iter_mut()) {
            for ((hid, wid, fidx), x) in input.indexed_iter() {
                output[(hid + fidx / kernel, wid + fidx % kernel)] += *x;
            }
        }
    }
    Ok(output)
}

impl Debug for Conv2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Conv2")
            .field("weight", &self.weight.shape())
            .field("bias", &self.bias.shape())
            .finish()
    }
}

impl Forward for Conv2 {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input = self.check_input(input)?;
        let (output, cols) = self.conv(input.view())?;
        self.cache.replace(ConvCache {
            cols,
            input_dim: input.dim(),
        });
        Ok(output.into_dyn())
    }
    fn infer(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input = self.check_input(input)?;
        Ok(self.conv(input.view())?.0.into_dyn())
    }
}

impl Backward for Conv2 {
    fn backward(&mut self, output_grad: ArrayD<f32>, learning_rate: f32) -> Result<ArrayD<f32>> {
        let ConvCache { cols, input_dim } =
            self.cache.take().ok_or_else(|| invalid_sequence("Conv2"))?;
        let (batch_size, _, ih, iw) = input_dim;
        let (outputs, kernel) = (self.outputs(), self.kernel());
        let (oh, ow) = (ih + 1 - kernel, iw + 1 - kernel);
        let output_grad = into_dimensionality::<Ix4>("Conv2", output_grad)?;
        let output_dim = (batch_size, outputs, oh, ow);
        if output_grad.dim() != output_dim {
            return Err(Error::dimension_mismatch(
                "Conv2",
                format!("{output_dim:?}"),
                format!("{:?}", output_grad.shape()),
            ));
        }
        // [batch_size * oh * ow, outputs], matching the rows of cols
        let output_grad = output_grad
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape([batch_size * oh * ow, outputs])?;
        let weight_grad = output_grad.t().dot(&cols);
        let bias_grad = output_grad.sum_axis(Axis(0)).insert_axis(Axis(1));
        let input_grad = col2im(output_grad.dot(&self.weight_matrix()?), input_dim, kernel)?;
        let weight_grad = weight_grad.into_shape(self.weight.raw_dim())?;
        self.weight.scaled_add(-learning_rate, &weight_grad);
        self.bias.scaled_add(-learning_rate, &bias_grad);
        Ok(input_grad.into_dyn())
    }
}
