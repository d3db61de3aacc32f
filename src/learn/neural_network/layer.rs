//! Layers.
//!
//! Every layer implements [`Forward`] and [`Backward`]. [`Forward::forward()`] caches what the
//! backward pass needs, and [`Backward::backward()`] consumes that cache, computes the gradient of
//! the input, and updates the parameters in place with gradient descent. [`Forward::infer()`]
//! computes the same output without touching the cache.
use crate::error::{Error, Result};
use ndarray::{
    Array, Array2, ArrayD, ArrayView2, ArrayViewD, ArrayViewMutD, Axis, Dimension, Ix2, Ix4,
};
use rand::{distributions::Distribution, Rng};
use rand_distr::StandardNormal;
use std::fmt::{self, Debug};

mod conv;
pub use conv::Conv2;

/// A trait for the forward pass.
pub trait Forward {
    /// Computes the forward pass, caching the activations needed by [`Backward::backward()`].
    ///
    /// **Errors**
    ///
    /// Returns an error if the input does not have the shape the layer expects.
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>>;
    /// Computes the forward pass without caching.
    ///
    /// **Errors**
    ///
    /// See [`.forward()`](Forward::forward()).
    fn infer(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>>;
}

/// A trait for the backward pass.
pub trait Backward {
    /// Computes the gradient of the input given the gradient of the output, and updates the
    /// parameters with `learning_rate`.
    ///
    /// The cache written by the last [`Forward::forward()`] is consumed, so each forward
    /// allows exactly one backward.
    ///
    /// **Errors**
    /// - [`Error::InvalidSequence`] if there was no forward since the last backward.
    /// - [`Error::DimensionMismatch`] if `output_grad` does not have the shape of the output.
    fn backward(&mut self, output_grad: ArrayD<f32>, learning_rate: f32) -> Result<ArrayD<f32>>;
}

/// He initialization, N(0, 2 / inputs).
fn he_normal(mut inputs: usize) -> impl Distribution<f32> {
    if inputs == 0 {
        inputs = 1;
    }
    let a = (2. / inputs as f32).sqrt();
    StandardNormal.map(move |x: f32| x * a)
}

fn into_dimensionality<D: Dimension>(
    layer: &'static str,
    input: ArrayD<f32>,
) -> Result<Array<f32, D>> {
    if let Some(ndim) = D::NDIM {
        if input.ndim() != ndim {
            return Err(Error::dimension_mismatch(
                layer,
                format!("{ndim} dimensions"),
                format!("{:?}", input.shape()),
            ));
        }
    }
    Ok(input.into_dimensionality()?)
}

fn into_standard_layout<D: Dimension>(input: Array<f32, D>) -> Array<f32, D> {
    if input.is_standard_layout() {
        input
    } else {
        input.as_standard_layout().into_owned()
    }
}

fn invalid_sequence(layer: &'static str) -> Error {
    Error::InvalidSequence { layer }
}

/// Layer.
///
/// The closed set of layers a [`Network`](super::Network) is composed of.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub enum Layer {
    Conv2(Conv2),
    Relu(Relu),
    MaxPool2(MaxPool2),
    Flatten(Flatten),
    Dense(Dense),
}

macro_rules! impl_layer_from {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Layer {
                fn from(layer: $variant) -> Self {
                    Self::$variant(layer)
                }
            }
        )*
    };
}

impl_layer_from!(Conv2, Relu, MaxPool2, Flatten, Dense);

impl Layer {
    /// The parameters, weight then bias, or none.
    pub fn parameters(&self) -> Vec<ArrayViewD<f32>> {
        match self {
            Self::Conv2(conv) => vec![conv.weight().into_dyn(), conv.bias().into_dyn()],
            Self::Dense(dense) => vec![dense.weight().into_dyn(), dense.bias().into_dyn()],
            Self::Relu(_) | Self::MaxPool2(_) | Self::Flatten(_) => Vec::new(),
        }
    }
    /// The parameters, mutably.
    ///
    /// Parameters can be assigned but never reshaped.
    pub fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<f32>> {
        match self {
            Self::Conv2(conv) => vec![
                conv.weight.view_mut().into_dyn(),
                conv.bias.view_mut().into_dyn(),
            ],
            Self::Dense(dense) => vec![
                dense.weight.view_mut().into_dyn(),
                dense.bias.view_mut().into_dyn(),
            ],
            Self::Relu(_) | Self::MaxPool2(_) | Self::Flatten(_) => Vec::new(),
        }
    }
}

impl Forward for Layer {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Self::Conv2(layer) => layer.forward(input),
            Self::Relu(layer) => layer.forward(input),
            Self::MaxPool2(layer) => layer.forward(input),
            Self::Flatten(layer) => layer.forward(input),
            Self::Dense(layer) => layer.forward(input),
        }
    }
    fn infer(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Self::Conv2(layer) => layer.infer(input),
            Self::Relu(layer) => layer.infer(input),
            Self::MaxPool2(layer) => layer.infer(input),
            Self::Flatten(layer) => layer.infer(input),
            Self::Dense(layer) => layer.infer(input),
        }
    }
}

impl Backward for Layer {
    fn backward(&mut self, output_grad: ArrayD<f32>, learning_rate: f32) -> Result<ArrayD<f32>> {
        match self {
            Self::Conv2(layer) => layer.backward(output_grad, learning_rate),
            Self::Relu(layer) => layer.backward(output_grad, learning_rate),
            Self::MaxPool2(layer) => layer.backward(output_grad, learning_rate),
            Self::Flatten(layer) => layer.backward(output_grad, learning_rate),
            Self::Dense(layer) => layer.backward(output_grad, learning_rate),
        }
    }
}

/// Relu.
///
/// `max(0, x)`. The gradient is blocked where the input was not positive, including 0.
#[derive(Default, Clone, Debug)]
pub struct Relu {
    mask: Option<ArrayD<bool>>,
}

impl Relu {
    /// Creates a new [`Relu`].
    pub fn new() -> Self {
        Self::default()
    }
}

fn relu(mut input: ArrayD<f32>) -> ArrayD<f32> {
    input.mapv_inplace(|x| if x > 0. { x } else { 0. });
    input
}

impl Forward for Relu {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.mask.replace(input.map(|x| *x > 0.));
        Ok(relu(input))
    }
    fn infer(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(relu(input))
    }
}

impl Backward for Relu {
    fn backward(&mut self, mut output_grad: ArrayD<f32>, _: f32) -> Result<ArrayD<f32>> {
        let mask = self.mask.take().ok_or_else(|| invalid_sequence("Relu"))?;
        if mask.shape() != output_grad.shape() {
            return Err(Error::dimension_mismatch(
                "Relu",
                format!("{:?}", mask.shape()),
                format!("{:?}", output_grad.shape()),
            ));
        }
        output_grad.zip_mut_with(&mask, |dy, m| {
            if !m {
                *dy = 0.;
            }
        });
        Ok(output_grad)
    }
}

/// Max pooling with a 2 x 2 window and stride 2.
///
/// An odd trailing row or column is dropped, and receives no gradient. Every position equal to
/// the maximum of its window receives the gradient, so tied positions all receive it.
#[derive(Default, Clone)]
pub struct MaxPool2 {
    mask: Option<ArrayD<bool>>,
}

impl MaxPool2 {
    /// Creates a new [`MaxPool2`].
    pub fn new() -> Self {
        Self::default()
    }
    fn pool(&self, input: ArrayD<f32>, mask: bool) -> Result<(ArrayD<f32>, Option<ArrayD<bool>>)> {
        let input = into_dimensionality::<Ix4>("MaxPool2", input)?;
        let (batch_size, channels, ih, iw) = input.dim();
        if ih < 2 || iw < 2 {
            return Err(Error::dimension_mismatch(
                "MaxPool2",
                "height and width of at least 2",
                format!("{:?}", input.shape()),
            ));
        }
        let (oh, ow) = (ih / 2, iw / 2);
        let mut output = Array::zeros([batch_size, channels, oh, ow]);
        for (x, mut y) in input.outer_iter().zip(output.outer_iter_mut()) {
            for (x, mut y) in x.outer_iter().zip(y.outer_iter_mut()) {
                for ((row, col), y) in y.indexed_iter_mut() {
                    let mut m = x[(row * 2, col * 2)];
                    for i in 0..2 {
                        for j in 0..2 {
                            let x = x[(row * 2 + i, col * 2 + j)];
                            if x > m {
                                m = x;
                            }
                        }
                    }
                    *y = m;
                }
            }
        }
        let mask = if mask {
            let mut mask = Array::from_elem(input.raw_dim(), false);
            for ((x, y), mut m) in input
                .outer_iter()
                .zip(output.outer_iter())
                .zip(mask.outer_iter_mut())
            {
                for ((x, y), mut m) in x.outer_iter().zip(y.outer_iter()).zip(m.outer_iter_mut()) {
                    for ((row, col), y) in y.indexed_iter() {
                        for i in 0..2 {
                            for j in 0..2 {
                                let index = (row * 2 + i, col * 2 + j);
                                m[index] = x[index] == *y;
                            }
                        }
                    }
                }
            }
            Some(mask.into_dyn())
        } else {
            None
        };
        Ok((output.into_dyn(), mask))
    }
}

impl Debug for MaxPool2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MaxPool2")
            .field("size", &[2, 2])
            .field("strides", &[2, 2])
            .finish()
    }
}

impl Forward for MaxPool2 {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (output, mask) = self.pool(input, true)?;
        self.mask = mask;
        Ok(output)
    }
    fn infer(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(self.pool(input, false)?.0)
    }
}

impl Backward for MaxPool2 {
    fn backward(&mut self, output_grad: ArrayD<f32>, _: f32) -> Result<ArrayD<f32>> {
        let mask = self.mask.take().ok_or_else(|| invalid_sequence("MaxPool2"))?;
        let mask = mask.into_dimensionality::<Ix4>()?;
        let (batch_size, channels, ih, iw) = mask.dim();
        let output_grad = into_dimensionality::<Ix4>("MaxPool2", output_grad)?;
        let output_dim = (batch_size, channels, ih / 2, iw / 2);
        if output_grad.dim() != output_dim {
            return Err(Error::dimension_mismatch(
                "MaxPool2",
                format!("{output_dim:?}"),
                format!("{:?}", output_grad.shape()),
            ));
        }
        let mut input_grad = Array::zeros(mask.raw_dim());
        for ((dy, m), mut dx) in output_grad
            .outer_iter()
            .zip(mask.outer_iter())
            .zip(input_grad.outer_iter_mut())
        {
            for ((dy, m), mut dx) in dy.outer_iter().zip(m.outer_iter()).zip(dx.outer_iter_mut()) {
                for ((row, col), dy) in dy.indexed_iter() {
                    for i in 0..2 {
                        for j in 0..2 {
                            let index = (row * 2 + i, col * 2 + j);
                            if m[index] {
                                dx[index] = *dy;
                            }
                        }
                    }
                }
            }
        }
        Ok(input_grad.into_dyn())
    }
}

/// Flatten.
///
/// Collapses every axis but the first (batch) axis.
#[derive(Default, Clone, Debug)]
pub struct Flatten {
    input_shape: Option<Vec<usize>>,
}

impl Flatten {
    /// Creates a new [`Flatten`].
    pub fn new() -> Self {
        Self::default()
    }
}

fn flatten(input: ArrayD<f32>) -> Result<ArrayD<f32>> {
    let batch_size = match input.shape().first() {
        Some(batch_size) if input.ndim() >= 2 => *batch_size,
        _ => {
            return Err(Error::dimension_mismatch(
                "Flatten",
                "at least 2 dimensions",
                format!("{:?}", input.shape()),
            ));
        }
    };
    let features = input.shape()[1..].iter().product::<usize>();
    Ok(into_standard_layout(input)
        .into_shape([batch_size, features])?
        .into_dyn())
}

impl Forward for Flatten {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input_shape = input.shape().to_vec();
        let output = flatten(input)?;
        self.input_shape.replace(input_shape);
        Ok(output)
    }
    fn infer(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        flatten(input)
    }
}

impl Backward for Flatten {
    fn backward(&mut self, output_grad: ArrayD<f32>, _: f32) -> Result<ArrayD<f32>> {
        let input_shape = self
            .input_shape
            .take()
            .ok_or_else(|| invalid_sequence("Flatten"))?;
        if output_grad.len() != input_shape.iter().product::<usize>() {
            return Err(Error::dimension_mismatch(
                "Flatten",
                format!("{input_shape:?}"),
                format!("{:?}", output_grad.shape()),
            ));
        }
        Ok(into_standard_layout(output_grad).into_shape(input_shape)?)
    }
}

/// Dense / fully connected layer.
///
/// `x.dot(weight) + bias`, with weight `[inputs, outputs]` and bias `[1, outputs]`.
#[derive(Clone)]
pub struct Dense {
    weight: Array2<f32>,
    bias: Array2<f32>,
    input: Option<Array2<f32>>,
}

impl Dense {
    /// Creates a new [`Dense`] for `inputs` and `outputs`.
    ///
    /// The weight is initialized with a normal distribution with std = sqrt(2 / inputs), the
    /// bias with zeros.
    pub fn from_inputs_outputs<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let dist = he_normal(inputs);
        let weight = Array::from_shape_simple_fn([inputs, outputs], || dist.sample(rng));
        let bias = Array::zeros([1, outputs]);
        Self {
            weight,
            bias,
            input: None,
        }
    }
    /// Creates a new [`Dense`] from `weight` and `bias`.
    ///
    /// **Errors**
    ///
    /// The bias must have shape `[1, outputs]`.
    pub fn from_weight_bias(weight: Array2<f32>, bias: Array2<f32>) -> Result<Self> {
        let outputs = weight.ncols();
        if bias.dim() != (1, outputs) {
            return Err(Error::dimension_mismatch(
                "Dense",
                format!("bias [1, {outputs}]"),
                format!("{:?}", bias.shape()),
            ));
        }
        Ok(Self {
            weight,
            bias,
            input: None,
        })
    }
    /// The number of input features.
    pub fn inputs(&self) -> usize {
        self.weight.nrows()
    }
    /// The number of output features.
    pub fn outputs(&self) -> usize {
        self.weight.ncols()
    }
    /// The weight.
    pub fn weight(&self) -> ArrayView2<f32> {
        self.weight.view()
    }
    /// The bias.
    pub fn bias(&self) -> ArrayView2<f32> {
        self.bias.view()
    }
    fn check_input(&self, input: ArrayD<f32>) -> Result<Array2<f32>> {
        let input = into_dimensionality::<Ix2>("Dense", input)?;
        if input.ncols() != self.inputs() {
            return Err(Error::dimension_mismatch(
                "Dense",
                format!("{} features", self.inputs()),
                format!("{:?}", input.shape()),
            ));
        }
        Ok(input)
    }
}

impl Debug for Dense {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dense")
            .field("weight", &self.weight.shape())
            .field("bias", &self.bias.shape())
            .finish()
    }
}

impl Forward for Dense {
    fn forward(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input = self.check_input(input)?;
        let output = input.dot(&self.weight) + &self.bias;
        self.input.replace(input);
        Ok(output.into_dyn())
    }
    fn infer(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input = self.check_input(input)?;
        Ok((input.dot(&self.weight) + &self.bias).into_dyn())
    }
}

impl Backward for Dense {
    fn backward(&mut self, output_grad: ArrayD<f32>, learning_rate: f32) -> Result<ArrayD<f32>> {
        let input = self.input.take().ok_or_else(|| invalid_sequence("Dense"))?;
        let output_grad = into_dimensionality::<Ix2>("Dense", output_grad)?;
        let output_dim = (input.nrows(), self.outputs());
        if output_grad.dim() != output_dim {
            return Err(Error::dimension_mismatch(
                "Dense",
                format!("{output_dim:?}"),
                format!("{:?}", output_grad.shape()),
            ));
        }
        let weight_grad = input.t().dot(&output_grad);
        let bias_grad = output_grad.sum_axis(Axis(0)).insert_axis(Axis(0));
        let input_grad = output_grad.dot(&self.weight.t());
        self.weight.scaled_add(-learning_rate, &weight_grad);
        self.bias.scaled_add(-learning_rate, &bias_grad);
        Ok(input_grad.into_dyn())
    }
}
