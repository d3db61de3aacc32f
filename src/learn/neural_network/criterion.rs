use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Softmax cross entropy loss.
///
/// Combines the softmax of the raw scores with the negative log likelihood of the target class,
/// so that the gradient is simply `(probabilities - one_hot) / batch_size`.
#[derive(Default, Clone, Debug)]
pub struct SoftmaxCrossEntropy {
    cache: Option<LossCache>,
}

#[derive(Clone, Debug)]
struct LossCache {
    probabilities: Array2<f32>,
    classes: Array1<usize>,
}

/// Added to the probability before the log so a probability of 0 gives a finite loss.
const EPSILON: f32 = 1e-9;

impl SoftmaxCrossEntropy {
    /// Creates a new [`SoftmaxCrossEntropy`].
    pub fn new() -> Self {
        Self::default()
    }
    /// Computes the mean loss of `input` `[batch_size, classes]` given the target `classes`.
    ///
    /// Caches the probabilities for [`.backward()`](Self::backward()).
    ///
    /// **Errors**
    /// - [`Error::EmptyBatch`] if the batch is empty.
    /// - [`Error::DimensionMismatch`] if the batch sizes differ.
    /// - [`Error::InvalidClass`] if a class is not less than the number of classes.
    pub fn forward(&mut self, input: Array2<f32>, classes: ArrayView1<u8>) -> Result<f32> {
        let classes = check_classes(&input, classes)?;
        let probabilities = softmax(input);
        let loss = probabilities
            .outer_iter()
            .zip(classes.iter().copied())
            .map(|(p, class)| -(p[class] + EPSILON).ln())
            .sum::<f32>()
            / classes.len() as f32;
        self.cache.replace(LossCache {
            probabilities,
            classes,
        });
        Ok(loss)
    }
    /// The gradient of the loss with respect to the input of [`.forward()`](Self::forward()).
    ///
    /// **Errors**
    ///
    /// [`Error::InvalidSequence`] if there was no forward since the last backward.
    pub fn backward(&mut self) -> Result<Array2<f32>> {
        let LossCache {
            probabilities: mut input_grad,
            classes,
        } = self.cache.take().ok_or(Error::InvalidSequence {
            layer: "SoftmaxCrossEntropy",
        })?;
        let scale = 1. / classes.len() as f32;
        for (mut dx, class) in input_grad.outer_iter_mut().zip(classes.iter().copied()) {
            dx[class] -= 1.;
            dx.mapv_inplace(|dx| dx * scale);
        }
        Ok(input_grad)
    }
}

fn check_classes(input: &Array2<f32>, classes: ArrayView1<u8>) -> Result<Array1<usize>> {
    let (batch_size, n_classes) = input.dim();
    if batch_size == 0 {
        return Err(Error::EmptyBatch);
    }
    if classes.len() != batch_size {
        return Err(Error::dimension_mismatch(
            "SoftmaxCrossEntropy",
            format!("{batch_size} classes"),
            classes.len(),
        ));
    }
    classes
        .iter()
        .map(|class| {
            let class = usize::from(*class);
            if class < n_classes {
                Ok(class)
            } else {
                Err(Error::InvalidClass {
                    class,
                    classes: n_classes,
                })
            }
        })
        .collect()
}

/// Row wise softmax, stabilized by subtracting the max of each row.
pub(crate) fn softmax(mut input: Array2<f32>) -> Array2<f32> {
    for mut x in input.axis_iter_mut(Axis(0)) {
        let m = x.fold(f32::NEG_INFINITY, |m, x| m.max(*x));
        x.mapv_inplace(|x| (x - m).exp());
        let s = x.sum();
        x.mapv_inplace(|x| x / s);
    }
    input
}
