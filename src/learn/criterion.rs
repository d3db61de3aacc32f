use ndarray::{Array1, ArrayView1, ArrayView2};

/// The index of the largest score of each row, the first on ties.
pub fn argmax(input: ArrayView2<f32>) -> Array1<u8> {
    input
        .outer_iter()
        .map(|x| {
            let mut max = f32::NEG_INFINITY;
            let mut max_index = 0;
            for (i, x) in x.iter().copied().enumerate() {
                if x > max {
                    max = x;
                    max_index = i;
                }
            }
            max_index as u8
        })
        .collect()
}

/// The number of `predictions` equal to `classes`.
pub fn accuracy(predictions: ArrayView1<u8>, classes: ArrayView1<u8>) -> usize {
    predictions
        .iter()
        .zip(classes.iter())
        .filter(|(prediction, class)| prediction == class)
        .count()
}
