use super::pickle::{self, Value};
use crate::learn::neural_network::{CLASSES, IMAGE_SIZE};
use anyhow::{anyhow, ensure, Context, Result};
use flate2::read::GzDecoder;
use ndarray::{concatenate, Array1, Array2, Array4, ArrayView1, ArrayView2, Axis, Ix2};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};
use tracing::info;

/// The default path of the archive.
pub const DEFAULT_PATH: &str = "MNIST/mnist.pkl.gz";

/// Mnist builder.
pub mod builders {
    use super::{Mnist, Result, DEFAULT_PATH};
    use std::path::{Path, PathBuf};

    /// Mnist builder.
    #[derive(Debug)]
    pub struct MnistBuilder {
        pub(super) path: PathBuf,
    }

    impl Default for MnistBuilder {
        fn default() -> Self {
            Self {
                path: PathBuf::from(DEFAULT_PATH),
            }
        }
    }

    impl MnistBuilder {
        /// The path of the gzip compressed pickle archive. Defaults to
        /// [`DEFAULT_PATH`](super::DEFAULT_PATH).
        pub fn path(self, path: impl AsRef<Path>) -> Self {
            Self {
                path: path.as_ref().to_owned(),
            }
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        /// - The file was not found.
        /// - Decompressing / unpickling the data failed.
        /// - The archive does not contain 3 splits of images and labels.
        pub fn build(&self) -> Result<Mnist> {
            Mnist::build(self)
        }
    }
}
use builders::MnistBuilder;

/// A split of the archive, flattened images `[n, 784]` and their classes.
#[derive(Clone, Debug)]
pub struct Split {
    images: Array2<f32>,
    classes: Array1<u8>,
}

impl Split {
    /// The images, one flattened image per row.
    pub fn images(&self) -> ArrayView2<f32> {
        self.images.view()
    }
    /// The classes.
    pub fn classes(&self) -> ArrayView1<u8> {
        self.classes.view()
    }
    /// The number of examples.
    pub fn len(&self) -> usize {
        self.classes.len()
    }
    /// Whether there are no examples.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
    fn from_value(value: &Value, name: &str) -> Result<Self> {
        let items = value
            .as_items()
            .ok_or_else(|| anyhow!("Expected {name} to be a tuple!"))?;
        ensure!(items.len() == 2, "Expected {name} to be (images, labels)!");
        let images = items[0]
            .to_ndarray()
            .with_context(|| format!("{name} images"))?
            .to_f32()?;
        let classes = items[1]
            .to_ndarray()
            .with_context(|| format!("{name} labels"))?
            .to_classes()?;
        let images = images
            .into_dimensionality::<Ix2>()
            .with_context(|| format!("Expected {name} images to be 2 dimensional!"))?;
        ensure!(
            images.ncols() == IMAGE_SIZE * IMAGE_SIZE,
            "Expected {name} images of {} pixels, found {}!",
            IMAGE_SIZE * IMAGE_SIZE,
            images.ncols()
        );
        ensure!(
            images.nrows() == classes.len(),
            "{name} has {} images but {} labels!",
            images.nrows(),
            classes.len()
        );
        Ok(Self { images, classes })
    }
}

/// The MNIST archive.
///
/// The gzip compressed pickle of `(train, validation, test)`, each `(images, labels)`, with
/// images as float rows of 784 pixels.
#[derive(Clone, Debug)]
pub struct Mnist {
    path: PathBuf,
    train: Split,
    validation: Split,
    test: Split,
}

impl Mnist {
    /// Returns an [`MnistBuilder`] used to specify options.
    /**
    ```no_run
    # use mnist_cnn::dataset::mnist::Mnist;
    # fn main() -> anyhow::Result<()> {
    let mnist = Mnist::builder()
        .path("MNIST/mnist.pkl.gz")
        .build()?;
    let balanced = mnist.balanced(500, 10)?;
    # Ok(())
    # }
    ```
    */
    pub fn builder() -> MnistBuilder {
        MnistBuilder::default()
    }
    fn build(builder: &MnistBuilder) -> Result<Self> {
        let path = builder.path.clone();
        let file = File::open(&path)
            .with_context(|| format!("Unable to open {:?}!", path.display()))?;
        let value = pickle::from_reader(BufReader::new(GzDecoder::new(file)))
            .with_context(|| format!("Unable to unpickle {:?}!", path.display()))?;
        let splits = value
            .as_items()
            .ok_or_else(|| anyhow!("Expected a tuple of splits!"))?;
        ensure!(
            splits.len() == 3,
            "Expected 3 splits (train, validation, test), found {}!",
            splits.len()
        );
        let train = Split::from_value(&splits[0], "train")?;
        let validation = Split::from_value(&splits[1], "validation")?;
        let test = Split::from_value(&splits[2], "test")?;
        info!(
            path = %path.display(),
            train = train.len(),
            validation = validation.len(),
            test = test.len(),
            "loaded mnist"
        );
        Ok(Self {
            path,
            train,
            validation,
            test,
        })
    }
    /// The path the archive was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// The training split.
    pub fn train(&self) -> &Split {
        &self.train
    }
    /// The validation split.
    pub fn validation(&self) -> &Split {
        &self.validation
    }
    /// The test split.
    pub fn test(&self) -> &Split {
        &self.test
    }
    /// Selects `train_per_class` examples of each class from the training and validation splits,
    /// and `test_per_class` of each class from the test split.
    ///
    /// See [`balance()`].
    ///
    /// **Errors**
    ///
    /// The splits could not be concatenated.
    pub fn balanced(&self, train_per_class: usize, test_per_class: usize) -> Result<BalancedMnist> {
        let train_images = concatenate(
            Axis(0),
            &[self.train.images.view(), self.validation.images.view()],
        )?;
        let train_classes = concatenate(
            Axis(0),
            &[self.train.classes.view(), self.validation.classes.view()],
        )?;
        let (train_images, train_classes) =
            balance(train_images.view(), train_classes.view(), train_per_class)?;
        let (test_images, test_classes) =
            balance(self.test.images(), self.test.classes(), test_per_class)?;
        info!(
            train = train_classes.len(),
            test = test_classes.len(),
            "balanced mnist"
        );
        Ok(BalancedMnist {
            train_images,
            train_classes,
            test_images,
            test_classes,
        })
    }
}

/// Class balanced training and testing sets.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub struct BalancedMnist {
    pub train_images: Array4<f32>,
    pub train_classes: Array1<u8>,
    pub test_images: Array4<f32>,
    pub test_classes: Array1<u8>,
}

/// Selects up to `per_class` examples of each of the 10 classes, in order of first appearance.
///
/// Stops scanning once every class has `per_class` examples. A class with fewer examples in
/// the data contributes all of them. The selected images are reshaped to `[n, 1, 28, 28]`.
///
/// **Errors**
/// - The number of images and classes differ.
/// - The images do not have 784 pixels.
pub fn balance(
    images: ArrayView2<f32>,
    classes: ArrayView1<u8>,
    per_class: usize,
) -> Result<(Array4<f32>, Array1<u8>)> {
    ensure!(
        images.nrows() == classes.len(),
        "{} images but {} classes!",
        images.nrows(),
        classes.len()
    );
    ensure!(
        images.ncols() == IMAGE_SIZE * IMAGE_SIZE,
        "Expected images of {} pixels, found {}!",
        IMAGE_SIZE * IMAGE_SIZE,
        images.ncols()
    );
    let mut counts = [0; CLASSES];
    let mut indices = Vec::new();
    if per_class > 0 {
        for (index, class) in classes.iter().copied().enumerate() {
            if let Some(count) = counts.get_mut(usize::from(class)) {
                if *count < per_class {
                    *count += 1;
                    indices.push(index);
                }
            }
            if counts.iter().all(|count| *count >= per_class) {
                break;
            }
        }
    }
    let selected = images.select(Axis(0), &indices);
    let images = selected.into_shape([indices.len(), 1, IMAGE_SIZE, IMAGE_SIZE])?;
    let classes = classes.select(Axis(0), &indices);
    Ok((images, classes))
}
