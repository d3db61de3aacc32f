//! Comma separated values without a header.
//!
//! Images are written one flattened image per row, classes one per row.
use anyhow::{ensure, Context, Result};
use ndarray::{Array, Array1, Array2, ArrayBase, ArrayView1, Data, Dimension};
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

/// Writes `images` to `path`, one flattened image per row.
///
/// The first axis is the example axis, the rest are flattened in standard order.
///
/// **Errors**
///
/// The file could not be created or written.
pub fn write_images<S, D>(path: impl AsRef<Path>, images: &ArrayBase<S, D>) -> Result<()>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let path = path.as_ref();
    let rows = images.shape().first().copied().unwrap_or(0);
    let images = images.as_standard_layout();
    let images = images
        .as_slice()
        .context("Images must be contiguous!")?;
    let cols = if rows > 0 { images.len() / rows } else { 0 };
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Unable to create {:?}!", path.display()))?,
    );
    for row in images.chunks(cols.max(1)).take(rows) {
        let mut items = row.iter();
        if let Some(x) = items.next() {
            write!(writer, "{x}")?;
        }
        for x in items {
            write!(writer, ",{x}")?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `classes` to `path`, one per row.
///
/// **Errors**
///
/// The file could not be created or written.
pub fn write_classes(path: impl AsRef<Path>, classes: ArrayView1<u8>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Unable to create {:?}!", path.display()))?,
    );
    for class in classes.iter() {
        writeln!(writer, "{class}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads images written by [`write_images()`], `[rows, cols]`.
///
/// **Errors**
/// - The file could not be read.
/// - A value is not a float.
/// - The rows have different lengths.
pub fn read_images(path: impl AsRef<Path>) -> Result<Array2<f32>> {
    let path = path.as_ref();
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("Unable to open {:?}!", path.display()))?,
    );
    let mut data = Vec::new();
    let mut rows = 0;
    let mut cols = None;
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let len = data.len();
        for item in line.split(',') {
            data.push(
                item.trim()
                    .parse::<f32>()
                    .with_context(|| format!("{}:{}: invalid value {item:?}!", path.display(), i + 1))?,
            );
        }
        let row_len = data.len() - len;
        let cols = *cols.get_or_insert(row_len);
        ensure!(
            row_len == cols,
            "{}:{}: expected {cols} values, found {row_len}!",
            path.display(),
            i + 1
        );
        rows += 1;
    }
    let cols = cols.unwrap_or(0);
    Ok(Array::from_shape_vec([rows, cols], data)?)
}

/// Reads classes written by [`write_classes()`].
///
/// **Errors**
/// - The file could not be read.
/// - A value is not in 0..=255.
pub fn read_classes(path: impl AsRef<Path>) -> Result<Array1<u8>> {
    let path = path.as_ref();
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("Unable to open {:?}!", path.display()))?,
    );
    let mut classes = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        classes.push(
            line.parse::<u8>()
                .with_context(|| format!("{}:{}: invalid class {line:?}!", path.display(), i + 1))?,
        );
    }
    Ok(Array1::from(classes))
}
