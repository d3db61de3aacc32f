/// Csv import / export.
pub mod csv;
/// The MNIST archive.
pub mod mnist;
/// Pickle decoding.
pub mod pickle;

#[cfg(test)]
mod tests;
