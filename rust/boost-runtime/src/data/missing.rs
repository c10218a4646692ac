// rust/boost-runtime/src/data/missing.rs

//! Missing-value stripping for point streams.

use crate::error::{BoostError, Result};

use super::point::LabeledPoint;

impl LabeledPoint {
    /// Returns a sparse copy of this point without entries equal to `missing`.
    ///
    /// A NaN sentinel strips NaN entries only. A `0.0` sentinel is only
    /// accepted for points that are already sparse.
    pub fn without_missing(&self, missing: f32) -> Result<LabeledPoint> {
        let is_missing = |v: f32| {
            if missing.is_nan() {
                v.is_nan()
            } else {
                v == missing
            }
        };

        let (indices, values) = match &self.indices {
            Some(indices) => {
                if indices.len() != self.values.len() {
                    return Err(BoostError::config(format!(
                        "sparse point has {} indices but {} values",
                        indices.len(),
                        self.values.len()
                    )));
                }
                indices
                    .iter()
                    .zip(&self.values)
                    .filter(|(_, v)| !is_missing(**v))
                    .map(|(i, v)| (*i, *v))
                    .unzip()
            }
            None if missing == 0.0 => {
                return Err(BoostError::config(
                    "missing value 0.0 requires sparse features, got a dense point",
                ));
            }
            None => self
                .values
                .iter()
                .enumerate()
                .filter(|(_, v)| !is_missing(**v))
                .map(|(i, v)| (i as u32, *v))
                .unzip(),
        };

        Ok(LabeledPoint {
            indices: Some(indices),
            values,
            ..self.clone()
        })
    }
}

/// Lazy 1:1 adapter that strips missing values from every point.
pub struct MissingValueFilter<I> {
    inner: I,
    missing: f32,
}

/// Wraps `iter` so each point has its `missing` entries removed.
pub fn filter_missing<I>(iter: I, missing: f32) -> MissingValueFilter<I::IntoIter>
where
    I: IntoIterator<Item = LabeledPoint>,
{
    MissingValueFilter {
        inner: iter.into_iter(),
        missing,
    }
}

impl<I> Iterator for MissingValueFilter<I>
where
    I: Iterator<Item = LabeledPoint>,
{
    type Item = Result<LabeledPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|point| point.without_missing(self.missing))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
