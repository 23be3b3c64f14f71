use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::ops::{Deref, DerefMut};

/// Compressed chromatic parameterization: optional raw amplitudes followed by
/// Legendre coefficients for every non-amplitude PSF parameter.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct PolyParams(pub Array1<f64>);

impl PolyParams {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for PolyParams {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PolyParams {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for PolyParams {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

/// One PSF parameter vector per dispersion column, shape `(Nx, n_params)`.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileParams(pub Array2<f64>);

impl ProfileParams {
    pub fn new(values: Array2<f64>) -> Self {
        Self(values)
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.0
    }

    pub fn as_view(&self) -> ArrayView2<'_, f64> {
        self.0.view()
    }

    pub fn columns(&self) -> usize {
        self.0.nrows()
    }
}

impl Deref for ProfileParams {
    type Target = Array2<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ProfileParams {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Pixels excluded from a fit, indexed over the flattened `(row, column)` image.
/// `true` marks an excluded pixel.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelMask(pub Array1<bool>);

impl PixelMask {
    pub fn none(len: usize) -> Self {
        Self(Array1::from_elem(len, false))
    }

    pub fn count(&self) -> usize {
        self.0.iter().filter(|&&m| m).count()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| m.then_some(i))
            .collect()
    }

    /// Pixels excluded by either mask.
    pub fn union(&self, other: &PixelMask) -> PixelMask {
        PixelMask(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(&a, &b)| a || b)
                .collect(),
        )
    }
}

impl Deref for PixelMask {
    type Target = Array1<bool>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
