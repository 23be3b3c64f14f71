//! # Spectrogram Input and Validation
//!
//! Entry point for user-provided images. A spectrogram is a `(Ny, Nx)` array of
//! intensities with a same-shaped array of one-sigma errors; rows run along the
//! transverse axis and columns along the dispersion axis.
//!
//! - Strict shapes: data and errors must agree, and only 1D slices or 2D images
//!   are accepted.
//! - Errors are positive. An infinite error marks a pixel that carries no
//!   information and gets zero weight in every fit.
//! - Matrices are exchanged as headerless CSV, one image row per line.

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Ix1, Ix2};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Data has shape {data:?} but errors have shape {errors:?}. They must match exactly.")]
    ShapeMismatch {
        data: Vec<usize>,
        errors: Vec<usize>,
    },
    #[error("Expected a 1D transverse slice or a 2D spectrogram, got an array with {0} dimensions.")]
    Dimensionality(usize),
    #[error("The spectrogram is empty.")]
    Empty,
    #[error(
        "Error at row {row}, column {column} is {value}. Errors must be positive; use infinity to exclude a pixel."
    )]
    InvalidError { row: usize, column: usize, value: f64 },
    #[error("Saturation level must be positive and finite, got {0}.")]
    InvalidSaturation(f64),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Row {row} of the matrix has {found} values, but the first row has {expected}.")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("Could not parse '{value}' at row {row}, column {column} as a number.")]
    ParseError {
        row: usize,
        column: usize,
        value: String,
    },
}

/// A validated image with its errors.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub data: Array2<f64>,
    pub errors: Array2<f64>,
    saturation: Option<f64>,
}

impl Spectrogram {
    pub fn new(
        data: Array2<f64>,
        errors: Array2<f64>,
        saturation: Option<f64>,
    ) -> Result<Self, DataError> {
        if data.shape() != errors.shape() {
            return Err(DataError::ShapeMismatch {
                data: data.shape().to_vec(),
                errors: errors.shape().to_vec(),
            });
        }
        if data.is_empty() {
            return Err(DataError::Empty);
        }
        if let Some(((row, column), &value)) = errors
            .indexed_iter()
            .find(|(_, e)| e.is_nan() || **e <= 0.0)
        {
            return Err(DataError::InvalidError { row, column, value });
        }
        if let Some(s) = saturation
            && !(s.is_finite() && s > 0.0)
        {
            return Err(DataError::InvalidSaturation(s));
        }
        Ok(Self {
            data,
            errors,
            saturation,
        })
    }

    /// Number of transverse rows.
    pub fn ny(&self) -> usize {
        self.data.nrows()
    }

    /// Number of dispersion columns.
    pub fn nx(&self) -> usize {
        self.data.ncols()
    }

    /// Explicit saturation, or twice the largest finite data value.
    pub fn saturation(&self) -> f64 {
        self.saturation.unwrap_or_else(|| {
            let max = self
                .data
                .iter()
                .filter(|v| v.is_finite())
                .fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            if max.is_finite() && max > 0.0 {
                2.0 * max
            } else {
                1.0
            }
        })
    }

    /// Inverse variances; zero for infinite errors and non-finite data.
    pub fn weights(&self) -> Array2<f64> {
        let mut weights = self.errors.mapv(|e| 1.0 / (e * e));
        weights.zip_mut_with(&self.data, |w, d| {
            if !d.is_finite() || !w.is_finite() {
                *w = 0.0;
            }
        });
        weights
    }

    /// Rows `start..end` of the image, keeping the saturation.
    pub fn crop_rows(&self, start: usize, end: usize) -> Result<Self, DataError> {
        let end = end.min(self.ny());
        if start >= end {
            return Err(DataError::Empty);
        }
        Self::new(
            self.data.slice(ndarray::s![start..end, ..]).to_owned(),
            self.errors.slice(ndarray::s![start..end, ..]).to_owned(),
            Some(self.saturation()),
        )
    }

    /// Subtracts a background model column by column.
    pub fn subtract_background(&mut self, background: &dyn BackgroundModel) {
        let rows = Array1::range(0.0, self.ny() as f64, 1.0);
        for (x, mut column) in self.data.columns_mut().into_iter().enumerate() {
            column -= &background.evaluate(x, rows.view());
        }
    }
}

/// A single transverse slice or a full spectrogram.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Slice { data: Array1<f64>, errors: Array1<f64> },
    Image(Spectrogram),
}

impl Observation {
    /// Builds an observation from arrays of unknown rank.
    pub fn from_dyn(data: ArrayD<f64>, errors: ArrayD<f64>) -> Result<Self, DataError> {
        if data.shape() != errors.shape() {
            return Err(DataError::ShapeMismatch {
                data: data.shape().to_vec(),
                errors: errors.shape().to_vec(),
            });
        }
        match data.ndim() {
            1 => {
                let (Ok(data), Ok(errors)) = (data.into_dimensionality::<Ix1>(), errors.into_dimensionality::<Ix1>()) else {
                    return Err(DataError::Dimensionality(1));
                };
                if data.is_empty() {
                    return Err(DataError::Empty);
                }
                if let Some((row, &value)) =
                    errors.indexed_iter().find(|(_, e)| e.is_nan() || **e <= 0.0)
                {
                    return Err(DataError::InvalidError {
                        row,
                        column: 0,
                        value,
                    });
                }
                Ok(Observation::Slice { data, errors })
            }
            2 => {
                let (Ok(data), Ok(errors)) = (data.into_dimensionality::<Ix2>(), errors.into_dimensionality::<Ix2>()) else {
                    return Err(DataError::Dimensionality(2));
                };
                Ok(Observation::Image(Spectrogram::new(data, errors, None)?))
            }
            n => Err(DataError::Dimensionality(n)),
        }
    }
}

/// Sky or detector background under the spectrum.
pub trait BackgroundModel: Sync {
    /// Background of dispersion column `column` at the given transverse rows.
    fn evaluate(&self, column: usize, rows: ArrayView1<f64>) -> Array1<f64>;
}

impl<F> BackgroundModel for F
where
    F: Fn(usize, ArrayView1<f64>) -> Array1<f64> + Sync,
{
    fn evaluate(&self, column: usize, rows: ArrayView1<f64>) -> Array1<f64> {
        self(column, rows)
    }
}

/// Constant background level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatBackground(pub f64);

impl BackgroundModel for FlatBackground {
    fn evaluate(&self, _: usize, rows: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_elem(rows.len(), self.0)
    }
}

/// Noise level of a background model over an image: `sqrt(var + mean |b|)`.
pub fn background_noise_level(background: &dyn BackgroundModel, nx: usize, ny: usize) -> f64 {
    let rows = Array1::range(0.0, ny as f64, 1.0);
    let values: Vec<f64> = (0..nx)
        .flat_map(|x| background.evaluate(x, rows.view()).to_vec())
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let mean_abs = values.iter().map(|v| v.abs()).sum::<f64>() / n;
    (variance + mean_abs).sqrt()
}

/// Median of the finite errors of an image; zero when none is finite.
pub fn median_error(errors: ArrayView2<f64>) -> f64 {
    let mut finite: Vec<f64> = errors.iter().copied().filter(|e| e.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    finite.sort_by(f64::total_cmp);
    let mid = finite.len() / 2;
    if finite.len() % 2 == 0 {
        0.5 * (finite[mid - 1] + finite[mid])
    } else {
        finite[mid]
    }
}

/// Reads a headerless CSV matrix. `inf` and `nan` are accepted.
pub fn load_matrix(path: &Path) -> Result<Array2<f64>, DataError> {
    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(file);
    let mut values = Vec::new();
    let mut width = None;
    let mut rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let expected = *width.get_or_insert(record.len());
        if record.len() != expected {
            return Err(DataError::RaggedRow {
                row,
                expected,
                found: record.len(),
            });
        }
        for (column, field) in record.iter().enumerate() {
            let value = field.parse::<f64>().map_err(|_| DataError::ParseError {
                row,
                column,
                value: field.to_string(),
            })?;
            values.push(value);
        }
        rows += 1;
    }
    let cols = width.unwrap_or(0);
    if rows == 0 || cols == 0 {
        return Err(DataError::Empty);
    }
    Array2::from_shape_vec((rows, cols), values).map_err(|_| DataError::Empty)
}

/// Writes a matrix as headerless CSV.
pub fn write_matrix(path: &Path, matrix: ArrayView2<f64>) -> Result<(), DataError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for row in matrix.rows() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}
