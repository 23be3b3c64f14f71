//! Fit configuration and persistence of fitted chromatic PSFs.

use crate::amplitude::AmplitudePrior;
use crate::chromatic::{ChromaticPsf, FitGeometry, LayoutError, ProfileTable};
use crate::fitter::MinimizerOptions;
use crate::shape::{Psf, PsfKind};
use crate::types::{PolyParams, ProfileParams};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Names of the descriptor columns written after the PSF parameters.
pub const DESCRIPTOR_COLUMNS: [&str; 8] = [
    "flux_sum",
    "flux_integral",
    "flux_err",
    "fwhm",
    "Dx",
    "Dy",
    "Dy_fwhm_inf",
    "Dy_fwhm_sup",
];

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Profile table header {found:?} does not match the {kind} PSF parameters.")]
    HeaderMismatch { kind: PsfKind, found: Vec<String> },
    #[error("Could not parse '{value}' in row {row} of the profile table.")]
    ParseError { row: usize, value: String },
}

/// Settings of the transverse column-by-column pre-fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransverseConfig {
    /// The transverse center is bounded to `middle +/- signal_half_width`.
    pub signal_half_width: usize,
    /// Half-width of the central band searched for the brightest column.
    pub background_half_width: usize,
    /// Every `pixel_step`-th column is fitted; the rest are interpolated.
    pub pixel_step: usize,
    pub sigma_clip: f64,
    pub clip_rounds: usize,
}

impl Default for TransverseConfig {
    fn default() -> Self {
        Self {
            signal_half_width: 10,
            background_half_width: 20,
            pixel_step: 1,
            sigma_clip: 5.0,
            clip_rounds: 2,
        }
    }
}

/// Everything that controls a chromatic PSF fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub psf_kind: PsfKind,
    /// Legendre degree of every shape parameter.
    pub degree: usize,
    /// Per-parameter degree overrides, keyed by parameter name.
    pub degrees: BTreeMap<String, usize>,
    pub prior: AmplitudePrior,
    /// Strength of the `psf1d` amplitude prior.
    pub reg_param: f64,
    /// Reference amplitudes for `psf1d` and `fixed`; the transverse fluxes when unset.
    pub reference_amplitudes: Option<Vec<f64>>,
    pub geometry: FitGeometry,
    pub saturation: Option<f64>,
    /// Keep only rows `start..end` of the image.
    pub crop_rows: Option<(usize, usize)>,
    pub mask_psf_footprint: bool,
    /// Footprint half-width in units of the FWHM.
    pub footprint_fwhm_clip: f64,
    /// Add the soft-bound penalty to the chi-square.
    pub bound_penalty: bool,
    pub minimizer: MinimizerOptions,
    pub transverse: TransverseConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            psf_kind: PsfKind::MoffatGauss,
            degree: 2,
            degrees: BTreeMap::new(),
            prior: AmplitudePrior::NoPrior,
            reg_param: 0.01,
            reference_amplitudes: None,
            geometry: FitGeometry::Columns,
            saturation: None,
            crop_rows: None,
            mask_psf_footprint: false,
            footprint_fwhm_clip: 2.0,
            bound_penalty: false,
            minimizer: MinimizerOptions {
                sigma_clip: Some(5.0),
                ..MinimizerOptions::default()
            },
            transverse: TransverseConfig::default(),
        }
    }
}

impl FitConfig {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Checks the configuration against an `nx` by `ny` image.
    pub fn validate(&self, nx: usize, ny: usize) -> Result<(), ModelError> {
        let invalid = |msg: String| Err(ModelError::InvalidConfiguration(msg));
        let psf = Psf::new(self.psf_kind);
        for (name, &degree) in &self.degrees {
            if psf.index_of(name).is_err() {
                return invalid(format!(
                    "degree override for '{name}', which the {} PSF does not have",
                    self.psf_kind
                ));
            }
            if degree >= nx {
                return invalid(format!("degree {degree} for '{name}' needs more than {nx} columns"));
            }
        }
        if self.degree >= nx {
            return invalid(format!("degree {} needs more than {nx} columns", self.degree));
        }
        if !(self.reg_param.is_finite() && self.reg_param >= 0.0) {
            return invalid(format!("reg_param must be non-negative, got {}", self.reg_param));
        }
        if let Some(reference) = &self.reference_amplitudes
            && reference.len() != nx
        {
            return invalid(format!(
                "{} reference amplitudes for {nx} columns",
                reference.len()
            ));
        }
        if let Some((start, end)) = self.crop_rows
            && (start >= end || end > ny)
        {
            return invalid(format!("crop_rows {start}..{end} outside the {ny} image rows"));
        }
        if !(self.footprint_fwhm_clip.is_finite() && self.footprint_fwhm_clip > 0.0) {
            return invalid(format!(
                "footprint_fwhm_clip must be positive, got {}",
                self.footprint_fwhm_clip
            ));
        }
        if self.transverse.pixel_step == 0 {
            return invalid("transverse pixel_step must be at least 1".to_string());
        }
        if !(self.transverse.sigma_clip > 0.0) {
            return invalid(format!(
                "transverse sigma_clip must be positive, got {}",
                self.transverse.sigma_clip
            ));
        }
        let m = &self.minimizer;
        if m.max_iterations == 0 {
            return invalid("minimizer max_iterations must be at least 1".to_string());
        }
        if !(m.epsilon > 0.0 && m.xtol >= 0.0) || m.ftol.is_some_and(|f| !(f >= 0.0)) {
            return invalid("minimizer tolerances must be non-negative and epsilon positive".to_string());
        }
        if m.sigma_clip.is_some_and(|k| !(k > 0.0)) {
            return invalid("minimizer sigma_clip must be positive".to_string());
        }
        Ok(())
    }
}

/// Serialized form of a [`ChromaticPsf`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChromaticPsfRecord {
    pub kind: PsfKind,
    pub nx: usize,
    pub ny: usize,
    pub degree: usize,
    #[serde(default)]
    pub degrees: BTreeMap<String, usize>,
    pub saturation: f64,
    pub poly_params: Vec<f64>,
}

impl ChromaticPsfRecord {
    pub fn from_psf(psf: &ChromaticPsf) -> Self {
        Self {
            kind: psf.psf().kind(),
            nx: psf.nx(),
            ny: psf.ny(),
            degree: psf.degree(),
            degrees: psf.degree_overrides().clone(),
            saturation: psf.saturation(),
            poly_params: psf.poly_params.to_vec(),
        }
    }

    pub fn into_psf(self) -> Result<ChromaticPsf, ModelError> {
        let mut psf = ChromaticPsf::new(
            self.kind,
            self.nx,
            self.ny,
            self.degree,
            self.degrees,
            self.saturation,
        )?;
        psf.set_poly_params(PolyParams(Array1::from(self.poly_params)))?;
        Ok(psf)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Writes a profile table as CSV with a header of column names.
pub fn save_profile_table(table: &ProfileTable, path: &Path) -> Result<(), ModelError> {
    let mut writer = csv::Writer::from_path(path)?;
    let header = table
        .param_names
        .iter()
        .map(String::as_str)
        .chain(DESCRIPTOR_COLUMNS);
    writer.write_record(header)?;
    let descriptors = internal::descriptor_columns(table);
    for (x, params) in table.params.rows().into_iter().enumerate() {
        let record = params
            .iter()
            .copied()
            .chain(descriptors.iter().map(|column| column[x]))
            .map(|v| v.to_string());
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a profile table written by [`save_profile_table`] for the given PSF family.
pub fn load_profile_table(path: &Path, kind: PsfKind) -> Result<ProfileTable, ModelError> {
    let psf = Psf::new(kind);
    let expected: Vec<String> = psf
        .param_names()
        .into_iter()
        .chain(DESCRIPTOR_COLUMNS)
        .map(str::to_string)
        .collect();
    let mut reader = csv::Reader::from_path(path)?;
    let found: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if found != expected {
        return Err(ModelError::HeaderMismatch { kind, found });
    }

    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let values = record?
            .iter()
            .map(|field| {
                field.trim().parse::<f64>().map_err(|_| ModelError::ParseError {
                    row,
                    value: field.to_string(),
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        rows.push(values);
    }

    let n_params = psf.n_params();
    let params = Array2::from_shape_fn((rows.len(), n_params), |(x, k)| rows[x][k]);
    let column = |j: usize| -> Array1<f64> { rows.iter().map(|r| r[n_params + j]).collect() };
    let mut table = ProfileTable::new(
        psf.param_names().into_iter().map(str::to_string).collect(),
        ProfileParams(params),
    );
    table.flux_sum = column(0);
    table.flux_integral = column(1);
    table.flux_err = column(2);
    table.fwhm = column(3);
    table.dx = column(4);
    table.dy = column(5);
    table.dy_fwhm_inf = column(6);
    table.dy_fwhm_sup = column(7);
    Ok(table)
}

mod internal {
    use super::*;

    /// Descriptor columns in [`DESCRIPTOR_COLUMNS`] order.
    pub(super) fn descriptor_columns(table: &ProfileTable) -> [&Array1<f64>; 8] {
        [
            &table.flux_sum,
            &table.flux_integral,
            &table.flux_err,
            &table.fwhm,
            &table.dx,
            &table.dy,
            &table.dy_fwhm_inf,
            &table.dy_fwhm_sup,
        ]
    }
}
