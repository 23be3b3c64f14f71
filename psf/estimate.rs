//! # Chromatic PSF Estimation
//!
//! Top-level entry point that ties the pieces together:
//!
//! 1. A transverse pre-fit of every `pixel_step`-th column gives a first profile table.
//! 2. The table is compressed into Legendre coefficients, weighted by amplitude.
//! 3. The shape coefficients are refined against the whole spectrogram while the
//!    per-column amplitudes are solved linearly at every step, with optional
//!    sigma clipping between minimization segments.

use crate::amplitude::AmplitudeError;
use crate::basis::BasisError;
use crate::chromatic::{ChromaticPsf, LayoutError, ProfileTable};
use crate::data::{BackgroundModel, DataError, Spectrogram};
use crate::fitter::{FitError, FitObserver, FitStatus, Minimizer, NoObserver};
use crate::model::{FitConfig, ModelError};
use crate::shape::ShapeError;
use crate::transverse::{TransverseFit, fit_transverse};
use crate::types::{PixelMask, PolyParams};
use crate::workspace::ChromaticFitWorkspace;
use ndarray::{Array1, Array2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    DataError(#[from] DataError),

    #[error(transparent)]
    LayoutError(#[from] LayoutError),

    #[error(transparent)]
    ShapeError(#[from] ShapeError),

    #[error(transparent)]
    BasisError(#[from] BasisError),

    #[error(transparent)]
    FitError(#[from] FitError),

    #[error(transparent)]
    AmplitudeError(AmplitudeError),

    #[error(transparent)]
    ModelError(ModelError),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<AmplitudeError> for EstimationError {
    fn from(e: AmplitudeError) -> Self {
        match e {
            AmplitudeError::UnknownPrior(_)
            | AmplitudeError::MissingReference(_)
            | AmplitudeError::MissingRegularization
            | AmplitudeError::InvalidRegularization(_)
            | AmplitudeError::ReferenceLength { .. } => {
                EstimationError::InvalidConfiguration(e.to_string())
            }
            other => EstimationError::AmplitudeError(other),
        }
    }
}

impl From<ModelError> for EstimationError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::InvalidConfiguration(msg) => EstimationError::InvalidConfiguration(msg),
            ModelError::Layout(layout) => EstimationError::LayoutError(layout),
            other => EstimationError::ModelError(other),
        }
    }
}

/// Everything a chromatic fit produces.
#[derive(Debug, Clone)]
pub struct ChromaticFit {
    /// Fitted model; its polynomial vector and table are in image coordinates.
    pub psf: ChromaticPsf,
    pub poly_params: PolyParams,
    pub table: ProfileTable,
    pub amplitudes: Array1<f64>,
    pub amplitude_errors: Array1<f64>,
    /// Amplitude covariance, `(Nx, Nx)`.
    pub covariance: Array2<f64>,
    /// Covariance of the shape coefficients, when the normal matrix is invertible.
    pub param_covariance: Option<Array2<f64>>,
    pub chi2: f64,
    pub history: Vec<f64>,
    pub segments: Vec<usize>,
    pub status: FitStatus,
    /// Rejected pixels over the fitted rows, flattened row-major.
    pub outliers: PixelMask,
    /// First image row of the fitted region.
    pub row_offset: usize,
    pub transverse: TransverseFit,
}

pub fn fit_chromatic_psf(
    spectrogram: &Spectrogram,
    background: Option<&dyn BackgroundModel>,
    config: &FitConfig,
) -> Result<ChromaticFit, EstimationError> {
    fit_chromatic_psf_observed(spectrogram, background, config, &mut NoObserver)
}

/// Like [`fit_chromatic_psf`], reporting every accepted iteration to `observer`.
pub fn fit_chromatic_psf_observed(
    spectrogram: &Spectrogram,
    background: Option<&dyn BackgroundModel>,
    config: &FitConfig,
    observer: &mut dyn FitObserver,
) -> Result<ChromaticFit, EstimationError> {
    let (nx, ny) = (spectrogram.nx(), spectrogram.ny());
    config.validate(nx, ny)?;
    log::info!(
        "Fitting a {} chromatic PSF of degree {} to a {ny} x {nx} spectrogram ({} prior, {} geometry).",
        config.psf_kind,
        config.degree,
        config.prior,
        config.geometry
    );

    // 1. Transverse pre-fit.
    let transverse = fit_transverse(spectrogram, background, config.psf_kind, &config.transverse)?;
    let saturation = config.saturation.unwrap_or(transverse.saturation);

    // 2. Compress into Legendre coefficients.
    let mut chromatic = ChromaticPsf::new(
        config.psf_kind,
        nx,
        ny,
        config.degree,
        config.degrees.clone(),
        saturation,
    )?;
    let mut seed_profile = transverse.table.params.clone();
    let last = seed_profile.ncols() - 1;
    seed_profile.column_mut(last).fill(saturation);
    let poly = chromatic.to_poly(&seed_profile)?;
    chromatic.set_poly_params(poly)?;

    let reference = config
        .reference_amplitudes
        .as_ref()
        .map(|r| Array1::from(r.clone()))
        .unwrap_or_else(|| transverse.table.params.column(0).to_owned());

    // 3. Global fit.
    let workspace =
        ChromaticFitWorkspace::new(&chromatic, spectrogram, background, config, Some(reference))?;
    let result = Minimizer::new(config.minimizer.clone()).minimize_observed(
        &workspace,
        workspace.initial_params(),
        observer,
    )?;
    let Some(solution) = result.state.amplitudes.clone() else {
        return Err(EstimationError::InternalError(
            "chromatic evaluation returned no amplitudes".to_string(),
        ));
    };

    let poly = workspace.full_poly(result.params.view(), solution.amplitudes.view());
    chromatic.set_poly_params(poly.clone())?;
    let amplitude_errors = solution.errors();
    chromatic.table.flux_sum = solution.amplitudes.clone();
    chromatic.table.flux_err = amplitude_errors.clone();

    let valid = result.mask.len() - result.mask.count();
    log::info!(
        "Chromatic fit {}: chi2 = {:.4e} over {valid} pixels ({:.3} per pixel), {} outliers, {} iterations.",
        result.status,
        result.chi2,
        result.chi2 / valid.max(1) as f64,
        result.outliers.count(),
        result.iterations
    );
    if result.status == FitStatus::Diverged {
        log::warn!("Chromatic fit diverged; returning the last valid parameters.");
    }

    let covariance = solution.covariance();
    Ok(ChromaticFit {
        table: chromatic.table.clone(),
        psf: chromatic,
        poly_params: poly,
        amplitudes: solution.amplitudes,
        amplitude_errors,
        covariance,
        param_covariance: result.covariance,
        chi2: result.chi2,
        history: result.history,
        segments: result.segments,
        status: result.status,
        outliers: result.outliers,
        row_offset: workspace.row_offset(),
        transverse,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amplitude::AmplitudePrior;

    #[test]
    fn configuration_errors_surface_before_fitting() {
        let image = Spectrogram::new(Array2::ones((10, 8)), Array2::ones((10, 8)), None).unwrap();
        let config = FitConfig {
            degree: 8,
            ..FitConfig::default()
        };
        assert!(matches!(
            fit_chromatic_psf(&image, None, &config),
            Err(EstimationError::InvalidConfiguration(_))
        ));

        let config = FitConfig {
            prior: AmplitudePrior::Fixed,
            reference_amplitudes: Some(vec![1.0; 3]),
            ..FitConfig::default()
        };
        assert!(matches!(
            fit_chromatic_psf(&image, None, &config),
            Err(EstimationError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn amplitude_configuration_errors_are_classified() {
        let e: EstimationError = AmplitudeError::MissingRegularization.into();
        assert!(matches!(e, EstimationError::InvalidConfiguration(_)));
        let e: EstimationError = ModelError::InvalidConfiguration("x".to_string()).into();
        assert!(matches!(e, EstimationError::InvalidConfiguration(_)));
    }
}
