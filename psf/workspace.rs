//! Fit problems handed to the [`Minimizer`](crate::fitter::Minimizer).
//!
//! [`PsfFitWorkspace`] fits a single PSF to a transverse slice or a small image,
//! [`ChromaticFitWorkspace`] fits the Legendre shape coefficients of a chromatic
//! PSF to a whole spectrogram. Both eliminate amplitudes linearly at every
//! evaluation.

use crate::amplitude::{AmplitudePrior, AmplitudeSolution, AmplitudeSolver, DesignMatrix};
use crate::chromatic::{ChromaticPsf, FitGeometry};
use crate::data::{BackgroundModel, DataError, Spectrogram, background_noise_level, median_error};
use crate::estimate::EstimationError;
use crate::fitter::{FitError, FitProblem, FitState};
use crate::model::FitConfig;
use crate::shape::{ParamRole, Pixels, Psf};
use crate::types::{PixelMask, PolyParams, ProfileParams};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};

/// One PSF against one set of pixels; amplitude is linear, `x_mean` and saturation are held.
#[derive(Debug, Clone)]
pub struct PsfFitWorkspace {
    psf: Psf,
    pixels: Pixels,
    data: Array1<f64>,
    errors: Array1<f64>,
    bounds: Vec<(f64, f64)>,
    fixed: Vec<bool>,
    solver: AmplitudeSolver,
}

impl PsfFitWorkspace {
    pub fn new(
        psf: Psf,
        pixels: Pixels,
        data: Array1<f64>,
        errors: Array1<f64>,
    ) -> Result<Self, EstimationError> {
        if data.len() != pixels.len() || errors.len() != pixels.len() {
            return Err(DataError::ShapeMismatch {
                data: vec![data.len()],
                errors: vec![errors.len()],
            }
            .into());
        }
        let bounds = psf.bounds_hard().to_vec();
        let fixed = psf
            .descriptors()
            .iter()
            .map(|d| {
                matches!(
                    d.role,
                    ParamRole::Amplitude | ParamRole::DispersionPosition | ParamRole::Saturation
                )
            })
            .collect();
        let noise = median_error(errors.view().insert_axis(Axis(1)));
        Ok(Self {
            solver: AmplitudeSolver::new(AmplitudePrior::NoPrior, noise),
            psf,
            pixels,
            data,
            errors,
            bounds,
            fixed,
        })
    }

    /// Overrides the hard bounds of parameter `index`.
    pub fn with_bounds(mut self, index: usize, bounds: (f64, f64)) -> Self {
        if let Some(b) = self.bounds.get_mut(index) {
            *b = bounds;
        }
        self
    }

    pub fn psf(&self) -> &Psf {
        &self.psf
    }

    /// Fitted parameters with the linear amplitude written back.
    pub fn params_with_amplitude(&self, params: ArrayView1<f64>, state: &FitState) -> Array1<f64> {
        let mut full = params.to_owned();
        if let Some(solution) = &state.amplitudes {
            full[0] = solution.amplitudes[0];
        }
        full
    }
}

impl FitProblem for PsfFitWorkspace {
    fn n_params(&self) -> usize {
        self.psf.n_params()
    }

    fn data(&self) -> ArrayView1<'_, f64> {
        self.data.view()
    }

    fn errors(&self) -> ArrayView1<'_, f64> {
        self.errors.view()
    }

    fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    fn fixed(&self) -> &[bool] {
        &self.fixed
    }

    fn evaluate(&self, params: ArrayView1<f64>, mask: &PixelMask) -> Result<FitState, FitError> {
        let mut unit = params.to_owned();
        unit[0] = 1.0;
        let last = unit.len() - 1;
        let saturation = params[last];
        unit[last] = f64::INFINITY;
        let shape = self.psf.evaluate(&self.pixels, unit.view())?;

        let design = DesignMatrix::Columns(shape.clone().insert_axis(Axis(1)));
        let weights = internal::inverse_variances(self.errors.view(), mask).insert_axis(Axis(1));
        let solution = self.solver.solve(
            &design,
            self.data.view().insert_axis(Axis(1)),
            weights.view(),
        )?;
        let amplitude = solution.amplitudes[0];
        Ok(FitState {
            model: shape.mapv(|v| (amplitude * v).min(saturation)),
            amplitudes: Some(solution),
            penalty: 0.0,
        })
    }
}

/// Legendre shape coefficients of a chromatic PSF against a spectrogram.
///
/// Parameters are the shape block of the polynomial vector; `x_mean` and
/// saturation coefficients are fixed and amplitudes come from the
/// [`AmplitudeSolver`] at every evaluation.
#[derive(Debug, Clone)]
pub struct ChromaticFitWorkspace {
    chromatic: ChromaticPsf,
    geometry: FitGeometry,
    data: Array2<f64>,
    errors: Array2<f64>,
    flat_data: Array1<f64>,
    flat_errors: Array1<f64>,
    footprint: PixelMask,
    solver: AmplitudeSolver,
    bounds: Vec<(f64, f64)>,
    fixed: Vec<bool>,
    bound_penalty: bool,
    noise_level: f64,
    row_offset: usize,
    initial: Array1<f64>,
}

impl ChromaticFitWorkspace {
    /// Prepares a fit of `chromatic` (whose polynomial vector is the starting point) to `spectrogram`.
    ///
    /// `reference` feeds the `psf1d` and `fixed` amplitude priors.
    pub fn new(
        chromatic: &ChromaticPsf,
        spectrogram: &Spectrogram,
        background: Option<&dyn BackgroundModel>,
        config: &FitConfig,
        reference: Option<Array1<f64>>,
    ) -> Result<Self, EstimationError> {
        let (nx, ny) = (spectrogram.nx(), spectrogram.ny());
        config.validate(nx, ny)?;
        if chromatic.nx() != nx || chromatic.ny() != ny {
            return Err(EstimationError::InvalidConfiguration(format!(
                "chromatic PSF is {} x {} but the spectrogram is {nx} x {ny}",
                chromatic.nx(),
                chromatic.ny()
            )));
        }

        let mut image = spectrogram.clone();
        let noise_level = match background {
            Some(b) => {
                image.subtract_background(b);
                background_noise_level(b, nx, ny)
            }
            None => median_error(spectrogram.errors.view()),
        };

        let (row_offset, image, fit_psf) = match config.crop_rows {
            Some((start, end)) => {
                let cropped = image.crop_rows(start, end)?;
                let mut poly = chromatic.poly_params.clone();
                if let Some(k) = chromatic.y_mean_constant_index() {
                    poly[nx + k] -= start as f64;
                }
                let mut resized = chromatic.with_rows(cropped.ny())?;
                resized.set_poly_params(poly)?;
                (start, cropped, resized)
            }
            None => (0, image, chromatic.clone()),
        };

        let (_, shape) = fit_psf.layout().split(fit_psf.poly_params.view())?;
        let initial = shape.to_owned();

        let mut solver = AmplitudeSolver::new(config.prior, noise_level);
        if let Some(reference) = reference {
            solver = solver.with_reference(reference);
        }
        if config.prior == AmplitudePrior::Psf1d {
            solver = solver.with_regularization(config.reg_param, image.errors.view())?;
        }
        solver.validate(nx)?;

        let footprint = if config.mask_psf_footprint {
            let profile = fit_psf.column_profile(initial.view())?;
            internal::footprint_mask(&fit_psf, &profile, config.footprint_fwhm_clip)
        } else {
            PixelMask::none(nx * image.ny())
        };
        if config.mask_psf_footprint {
            log::info!(
                "PSF footprint mask excludes {} of {} pixels.",
                footprint.count(),
                footprint.len()
            );
        }

        Ok(Self {
            bounds: fit_psf.poly_bounds(),
            fixed: fit_psf.fixed_poly_params(),
            flat_data: image.data.iter().copied().collect(),
            flat_errors: image.errors.iter().copied().collect(),
            data: image.data,
            errors: image.errors,
            chromatic: fit_psf,
            geometry: config.geometry,
            footprint,
            solver,
            bound_penalty: config.bound_penalty,
            noise_level,
            row_offset,
            initial,
        })
    }

    /// Starting shape coefficients, in the cropped frame.
    pub fn initial_params(&self) -> ArrayView1<'_, f64> {
        self.initial.view()
    }

    pub fn chromatic(&self) -> &ChromaticPsf {
        &self.chromatic
    }

    pub fn noise_level(&self) -> f64 {
        self.noise_level
    }

    /// First image row of the fitted region.
    pub fn row_offset(&self) -> usize {
        self.row_offset
    }

    /// Full polynomial vector in the uncropped frame from fitted shape coefficients and amplitudes.
    pub fn full_poly(&self, params: ArrayView1<f64>, amplitudes: ArrayView1<f64>) -> PolyParams {
        let nx = self.chromatic.nx();
        let mut poly = Array1::zeros(nx + params.len());
        poly.slice_mut(s![..nx]).assign(&amplitudes);
        poly.slice_mut(s![nx..]).assign(&params);
        if let Some(k) = self.chromatic.y_mean_constant_index() {
            poly[nx + k] += self.row_offset as f64;
        }
        PolyParams(poly)
    }

    /// Noiseless model image of the fitted region.
    pub fn model_image(&self, state: &FitState) -> Array2<f64> {
        let (ny, nx) = self.data.dim();
        Array2::from_shape_fn((ny, nx), |(y, x)| state.model[y * nx + x])
    }

    /// Residuals in units of the pixel error; zero where the error is infinite.
    pub fn normalized_residuals(&self, state: &FitState) -> Array2<f64> {
        let model = self.model_image(state);
        let mut residuals = &self.data - &model;
        residuals.zip_mut_with(&self.errors, |r, &e| {
            *r = if e.is_finite() { *r / e } else { 0.0 }
        });
        residuals
    }

    fn solve_amplitudes(
        &self,
        profile: &ProfileParams,
        mask: &PixelMask,
    ) -> Result<(DesignMatrix, AmplitudeSolution), FitError> {
        let design = self.chromatic.unit_design(profile, self.geometry);
        let (ny, nx) = self.data.dim();
        let flat = internal::inverse_variances(self.flat_errors.view(), mask);
        let weights = Array2::from_shape_fn((ny, nx), |(y, x)| flat[y * nx + x]);
        let solution = self.solver.solve(&design, self.data.view(), weights.view())?;
        Ok((design, solution))
    }
}

impl FitProblem for ChromaticFitWorkspace {
    fn n_params(&self) -> usize {
        self.initial.len()
    }

    fn data(&self) -> ArrayView1<'_, f64> {
        self.flat_data.view()
    }

    fn errors(&self) -> ArrayView1<'_, f64> {
        self.flat_errors.view()
    }

    fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    fn fixed(&self) -> &[bool] {
        &self.fixed
    }

    fn base_mask(&self) -> PixelMask {
        self.footprint.clone()
    }

    fn evaluate(&self, params: ArrayView1<f64>, mask: &PixelMask) -> Result<FitState, FitError> {
        let profile = self.chromatic.column_profile(params)?;
        let (design, solution) = self.solve_amplitudes(&profile, mask)?;
        let saturation = self.chromatic.saturation();
        let model = design
            .apply(solution.amplitudes.view())
            .iter()
            .map(|&v| v.min(saturation))
            .collect();
        let penalty = if self.bound_penalty {
            let nx = self.chromatic.nx();
            let mut poly = Array1::zeros(nx + params.len());
            poly.slice_mut(s![..nx]).assign(&solution.amplitudes);
            poly.slice_mut(s![nx..]).assign(&params);
            self.chromatic
                .check_bounds(poly.view(), self.noise_level)?
                .penalty
        } else {
            0.0
        };
        Ok(FitState {
            model,
            amplitudes: Some(solution),
            penalty,
        })
    }
}

mod internal {
    use super::*;

    /// `1 / err^2`, zero for masked pixels and infinite errors.
    pub(super) fn inverse_variances(errors: ArrayView1<f64>, mask: &PixelMask) -> Array1<f64> {
        errors
            .iter()
            .zip(mask.iter())
            .map(|(&e, &masked)| {
                let w = 1.0 / (e * e);
                if masked || !w.is_finite() { 0.0 } else { w }
            })
            .collect()
    }

    /// Pixels farther than `clip` FWHM from the center of their column, after
    /// dilating the kept region by a box of 3 rows and `nx / 10` columns.
    pub(super) fn footprint_mask(chromatic: &ChromaticPsf, profile: &ProfileParams, clip: f64) -> PixelMask {
        let (ny, nx) = (chromatic.ny(), chromatic.nx());
        let psf = chromatic.psf();
        let mut inside = Array2::from_elem((ny, nx), false);
        for (x, p) in profile.axis_iter(Axis(0)).enumerate() {
            let reach = clip * psf.fwhm(p);
            let center = p[2];
            for y in 0..ny {
                if (y as f64 - center).abs() <= reach {
                    inside[[y, x]] = true;
                }
            }
        }

        let half_width = (nx / 10).max(1) / 2;
        let dilated = Array2::from_shape_fn((ny, nx), |(y, x)| {
            let rows = y.saturating_sub(1)..=(y + 1).min(ny - 1);
            let cols = x.saturating_sub(half_width)..=(x + half_width).min(nx - 1);
            inside
                .slice(s![rows, cols])
                .iter()
                .any(|&kept| kept)
        });
        PixelMask(dilated.iter().map(|&kept| !kept).collect())
    }
}
