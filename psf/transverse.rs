//! Column-by-column transverse pre-fit.
//!
//! Every `pixel_step`-th column is fitted on its own with a single PSF; the
//! remaining columns are interpolated. The resulting profile table seeds the
//! chromatic fit.

use crate::basis::CubicSpline;
use crate::chromatic::ProfileTable;
use crate::data::{BackgroundModel, Spectrogram};
use crate::estimate::EstimationError;
use crate::fitter::{FitError, Minimizer, MinimizerOptions};
use crate::model::TransverseConfig;
use crate::shape::{Pixels, Psf, PsfKind};
use crate::types::ProfileParams;
use crate::workspace::PsfFitWorkspace;
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis, s};
use rayon::prelude::*;

/// Output of [`fit_transverse`].
#[derive(Debug, Clone)]
pub struct TransverseFit {
    /// One row per column; skipped columns are interpolated.
    pub table: ProfileTable,
    /// Columns actually fitted, in visiting order.
    pub fitted_columns: Vec<usize>,
    pub saturation: f64,
}

/// Columns visited starting at `start`: rightwards by `step` up to `nx - 1`,
/// then leftwards from `start` down to `0`. Both ends are always included.
pub fn visiting_order(start: usize, nx: usize, step: usize) -> Vec<usize> {
    if nx == 0 {
        return Vec::new();
    }
    let step = step.max(1);
    let start = start.min(nx - 1);
    let mut order: Vec<usize> = (start..nx).step_by(step).collect();
    if order.last() != Some(&(nx - 1)) {
        order.push(nx - 1);
    }
    let mut left: Vec<usize> = (0..start).rev().skip(step - 1).step_by(step).collect();
    if start > 0 && left.last() != Some(&0) {
        left.push(0);
    }
    order.extend(left);
    order
}

/// Fits every visited column of `spectrogram` with a single `kind` PSF.
pub fn fit_transverse(
    spectrogram: &Spectrogram,
    background: Option<&dyn BackgroundModel>,
    kind: PsfKind,
    config: &TransverseConfig,
) -> Result<TransverseFit, EstimationError> {
    if config.pixel_step == 0 {
        return Err(EstimationError::InvalidConfiguration(
            "transverse pixel_step must be at least 1".to_string(),
        ));
    }
    let (nx, ny) = (spectrogram.nx(), spectrogram.ny());
    let saturation = spectrogram.saturation();
    let mut image = spectrogram.clone();
    if let Some(b) = background {
        image.subtract_background(b);
    }

    let middle = ny / 2;
    let band = middle.saturating_sub(config.background_half_width)
        ..(middle + config.background_half_width).min(ny).max(middle + 1);
    let start = image
        .data
        .slice(s![band, ..])
        .sum_axis(Axis(0))
        .iter()
        .position_max_by(|a, b| a.total_cmp(b))
        .unwrap_or(0);
    let order = visiting_order(start, nx, config.pixel_step);

    let mut psf = Psf::new(kind);
    psf.apply_max_width_to_bounds(ny as f64 / 2.0);
    let mut guess = psf.default_params();
    guess[2] = middle as f64;
    let last = guess.len() - 1;
    guess[last] = saturation;
    let center_bounds = (
        middle as f64 - config.signal_half_width as f64,
        middle as f64 + config.signal_half_width as f64,
    );
    let options = MinimizerOptions {
        sigma_clip: Some(config.sigma_clip),
        max_clip_rounds: config.clip_rounds,
        ..MinimizerOptions::default()
    };

    let fits = order
        .par_iter()
        .map(|&x| internal::fit_column(&image, &psf, guess.clone(), x, center_bounds, &options))
        .collect::<Result<Vec<_>, _>>()?;

    let n_params = psf.n_params();
    let mut params = Array2::zeros((nx, n_params));
    let mut flux_sum = Array1::zeros(nx);
    let mut flux_err = Array1::zeros(nx);
    let fitted: Vec<(usize, internal::ColumnFit)> = order.iter().copied().zip(fits).sorted_by_key(|(x, _)| *x).collect();
    let knots: Array1<f64> = fitted.iter().map(|(x, _)| *x as f64).collect();
    let targets: Array1<f64> = Array1::range(0.0, nx as f64, 1.0);

    for k in 0..n_params {
        let values: Array1<f64> = fitted.iter().map(|(_, f)| f.params[k]).collect();
        params
            .column_mut(k)
            .assign(&internal::interpolate(&knots, &values, &targets)?);
    }
    let sums: Array1<f64> = fitted.iter().map(|(_, f)| f.flux_sum).collect();
    flux_sum.assign(&internal::interpolate(&knots, &sums, &targets)?);
    let errs: Array1<f64> = fitted.iter().map(|(_, f)| f.flux_err).collect();
    flux_err.assign(&internal::interpolate(&knots, &errs, &targets)?);

    params.column_mut(1).assign(&targets);
    params.column_mut(last).fill(saturation);
    for (x, fit) in &fitted {
        params.row_mut(*x).assign(&fit.params);
    }

    let names = psf.param_names().iter().map(|n| n.to_string()).collect();
    let mut table = ProfileTable::new(names, ProfileParams(params));
    table.flux_sum = flux_sum;
    table.flux_err = flux_err;
    let rows = Array1::range(0.0, ny as f64, 1.0);
    table.fill_shape_descriptors(&psf, rows.view(), (0.0, middle as f64));

    log::info!(
        "Transverse fit: {} of {nx} columns fitted starting at column {start}, the rest interpolated.",
        order.len()
    );
    Ok(TransverseFit {
        table,
        fitted_columns: order,
        saturation,
    })
}

mod internal {
    use super::*;

    #[derive(Debug, Clone)]
    pub(super) struct ColumnFit {
        pub(super) params: Array1<f64>,
        pub(super) flux_sum: f64,
        pub(super) flux_err: f64,
    }

    pub(super) fn fit_column(
        image: &Spectrogram,
        psf: &Psf,
        mut guess: Array1<f64>,
        x: usize,
        center_bounds: (f64, f64),
        options: &MinimizerOptions,
    ) -> Result<ColumnFit, EstimationError> {
        let data = image.data.column(x).to_owned();
        let errors = image.errors.column(x).to_owned();
        let flux_sum: f64 = data
            .iter()
            .zip(errors.iter())
            .filter(|(d, e)| d.is_finite() && e.is_finite())
            .map(|(d, _)| d)
            .sum();
        let flux_err = errors
            .iter()
            .filter(|e| e.is_finite())
            .map(|e| e * e)
            .sum::<f64>()
            .sqrt();
        guess[0] = flux_sum;
        guess[1] = x as f64;

        let rows = Array1::range(0.0, data.len() as f64, 1.0);
        let workspace = PsfFitWorkspace::new(psf.clone(), Pixels::Transverse(rows), data, errors)?
            .with_bounds(2, center_bounds);
        let params = match Minimizer::new(options.clone()).minimize(&workspace, guess.view()) {
            Ok(result) => workspace.params_with_amplitude(result.params.view(), &result.state),
            Err(FitError::NoValidPixels) => {
                log::warn!("Column {x} has no usable pixel; keeping the initial guess.");
                guess[0] = 0.0;
                guess
            }
            Err(e) => return Err(e.into()),
        };
        log::debug!("Column {x}: center {:.3}, amplitude {:.3e}.", params[2], params[0]);
        Ok(ColumnFit {
            params,
            flux_sum,
            flux_err,
        })
    }

    /// Natural cubic spline through the knots, or linear interpolation with fewer than 3 knots.
    pub(super) fn interpolate(
        knots: &Array1<f64>,
        values: &Array1<f64>,
        targets: &Array1<f64>,
    ) -> Result<Array1<f64>, EstimationError> {
        match knots.len() {
            0 => Ok(Array1::zeros(targets.len())),
            1 => Ok(Array1::from_elem(targets.len(), values[0])),
            2 => {
                let (x0, x1) = (knots[0], knots[1]);
                Ok(targets.mapv(|t| {
                    let u = ((t - x0) / (x1 - x0)).clamp(0.0, 1.0);
                    values[0] + u * (values[1] - values[0])
                }))
            }
            _ => Ok(CubicSpline::natural(knots.view(), values.view())?.evaluate_many(targets.view())),
        }
    }
}
