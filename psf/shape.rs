//! Parametric PSF shape families.
//!
//! Every family shares the same parameter skeleton: `amplitude`, `x_mean`,
//! `y_mean` first and `saturation` last, with the family-specific width and
//! mixing parameters in between. Profiles integrate to `amplitude` and are
//! clipped to `[0, saturation]`.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShapeError {
    #[error("The {kind} PSF model expects {expected} parameters but {got} were given.")]
    ParameterCount {
        kind: PsfKind,
        expected: usize,
        got: usize,
    },

    #[error("Unknown PSF model '{0}'. Expected one of: moffat, moffatgauss, gauss.")]
    UnknownKind(String),

    #[error("The {kind} PSF model has no parameter named '{name}'.")]
    UnknownParameter { kind: PsfKind, name: String },
}

/// The closed set of supported shape families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsfKind {
    Moffat,
    MoffatGauss,
    Gauss,
}

impl fmt::Display for PsfKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PsfKind::Moffat => "moffat",
            PsfKind::MoffatGauss => "moffatgauss",
            PsfKind::Gauss => "gauss",
        };
        f.write_str(name)
    }
}

impl FromStr for PsfKind {
    type Err = ShapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "moffat" => Ok(PsfKind::Moffat),
            "moffatgauss" => Ok(PsfKind::MoffatGauss),
            "gauss" => Ok(PsfKind::Gauss),
            other => Err(ShapeError::UnknownKind(other.to_string())),
        }
    }
}

/// What a parameter means for the chromatic machinery built on top of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Integrated flux; solved linearly, never polynomial.
    Amplitude,
    /// Position along the dispersion axis.
    DispersionPosition,
    /// Position across the dispersion axis.
    TransversePosition,
    /// Width, exponent or mixing fraction.
    Shape,
    /// Detector saturation level; a single constant across columns.
    Saturation,
}

/// Static description of one PSF parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamDescriptor {
    pub name: &'static str,
    pub role: ParamRole,
    pub default: f64,
    pub bounds: (f64, f64),
    /// Upper bound shrinks to the usable transverse half-width.
    pub width_bounded: bool,
}

impl ParamDescriptor {
    const fn new(name: &'static str, role: ParamRole, default: f64, bounds: (f64, f64)) -> Self {
        Self {
            name,
            role,
            default,
            bounds,
            width_bounded: false,
        }
    }

    const fn width(name: &'static str, default: f64) -> Self {
        Self {
            name,
            role: ParamRole::Shape,
            default,
            bounds: (0.1, f64::INFINITY),
            width_bounded: true,
        }
    }

    /// Soft-bound violations of this parameter contribute to the bound penalty.
    pub fn is_penalized(&self) -> bool {
        !matches!(self.role, ParamRole::Amplitude | ParamRole::Saturation)
    }

    /// Held constant by the chromatic fit (the column grid fixes `x_mean`).
    pub fn is_fixed_in_chromatic_fit(&self) -> bool {
        matches!(
            self.role,
            ParamRole::DispersionPosition | ParamRole::Saturation
        )
    }
}

const INF: f64 = f64::INFINITY;

const AMPLITUDE: ParamDescriptor =
    ParamDescriptor::new("amplitude", ParamRole::Amplitude, 1.0, (0.0, INF));
const X_MEAN: ParamDescriptor =
    ParamDescriptor::new("x_mean", ParamRole::DispersionPosition, 0.0, (-INF, INF));
const Y_MEAN: ParamDescriptor =
    ParamDescriptor::new("y_mean", ParamRole::TransversePosition, 0.0, (-INF, INF));
const ALPHA: ParamDescriptor = ParamDescriptor::new("alpha", ParamRole::Shape, 2.0, (1.1, 10.0));
const ETA_GAUSS: ParamDescriptor =
    ParamDescriptor::new("eta_gauss", ParamRole::Shape, 0.0, (-1.0, 0.0));
const SATURATION: ParamDescriptor =
    ParamDescriptor::new("saturation", ParamRole::Saturation, 1.0, (0.0, INF));

const MOFFAT_PARAMS: [ParamDescriptor; 6] = [
    AMPLITUDE,
    X_MEAN,
    Y_MEAN,
    ParamDescriptor::width("gamma", 3.0),
    ALPHA,
    SATURATION,
];

const MOFFAT_GAUSS_PARAMS: [ParamDescriptor; 8] = [
    AMPLITUDE,
    X_MEAN,
    Y_MEAN,
    ParamDescriptor::width("gamma", 3.0),
    ALPHA,
    ETA_GAUSS,
    ParamDescriptor::width("stddev", 1.0),
    SATURATION,
];

const GAUSS_PARAMS: [ParamDescriptor; 5] = [
    AMPLITUDE,
    X_MEAN,
    Y_MEAN,
    ParamDescriptor::width("stddev", 1.0),
    SATURATION,
];

impl PsfKind {
    pub fn descriptors(self) -> &'static [ParamDescriptor] {
        match self {
            PsfKind::Moffat => &MOFFAT_PARAMS,
            PsfKind::MoffatGauss => &MOFFAT_GAUSS_PARAMS,
            PsfKind::Gauss => &GAUSS_PARAMS,
        }
    }
}

/// Coordinates at which a PSF is evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    /// Transverse (row) coordinates of a single column.
    Transverse(Array1<f64>),
    /// Integer pixel grid of `ny` rows by `nx` columns, flattened row-major.
    Grid { nx: usize, ny: usize },
}

impl Pixels {
    /// Rows `0..ny` of a single column.
    pub fn rows(ny: usize) -> Self {
        Pixels::Transverse(Array1::range(0.0, ny as f64, 1.0))
    }

    pub fn len(&self) -> usize {
        match self {
            Pixels::Transverse(rows) => rows.len(),
            Pixels::Grid { nx, ny } => nx * ny,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A PSF shape family together with its current bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Psf {
    kind: PsfKind,
    bounds_hard: Vec<(f64, f64)>,
    bounds_soft: Vec<(f64, f64)>,
    max_half_width: Option<f64>,
}

impl Psf {
    pub fn new(kind: PsfKind) -> Self {
        let bounds: Vec<(f64, f64)> = kind.descriptors().iter().map(|d| d.bounds).collect();
        Self {
            kind,
            bounds_hard: bounds.clone(),
            bounds_soft: bounds,
            max_half_width: None,
        }
    }

    pub fn kind(&self) -> PsfKind {
        self.kind
    }

    pub fn descriptors(&self) -> &'static [ParamDescriptor] {
        self.kind.descriptors()
    }

    pub fn n_params(&self) -> usize {
        self.descriptors().len()
    }

    pub fn param_names(&self) -> Vec<&'static str> {
        self.descriptors().iter().map(|d| d.name).collect()
    }

    pub fn index_of(&self, name: &str) -> Result<usize, ShapeError> {
        self.descriptors()
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| ShapeError::UnknownParameter {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    pub fn default_params(&self) -> Array1<f64> {
        self.descriptors().iter().map(|d| d.default).collect()
    }

    pub fn bounds_hard(&self) -> &[(f64, f64)] {
        &self.bounds_hard
    }

    pub fn bounds_soft(&self) -> &[(f64, f64)] {
        &self.bounds_soft
    }

    pub fn max_half_width(&self) -> Option<f64> {
        self.max_half_width
    }

    /// Restricts the transverse center to `(0, 2h)` and every width to `(0.1, h)`.
    ///
    /// Bounds are rebuilt from the family defaults, so calling this twice with
    /// the same `half_width` leaves them unchanged.
    pub fn apply_max_width_to_bounds(&mut self, half_width: f64) {
        for (k, d) in self.kind.descriptors().iter().enumerate() {
            let bounds = if d.role == ParamRole::TransversePosition {
                (0.0, 2.0 * half_width)
            } else if d.width_bounded {
                (d.bounds.0, half_width)
            } else {
                d.bounds
            };
            self.bounds_hard[k] = bounds;
            self.bounds_soft[k] = bounds;
        }
        self.max_half_width = Some(half_width);
    }

    fn check_len(&self, p: ArrayView1<f64>) -> Result<(), ShapeError> {
        if p.len() != self.n_params() {
            return Err(ShapeError::ParameterCount {
                kind: self.kind,
                expected: self.n_params(),
                got: p.len(),
            });
        }
        Ok(())
    }

    /// Evaluates the PSF at the given pixels. Grid output is flattened row-major.
    pub fn evaluate(&self, pixels: &Pixels, p: ArrayView1<f64>) -> Result<Array1<f64>, ShapeError> {
        self.check_len(p)?;
        Ok(match pixels {
            Pixels::Transverse(rows) => self.evaluate_transverse(rows.view(), p),
            Pixels::Grid { nx, ny } => {
                let (nx, ny) = (*nx, *ny);
                let grid = self.evaluate_grid(nx, ny, p);
                Array1::from_iter(grid)
            }
        })
    }

    /// Transverse profile of one column, normalized by a Riemann sum over `rows`.
    ///
    /// `p` must have [`Psf::n_params`] entries.
    pub fn evaluate_transverse(&self, rows: ArrayView1<f64>, p: ArrayView1<f64>) -> Array1<f64> {
        let amplitude = p[0];
        let center = p[2];
        let saturation = p[p.len() - 1];
        let step = if rows.len() > 1 {
            (rows[1] - rows[0]).abs()
        } else {
            1.0
        };

        let profile = internal::ProfileTerms::from_params(self.kind, p);
        let normalized = internal::riemann_normalized(&profile, rows, center, step)
            .or_else(|| {
                let fallback = profile.gaussian_fallback()?;
                log::warn!(
                    "{} profile is not finite for center {center:.3}; falling back to its Gaussian term.",
                    self.kind
                );
                internal::riemann_normalized(&fallback, rows, center, step)
            });

        match normalized {
            Some(shape) => shape.mapv(|v| (amplitude * v).max(0.0).min(saturation)),
            None => {
                log::warn!(
                    "{} profile could not be normalized for parameters {p}; returning zeros.",
                    self.kind
                );
                Array1::zeros(rows.len())
            }
        }
    }

    /// Two-dimensional PSF on an `ny` x `nx` integer grid with analytic normalization.
    pub fn evaluate_grid(&self, nx: usize, ny: usize, p: ArrayView1<f64>) -> Array2<f64> {
        let amplitude = p[0];
        let (x0, y0) = (p[1], p[2]);
        let saturation = p[p.len() - 1];

        let profile = internal::ProfileTerms::from_params(self.kind, p);
        let sampled = |terms: &internal::ProfileTerms| -> Option<Array2<f64>> {
            let norm = terms.plane_integral();
            if !(norm.is_finite() && norm > 0.0) {
                return None;
            }
            let values = Array2::from_shape_fn((ny, nx), |(y, x)| {
                let rr = (x as f64 - x0).powi(2) + (y as f64 - y0).powi(2);
                terms.value(rr) / norm
            });
            values.iter().all(|v| v.is_finite()).then_some(values)
        };

        let normalized = sampled(&profile).or_else(|| {
            let fallback = profile.gaussian_fallback()?;
            log::warn!(
                "{} plane profile is singular at ({x0:.2}, {y0:.2}); falling back to its Gaussian term.",
                self.kind
            );
            sampled(&fallback)
        });

        match normalized {
            Some(shape) => shape.mapv(|v| (amplitude * v).max(0.0).min(saturation)),
            None => {
                log::warn!(
                    "{} plane profile could not be normalized for parameters {p}; returning zeros.",
                    self.kind
                );
                Array2::zeros((ny, nx))
            }
        }
    }

    /// Full width at half maximum of the transverse profile, found numerically.
    pub fn fwhm(&self, p: ArrayView1<f64>) -> f64 {
        let profile = internal::ProfileTerms::from_params(self.kind, p);
        let width = profile.characteristic_width();
        if !(width.is_finite() && width > 0.0) {
            return 0.0;
        }
        let offsets = Array1::linspace(-10.0 * width, 10.0 * width, 4001);
        let values = offsets.mapv(|dy| profile.value(dy * dy));
        internal::half_maximum_width(offsets.view(), values.view())
    }
}

mod internal {
    use super::*;

    /// Unnormalized radial profile `moffat(r²) + weight * gauss(r²)`.
    #[derive(Debug, Clone, Copy)]
    pub(super) struct ProfileTerms {
        moffat: Option<(f64, f64)>,
        gauss: Option<(f64, f64)>,
    }

    impl ProfileTerms {
        pub(super) fn from_params(kind: PsfKind, p: ArrayView1<f64>) -> Self {
            match kind {
                PsfKind::Moffat => Self {
                    moffat: Some((p[3], p[4])),
                    gauss: None,
                },
                PsfKind::MoffatGauss => Self {
                    moffat: Some((p[3], p[4])),
                    gauss: Some((p[5], p[6])),
                },
                PsfKind::Gauss => Self {
                    moffat: None,
                    gauss: Some((1.0, p[3])),
                },
            }
        }

        pub(super) fn value(&self, rr: f64) -> f64 {
            let moffat = self
                .moffat
                .map_or(0.0, |(gamma, alpha)| (1.0 + rr / (gamma * gamma)).powf(-alpha));
            let gauss = self
                .gauss
                .map_or(0.0, |(weight, sigma)| weight * (-rr / (2.0 * sigma * sigma)).exp());
            moffat + gauss
        }

        /// Integral over the plane: `pi gamma^2 / (alpha - 1) + weight 2 pi sigma^2`.
        pub(super) fn plane_integral(&self) -> f64 {
            let moffat = self
                .moffat
                .map_or(0.0, |(gamma, alpha)| PI * gamma * gamma / (alpha - 1.0));
            let gauss = self
                .gauss
                .map_or(0.0, |(weight, sigma)| weight * 2.0 * PI * sigma * sigma);
            moffat + gauss
        }

        /// Unit-weight Gaussian, borrowing the Moffat core width when the family has no Gaussian.
        ///
        /// Both callers normalize the fallback, so any positive Gaussian weight yields the same
        /// shape. The unit weight keeps the fallback positive when the fitted `eta` is zero or
        /// negative.
        pub(super) fn gaussian_fallback(&self) -> Option<Self> {
            let sigma = match (self.gauss, self.moffat) {
                (Some((_, sigma)), _) => sigma,
                (None, Some((gamma, _))) => gamma,
                (None, None) => return None,
            };
            (sigma.is_finite() && sigma > 0.0).then_some(Self {
                moffat: None,
                gauss: Some((1.0, sigma)),
            })
        }

        pub(super) fn characteristic_width(&self) -> f64 {
            let gamma = self.moffat.map_or(0.0, |(gamma, _)| gamma.abs());
            let sigma = self.gauss.map_or(0.0, |(_, sigma)| sigma.abs());
            gamma.max(sigma)
        }
    }

    pub(super) fn riemann_normalized(
        terms: &ProfileTerms,
        rows: ArrayView1<f64>,
        center: f64,
        step: f64,
    ) -> Option<Array1<f64>> {
        let raw = rows.mapv(|y| terms.value((y - center) * (y - center)));
        let integral = raw.sum() * step;
        if !(integral.is_finite() && integral > 0.0) || raw.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(raw / integral)
    }

    /// Distance between the outermost half-maximum crossings, linearly interpolated.
    pub(super) fn half_maximum_width(offsets: ArrayView1<f64>, values: ArrayView1<f64>) -> f64 {
        let maximum = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !(maximum.is_finite() && maximum > 0.0) {
            return 0.0;
        }
        let half = 0.5 * maximum;
        let (Some(first), Some(last)) = (
            values.iter().position(|&v| v >= half),
            values.iter().rposition(|&v| v >= half),
        ) else {
            return 0.0;
        };
        let crossing = |inside: usize, outside: usize| -> f64 {
            let (vi, vo) = (values[inside], values[outside]);
            let t = if vi != vo { (vi - half) / (vi - vo) } else { 0.0 };
            offsets[inside] + t * (offsets[outside] - offsets[inside])
        };
        let left = if first > 0 {
            crossing(first, first - 1)
        } else {
            offsets[0]
        };
        let right = if last + 1 < values.len() {
            crossing(last, last + 1)
        } else {
            offsets[values.len() - 1]
        };
        right - left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn transverse_profile_integrates_to_amplitude() {
        let psf = Psf::new(PsfKind::MoffatGauss);
        let p = array![1000.0, 0.0, 50.0, 3.0, 2.0, -0.3, 2.0, 1e9];
        let rows = Array1::range(0.0, 100.0, 1.0);
        let out = psf.evaluate_transverse(rows.view(), p.view());
        assert_relative_eq!(out.sum(), 1000.0, max_relative = 1e-10);
        assert!(out.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn transverse_profile_respects_pixel_step() {
        let psf = Psf::new(PsfKind::Gauss);
        let p = array![10.0, 0.0, 5.0, 1.0, 1e9];
        let rows = Array1::range(0.0, 10.0, 0.5);
        let out = psf.evaluate_transverse(rows.view(), p.view());
        assert_relative_eq!(out.sum() * 0.5, 10.0, max_relative = 1e-10);
    }

    #[test]
    fn saturation_clips_output() {
        let psf = Psf::new(PsfKind::Moffat);
        let p = array![1e6, 0.0, 10.0, 2.0, 3.0, 500.0];
        let out = psf
            .evaluate(&Pixels::rows(20), p.view())
            .expect("parameter count matches");
        assert_relative_eq!(out.fold(0.0_f64, |m, &v| m.max(v)), 500.0);
    }

    #[test]
    fn grid_profile_integrates_to_amplitude() {
        let psf = Psf::new(PsfKind::MoffatGauss);
        let p = array![500.0, 60.0, 60.0, 2.0, 3.0, -0.2, 1.5, 1e9];
        let out = psf.evaluate_grid(121, 121, p.view());
        // Moffat wings beyond the stamp carry a small fraction of the flux.
        assert_relative_eq!(out.sum(), 500.0, max_relative = 1e-2);
        assert_eq!(out.dim(), (121, 121));
    }

    #[test]
    fn evaluate_rejects_wrong_parameter_count() {
        let psf = Psf::new(PsfKind::Gauss);
        let err = psf
            .evaluate(&Pixels::rows(5), array![1.0, 2.0].view())
            .unwrap_err();
        assert!(matches!(
            err,
            ShapeError::ParameterCount {
                expected: 5,
                got: 2,
                ..
            }
        ));
    }

    #[test]
    fn singular_moffat_falls_back_to_gaussian() {
        let psf = Psf::new(PsfKind::MoffatGauss);
        // alpha = 1 makes the analytic plane normalization infinite.
        let p = array![100.0, 10.0, 10.0, 2.0, 1.0, -0.1, 1.5, 1e9];
        let out = psf.evaluate_grid(21, 21, p.view());
        assert!(out.iter().all(|v| v.is_finite()));
        assert_relative_eq!(out.sum(), 100.0, max_relative = 1e-3);

        // gamma = 0 produces NaN on the center pixel.
        let p = array![100.0, 0.0, 10.0, 0.0, 2.0, -0.1, 1.5, 1e9];
        let out = psf.evaluate_transverse(Array1::range(0.0, 21.0, 1.0).view(), p.view());
        assert!(out.iter().all(|v| v.is_finite()));
        assert_relative_eq!(out.sum(), 100.0, max_relative = 1e-6);
    }

    #[test]
    fn gaussian_fallback_shape_ignores_eta() {
        let rows = Array1::range(0.0, 21.0, 1.0);
        let gauss = Psf::new(PsfKind::Gauss)
            .evaluate_transverse(rows.view(), array![100.0, 0.0, 10.0, 1.5, 1e9].view());
        let psf = Psf::new(PsfKind::MoffatGauss);
        for eta in [0.3, 0.0, -0.1] {
            let p = array![100.0, 0.0, 10.0, 0.0, 2.0, eta, 1.5, 1e9];
            let out = psf.evaluate_transverse(rows.view(), p.view());
            for (a, b) in out.iter().zip(gauss.iter()) {
                assert_relative_eq!(*a, *b, max_relative = 1e-12, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn fully_degenerate_profile_returns_zeros() {
        let psf = Psf::new(PsfKind::Gauss);
        let p = array![100.0, 0.0, 10.0, 0.0, 1e9];
        let out = psf.evaluate_transverse(Array1::range(0.0, 21.0, 1.0).view(), p.view());
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn max_width_bounds_are_idempotent() {
        let mut psf = Psf::new(PsfKind::MoffatGauss);
        psf.apply_max_width_to_bounds(15.0);
        let first = psf.bounds_hard().to_vec();
        psf.apply_max_width_to_bounds(15.0);
        assert_eq!(first, psf.bounds_hard());
        assert_eq!(psf.bounds_hard()[2], (0.0, 30.0));
        assert_eq!(psf.bounds_hard()[3], (0.1, 15.0));
        assert_eq!(psf.bounds_hard()[6], (0.1, 15.0));
        assert_eq!(psf.bounds_hard()[4], (1.1, 10.0));
        assert_eq!(psf.bounds_soft(), psf.bounds_hard());
        assert_eq!(psf.max_half_width(), Some(15.0));
    }

    #[test]
    fn fwhm_matches_closed_forms() {
        let gauss = Psf::new(PsfKind::Gauss);
        let fwhm = gauss.fwhm(array![1.0, 0.0, 0.0, 2.0, 1e9].view());
        assert_relative_eq!(fwhm, 2.0 * 2.0 * (2.0_f64.ln() * 2.0).sqrt(), max_relative = 1e-4);

        let moffat = Psf::new(PsfKind::Moffat);
        let (gamma, alpha) = (3.0_f64, 2.5_f64);
        let fwhm = moffat.fwhm(array![1.0, 0.0, 0.0, gamma, alpha, 1e9].view());
        let expected = 2.0 * gamma * (2.0_f64.powf(1.0 / alpha) - 1.0).sqrt();
        assert_relative_eq!(fwhm, expected, max_relative = 1e-4);
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("MoffatGauss".parse::<PsfKind>().unwrap(), PsfKind::MoffatGauss);
        assert!(matches!(
            "airy".parse::<PsfKind>(),
            Err(ShapeError::UnknownKind(_))
        ));
        assert_eq!(PsfKind::Gauss.to_string(), "gauss");
    }

    #[test]
    fn descriptors_flag_chromatic_roles() {
        let psf = Psf::new(PsfKind::MoffatGauss);
        let fixed: Vec<_> = psf
            .descriptors()
            .iter()
            .filter(|d| d.is_fixed_in_chromatic_fit())
            .map(|d| d.name)
            .collect();
        assert_eq!(fixed, vec!["x_mean", "saturation"]);
        assert_eq!(psf.index_of("stddev").unwrap(), 6);
        assert!(!psf.descriptors()[0].is_penalized());
        assert_eq!(psf.default_params(), array![1.0, 0.0, 0.0, 3.0, 2.0, 0.0, 1.0, 1.0]);
    }
}
