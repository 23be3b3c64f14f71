//! Linear amplitude sub-problem of the chromatic fit.
//!
//! With every shape parameter fixed, the model is linear in the per-column
//! amplitudes, so they are eliminated analytically at each evaluation:
//! `A = (M^T W M + Q)^-1 (M^T W y + Q A0)`, where `Q` is zero unless the
//! `psf1d` prior is selected.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::InverseC;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Columns examined on each side when repairing a negative amplitude with the `smooth` prior.
pub const SMOOTH_WINDOW: usize = 10;

/// Fraction of the background noise level used as the amplitude uncertainty of degenerate columns.
pub const NOISE_FLOOR_FRACTION: f64 = 0.1;

/// Gram entries below this fraction of the largest one mark a column as degenerate.
pub const DEGENERATE_GRAM_FRACTION: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum AmplitudeError {
    #[error(
        "Unknown amplitude prior '{0}'. Expected one of: noprior, positive, smooth, psf1d, fixed."
    )]
    UnknownPrior(String),

    #[error("The '{0}' amplitude prior needs a reference amplitude vector.")]
    MissingReference(AmplitudePrior),

    #[error("The 'psf1d' amplitude prior needs a regularization strength and the data errors.")]
    MissingRegularization,

    #[error("Regularization strength must be finite and non-negative, got {0}.")]
    InvalidRegularization(f64),

    #[error("Reference amplitudes have {got} entries but the design has {expected} columns.")]
    ReferenceLength { expected: usize, got: usize },

    #[error("Design matrix expects a {expected:?} image but data and weights are {data:?} and {weights:?}.")]
    DimensionMismatch {
        expected: (usize, usize),
        data: (usize, usize),
        weights: (usize, usize),
    },

    #[error("Gram matrix could not be inverted even after diagonal jitter: {0}")]
    Singular(#[from] ndarray_linalg::error::LinalgError),
}

/// Prior applied to the linear amplitude estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmplitudePrior {
    /// Plain weighted least squares; amplitudes may be negative.
    NoPrior,
    /// Negative amplitudes clipped to zero after the solve.
    Positive,
    /// Negative amplitudes replaced by their nearest non-negative neighbors.
    Smooth,
    /// Quadratic pull towards a reference amplitude vector.
    Psf1d,
    /// Reference amplitudes used verbatim.
    Fixed,
}

impl AmplitudePrior {
    pub fn needs_reference(self) -> bool {
        matches!(self, AmplitudePrior::Psf1d | AmplitudePrior::Fixed)
    }
}

impl fmt::Display for AmplitudePrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AmplitudePrior::NoPrior => "noprior",
            AmplitudePrior::Positive => "positive",
            AmplitudePrior::Smooth => "smooth",
            AmplitudePrior::Psf1d => "psf1d",
            AmplitudePrior::Fixed => "fixed",
        })
    }
}

impl FromStr for AmplitudePrior {
    type Err = AmplitudeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "noprior" => Ok(AmplitudePrior::NoPrior),
            "positive" => Ok(AmplitudePrior::Positive),
            "smooth" => Ok(AmplitudePrior::Smooth),
            "psf1d" => Ok(AmplitudePrior::Psf1d),
            "fixed" => Ok(AmplitudePrior::Fixed),
            other => Err(AmplitudeError::UnknownPrior(other.to_string())),
        }
    }
}

/// Unit-amplitude model of every column.
#[derive(Debug, Clone, PartialEq)]
pub enum DesignMatrix {
    /// `(ny, nx)`: column `x` is the transverse profile of dispersion column `x` only.
    Columns(Array2<f64>),
    /// `(ny * nx, nx)`: column `x` is the flattened image of dispersion column `x`.
    Joint(Array2<f64>),
}

impl DesignMatrix {
    pub fn n_columns(&self) -> usize {
        match self {
            DesignMatrix::Columns(m) | DesignMatrix::Joint(m) => m.ncols(),
        }
    }

    /// Image shape `(ny, nx)` the design applies to.
    pub fn image_dim(&self) -> (usize, usize) {
        match self {
            DesignMatrix::Columns(m) => m.dim(),
            DesignMatrix::Joint(m) => {
                let nx = m.ncols();
                (if nx > 0 { m.nrows() / nx } else { 0 }, nx)
            }
        }
    }

    /// Model image for the given amplitudes.
    pub fn apply(&self, amplitudes: ArrayView1<f64>) -> Array2<f64> {
        match self {
            DesignMatrix::Columns(m) => m * &amplitudes.insert_axis(Axis(0)),
            DesignMatrix::Joint(m) => {
                let (ny, nx) = self.image_dim();
                let flat = m.dot(&amplitudes);
                Array2::from_shape_fn((ny, nx), |(y, x)| flat[y * nx + x])
            }
        }
    }
}

/// Amplitudes with their uncertainties.
#[derive(Debug, Clone, PartialEq)]
pub struct AmplitudeSolution {
    pub amplitudes: Array1<f64>,
    pub variances: Array1<f64>,
    /// Full covariance of a joint solve; `None` when the covariance is diagonal.
    pub joint_covariance: Option<Array2<f64>>,
    /// Columns whose Gram entry vanished and received the noise floor.
    pub degenerate: Vec<usize>,
}

impl AmplitudeSolution {
    pub fn errors(&self) -> Array1<f64> {
        self.variances.mapv(|v| v.max(0.0).sqrt())
    }

    /// Dense `(Nx, Nx)` covariance.
    pub fn covariance(&self) -> Array2<f64> {
        match &self.joint_covariance {
            Some(covariance) => covariance.clone(),
            None => Array2::from_diag(&self.variances),
        }
    }
}

/// Solves for amplitudes under one of the five priors.
#[derive(Debug, Clone)]
pub struct AmplitudeSolver {
    prior: AmplitudePrior,
    reference: Option<Array1<f64>>,
    regularization: Option<Array1<f64>>,
    variance_floor: f64,
}

impl AmplitudeSolver {
    /// `noise_level` is the per-pixel background noise used to floor degenerate columns.
    pub fn new(prior: AmplitudePrior, noise_level: f64) -> Self {
        let floor = (NOISE_FLOOR_FRACTION * noise_level).powi(2);
        Self {
            prior,
            reference: None,
            regularization: None,
            variance_floor: if floor.is_finite() && floor > 0.0 {
                floor
            } else {
                f64::EPSILON
            },
        }
    }

    pub fn with_reference(mut self, reference: Array1<f64>) -> Self {
        self.reference = Some(reference);
        self
    }

    /// `Q_i = lambda / sum_y err[y, i]^2`; columns with infinite errors get no pull.
    pub fn with_regularization(
        mut self,
        lambda: f64,
        errors: ArrayView2<f64>,
    ) -> Result<Self, AmplitudeError> {
        if !(lambda.is_finite() && lambda >= 0.0) {
            return Err(AmplitudeError::InvalidRegularization(lambda));
        }
        let q = errors
            .axis_iter(Axis(1))
            .map(|column| {
                let total: f64 = column.iter().map(|e| e * e).sum();
                if total.is_finite() && total > 0.0 {
                    lambda / total
                } else {
                    0.0
                }
            })
            .collect();
        self.regularization = Some(q);
        Ok(self)
    }

    pub fn prior(&self) -> AmplitudePrior {
        self.prior
    }

    pub fn variance_floor(&self) -> f64 {
        self.variance_floor
    }

    pub fn reference(&self) -> Option<&Array1<f64>> {
        self.reference.as_ref()
    }

    /// Checks that the prior has what it needs for `nx` columns.
    pub fn validate(&self, nx: usize) -> Result<(), AmplitudeError> {
        if self.prior.needs_reference() {
            let reference = self
                .reference
                .as_ref()
                .ok_or(AmplitudeError::MissingReference(self.prior))?;
            if reference.len() != nx {
                return Err(AmplitudeError::ReferenceLength {
                    expected: nx,
                    got: reference.len(),
                });
            }
        }
        if self.prior == AmplitudePrior::Psf1d {
            match &self.regularization {
                Some(q) if q.len() == nx => {}
                Some(q) => {
                    return Err(AmplitudeError::ReferenceLength {
                        expected: nx,
                        got: q.len(),
                    });
                }
                None => return Err(AmplitudeError::MissingRegularization),
            }
        }
        Ok(())
    }

    /// Best-fit amplitudes for the given unit-amplitude design.
    ///
    /// `weights` is the inverse variance of each pixel, zero for masked pixels.
    pub fn solve(
        &self,
        design: &DesignMatrix,
        data: ArrayView2<f64>,
        weights: ArrayView2<f64>,
    ) -> Result<AmplitudeSolution, AmplitudeError> {
        let expected = design.image_dim();
        if data.dim() != expected || weights.dim() != expected {
            return Err(AmplitudeError::DimensionMismatch {
                expected,
                data: data.dim(),
                weights: weights.dim(),
            });
        }
        let nx = design.n_columns();
        self.validate(nx)?;

        if self.prior == AmplitudePrior::Fixed {
            return Ok(self.fixed_solution());
        }

        let mut solution = match design {
            DesignMatrix::Columns(m) => self.solve_columns(m, data, weights),
            DesignMatrix::Joint(m) => self.solve_joint(m, data, weights)?,
        };
        if !solution.degenerate.is_empty() {
            log::debug!(
                "{} of {nx} amplitude columns have no weighted signal; using the noise floor.",
                solution.degenerate.len()
            );
        }

        match self.prior {
            AmplitudePrior::Positive => solution.amplitudes.mapv_inplace(|a| a.max(0.0)),
            AmplitudePrior::Smooth => repair_negative(&mut solution.amplitudes, SMOOTH_WINDOW),
            _ => {}
        }
        Ok(solution)
    }

    fn pull(&self, x: usize) -> (f64, f64) {
        match (self.prior, &self.regularization, &self.reference) {
            (AmplitudePrior::Psf1d, Some(q), Some(a0)) => (q[x], a0[x]),
            _ => (0.0, 0.0),
        }
    }

    fn fixed_solution(&self) -> AmplitudeSolution {
        let amplitudes = self.reference.clone().unwrap_or_default();
        let smallest_positive = amplitudes
            .iter()
            .filter(|&&a| a > 0.0)
            .fold(f64::INFINITY, |m, &a| m.min(a));
        let fallback = if smallest_positive.is_finite() {
            smallest_positive
        } else {
            self.variance_floor
        };
        let variances = amplitudes.mapv(|a| if a > 0.0 { a } else { fallback });
        AmplitudeSolution {
            variances,
            amplitudes,
            joint_covariance: None,
            degenerate: Vec::new(),
        }
    }

    fn solve_columns(
        &self,
        m: &Array2<f64>,
        data: ArrayView2<f64>,
        weights: ArrayView2<f64>,
    ) -> AmplitudeSolution {
        let nx = m.ncols();
        let mut normal = Vec::with_capacity(nx);
        for x in 0..nx {
            let (mut gram, mut projection) = (0.0, 0.0);
            for ((&mi, &wi), &yi) in m
                .column(x)
                .iter()
                .zip(weights.column(x).iter())
                .zip(data.column(x).iter())
            {
                if wi > 0.0 {
                    gram += wi * mi * mi;
                    projection += wi * mi * yi;
                }
            }
            let (q, a0) = self.pull(x);
            normal.push((gram + q, projection + q * a0));
        }
        let max_diag = normal
            .iter()
            .map(|&(d, _)| d)
            .filter(|d| d.is_finite())
            .fold(0.0_f64, f64::max);

        let mut amplitudes = Array1::zeros(nx);
        let mut variances = Array1::zeros(nx);
        let mut degenerate = Vec::new();
        for (x, &(denominator, rhs)) in normal.iter().enumerate() {
            if internal::is_resolved(denominator, max_diag) && rhs.is_finite() {
                amplitudes[x] = rhs / denominator;
                variances[x] = 1.0 / denominator;
            } else {
                variances[x] = self.variance_floor;
                degenerate.push(x);
            }
        }
        AmplitudeSolution {
            variances,
            amplitudes,
            joint_covariance: None,
            degenerate,
        }
    }

    fn solve_joint(
        &self,
        m: &Array2<f64>,
        data: ArrayView2<f64>,
        weights: ArrayView2<f64>,
    ) -> Result<AmplitudeSolution, AmplitudeError> {
        let nx = m.ncols();
        let w: Array1<f64> = weights.iter().map(|&w| if w > 0.0 { w } else { 0.0 }).collect();
        let y: Array1<f64> = data
            .iter()
            .zip(w.iter())
            .map(|(&d, &wi)| if wi > 0.0 { d } else { 0.0 })
            .collect();
        let weighted = m * &w.view().insert_axis(Axis(1));
        let mut gram = m.t().dot(&weighted);
        let mut rhs = weighted.t().dot(&y);
        for x in 0..nx {
            let (q, a0) = self.pull(x);
            gram[[x, x]] += q;
            rhs[x] += q * a0;
        }

        let max_diag = gram
            .diag()
            .iter()
            .copied()
            .filter(|d| d.is_finite())
            .fold(0.0_f64, f64::max);
        let (active, degenerate): (Vec<usize>, Vec<usize>) =
            (0..nx).partition(|&x| internal::is_resolved(gram[[x, x]], max_diag));

        let mut amplitudes = Array1::zeros(nx);
        let mut covariance = Array2::zeros((nx, nx));
        if !active.is_empty() {
            let reduced = gram.select(Axis(0), &active).select(Axis(1), &active);
            let reduced_rhs = rhs.select(Axis(0), &active);
            let inverse = internal::jittered_inverse(&reduced, max_diag)?;
            let solved = inverse.dot(&reduced_rhs);
            for (i, &xi) in active.iter().enumerate() {
                amplitudes[xi] = solved[i];
                for (j, &xj) in active.iter().enumerate() {
                    covariance[[xi, xj]] = inverse[[i, j]];
                }
            }
        }
        for &x in &degenerate {
            covariance[[x, x]] = self.variance_floor;
        }
        Ok(AmplitudeSolution {
            variances: covariance.diag().to_owned(),
            joint_covariance: Some(covariance),
            amplitudes,
            degenerate,
        })
    }
}

/// Replaces each negative amplitude by the mean of the nearest non-negative
/// value on each side within `window` columns.
///
/// Neighbors are chosen from the original vector, so a run of negatives is
/// bridged by the values around it. When no side has a non-negative value
/// within the window the amplitude is set to zero.
pub fn repair_negative(amplitudes: &mut Array1<f64>, window: usize) {
    let original = amplitudes.clone();
    let n = original.len();
    let usable = |j: usize| original[j] >= 0.0;
    for i in (0..n).filter(|&i| original[i] < 0.0) {
        let left = (1..=window)
            .filter_map(|d| i.checked_sub(d))
            .find(|&j| usable(j))
            .map(|j| original[j]);
        let right = (1..=window)
            .map(|d| i + d)
            .take_while(|&j| j < n)
            .find(|&j| usable(j))
            .map(|j| original[j]);
        amplitudes[i] = match (left, right) {
            (Some(l), Some(r)) => 0.5 * (l + r),
            (Some(v), None) | (None, Some(v)) => v,
            (None, None) => 0.0,
        };
    }
}

mod internal {
    use super::*;

    /// Whether a Gram diagonal entry is large enough to determine its amplitude.
    pub(super) fn is_resolved(diag: f64, max_diag: f64) -> bool {
        diag.is_finite() && diag > 0.0 && diag > DEGENERATE_GRAM_FRACTION * max_diag
    }

    /// Cholesky inverse of a symmetric matrix, retried with a growing ridge if it is not positive definite.
    pub(super) fn jittered_inverse(
        gram: &Array2<f64>,
        scale: f64,
    ) -> Result<Array2<f64>, AmplitudeError> {
        let mut last_error = match gram.invc() {
            Ok(inverse) => return Ok(inverse),
            Err(e) => e,
        };
        let base = if scale > 0.0 { scale } else { 1.0 };
        for attempt in 0..6 {
            let ridge = base * 1e-12 * 100f64.powi(attempt);
            let mut jittered = gram.clone();
            jittered.diag_mut().mapv_inplace(|d| d + ridge);
            match jittered.invc() {
                Ok(inverse) => {
                    log::debug!("Amplitude Gram matrix needed a ridge of {ridge:.3e} to factorize.");
                    return Ok(inverse);
                }
                Err(e) => last_error = e,
            }
        }
        Err(AmplitudeError::Singular(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn gaussian_columns(ny: usize, nx: usize) -> Array2<f64> {
        Array2::from_shape_fn((ny, nx), |(y, x)| {
            let center = 3.0 + 0.2 * x as f64;
            let r = y as f64 - center;
            (-0.5 * r * r / 1.5).exp()
        })
    }

    #[test]
    fn column_solve_recovers_noiseless_amplitudes() {
        let m = gaussian_columns(12, 6);
        let truth = array![10.0, -3.0, 0.0, 250.0, 7.5, 1.0];
        let design = DesignMatrix::Columns(m);
        let data = design.apply(truth.view());
        let weights = Array2::from_elem((12, 6), 4.0);
        let solution = AmplitudeSolver::new(AmplitudePrior::NoPrior, 1.0)
            .solve(&design, data.view(), weights.view())
            .unwrap();
        for (a, b) in solution.amplitudes.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        let DesignMatrix::Columns(m) = &design else {
            unreachable!()
        };
        let gram0: f64 = m.column(0).iter().map(|v| 4.0 * v * v).sum();
        assert_abs_diff_eq!(solution.variances[0], 1.0 / gram0, epsilon = 1e-14);
        assert!(solution.degenerate.is_empty());
    }

    #[test]
    fn joint_solve_recovers_overlapping_columns() {
        let (ny, nx) = (4, 3);
        let m = Array2::from_shape_fn((ny * nx, nx), |(row, col)| {
            let x = (row % nx) as f64;
            let y = (row / nx) as f64;
            (-((x - col as f64).powi(2) + (y - 1.5).powi(2)) / 2.0).exp()
        });
        let design = DesignMatrix::Joint(m.clone());
        let truth = array![5.0, 2.0, -1.0];
        let data = design.apply(truth.view());
        let weights = Array2::from_elem((ny, nx), 1.0);
        let solution = AmplitudeSolver::new(AmplitudePrior::NoPrior, 1.0)
            .solve(&design, data.view(), weights.view())
            .unwrap();
        for (a, b) in solution.amplitudes.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
        let gram = m.t().dot(&m);
        let identity = gram.dot(&solution.covariance());
        for i in 0..nx {
            for j in 0..nx {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(identity[[i, j]], expected, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn zero_weight_column_gets_noise_floor() {
        let m = gaussian_columns(10, 4);
        let design = DesignMatrix::Columns(m);
        let mut data = Array2::from_elem((10, 4), 3.0);
        data.column_mut(2).fill(0.0);
        let mut weights = Array2::from_elem((10, 4), 1.0);
        weights.column_mut(2).fill(0.0);
        let solution = AmplitudeSolver::new(AmplitudePrior::NoPrior, 5.0)
            .solve(&design, data.view(), weights.view())
            .unwrap();
        assert_eq!(solution.amplitudes[2], 0.0);
        assert!(solution.variances[2].is_finite() && solution.variances[2] > 0.0);
        assert_abs_diff_eq!(solution.variances[2], 0.25, epsilon = 1e-12);
        assert_eq!(solution.degenerate, vec![2]);
    }

    #[test]
    fn vanishing_column_weight_is_degenerate_in_both_geometries() {
        let (ny, nx) = (10, 3);
        let m = gaussian_columns(ny, nx);
        let data = DesignMatrix::Columns(m.clone()).apply(array![5.0, 5.0, 5.0].view());
        let mut weights = Array2::ones((ny, nx));
        weights.column_mut(1).fill(1e-300);

        let columns = AmplitudeSolver::new(AmplitudePrior::NoPrior, 2.0)
            .solve(&DesignMatrix::Columns(m.clone()), data.view(), weights.view())
            .unwrap();
        assert_eq!(columns.degenerate, vec![1]);
        assert_eq!(columns.amplitudes[1], 0.0);
        assert_abs_diff_eq!(columns.variances[1], 0.04, epsilon = 1e-12);
        assert!(columns.joint_covariance.is_none());
        assert_eq!(columns.covariance(), Array2::from_diag(&columns.variances));

        let joint_design = Array2::from_shape_fn((ny * nx, nx), |(row, col)| {
            if row % nx == col { m[[row / nx, col]] } else { 0.0 }
        });
        let joint = AmplitudeSolver::new(AmplitudePrior::NoPrior, 2.0)
            .solve(&DesignMatrix::Joint(joint_design), data.view(), weights.view())
            .unwrap();
        assert_eq!(joint.degenerate, columns.degenerate);
        assert_abs_diff_eq!(joint.amplitudes[0], columns.amplitudes[0], epsilon = 1e-9);
        assert_eq!(joint.covariance().dim(), (nx, nx));
    }

    #[test]
    fn joint_degenerate_column_is_removed_from_the_solve() {
        let (ny, nx) = (3, 3);
        let mut m = Array2::from_shape_fn((ny * nx, nx), |(row, col)| {
            if row % nx == col { 1.0 + (row / nx) as f64 } else { 0.1 }
        });
        m.column_mut(1).fill(0.0);
        let design = DesignMatrix::Joint(m);
        let truth = array![2.0, 0.0, 3.0];
        let data = design.apply(truth.view());
        let weights = Array2::ones((ny, nx));
        let solution = AmplitudeSolver::new(AmplitudePrior::NoPrior, 0.0)
            .solve(&design, data.view(), weights.view())
            .unwrap();
        assert_eq!(solution.degenerate, vec![1]);
        assert_eq!(solution.amplitudes[1], 0.0);
        assert!(solution.variances[1] > 0.0);
        assert_abs_diff_eq!(solution.amplitudes[0], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(solution.amplitudes[2], 3.0, epsilon = 1e-9);
    }

    #[test]
    fn positive_prior_clips_negative_amplitudes() {
        let m = gaussian_columns(10, 3);
        let design = DesignMatrix::Columns(m);
        let data = design.apply(array![4.0, -2.0, 1.0].view());
        let weights = Array2::ones((10, 3));
        let raw = AmplitudeSolver::new(AmplitudePrior::NoPrior, 1.0)
            .solve(&design, data.view(), weights.view())
            .unwrap();
        assert!(raw.amplitudes[1] < 0.0);
        let clipped = AmplitudeSolver::new(AmplitudePrior::Positive, 1.0)
            .solve(&design, data.view(), weights.view())
            .unwrap();
        assert_eq!(clipped.amplitudes[1], 0.0);
        assert!(clipped.amplitudes.iter().all(|&a| a >= 0.0));
        assert_eq!(clipped.variances, raw.variances);
    }

    #[test]
    fn smooth_repair_bridges_negative_runs() {
        let mut a = array![5.0, -1.0, -2.0, 7.0, 1.0];
        repair_negative(&mut a, SMOOTH_WINDOW);
        assert_eq!(a, array![5.0, 6.0, 6.0, 7.0, 1.0]);

        let mut edge = array![-1.0, 4.0, 2.0];
        repair_negative(&mut edge, SMOOTH_WINDOW);
        assert_eq!(edge, array![4.0, 4.0, 2.0]);

        let mut hopeless = array![-1.0, -2.0, -3.0];
        repair_negative(&mut hopeless, SMOOTH_WINDOW);
        assert_eq!(hopeless, array![0.0, 0.0, 0.0]);

        let mut far = Array1::from_elem(25, -1.0);
        far[0] = 3.0;
        repair_negative(&mut far, SMOOTH_WINDOW);
        assert_eq!(far[10], 3.0);
        assert_eq!(far[11], 0.0);
    }

    #[test]
    fn psf1d_pulls_towards_reference() {
        let m = gaussian_columns(8, 2);
        let design = DesignMatrix::Columns(m.clone());
        let data = design.apply(array![10.0, 10.0].view());
        let weights = Array2::ones((8, 2));
        let errors = Array2::ones((8, 2));
        let reference = array![20.0, 0.0];
        let solver = AmplitudeSolver::new(AmplitudePrior::Psf1d, 1.0)
            .with_reference(reference.clone())
            .with_regularization(8.0, errors.view())
            .unwrap();
        let solution = solver.solve(&design, data.view(), weights.view()).unwrap();
        // lambda / sum(err^2) = 8 / 8 = 1 per column
        for x in 0..2 {
            let gram: f64 = m.column(x).iter().map(|v| v * v).sum();
            let projection = 10.0 * gram;
            let expected = (projection + reference[x]) / (gram + 1.0);
            assert_abs_diff_eq!(solution.amplitudes[x], expected, epsilon = 1e-12);
            assert_abs_diff_eq!(solution.variances[x], 1.0 / (gram + 1.0), epsilon = 1e-12);
        }
    }

    #[test]
    fn fixed_prior_uses_reference_verbatim() {
        let design = DesignMatrix::Columns(gaussian_columns(5, 4));
        let data = Array2::zeros((5, 4));
        let weights = Array2::ones((5, 4));
        let solution = AmplitudeSolver::new(AmplitudePrior::Fixed, 1.0)
            .with_reference(array![4.0, -1.0, 0.0, 9.0])
            .solve(&design, data.view(), weights.view())
            .unwrap();
        assert_eq!(solution.amplitudes, array![4.0, -1.0, 0.0, 9.0]);
        assert_eq!(solution.variances, array![4.0, 4.0, 4.0, 9.0]);
        assert_eq!(solution.errors(), array![2.0, 2.0, 2.0, 3.0]);
    }

    #[test]
    fn configuration_errors_are_reported() {
        assert!(matches!(
            "gaussian".parse::<AmplitudePrior>(),
            Err(AmplitudeError::UnknownPrior(_))
        ));
        assert_eq!("PSF1D".parse::<AmplitudePrior>().unwrap(), AmplitudePrior::Psf1d);

        let design = DesignMatrix::Columns(gaussian_columns(5, 3));
        let data = Array2::zeros((5, 3));
        let weights = Array2::ones((5, 3));
        let err = AmplitudeSolver::new(AmplitudePrior::Psf1d, 1.0)
            .solve(&design, data.view(), weights.view())
            .unwrap_err();
        assert!(matches!(err, AmplitudeError::MissingReference(AmplitudePrior::Psf1d)));

        let err = AmplitudeSolver::new(AmplitudePrior::NoPrior, 1.0)
            .solve(&design, Array2::zeros((4, 3)).view(), weights.view())
            .unwrap_err();
        assert!(matches!(err, AmplitudeError::DimensionMismatch { .. }));

        assert!(matches!(
            AmplitudeSolver::new(AmplitudePrior::Psf1d, 1.0)
                .with_regularization(-1.0, weights.view()),
            Err(AmplitudeError::InvalidRegularization(_))
        ));
    }
}
