use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::LeastSquaresSvd;
use thiserror::Error;

/// Errors raised while building or fitting polynomial and spline bases.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Cannot fit a basis to an empty set of points.")]
    EmptyInput,

    #[error("Abscissa and ordinate lengths differ: {x_len} vs {y_len}.")]
    LengthMismatch { x_len: usize, y_len: usize },

    #[error("Weight vector has {weights_len} entries but {points} points were given.")]
    WeightLengthMismatch { weights_len: usize, points: usize },

    #[error("Spline knots must be strictly increasing; found {previous} followed by {next}.")]
    NonIncreasingKnots { previous: f64, next: f64 },

    #[error("A cubic spline needs at least 2 knots, got {0}.")]
    TooFewKnots(usize),

    #[error("Least-squares solve failed while fitting Legendre coefficients: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// Positions of `n` pixels rescaled to the interval [-1, 1].
///
/// A single pixel maps to -1, matching `linspace(-1, 1, 1)`.
pub fn rescaled_pixels(n: usize) -> Array1<f64> {
    Array1::linspace(-1.0, 1.0, n)
}

/// Builds the Legendre Vandermonde matrix `V[i, k] = P_k(x_i)` for `k = 0..=degree`.
///
/// Uses the Bonnet recurrence `(k+1) P_{k+1} = (2k+1) x P_k - k P_{k-1}`.
pub fn legendre_vandermonde(x: ArrayView1<f64>, degree: usize) -> Array2<f64> {
    let mut v = Array2::zeros((x.len(), degree + 1));
    for (i, &xi) in x.iter().enumerate() {
        v[[i, 0]] = 1.0;
        if degree >= 1 {
            v[[i, 1]] = xi;
        }
        for k in 1..degree {
            let kf = k as f64;
            v[[i, k + 1]] = ((2.0 * kf + 1.0) * xi * v[[i, k]] - kf * v[[i, k - 1]]) / (kf + 1.0);
        }
    }
    v
}

/// Evaluates the Legendre series `sum_k c_k P_k(x)` at every abscissa.
pub fn legendre_eval(x: ArrayView1<f64>, coefficients: ArrayView1<f64>) -> Array1<f64> {
    if coefficients.is_empty() {
        return Array1::zeros(x.len());
    }
    legendre_vandermonde(x, coefficients.len() - 1).dot(&coefficients)
}

/// Weighted least-squares fit of a Legendre series of the given degree.
///
/// The weights multiply the residuals (not their squares), so the minimized
/// quantity is `sum_i (w_i (y_i - f(x_i)))^2`. Columns of the design are
/// scaled to unit norm before the SVD solve to keep high degrees conditioned;
/// rank-deficient problems return the minimum-norm solution.
///
/// # Arguments
/// * `x`: abscissae, normally produced by [`rescaled_pixels`].
/// * `y`: values to fit.
/// * `degree`: highest Legendre order.
/// * `weights`: optional per-point weights.
///
/// # Returns
/// The `degree + 1` Legendre coefficients.
pub fn legendre_fit(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    degree: usize,
    weights: Option<ArrayView1<f64>>,
) -> Result<Array1<f64>, BasisError> {
    if x.is_empty() {
        return Err(BasisError::EmptyInput);
    }
    if x.len() != y.len() {
        return Err(BasisError::LengthMismatch {
            x_len: x.len(),
            y_len: y.len(),
        });
    }

    let mut lhs = legendre_vandermonde(x, degree);
    let mut rhs = y.to_owned();
    if let Some(w) = weights {
        if w.len() != x.len() {
            return Err(BasisError::WeightLengthMismatch {
                weights_len: w.len(),
                points: x.len(),
            });
        }
        for (mut row, (&wi, yi)) in lhs.axis_iter_mut(Axis(0)).zip(w.iter().zip(rhs.iter_mut())) {
            row *= wi;
            *yi *= wi;
        }
    }

    let scale = internal::column_norms(&lhs);
    for (mut col, &s) in lhs.axis_iter_mut(Axis(1)).zip(scale.iter()) {
        col /= s;
    }

    let solution = lhs.least_squares(&rhs)?.solution;
    Ok(solution / &scale)
}

/// Converts power-series coefficients `c_0 + c_1 x + ...` to the Legendre basis.
pub fn power_to_legendre(power: ArrayView1<f64>) -> Result<Array1<f64>, BasisError> {
    if power.is_empty() {
        return Err(BasisError::EmptyInput);
    }
    let degree = power.len() - 1;
    // Degree + 1 distinct nodes make the fit an exact interpolation.
    let nodes = Array1::linspace(-1.0, 1.0, degree + 2);
    let values = nodes.mapv(|t| power.iter().rev().fold(0.0, |acc, &c| acc * t + c));
    legendre_fit(nodes.view(), values.view(), degree, None)
}

/// Natural cubic spline through a set of strictly increasing knots.
#[derive(Debug, Clone)]
pub struct CubicSpline {
    knots: Array1<f64>,
    values: Array1<f64>,
    second_derivatives: Array1<f64>,
}

impl CubicSpline {
    /// Builds the interpolant. Two knots degrade gracefully to a straight line.
    pub fn natural(knots: ArrayView1<f64>, values: ArrayView1<f64>) -> Result<Self, BasisError> {
        if knots.len() != values.len() {
            return Err(BasisError::LengthMismatch {
                x_len: knots.len(),
                y_len: values.len(),
            });
        }
        if knots.len() < 2 {
            return Err(BasisError::TooFewKnots(knots.len()));
        }
        for pair in knots.windows(2) {
            if pair[1] <= pair[0] {
                return Err(BasisError::NonIncreasingKnots {
                    previous: pair[0],
                    next: pair[1],
                });
            }
        }
        let second_derivatives = internal::natural_second_derivatives(knots, values);
        Ok(Self {
            knots: knots.to_owned(),
            values: values.to_owned(),
            second_derivatives,
        })
    }

    /// Evaluates the spline; points outside the knot range use the end segments.
    pub fn evaluate(&self, x: f64) -> f64 {
        let n = self.knots.len();
        let upper = self.knots.iter().take_while(|&&k| k <= x).count();
        let i = upper.saturating_sub(1).min(n - 2);

        let (x0, x1) = (self.knots[i], self.knots[i + 1]);
        let (y0, y1) = (self.values[i], self.values[i + 1]);
        let (m0, m1) = (self.second_derivatives[i], self.second_derivatives[i + 1]);
        let h = x1 - x0;
        let a = x1 - x;
        let b = x - x0;
        m0 * a.powi(3) / (6.0 * h)
            + m1 * b.powi(3) / (6.0 * h)
            + (y0 / h - m0 * h / 6.0) * a
            + (y1 / h - m1 * h / 6.0) * b
    }

    pub fn evaluate_many(&self, x: ArrayView1<f64>) -> Array1<f64> {
        x.mapv(|xi| self.evaluate(xi))
    }
}

mod internal {
    use super::*;

    pub(super) fn column_norms(lhs: &Array2<f64>) -> Array1<f64> {
        lhs.axis_iter(Axis(1))
            .map(|col| {
                let norm = col.dot(&col).sqrt();
                if norm > 0.0 { norm } else { 1.0 }
            })
            .collect()
    }

    /// Solves the tridiagonal system for the spline curvature with zero end curvature.
    pub(super) fn natural_second_derivatives(
        knots: ArrayView1<f64>,
        values: ArrayView1<f64>,
    ) -> Array1<f64> {
        let n = knots.len();
        let mut m = Array1::zeros(n);
        if n < 3 {
            return m;
        }

        let interior = n - 2;
        let mut diag = vec![0.0; interior];
        let mut upper = vec![0.0; interior];
        let mut rhs = vec![0.0; interior];
        for j in 0..interior {
            let i = j + 1;
            let h_prev = knots[i] - knots[i - 1];
            let h_next = knots[i + 1] - knots[i];
            diag[j] = 2.0 * (h_prev + h_next);
            upper[j] = h_next;
            rhs[j] = 6.0
                * ((values[i + 1] - values[i]) / h_next - (values[i] - values[i - 1]) / h_prev);
        }

        // Thomas algorithm; the sub-diagonal entry of row j equals the super-diagonal of row j-1.
        for j in 1..interior {
            let factor = upper[j - 1] / diag[j - 1];
            diag[j] -= factor * upper[j - 1];
            rhs[j] -= factor * rhs[j - 1];
        }
        let mut solution = vec![0.0; interior];
        for j in (0..interior).rev() {
            let next = if j + 1 < interior {
                upper[j] * solution[j + 1]
            } else {
                0.0
            };
            solution[j] = (rhs[j] - next) / diag[j];
        }
        for (j, value) in solution.into_iter().enumerate() {
            m[j + 1] = value;
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn vandermonde_matches_closed_forms() {
        let x = array![-1.0, -0.5, 0.0, 0.3, 1.0];
        let v = legendre_vandermonde(x.view(), 3);
        for (i, &xi) in x.iter().enumerate() {
            assert_abs_diff_eq!(v[[i, 0]], 1.0);
            assert_abs_diff_eq!(v[[i, 1]], xi);
            assert_abs_diff_eq!(v[[i, 2]], 0.5 * (3.0 * xi * xi - 1.0), epsilon = 1e-14);
            assert_abs_diff_eq!(
                v[[i, 3]],
                0.5 * (5.0 * xi.powi(3) - 3.0 * xi),
                epsilon = 1e-14
            );
        }
    }

    #[test]
    fn fit_recovers_exact_series() {
        let x = rescaled_pixels(25);
        let coeffs = array![2.0, -0.5, 0.25, 0.1];
        let y = legendre_eval(x.view(), coeffs.view());
        let fitted = legendre_fit(x.view(), y.view(), 3, None).unwrap();
        for (a, b) in fitted.iter().zip(coeffs.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn weights_emphasize_heavily_weighted_points() {
        let x = rescaled_pixels(5);
        let y = array![0.0, 0.0, 10.0, 0.0, 0.0];
        let w = array![1.0, 1.0, 1e-6, 1.0, 1.0];
        let fitted = legendre_fit(x.view(), y.view(), 0, Some(w.view())).unwrap();
        assert!(fitted[0].abs() < 1e-6);

        let err = legendre_fit(x.view(), y.view(), 0, Some(array![1.0].view())).unwrap_err();
        assert!(matches!(err, BasisError::WeightLengthMismatch { .. }));
    }

    #[test]
    fn power_series_conversion() {
        // x^2 = P0/3 + 2 P2/3
        let leg = power_to_legendre(array![0.0, 0.0, 1.0].view()).unwrap();
        assert_abs_diff_eq!(leg[0], 1.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(leg[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(leg[2], 2.0 / 3.0, epsilon = 1e-12);

        let constant = power_to_legendre(array![7.0].view()).unwrap();
        assert_abs_diff_eq!(constant[0], 7.0, epsilon = 1e-12);
    }

    #[test]
    fn spline_interpolates_knots_and_lines() {
        let knots = array![0.0, 2.0, 3.0, 7.0, 10.0];
        let values = knots.mapv(|k: f64| 3.0 * k - 1.0);
        let spline = CubicSpline::natural(knots.view(), values.view()).unwrap();
        for x in [0.0, 0.5, 2.0, 4.4, 9.9, 10.0] {
            assert_abs_diff_eq!(spline.evaluate(x), 3.0 * x - 1.0, epsilon = 1e-10);
        }

        let curved = array![1.0, -2.0, 4.0, 0.5, 3.0];
        let spline = CubicSpline::natural(knots.view(), curved.view()).unwrap();
        let at_knots = spline.evaluate_many(knots.view());
        for (a, b) in at_knots.iter().zip(curved.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn spline_rejects_unsorted_knots() {
        let err = CubicSpline::natural(array![0.0, 1.0, 1.0].view(), array![1.0, 2.0, 3.0].view())
            .unwrap_err();
        assert!(matches!(err, BasisError::NonIncreasingKnots { .. }));
        assert!(matches!(
            CubicSpline::natural(array![0.0].view(), array![1.0].view()),
            Err(BasisError::TooFewKnots(1))
        ));
    }
}
