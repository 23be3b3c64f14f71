//! Generic nonlinear least-squares driver with outer sigma clipping.
//!
//! A [`FitProblem`] maps a parameter vector to a model of its flattened data;
//! the [`Minimizer`] turns that into weighted residuals and minimizes the
//! chi-square with either Gauss-Newton steps or BFGS, optionally re-running
//! after every convergence with the current outliers masked.

use crate::amplitude::{AmplitudeError, AmplitudeSolution};
use crate::chromatic::LayoutError;
use crate::shape::ShapeError;
use crate::types::PixelMask;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{InverseC, LeastSquaresSvd, SolveC};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Expected {expected} parameters but got {got}.")]
    ParameterCount { expected: usize, got: usize },

    #[error("Mask covers {got} pixels but the data has {expected}.")]
    MaskLength { expected: usize, got: usize },

    #[error("No pixel has a finite error and a valid value; nothing to fit.")]
    NoValidPixels,

    #[error("Unknown minimizer method '{0}'. Expected 'newton' or 'bfgs'.")]
    UnknownMethod(String),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Amplitude(#[from] AmplitudeError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("Linear algebra failure in a Gauss-Newton step: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// Model produced by one evaluation of a [`FitProblem`].
#[derive(Debug, Clone)]
pub struct FitState {
    /// Model of the flattened data.
    pub model: Array1<f64>,
    /// Linear amplitudes eliminated during the evaluation, if the problem has any.
    pub amplitudes: Option<AmplitudeSolution>,
    /// Non-negative penalty added to the chi-square.
    pub penalty: f64,
}

/// A parametric model of a fixed data vector.
pub trait FitProblem {
    fn n_params(&self) -> usize;

    fn data(&self) -> ArrayView1<'_, f64>;

    fn errors(&self) -> ArrayView1<'_, f64>;

    /// Hard bounds; steps are projected onto them.
    fn bounds(&self) -> &[(f64, f64)];

    fn fixed(&self) -> &[bool];

    /// Pixels excluded before any clipping.
    fn base_mask(&self) -> PixelMask {
        PixelMask::none(self.data().len())
    }

    fn evaluate(&self, params: ArrayView1<f64>, mask: &PixelMask) -> Result<FitState, FitError>;
}

/// Receives every accepted iteration.
pub trait FitObserver {
    fn on_iteration(&mut self, iteration: usize, params: ArrayView1<f64>, cost: f64);
}

/// Observer that ignores every iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl FitObserver for NoObserver {
    fn on_iteration(&mut self, _: usize, _: ArrayView1<f64>, _: f64) {}
}

impl<F: FnMut(usize, ArrayView1<f64>, f64)> FitObserver for F {
    fn on_iteration(&mut self, iteration: usize, params: ArrayView1<f64>, cost: f64) {
        self(iteration, params, cost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinimizerMethod {
    /// Gauss-Newton with a finite-difference Jacobian and step halving.
    #[default]
    Newton,
    /// Quasi-Newton with a Wolfe line search on the chi-square.
    Bfgs,
}

impl fmt::Display for MinimizerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MinimizerMethod::Newton => "newton",
            MinimizerMethod::Bfgs => "bfgs",
        })
    }
}

impl FromStr for MinimizerMethod {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newton" => Ok(MinimizerMethod::Newton),
            "bfgs" => Ok(MinimizerMethod::Bfgs),
            other => Err(FitError::UnknownMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    Converged,
    MaxIterationsReached,
    /// The cost became non-finite; the last valid parameters are returned.
    Diverged,
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FitStatus::Converged => "converged",
            FitStatus::MaxIterationsReached => "maximum iterations reached",
            FitStatus::Diverged => "diverged",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizerOptions {
    pub method: MinimizerMethod,
    pub max_iterations: usize,
    /// Relative chi-square tolerance; `1 / Npix` when unset.
    pub ftol: Option<f64>,
    /// Relative parameter step tolerance.
    pub xtol: f64,
    /// Relative finite-difference step.
    pub epsilon: f64,
    pub max_step_halvings: usize,
    /// Outlier threshold in units of the pixel error; no clipping when unset.
    pub sigma_clip: Option<f64>,
    pub max_clip_rounds: usize,
}

impl Default for MinimizerOptions {
    fn default() -> Self {
        Self {
            method: MinimizerMethod::Newton,
            max_iterations: 50,
            ftol: None,
            xtol: 1e-6,
            epsilon: 1e-4,
            max_step_halvings: 12,
            sigma_clip: None,
            max_clip_rounds: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub params: Array1<f64>,
    pub state: FitState,
    /// Weighted sum of squared residuals over the unmasked pixels, penalty excluded.
    pub chi2: f64,
    /// Accepted cost (chi-square plus penalty) of every iteration, segments concatenated.
    pub history: Vec<f64>,
    /// Index in `history` where each minimization segment starts.
    pub segments: Vec<usize>,
    pub status: FitStatus,
    /// Pixels rejected by sigma clipping.
    pub outliers: PixelMask,
    /// Base mask and outliers together, as used by the final segment.
    pub mask: PixelMask,
    /// `(J^T W J)^-1` over all parameters, zero for fixed ones; `None` when singular.
    pub covariance: Option<Array2<f64>>,
    pub iterations: usize,
}

/// Runs a [`FitProblem`] to convergence.
#[derive(Debug, Clone, Default)]
pub struct Minimizer {
    options: MinimizerOptions,
}

impl Minimizer {
    pub fn new(options: MinimizerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MinimizerOptions {
        &self.options
    }

    pub fn minimize<P: FitProblem + ?Sized>(
        &self,
        problem: &P,
        x0: ArrayView1<f64>,
    ) -> Result<FitResult, FitError> {
        self.minimize_observed(problem, x0, &mut NoObserver)
    }

    pub fn minimize_observed<P: FitProblem + ?Sized>(
        &self,
        problem: &P,
        x0: ArrayView1<f64>,
        observer: &mut dyn FitObserver,
    ) -> Result<FitResult, FitError> {
        let n_params = problem.n_params();
        if x0.len() != n_params
            || problem.bounds().len() != n_params
            || problem.fixed().len() != n_params
        {
            return Err(FitError::ParameterCount {
                expected: n_params,
                got: x0.len(),
            });
        }
        let n_pixels = problem.data().len();
        let base = problem.base_mask();
        if base.len() != n_pixels {
            return Err(FitError::MaskLength {
                expected: n_pixels,
                got: base.len(),
            });
        }

        let mut outliers = PixelMask::none(n_pixels);
        let mut params = internal::project(x0.to_owned(), problem.bounds());
        let mut history = Vec::new();
        let mut segments = Vec::new();
        let mut iterations = 0;
        let mut round = 0;

        let (segment, evaluator) = loop {
            let mask = base.union(&outliers);
            let evaluator = internal::Evaluator::new(problem, mask)?;
            let ftol = self
                .options
                .ftol
                .unwrap_or(1.0 / evaluator.valid_pixels() as f64);
            segments.push(history.len());
            let segment = match self.options.method {
                MinimizerMethod::Newton => internal::newton(
                    &evaluator,
                    params.clone(),
                    &self.options,
                    ftol,
                    &mut history,
                    observer,
                )?,
                MinimizerMethod::Bfgs => internal::bfgs(
                    &evaluator,
                    params.clone(),
                    &self.options,
                    ftol,
                    &mut history,
                    observer,
                )?,
            };
            iterations += segment.iterations;
            params = segment.params.clone();
            log::info!(
                "Fit segment {round} finished ({}) after {} iterations with cost {:.6e}.",
                segment.status,
                segment.iterations,
                segment.evaluation.cost
            );

            let Some(threshold) = self.options.sigma_clip else {
                break (segment, evaluator);
            };
            if segment.status == FitStatus::Diverged || round >= self.options.max_clip_rounds {
                break (segment, evaluator);
            }
            let clipped = internal::sigma_clip(problem, &base, &segment.evaluation.state.model, threshold);
            log::info!(
                "Sigma clipping round {}: {} outliers beyond {threshold} sigma.",
                round + 1,
                clipped.count()
            );
            if clipped == outliers {
                break (segment, evaluator);
            }
            outliers = clipped;
            round += 1;
        };

        let covariance = if segment.status == FitStatus::Diverged {
            None
        } else {
            internal::covariance(&evaluator, &segment, self.options.epsilon)?
        };
        let evaluation = Rc::clone(&segment.evaluation);
        Ok(FitResult {
            params: segment.params,
            state: evaluation.state.clone(),
            chi2: evaluation.chi2,
            history,
            segments,
            status: segment.status,
            mask: evaluator.into_mask(),
            outliers,
            covariance,
            iterations,
        })
    }
}

mod internal {
    use super::*;

    const NON_FINITE_COST: f64 = 1e300;

    #[derive(Debug)]
    pub(super) struct Evaluation {
        pub(super) state: FitState,
        /// Weighted pixel residuals followed by the square root of the penalty.
        pub(super) residuals: Array1<f64>,
        pub(super) chi2: f64,
        pub(super) cost: f64,
    }

    pub(super) struct Segment {
        pub(super) params: Array1<f64>,
        pub(super) evaluation: Rc<Evaluation>,
        pub(super) status: FitStatus,
        pub(super) iterations: usize,
    }

    /// Most recently used evaluations keyed by parameter bit pattern.
    struct EvaluationCache {
        capacity: usize,
        entries: HashMap<Vec<u64>, Rc<Evaluation>>,
        order: VecDeque<Vec<u64>>,
    }

    impl EvaluationCache {
        fn new(capacity: usize) -> Self {
            Self {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                order: VecDeque::new(),
            }
        }

        fn get(&mut self, key: &[u64]) -> Option<Rc<Evaluation>> {
            let hit = Rc::clone(self.entries.get(key)?);
            if let Some(pos) = self.order.iter().position(|k| k.as_slice() == key)
                && let Some(k) = self.order.remove(pos)
            {
                self.order.push_back(k);
            }
            Some(hit)
        }

        fn insert(&mut self, key: Vec<u64>, evaluation: Rc<Evaluation>) {
            if self.entries.insert(key.clone(), evaluation).is_none() {
                self.order.push_back(key);
            }
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    /// Evaluates a problem under a fixed mask, caching the last `n_free + 2` points.
    pub(super) struct Evaluator<'a, P: FitProblem + ?Sized> {
        problem: &'a P,
        mask: PixelMask,
        inverse_errors: Array1<f64>,
        free: Vec<usize>,
        cache: RefCell<EvaluationCache>,
    }

    impl<'a, P: FitProblem + ?Sized> Evaluator<'a, P> {
        pub(super) fn new(problem: &'a P, mask: PixelMask) -> Result<Self, FitError> {
            let inverse_errors: Array1<f64> = problem
                .data()
                .iter()
                .zip(problem.errors().iter())
                .zip(mask.iter())
                .map(|((&d, &e), &masked)| {
                    if masked || !d.is_finite() || !(e.is_finite() && e > 0.0) {
                        0.0
                    } else {
                        1.0 / e
                    }
                })
                .collect();
            if inverse_errors.iter().all(|&w| w == 0.0) {
                return Err(FitError::NoValidPixels);
            }
            let free: Vec<usize> = (0..problem.n_params())
                .filter(|&i| !problem.fixed()[i])
                .collect();
            Ok(Self {
                problem,
                mask,
                inverse_errors,
                cache: RefCell::new(EvaluationCache::new(free.len() + 2)),
                free,
            })
        }

        pub(super) fn valid_pixels(&self) -> usize {
            self.inverse_errors.iter().filter(|&&w| w > 0.0).count()
        }

        pub(super) fn free(&self) -> &[usize] {
            &self.free
        }

        pub(super) fn bounds(&self) -> &[(f64, f64)] {
            self.problem.bounds()
        }

        pub(super) fn into_mask(self) -> PixelMask {
            self.mask
        }

        #[cfg(test)]
        pub(super) fn cached_len(&self) -> usize {
            self.cache.borrow().entries.len()
        }

        pub(super) fn evaluate(&self, params: &Array1<f64>) -> Result<Rc<Evaluation>, FitError> {
            let key: Vec<u64> = params.iter().map(|v| v.to_bits()).collect();
            if let Some(hit) = self.cache.borrow_mut().get(&key) {
                return Ok(hit);
            }
            let state = self.problem.evaluate(params.view(), &self.mask)?;
            let data = self.problem.data();
            let mut residuals = Array1::zeros(data.len() + 1);
            for (i, r) in residuals.iter_mut().take(data.len()).enumerate() {
                let w = self.inverse_errors[i];
                if w > 0.0 {
                    *r = (data[i] - state.model[i]) * w;
                }
            }
            let chi2: f64 = residuals.iter().map(|r| r * r).sum();
            let penalty = state.penalty.max(0.0);
            residuals[data.len()] = penalty.sqrt();
            let evaluation = Rc::new(Evaluation {
                cost: chi2 + penalty,
                chi2,
                residuals,
                state,
            });
            self.cache.borrow_mut().insert(key, Rc::clone(&evaluation));
            Ok(evaluation)
        }
    }

    pub(super) fn project(mut params: Array1<f64>, bounds: &[(f64, f64)]) -> Array1<f64> {
        for (p, &(lo, hi)) in params.iter_mut().zip(bounds) {
            *p = p.max(lo).min(hi);
        }
        params
    }

    /// Forward step for parameter `i`, flipped when it would leave the bounds.
    fn finite_step(value: f64, (lo, hi): (f64, f64), epsilon: f64) -> f64 {
        let h = if value == 0.0 {
            epsilon
        } else {
            epsilon * value.abs()
        };
        if value + h > hi && value - h >= lo { -h } else { h }
    }

    /// Jacobian of the residual vector with respect to the free parameters.
    pub(super) fn jacobian<P: FitProblem + ?Sized>(
        evaluator: &Evaluator<'_, P>,
        params: &Array1<f64>,
        base: &Evaluation,
        epsilon: f64,
    ) -> Result<Array2<f64>, FitError> {
        let free = evaluator.free();
        let mut jac = Array2::zeros((base.residuals.len(), free.len()));
        for (col, &i) in free.iter().enumerate() {
            let h = finite_step(params[i], evaluator.bounds()[i], epsilon);
            let mut shifted = params.clone();
            shifted[i] += h;
            let trial = evaluator.evaluate(&shifted)?;
            // Residuals are data minus model, so the model derivative is the negated difference.
            jac.column_mut(col)
                .assign(&((&trial.residuals - &base.residuals) / -h));
        }
        Ok(jac)
    }

    /// Gauss-Newton step `(J^T J) delta = J^T r` for `r = data - model`.
    fn gauss_newton_step(jac: &Array2<f64>, residuals: &Array1<f64>) -> Result<Array1<f64>, FitError> {
        let normal = jac.t().dot(jac);
        let rhs = jac.t().dot(residuals);
        match normal.solvec(&rhs) {
            Ok(step) if step.iter().all(|v| v.is_finite()) => Ok(step),
            _ => {
                log::debug!("Normal equations are not positive definite; using an SVD step.");
                Ok(jac.least_squares(residuals)?.solution)
            }
        }
    }

    pub(super) fn newton<P: FitProblem + ?Sized>(
        evaluator: &Evaluator<'_, P>,
        x0: Array1<f64>,
        options: &MinimizerOptions,
        ftol: f64,
        history: &mut Vec<f64>,
        observer: &mut dyn FitObserver,
    ) -> Result<Segment, FitError> {
        let mut params = x0;
        let mut current = evaluator.evaluate(&params)?;
        if !current.cost.is_finite() {
            log::warn!("Initial cost is not finite; returning the starting parameters.");
            return Ok(Segment {
                params,
                evaluation: current,
                status: FitStatus::Diverged,
                iterations: 0,
            });
        }
        history.push(current.cost);
        let free = evaluator.free().to_vec();
        if free.is_empty() {
            return Ok(Segment {
                params,
                evaluation: current,
                status: FitStatus::Converged,
                iterations: 0,
            });
        }

        for iteration in 1..=options.max_iterations {
            let jac = jacobian(evaluator, &params, &current, options.epsilon)?;
            if jac.iter().any(|v| !v.is_finite()) {
                log::warn!(
                    "Jacobian is not finite at iteration {iteration}; keeping the last valid parameters."
                );
                return Ok(Segment {
                    params,
                    evaluation: current,
                    status: FitStatus::Diverged,
                    iterations: iteration - 1,
                });
            }
            let direction = gauss_newton_step(&jac, &current.residuals)?;

            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..=options.max_step_halvings {
                let mut trial = params.clone();
                for (k, &i) in free.iter().enumerate() {
                    trial[i] += scale * direction[k];
                }
                let trial = project(trial, evaluator.bounds());
                let evaluation = evaluator.evaluate(&trial)?;
                if evaluation.cost.is_finite() && evaluation.cost <= current.cost {
                    accepted = Some((trial, evaluation));
                    break;
                }
                scale *= 0.5;
            }

            let Some((next, evaluation)) = accepted else {
                log::debug!("No step decreases the cost at iteration {iteration}; stopping.");
                return Ok(Segment {
                    params,
                    evaluation: current,
                    status: FitStatus::Converged,
                    iterations: iteration - 1,
                });
            };

            let relative_cost = (current.cost - evaluation.cost) / current.cost.max(1.0);
            let step_norm = free.iter().map(|&i| (next[i] - params[i]).powi(2)).sum::<f64>().sqrt();
            let param_norm = free.iter().map(|&i| params[i].powi(2)).sum::<f64>().sqrt();
            let relative_step = step_norm / param_norm.max(1.0);
            log::debug!(
                "Iteration {iteration}: cost {:.6e}, relative change {relative_cost:.3e}, step scale {scale}.",
                evaluation.cost
            );

            params = next;
            current = evaluation;
            history.push(current.cost);
            observer.on_iteration(iteration, params.view(), current.cost);

            if relative_cost < ftol && relative_step < options.xtol {
                return Ok(Segment {
                    params,
                    evaluation: current,
                    status: FitStatus::Converged,
                    iterations: iteration,
                });
            }
        }

        Ok(Segment {
            params,
            evaluation: current,
            status: FitStatus::MaxIterationsReached,
            iterations: options.max_iterations,
        })
    }

    pub(super) fn bfgs<P: FitProblem + ?Sized>(
        evaluator: &Evaluator<'_, P>,
        x0: Array1<f64>,
        options: &MinimizerOptions,
        ftol: f64,
        history: &mut Vec<f64>,
        observer: &mut dyn FitObserver,
    ) -> Result<Segment, FitError> {
        let start = evaluator.evaluate(&x0)?;
        if !start.cost.is_finite() {
            log::warn!("Initial cost is not finite; returning the starting parameters.");
            return Ok(Segment {
                params: x0,
                evaluation: start,
                status: FitStatus::Diverged,
                iterations: 0,
            });
        }
        history.push(start.cost);
        let free = evaluator.free().to_vec();
        if free.is_empty() {
            return Ok(Segment {
                params: x0,
                evaluation: start,
                status: FitStatus::Converged,
                iterations: 0,
            });
        }

        let embed = |z: &Array1<f64>| -> Array1<f64> {
            let mut full = x0.clone();
            for (k, &i) in free.iter().enumerate() {
                full[i] = z[k];
            }
            project(full, evaluator.bounds())
        };
        let best = RefCell::new((x0.clone(), Rc::clone(&start)));
        let failure = RefCell::new(None::<FitError>);
        let improvements = RefCell::new(0usize);
        let trail = RefCell::new((history, observer));

        let cost_at = |z: &Array1<f64>| -> f64 {
            let full = embed(z);
            match evaluator.evaluate(&full) {
                Ok(evaluation) if evaluation.cost.is_finite() => {
                    let mut best = best.borrow_mut();
                    if evaluation.cost < best.1.cost {
                        let mut count = improvements.borrow_mut();
                        *count += 1;
                        let mut trail = trail.borrow_mut();
                        trail.0.push(evaluation.cost);
                        trail.1.on_iteration(*count, full.view(), evaluation.cost);
                        *best = (full, Rc::clone(&evaluation));
                    }
                    evaluation.cost
                }
                Ok(_) => NON_FINITE_COST,
                Err(e) => {
                    failure.borrow_mut().get_or_insert(e);
                    NON_FINITE_COST
                }
            }
        };

        let z0: Array1<f64> = free.iter().map(|&i| x0[i]).collect();
        let cost_and_grad = |z: &Array1<f64>| -> (f64, Array1<f64>) {
            let cost = cost_at(z);
            let mut grad = Array1::zeros(z.len());
            if cost >= NON_FINITE_COST {
                return (cost, grad);
            }
            for (k, &i) in free.iter().enumerate() {
                let h = finite_step(z[k], evaluator.bounds()[i], options.epsilon);
                let mut shifted = z.clone();
                shifted[k] += h;
                grad[k] = (cost_at(&shifted) - cost) / h;
            }
            (cost, grad)
        };

        let outcome = Bfgs::new(z0, cost_and_grad)
            .with_tolerance(ftol)
            .with_max_iterations(options.max_iterations)
            .run();
        if let Some(e) = failure.into_inner() {
            return Err(e);
        }
        let iterations = *improvements.borrow();
        let (params, evaluation) = best.into_inner();
        let status = match outcome {
            Ok(BfgsSolution { iterations: used, .. }) => {
                log::debug!("BFGS finished after {used} iterations.");
                FitStatus::Converged
            }
            Err(e) if iterations >= options.max_iterations => {
                log::warn!("BFGS stopped at its iteration limit: {e:?}");
                FitStatus::MaxIterationsReached
            }
            Err(e) => {
                log::debug!("BFGS line search stalled ({e:?}); keeping the best point seen.");
                FitStatus::Converged
            }
        };
        Ok(Segment {
            params,
            evaluation,
            status,
            iterations,
        })
    }

    /// Pixels outside the base mask whose normalized residual exceeds `threshold`.
    pub(super) fn sigma_clip<P: FitProblem + ?Sized>(
        problem: &P,
        base: &PixelMask,
        model: &Array1<f64>,
        threshold: f64,
    ) -> PixelMask {
        let flags = problem
            .data()
            .iter()
            .zip(problem.errors().iter())
            .zip(model.iter())
            .zip(base.iter())
            .map(|(((&d, &e), &m), &excluded)| {
                !excluded && e.is_finite() && e > 0.0 && ((d - m) / e).abs() > threshold
            })
            .collect();
        PixelMask(flags)
    }

    pub(super) fn covariance<P: FitProblem + ?Sized>(
        evaluator: &Evaluator<'_, P>,
        segment: &Segment,
        epsilon: f64,
    ) -> Result<Option<Array2<f64>>, FitError> {
        let free = evaluator.free();
        let n = segment.params.len();
        if free.is_empty() {
            return Ok(Some(Array2::zeros((n, n))));
        }
        let jac = jacobian(evaluator, &segment.params, &segment.evaluation, epsilon)?;
        let inverse = match jac.t().dot(&jac).invc() {
            Ok(inverse) if inverse.iter().all(|v| v.is_finite()) => inverse,
            _ => {
                log::warn!("Parameter covariance is singular; it is not reported.");
                return Ok(None);
            }
        };
        let mut full = Array2::zeros((n, n));
        for (a, &i) in free.iter().enumerate() {
            for (b, &j) in free.iter().enumerate() {
                full[[i, j]] = inverse[[a, b]];
            }
        }
        Ok(Some(full))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// `a exp(-(t - b)^2 / (2 c^2)) + d`
    struct GaussianLine {
        t: Array1<f64>,
        data: Array1<f64>,
        errors: Array1<f64>,
        bounds: Vec<(f64, f64)>,
        fixed: Vec<bool>,
    }

    impl GaussianLine {
        fn model(t: &Array1<f64>, p: ArrayView1<f64>) -> Array1<f64> {
            t.mapv(|t| p[0] * (-(t - p[1]).powi(2) / (2.0 * p[2] * p[2])).exp() + p[3])
        }

        fn new(truth: ArrayView1<f64>, error: f64) -> Self {
            let t = Array1::range(0.0, 20.25, 0.25);
            let data = Self::model(&t, truth);
            let n = t.len();
            Self {
                t,
                data,
                errors: Array1::from_elem(n, error),
                bounds: vec![
                    (0.0, f64::INFINITY),
                    (f64::NEG_INFINITY, f64::INFINITY),
                    (0.1, 20.0),
                    (f64::NEG_INFINITY, f64::INFINITY),
                ],
                fixed: vec![false; 4],
            }
        }
    }

    impl FitProblem for GaussianLine {
        fn n_params(&self) -> usize {
            4
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

        fn evaluate(&self, params: ArrayView1<f64>, _: &PixelMask) -> Result<FitState, FitError> {
            Ok(FitState {
                model: Self::model(&self.t, params),
                amplitudes: None,
                penalty: 0.0,
            })
        }
    }

    fn assert_segments_non_increasing(result: &FitResult) {
        let mut bounds = result.segments.clone();
        bounds.push(result.history.len());
        for window in bounds.windows(2) {
            for pair in result.history[window[0]..window[1]].windows(2) {
                assert!(pair[1] <= pair[0], "cost rose from {} to {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn newton_recovers_noiseless_parameters() {
        let truth = array![10.0, 9.0, 1.5, 0.5];
        let problem = GaussianLine::new(truth.view(), 0.1);
        let result = Minimizer::default()
            .minimize(&problem, array![8.0, 8.5, 2.0, 0.0].view())
            .unwrap();
        assert_eq!(result.status, FitStatus::Converged);
        for (p, t) in result.params.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(p, t, epsilon = 1e-4);
        }
        assert!(result.chi2 < 1e-6);
        assert_segments_non_increasing(&result);
        assert_eq!(result.segments, vec![0]);
        let covariance = result.covariance.expect("well conditioned");
        assert!((0..4).all(|i| covariance[[i, i]] > 0.0));
    }

    #[test]
    fn evaluation_cache_holds_only_recent_points() {
        let truth = array![10.0, 9.0, 1.5, 0.5];
        let problem = GaussianLine::new(truth.view(), 0.1);
        let evaluator = internal::Evaluator::new(&problem, PixelMask::none(problem.data.len())).unwrap();
        let capacity = evaluator.free().len() + 2;

        let mut history = Vec::new();
        let segment = internal::newton(
            &evaluator,
            array![8.0, 8.5, 2.0, 0.0],
            &MinimizerOptions::default(),
            1e-12,
            &mut history,
            &mut NoObserver,
        )
        .unwrap();
        assert!(segment.iterations >= 2);
        assert!(evaluator.cached_len() <= capacity);

        let point = array![9.0, 9.0, 1.5, 0.5];
        let first = evaluator.evaluate(&point).unwrap();
        let second = evaluator.evaluate(&point).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        for k in 0..2 * capacity {
            evaluator.evaluate(&array![9.0, 9.0, 1.5, k as f64]).unwrap();
        }
        assert_eq!(evaluator.cached_len(), capacity);
        assert!(!Rc::ptr_eq(&first, &evaluator.evaluate(&point).unwrap()));
    }

    #[test]
    fn bfgs_reaches_the_same_minimum() {
        let truth = array![10.0, 9.0, 1.5, 0.5];
        let problem = GaussianLine::new(truth.view(), 1.0);
        let options = MinimizerOptions {
            method: MinimizerMethod::Bfgs,
            max_iterations: 500,
            ftol: Some(1e-10),
            ..MinimizerOptions::default()
        };
        let result = Minimizer::new(options)
            .minimize(&problem, array![9.0, 8.7, 1.7, 0.3].view())
            .unwrap();
        assert_ne!(result.status, FitStatus::Diverged);
        assert_abs_diff_eq!(result.params[1], 9.0, epsilon = 1e-2);
        assert_abs_diff_eq!(result.params[0], 10.0, epsilon = 5e-2);
        assert_segments_non_increasing(&result);
    }

    #[test]
    fn steps_are_projected_onto_bounds() {
        let truth = array![10.0, 9.0, 1.5, 0.5];
        let mut problem = GaussianLine::new(truth.view(), 0.1);
        problem.bounds[3] = (1.0, 2.0);
        let result = Minimizer::default()
            .minimize(&problem, array![10.0, 9.0, 1.5, 1.5].view())
            .unwrap();
        assert!(result.params[3] >= 1.0 && result.params[3] <= 2.0);
        assert_abs_diff_eq!(result.params[3], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn fixed_parameters_do_not_move() {
        let truth = array![10.0, 9.0, 1.5, 0.5];
        let mut problem = GaussianLine::new(truth.view(), 0.1);
        problem.fixed[2] = true;
        let result = Minimizer::default()
            .minimize(&problem, array![7.0, 8.0, 1.5, 0.0].view())
            .unwrap();
        assert_eq!(result.params[2], 1.5);
        assert_abs_diff_eq!(result.params[0], 10.0, epsilon = 1e-4);
        let covariance = result.covariance.unwrap();
        assert!(covariance.row(2).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn sigma_clipping_rejects_an_outlier_and_refits() {
        let truth = array![10.0, 9.0, 1.5, 0.5];
        let mut problem = GaussianLine::new(truth.view(), 1.0);
        problem.data[20] += 60.0;
        let options = MinimizerOptions {
            sigma_clip: Some(5.0),
            max_clip_rounds: 5,
            ..MinimizerOptions::default()
        };
        let mut accepted = 0;
        let mut count = |_: usize, _: ArrayView1<f64>, _: f64| accepted += 1;
        let result = Minimizer::new(options)
            .minimize_observed(&problem, array![9.0, 8.5, 2.0, 0.0].view(), &mut count)
            .unwrap();
        assert_eq!(result.outliers.indices(), vec![20]);
        assert!(result.mask[20]);
        assert!(result.segments.len() >= 2);
        assert_abs_diff_eq!(result.params[1], 9.0, epsilon = 1e-3);
        assert_abs_diff_eq!(result.params[3], 0.5, epsilon = 1e-3);
        assert_segments_non_increasing(&result);
        assert!(accepted > 0);
    }

    #[test]
    fn non_finite_start_is_reported_as_divergence() {
        let truth = array![10.0, 9.0, 1.5, 0.5];
        let mut problem = GaussianLine::new(truth.view(), 0.1);
        problem.bounds[2] = (f64::NEG_INFINITY, f64::INFINITY);
        let start = array![10.0, 9.0, 0.0, 0.5];
        let result = Minimizer::default().minimize(&problem, start.view()).unwrap();
        assert_eq!(result.status, FitStatus::Diverged);
        assert_eq!(result.params, start);
        assert!(result.covariance.is_none());
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let truth = array![10.0, 9.0, 1.5, 0.5];
        let problem = GaussianLine::new(truth.view(), 0.1);
        assert!(matches!(
            Minimizer::default().minimize(&problem, array![1.0, 2.0].view()),
            Err(FitError::ParameterCount { expected: 4, got: 2 })
        ));
        let mut blind = GaussianLine::new(truth.view(), 0.1);
        blind.errors.fill(f64::INFINITY);
        assert!(matches!(
            Minimizer::default().minimize(&blind, truth.view()),
            Err(FitError::NoValidPixels)
        ));
        assert!(matches!(
            "levenberg".parse::<MinimizerMethod>(),
            Err(FitError::UnknownMethod(_))
        ));
    }
}
