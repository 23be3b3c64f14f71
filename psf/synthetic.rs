//! Simulated spectrograms with Poisson noise, for tests and the `simulate` command.

use crate::chromatic::{ChromaticPsf, FitGeometry};
use crate::data::Spectrogram;
use crate::estimate::EstimationError;
use crate::shape::Psf;
use crate::types::PolyParams;
use ndarray::{Array, Array1, Array2, ArrayView, ArrayView1, Dimension};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};

/// Variance added to the Poisson variance of every pixel.
pub const READ_NOISE_VARIANCE: f64 = 1.0;

/// A simulated image with the model it was drawn from.
#[derive(Debug, Clone)]
pub struct SyntheticSpectrogram {
    pub truth: PolyParams,
    pub expected: Array2<f64>,
    pub spectrogram: Spectrogram,
}

/// Smooth positive amplitudes peaking at `peak` in the middle of `nx` columns.
pub fn smooth_amplitudes(nx: usize, peak: f64) -> Array1<f64> {
    let center = (nx as f64 - 1.0) / 2.0;
    let scale = (nx as f64 / 3.0).max(1.0);
    Array1::from_shape_fn(nx, |x| {
        let u = (x as f64 - center) / scale;
        peak * (0.3 + 0.7 * (-u * u).exp())
    })
}

/// Reference truth: the test polynomial vector with [`smooth_amplitudes`].
pub fn default_truth(chromatic: &ChromaticPsf, peak: f64) -> Result<PolyParams, EstimationError> {
    let mut truth = chromatic.generate_test_poly_params()?;
    let nx = chromatic.nx();
    truth
        .slice_mut(ndarray::s![..nx])
        .assign(&smooth_amplitudes(nx, peak));
    Ok(truth)
}

/// Draws Poisson counts around `expected`; errors are `sqrt(expected + READ_NOISE_VARIANCE)`.
pub fn poisson_realization<D: Dimension>(
    expected: ArrayView<f64, D>,
    rng: &mut StdRng,
) -> (Array<f64, D>, Array<f64, D>) {
    let data = expected.mapv(|mu| internal::draw(mu, rng));
    let errors = expected.mapv(|mu| (mu.max(0.0) + READ_NOISE_VARIANCE).sqrt());
    (data, errors)
}

/// Simulates a spectrogram of `truth` with an optional flat background level.
pub fn simulate(
    chromatic: &ChromaticPsf,
    truth: &PolyParams,
    geometry: FitGeometry,
    background: f64,
    seed: u64,
) -> Result<SyntheticSpectrogram, EstimationError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let expected = chromatic.evaluate(truth.view(), geometry)? + background;
    let (data, errors) = poisson_realization(expected.view(), &mut rng);
    let spectrogram = Spectrogram::new(data, errors, Some(chromatic.saturation()))?;
    log::info!(
        "Simulated a {} x {} spectrogram with seed {seed}.",
        chromatic.ny(),
        chromatic.nx()
    );
    Ok(SyntheticSpectrogram {
        truth: truth.clone(),
        expected,
        spectrogram,
    })
}

/// Simulates one transverse slice of a single PSF.
pub fn simulate_slice(
    psf: &Psf,
    params: ArrayView1<f64>,
    ny: usize,
    seed: u64,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    let rows = Array1::range(0.0, ny as f64, 1.0);
    let expected = psf.evaluate_transverse(rows.view(), params);
    let mut rng = StdRng::seed_from_u64(seed);
    let (data, errors) = poisson_realization(expected.view(), &mut rng);
    (expected, data, errors)
}

mod internal {
    use super::*;

    pub(super) fn draw(mu: f64, rng: &mut StdRng) -> f64 {
        match Poisson::new(mu) {
            Ok(poisson) if mu > 0.0 => poisson.sample(rng),
            _ => 0.0,
        }
    }
}
