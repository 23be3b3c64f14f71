use chromapsf::fitter::{FitResult, FitStatus, Minimizer, MinimizerOptions};
use chromapsf::shape::{Pixels, Psf, PsfKind};
use chromapsf::synthetic::simulate_slice;
use chromapsf::workspace::PsfFitWorkspace;
use ndarray::{Array1, array};

const NY: usize = 200;
const CENTER: f64 = 19.0;
const SATURATION: f64 = 4e5;
const ARTIFACT_ROW: usize = 60;

fn truth() -> Array1<f64> {
    array![1e5, 0.0, CENTER, 2.5, 2.2, -0.3, 1.2, SATURATION]
}

fn fit(psf: &Psf, data: Array1<f64>, errors: Array1<f64>, sigma_clip: Option<f64>) -> FitResult {
    let workspace = PsfFitWorkspace::new(psf.clone(), Pixels::rows(NY), data, errors)
        .expect("matching slice lengths");
    let guess = array![1.0, 0.0, CENTER - 0.6, 3.0, 2.0, -0.1, 1.0, SATURATION];
    let options = MinimizerOptions {
        sigma_clip,
        ..MinimizerOptions::default()
    };
    Minimizer::new(options)
        .minimize(&workspace, guess.view())
        .expect("slice fit")
}

#[test]
fn poisson_slice_fit_leaves_unit_residuals() {
    let psf = Psf::new(PsfKind::MoffatGauss);
    let (_, data, errors) = simulate_slice(&psf, truth().view(), NY, 3);
    let result = fit(&psf, data.clone(), errors.clone(), None);
    assert_ne!(result.status, FitStatus::Diverged);

    let residuals: Array1<f64> = (&data - &result.state.model) / &errors;
    let mean = residuals.mean().expect("non-empty slice");
    let std = residuals.std(0.0);
    assert!(mean.abs() < 0.2, "mean normalized residual {mean}");
    assert!(std > 0.7 && std < 1.2, "normalized residual spread {std}");
    assert!((result.params[2] - CENTER).abs() < 0.05, "center {}", result.params[2]);
    assert!(result.history.windows(2).all(|w| w[1] <= w[0] * (1.0 + 1e-12)));
}

#[test]
fn artifact_is_clipped_without_biasing_the_center() {
    let psf = Psf::new(PsfKind::MoffatGauss);
    let (_, clean, errors) = simulate_slice(&psf, truth().view(), NY, 5);
    let mut corrupted = clean.clone();
    corrupted[ARTIFACT_ROW] += 1e4;

    let reference = fit(&psf, clean, errors.clone(), Some(5.0));
    let clipped = fit(&psf, corrupted.clone(), errors.clone(), Some(5.0));
    let unclipped = fit(&psf, corrupted, errors, None);

    assert!(clipped.outliers.indices().contains(&ARTIFACT_ROW));
    assert!(clipped.segments.len() >= 2);
    assert!((clipped.params[2] - reference.params[2]).abs() < 0.02);
    assert!(clipped.chi2 < 0.1 * unclipped.chi2);
}
