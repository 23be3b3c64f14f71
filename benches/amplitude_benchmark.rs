// ========================================================================================
//
//                 Chromapsf amplitude solver benchmark
//
// ========================================================================================
//
// Measures the linear amplitude solve that runs at every evaluation of the chromatic
// fit, comparing the column-wise (block diagonal) solve with the joint 2D solve as the
// number of dispersion columns grows.
//
// ========================================================================================

use chromapsf::amplitude::{AmplitudePrior, AmplitudeSolver};
use chromapsf::chromatic::{ChromaticPsf, FitGeometry};
use chromapsf::shape::PsfKind;
use chromapsf::synthetic::{default_truth, simulate};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::collections::BTreeMap;

/// Transverse size of every simulated spectrogram.
const NY: usize = 24;
/// Column counts to benchmark.
const COLUMNS: [usize; 3] = [40, 80, 160];

fn benchmark_amplitude_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("amplitude_solve");
    for &nx in COLUMNS.iter() {
        let chromatic = ChromaticPsf::new(PsfKind::MoffatGauss, nx, NY, 2, BTreeMap::new(), 1e6)
            .expect("valid benchmark grid");
        let truth = default_truth(&chromatic, 5000.0).expect("reference polynomial");
        let image = simulate(&chromatic, &truth, FitGeometry::Columns, 0.0, 11)
            .expect("simulation")
            .spectrogram;
        let weights = image.weights();
        let profile = chromatic
            .column_profile(truth.view())
            .expect("profile expansion");
        let solver = AmplitudeSolver::new(AmplitudePrior::NoPrior, 1.0);
        group.throughput(Throughput::Elements((nx * NY) as u64));

        for geometry in [FitGeometry::Columns, FitGeometry::Full2d] {
            let design = chromatic.unit_design(&profile, geometry);
            group.bench_with_input(
                BenchmarkId::new(geometry.to_string(), nx),
                &design,
                |b, design| {
                    b.iter(|| {
                        let solution = solver
                            .solve(black_box(design), image.data.view(), weights.view())
                            .expect("solvable design");
                        black_box(solution);
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(amplitude, benchmark_amplitude_solve);
criterion_main!(amplitude);
