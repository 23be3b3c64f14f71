//! Chromatic PSF: a PSF whose shape parameters vary smoothly along the
//! dispersion axis, stored either as a per-column profile table or as a
//! compact vector of Legendre coefficients.

use crate::amplitude::DesignMatrix;
use crate::basis::{self, BasisError};
use crate::shape::{ParamRole, Psf, PsfKind, ShapeError};
use crate::types::{PolyParams, ProfileParams};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error(
        "Polynomial vector has {got} entries; expected {with_amplitudes} (with amplitudes) or {without_amplitudes} (shape only)."
    )]
    LengthMismatch {
        got: usize,
        with_amplitudes: usize,
        without_amplitudes: usize,
    },

    #[error("Profile table has shape {got:?}; expected ({nx}, {n_params}).")]
    ProfileShape {
        got: (usize, usize),
        nx: usize,
        n_params: usize,
    },

    #[error("Degree {degree} for '{name}' needs more than the {nx} available columns.")]
    DegreeTooHigh {
        name: String,
        degree: usize,
        nx: usize,
    },

    #[error("A chromatic PSF needs at least one column and one row, got {nx} x {ny}.")]
    EmptyGrid { nx: usize, ny: usize },

    #[error("Unknown fit geometry '{0}'. Expected 'columns' or 'full2d'.")]
    UnknownGeometry(String),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Basis(#[from] BasisError),
}

/// How a chromatic PSF is laid onto the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitGeometry {
    /// Each column is an independent transverse profile.
    Columns,
    /// Every column contributes a 2D PSF to the whole image.
    Full2d,
}

impl fmt::Display for FitGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FitGeometry::Columns => "columns",
            FitGeometry::Full2d => "full2d",
        })
    }
}

impl FromStr for FitGeometry {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "columns" | "1d" => Ok(FitGeometry::Columns),
            "full2d" | "2d" => Ok(FitGeometry::Full2d),
            other => Err(LayoutError::UnknownGeometry(other.to_string())),
        }
    }
}

/// Location of one parameter's Legendre coefficients inside the shape block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolyBlock {
    pub offset: usize,
    pub degree: usize,
}

/// Layout of a polynomial parameter vector, built once from the descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct PolyLayout {
    nx: usize,
    blocks: Vec<Option<PolyBlock>>,
    n_shape: usize,
}

impl PolyLayout {
    /// `degree` applies to every parameter unless overridden by name;
    /// saturation is always a single constant.
    pub fn new(
        psf: &Psf,
        nx: usize,
        degree: usize,
        overrides: &BTreeMap<String, usize>,
    ) -> Result<Self, LayoutError> {
        for name in overrides.keys() {
            psf.index_of(name)?;
        }
        let mut blocks = Vec::with_capacity(psf.n_params());
        let mut offset = 0;
        for d in psf.descriptors() {
            let block = match d.role {
                ParamRole::Amplitude => None,
                ParamRole::Saturation => Some(PolyBlock { offset, degree: 0 }),
                _ => {
                    let degree = overrides.get(d.name).copied().unwrap_or(degree);
                    if degree >= nx.max(1) {
                        return Err(LayoutError::DegreeTooHigh {
                            name: d.name.to_string(),
                            degree,
                            nx,
                        });
                    }
                    Some(PolyBlock { offset, degree })
                }
            };
            if let Some(b) = block {
                offset += b.degree + 1;
            }
            blocks.push(block);
        }
        Ok(Self {
            nx,
            blocks,
            n_shape: offset,
        })
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn n_shape(&self) -> usize {
        self.n_shape
    }

    pub fn len_with_amplitudes(&self) -> usize {
        self.nx + self.n_shape
    }

    pub fn block(&self, k: usize) -> Option<PolyBlock> {
        self.blocks.get(k).copied().flatten()
    }

    /// Splits a polynomial vector into its optional amplitude block and its shape block.
    pub fn split<'a>(
        &self,
        poly: ArrayView1<'a, f64>,
    ) -> Result<(Option<ArrayView1<'a, f64>>, ArrayView1<'a, f64>), LayoutError> {
        if poly.len() == self.len_with_amplitudes() {
            let (amplitudes, shape) = poly.split_at(Axis(0), self.nx);
            Ok((Some(amplitudes), shape))
        } else if poly.len() == self.n_shape {
            Ok((None, poly))
        } else {
            Err(LayoutError::LengthMismatch {
                got: poly.len(),
                with_amplitudes: self.len_with_amplitudes(),
                without_amplitudes: self.n_shape,
            })
        }
    }

    /// Names of every entry of the shape block, e.g. `y_mean_0, y_mean_1, saturation_0`.
    pub fn labels(&self, psf: &Psf) -> Vec<String> {
        psf.descriptors()
            .iter()
            .zip(&self.blocks)
            .filter_map(|(d, b)| b.map(|b| (d.name, b)))
            .flat_map(|(name, b)| (0..=b.degree).map(move |i| format!("{name}_{i}")))
            .collect()
    }
}

/// Result of checking a polynomial vector against the soft bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundsCheck {
    pub in_bounds: bool,
    pub penalty: f64,
    pub offending: BTreeSet<&'static str>,
}

/// Per-column profile parameters plus derived shape descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileTable {
    pub param_names: Vec<String>,
    pub params: ProfileParams,
    pub flux_sum: Array1<f64>,
    pub flux_integral: Array1<f64>,
    pub flux_err: Array1<f64>,
    pub fwhm: Array1<f64>,
    pub dx: Array1<f64>,
    pub dy: Array1<f64>,
    pub dy_fwhm_inf: Array1<f64>,
    pub dy_fwhm_sup: Array1<f64>,
}

impl ProfileTable {
    pub fn new(param_names: Vec<String>, params: ProfileParams) -> Self {
        let nx = params.nrows();
        let zeros = Array1::<f64>::zeros(nx);
        Self {
            param_names,
            params,
            flux_sum: zeros.clone(),
            flux_integral: zeros.clone(),
            flux_err: zeros.clone(),
            fwhm: zeros.clone(),
            dx: zeros.clone(),
            dy: zeros.clone(),
            dy_fwhm_inf: zeros.clone(),
            dy_fwhm_sup: zeros,
        }
    }

    pub fn len(&self) -> usize {
        self.params.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let k = self.param_names.iter().position(|n| n == name)?;
        Some(self.params.column(k))
    }

    /// Recomputes FWHM, flux integral and centroid offsets from the parameter columns.
    ///
    /// `reference` is the `(x, y)` position the offsets are measured from.
    pub fn fill_shape_descriptors(&mut self, psf: &Psf, rows: ArrayView1<f64>, reference: (f64, f64)) {
        let step = if rows.len() > 1 { rows[1] - rows[0] } else { 1.0 };
        for (x, p) in self.params.axis_iter(Axis(0)).enumerate() {
            let fwhm = psf.fwhm(p);
            let profile = psf.evaluate_transverse(rows, p);
            self.fwhm[x] = fwhm;
            self.flux_integral[x] = profile.sum() * step;
            self.dx[x] = p[1] - reference.0;
            self.dy[x] = p[2] - reference.1;
            self.dy_fwhm_inf[x] = self.dy[x] - 0.5 * fwhm;
            self.dy_fwhm_sup[x] = self.dy[x] + 0.5 * fwhm;
        }
    }

    /// Rotates the centroid offset columns by `angle_degree`.
    pub fn rotate(&mut self, angle_degree: f64) {
        let (sin, cos) = angle_degree.to_radians().sin_cos();
        let dx = self.dx.clone();
        let rotate_y = |y: &Array1<f64>| -> Array1<f64> { &dx * (-sin) + y * cos };
        self.dx = &dx * cos + &self.dy * sin;
        self.dy = rotate_y(&self.dy);
        self.dy_fwhm_inf = rotate_y(&self.dy_fwhm_inf);
        self.dy_fwhm_sup = rotate_y(&self.dy_fwhm_sup);
    }
}

/// A PSF shape family expanded along `nx` dispersion columns of `ny` rows.
#[derive(Debug, Clone)]
pub struct ChromaticPsf {
    psf: Psf,
    nx: usize,
    ny: usize,
    layout: PolyLayout,
    degree: usize,
    degree_overrides: BTreeMap<String, usize>,
    saturation: f64,
    bases: Vec<Option<Array2<f64>>>,
    pub poly_params: PolyParams,
    pub table: ProfileTable,
}

impl ChromaticPsf {
    pub fn new(
        kind: PsfKind,
        nx: usize,
        ny: usize,
        degree: usize,
        degree_overrides: BTreeMap<String, usize>,
        saturation: f64,
    ) -> Result<Self, LayoutError> {
        if nx == 0 || ny == 0 {
            return Err(LayoutError::EmptyGrid { nx, ny });
        }
        let mut psf = Psf::new(kind);
        psf.apply_max_width_to_bounds(ny as f64 / 2.0);
        let layout = PolyLayout::new(&psf, nx, degree, &degree_overrides)?;
        let pixels = basis::rescaled_pixels(nx);
        let bases = (0..psf.n_params())
            .map(|k| {
                layout
                    .block(k)
                    .map(|b| basis::legendre_vandermonde(pixels.view(), b.degree))
            })
            .collect();

        let names = psf.param_names().iter().map(|n| n.to_string()).collect();
        let mut defaults = psf.default_params();
        defaults[2] = ny as f64 / 2.0;
        let last = defaults.len() - 1;
        defaults[last] = saturation;
        let mut params = Array2::zeros((nx, psf.n_params()));
        params.axis_iter_mut(Axis(0)).for_each(|mut row| row.assign(&defaults));
        params.column_mut(0).fill(0.0);
        let params = ProfileParams(params);

        // Constant Legendre series reproduce the defaults exactly since P0 = 1.
        let mut poly = Array1::zeros(layout.len_with_amplitudes());
        for (k, &value) in defaults.iter().enumerate() {
            if let Some(block) = layout.block(k) {
                poly[nx + block.offset] = value;
            }
        }

        Ok(Self {
            psf,
            nx,
            ny,
            layout,
            degree,
            degree_overrides,
            saturation,
            bases,
            poly_params: PolyParams(poly),
            table: ProfileTable::new(names, params),
        })
    }

    /// Same chromatic model over a different number of rows (bounds follow the new height).
    pub fn with_rows(&self, ny: usize) -> Result<Self, LayoutError> {
        let mut resized = Self::new(
            self.psf.kind(),
            self.nx,
            ny,
            self.degree,
            self.degree_overrides.clone(),
            self.saturation,
        )?;
        resized.set_poly_params(self.poly_params.clone())?;
        Ok(resized)
    }

    pub fn psf(&self) -> &Psf {
        &self.psf
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn ny(&self) -> usize {
        self.ny
    }

    pub fn layout(&self) -> &PolyLayout {
        &self.layout
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn degree_overrides(&self) -> &BTreeMap<String, usize> {
        &self.degree_overrides
    }

    pub fn saturation(&self) -> f64 {
        self.saturation
    }

    pub fn rows(&self) -> Array1<f64> {
        Array1::range(0.0, self.ny as f64, 1.0)
    }

    /// Index of the constant Legendre coefficient of `y_mean` inside the shape block.
    pub fn y_mean_constant_index(&self) -> Option<usize> {
        let k = self
            .psf
            .descriptors()
            .iter()
            .position(|d| d.role == ParamRole::TransversePosition)?;
        self.layout.block(k).map(|b| b.offset)
    }

    /// Compresses a profile table into Legendre coefficients.
    ///
    /// Each shape parameter is fitted across columns with the amplitude column
    /// as weights; amplitudes are kept verbatim.
    pub fn to_poly(&self, profile: &ProfileParams) -> Result<PolyParams, LayoutError> {
        let n_params = self.psf.n_params();
        if profile.dim() != (self.nx, n_params) {
            return Err(LayoutError::ProfileShape {
                got: profile.dim(),
                nx: self.nx,
                n_params,
            });
        }

        let amplitudes = profile.column(0);
        let weights = if amplitudes.iter().all(|&a| a == 0.0) {
            log::warn!(
                "Amplitudes are all zero; fitting the chromatic polynomials without weights."
            );
            None
        } else {
            Some(amplitudes)
        };

        let pixels = basis::rescaled_pixels(self.nx);
        let mut poly = Array1::zeros(self.layout.len_with_amplitudes());
        poly.slice_mut(s![..self.nx]).assign(&amplitudes);
        for k in 0..n_params {
            let Some(block) = self.layout.block(k) else {
                continue;
            };
            let coeffs =
                basis::legendre_fit(pixels.view(), profile.column(k), block.degree, weights)?;
            let start = self.nx + block.offset;
            poly.slice_mut(s![start..start + block.degree + 1])
                .assign(&coeffs);
        }
        Ok(PolyParams(poly))
    }

    /// Expands Legendre coefficients back into a profile table.
    ///
    /// A shape-only vector yields unit amplitudes. With `apply_bounds` every
    /// entry is clipped to the hard bounds of its parameter.
    pub fn to_profile(
        &self,
        poly: ArrayView1<f64>,
        apply_bounds: bool,
    ) -> Result<ProfileParams, LayoutError> {
        let (amplitudes, shape) = self.layout.split(poly)?;
        let mut profile = Array2::zeros((self.nx, self.psf.n_params()));
        match amplitudes {
            Some(a) => profile.column_mut(0).assign(&a),
            None => profile.column_mut(0).fill(1.0),
        }
        for (k, basis_matrix) in self.bases.iter().enumerate() {
            let (Some(block), Some(v)) = (self.layout.block(k), basis_matrix) else {
                continue;
            };
            let coeffs = shape.slice(s![block.offset..block.offset + block.degree + 1]);
            profile.column_mut(k).assign(&v.dot(&coeffs));
        }
        if apply_bounds {
            for (mut column, &(lo, hi)) in profile
                .axis_iter_mut(Axis(1))
                .zip(self.psf.bounds_hard())
            {
                column.mapv_inplace(|v| v.max(lo).min(hi));
            }
        }
        Ok(ProfileParams(profile))
    }

    /// Bounds of each shape-block coefficient: free except saturation in `(0, 2 saturation)`.
    pub fn poly_bounds(&self) -> Vec<(f64, f64)> {
        let mut bounds = vec![(f64::NEG_INFINITY, f64::INFINITY); self.layout.n_shape()];
        for (k, d) in self.psf.descriptors().iter().enumerate() {
            if let (ParamRole::Saturation, Some(block)) = (d.role, self.layout.block(k)) {
                bounds[block.offset] = (0.0, 2.0 * self.saturation);
            }
        }
        bounds
    }

    /// Whether each shape-block coefficient is held fixed by the chromatic fit.
    pub fn fixed_poly_params(&self) -> Vec<bool> {
        let mut fixed = vec![false; self.layout.n_shape()];
        for (k, d) in self.psf.descriptors().iter().enumerate() {
            if let (true, Some(block)) = (d.is_fixed_in_chromatic_fit(), self.layout.block(k)) {
                fixed[block.offset..=block.offset + block.degree].fill(true);
            }
        }
        fixed
    }

    /// Soft-bound check of the unclipped profile expansion of `poly`.
    ///
    /// Violations are normalized by the mean of the parameter across columns,
    /// and the total is scaled by `nx * ny` to be commensurate with a chi-square.
    pub fn check_bounds(
        &self,
        poly: ArrayView1<f64>,
        noise_level: f64,
    ) -> Result<BoundsCheck, LayoutError> {
        let (amplitudes, _) = self.layout.split(poly)?;
        let profile = self.to_profile(poly, false)?;
        let mut penalty = 0.0;
        let mut offending = BTreeSet::new();

        for (k, d) in self.psf.descriptors().iter().enumerate() {
            let column = profile.column(k);
            match d.role {
                ParamRole::Amplitude => {
                    if amplitudes.is_none() {
                        continue;
                    }
                    let negative: f64 = column.iter().filter(|&&a| a < -noise_level).sum();
                    if column.iter().any(|&a| a < -noise_level) {
                        penalty += negative.abs();
                        offending.insert(d.name);
                    }
                }
                ParamRole::Saturation => {}
                _ => {
                    let (lo, hi) = self.psf.bounds_soft()[k];
                    let violation: f64 = column
                        .iter()
                        .map(|&v| (lo - v).max(0.0) + (v - hi).max(0.0))
                        .sum();
                    if violation > 0.0 {
                        offending.insert(d.name);
                        let mean = column.mean().unwrap_or(0.0).abs();
                        penalty += if mean > 1e-12 { violation / mean } else { violation };
                    }
                }
            }
        }

        Ok(BoundsCheck {
            in_bounds: offending.is_empty(),
            penalty: penalty * (self.nx * self.ny) as f64,
            offending,
        })
    }

    /// Reference polynomial vector: amplitudes `50 i` and mostly constant shape parameters.
    pub fn generate_test_poly_params(&self) -> Result<PolyParams, LayoutError> {
        let mut poly = Array1::zeros(self.layout.len_with_amplitudes());
        for x in 0..self.nx {
            poly[x] = 50.0 * x as f64;
        }
        for (k, d) in self.psf.descriptors().iter().enumerate() {
            let Some(block) = self.layout.block(k) else {
                continue;
            };
            let power: Vec<f64> = match d.name {
                "y_mean" => vec![self.ny as f64 / 2.0],
                "gamma" => vec![2.0],
                "alpha" => vec![2.0],
                "eta_gauss" => vec![-0.4, -0.3],
                "stddev" => vec![1.0],
                "saturation" => vec![self.saturation],
                _ => vec![d.default],
            };
            let legendre = basis::power_to_legendre(Array1::from(power).view())?;
            let start = self.nx + block.offset;
            for (i, c) in legendre.iter().take(block.degree + 1).enumerate() {
                poly[start + i] = *c;
            }
        }
        Ok(PolyParams(poly))
    }

    /// Clipped profile with `x_mean` pinned to the column index, as used by every model evaluation.
    pub fn column_profile(&self, poly: ArrayView1<f64>) -> Result<ProfileParams, LayoutError> {
        let mut profile = self.to_profile(poly, true)?;
        profile
            .column_mut(1)
            .assign(&Array1::range(0.0, self.nx as f64, 1.0));
        Ok(profile)
    }

    /// Unit-amplitude design matrix of a profile table.
    pub fn unit_design(&self, profile: &ProfileParams, geometry: FitGeometry) -> DesignMatrix {
        let rows = self.rows();
        let mut unit = profile.clone();
        unit.column_mut(0).fill(1.0);
        match geometry {
            FitGeometry::Columns => {
                let columns: Vec<Array1<f64>> = unit
                    .axis_iter(Axis(0))
                    .into_par_iter()
                    .map(|p| self.psf.evaluate_transverse(rows.view(), p))
                    .collect();
                let mut design = Array2::zeros((self.ny, self.nx));
                for (x, column) in columns.into_iter().enumerate() {
                    design.column_mut(x).assign(&column);
                }
                DesignMatrix::Columns(design)
            }
            FitGeometry::Full2d => {
                let planes: Vec<Array2<f64>> = unit
                    .axis_iter(Axis(0))
                    .into_par_iter()
                    .map(|p| self.psf.evaluate_grid(self.nx, self.ny, p))
                    .collect();
                let mut design = Array2::zeros((self.ny * self.nx, self.nx));
                for (x, plane) in planes.into_iter().enumerate() {
                    design
                        .column_mut(x)
                        .iter_mut()
                        .zip(plane.iter())
                        .for_each(|(d, &v)| *d = v);
                }
                DesignMatrix::Joint(design)
            }
        }
    }

    /// Noiseless model image `(ny, nx)` of a polynomial vector carrying amplitudes.
    pub fn evaluate(
        &self,
        poly: ArrayView1<f64>,
        geometry: FitGeometry,
    ) -> Result<Array2<f64>, LayoutError> {
        let profile = self.column_profile(poly)?;
        let design = self.unit_design(&profile, geometry);
        let model = design.apply(profile.column(0));
        Ok(model.mapv(|v| v.min(self.saturation)))
    }

    /// Stores a polynomial vector and refreshes the profile table from it.
    ///
    /// The table keeps the raw amplitudes of the vector (unit amplitudes for a
    /// shape-only vector) and pins `x_mean` to the column index.
    pub fn set_poly_params(&mut self, poly: PolyParams) -> Result<(), LayoutError> {
        let mut profile = self.column_profile(poly.view())?;
        if let (Some(amplitudes), _) = self.layout.split(poly.view())? {
            profile.column_mut(0).assign(&amplitudes);
        }
        self.poly_params = poly;
        self.set_profile(profile);
        Ok(())
    }

    /// Replaces the table parameters and recomputes the shape descriptors.
    pub fn set_profile(&mut self, profile: ProfileParams) {
        self.table.params = profile;
        let rows = self.rows();
        let reference = (0.0, self.ny as f64 / 2.0);
        self.table
            .fill_shape_descriptors(&self.psf, rows.view(), reference);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn chromatic(nx: usize, ny: usize, degree: usize) -> ChromaticPsf {
        ChromaticPsf::new(PsfKind::MoffatGauss, nx, ny, degree, BTreeMap::new(), 8000.0)
            .expect("valid grid")
    }

    #[test]
    fn layout_counts_and_labels() {
        let c = chromatic(5, 4, 1);
        // six polynomial parameters of degree 1 plus a constant saturation
        assert_eq!(c.layout().n_shape(), 6 * 2 + 1);
        assert_eq!(c.layout().len_with_amplitudes(), 5 + 13);
        let labels = c.layout().labels(c.psf());
        assert_eq!(labels[0], "x_mean_0");
        assert_eq!(labels[3], "y_mean_1");
        assert_eq!(labels.last().map(String::as_str), Some("saturation_0"));
        assert_eq!(c.y_mean_constant_index(), Some(2));
    }

    #[test]
    fn test_poly_params_match_reference_vector() {
        let c = chromatic(5, 4, 1);
        let params = c.generate_test_poly_params().unwrap();
        let expected = array![
            0.0, 50.0, 100.0, 150.0, 200.0, 0.0, 0.0, 2.0, 0.0, 2.0, 0.0, 2.0, 0.0, -0.4, -0.3,
            1.0, 0.0, 8000.0
        ];
        for (a, b) in params.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn profile_poly_round_trip() {
        let c = chromatic(40, 30, 2);
        let mut poly = c.generate_test_poly_params().unwrap();
        let n = c.nx();
        // give the shape parameters some chromatic curvature
        poly[n + 3] = 1.5;
        poly[n + 4] = -0.5;
        poly[n + 7] = 0.3;
        let profile = c.to_profile(poly.view(), false).unwrap();
        let back = c.to_poly(&profile).unwrap();
        let again = c.to_profile(back.view(), false).unwrap();
        for (a, b) in profile.iter().zip(again.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn random_profiles_survive_the_polynomial_round_trip() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(2024);
        for kind in [PsfKind::MoffatGauss, PsfKind::Moffat, PsfKind::Gauss] {
            for _ in 0..4 {
                let nx = rng.gen_range(10..60);
                let degree = rng.gen_range(0..4);
                let c = ChromaticPsf::new(kind, nx, 20, degree, BTreeMap::new(), 1e5).unwrap();
                let mut poly = Array1::zeros(c.layout().len_with_amplitudes());
                for (i, v) in poly.iter_mut().enumerate() {
                    *v = if i < nx {
                        rng.gen_range(100.0..1000.0)
                    } else {
                        rng.gen_range(-2.0..2.0)
                    };
                }
                let profile = c.to_profile(poly.view(), false).unwrap();
                let back = c.to_poly(&profile).unwrap();
                for (a, b) in back.iter().zip(poly.iter()) {
                    assert_abs_diff_eq!(a, b, epsilon = 1e-8 * b.abs().max(1.0));
                }
            }
        }
    }

    #[test]
    fn shape_only_vector_synthesizes_unit_amplitudes() {
        let c = chromatic(10, 20, 1);
        let poly = c.generate_test_poly_params().unwrap();
        let shape = poly.slice(s![10..]);
        let profile = c.to_profile(shape, false).unwrap();
        assert!(profile.column(0).iter().all(|&a| a == 1.0));

        let err = c.to_profile(poly.slice(s![3..]), false).unwrap_err();
        assert!(matches!(err, LayoutError::LengthMismatch { .. }));
    }

    #[test]
    fn apply_bounds_clips_adversarial_coefficients() {
        let c = chromatic(30, 20, 2);
        let mut poly = c.generate_test_poly_params().unwrap();
        for (i, v) in poly.iter_mut().enumerate() {
            *v = if i % 3 == 0 { -1e6 } else { 1e6 * (i as f64) };
        }
        poly[40] = f64::NAN;
        let profile = c.to_profile(poly.view(), true).unwrap();
        for (k, &(lo, hi)) in c.psf().bounds_hard().iter().enumerate() {
            for &v in profile.column(k) {
                assert!(v >= lo && v <= hi, "column {k}: {v} outside ({lo}, {hi})");
            }
        }
    }

    #[test]
    fn unweighted_fit_when_amplitudes_are_zero() {
        let c = chromatic(12, 10, 1);
        let mut profile = c.to_profile(c.generate_test_poly_params().unwrap().view(), false)
            .unwrap();
        profile.column_mut(0).fill(0.0);
        let poly = c.to_poly(&profile).unwrap();
        assert!(poly.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(poly[12 + 2], 5.0, epsilon = 1e-10);
    }

    #[test]
    fn check_bounds_flags_violations() {
        let c = chromatic(20, 20, 1);
        let poly = c.generate_test_poly_params().unwrap();
        let clean = c.check_bounds(poly.view(), 0.0).unwrap();
        assert!(clean.in_bounds);
        assert_eq!(clean.penalty, 0.0);

        let mut bad = poly.clone();
        // alpha constant pushed above its upper bound of 10
        let alpha = c.layout().block(c.psf().index_of("alpha").unwrap()).unwrap();
        bad[20 + alpha.offset] = 12.0;
        bad[3] = -500.0;
        let check = c.check_bounds(bad.view(), 10.0).unwrap();
        assert!(!check.in_bounds);
        assert!(check.offending.contains("alpha"));
        assert!(check.offending.contains("amplitude"));
        let expected = (500.0 + 20.0 * 2.0 / 12.0) * 400.0;
        assert_abs_diff_eq!(check.penalty, expected, epsilon = 1e-6);

        // saturation never counts, and a tiny negative amplitude is within the noise allowance
        let mut tolerated = poly.clone();
        tolerated[3] = -5.0;
        assert!(c.check_bounds(tolerated.view(), 10.0).unwrap().in_bounds);
    }

    #[test]
    fn poly_bounds_and_fixed_flags() {
        let c = chromatic(8, 10, 1);
        let bounds = c.poly_bounds();
        assert_eq!(bounds.len(), c.layout().n_shape());
        assert_eq!(bounds[bounds.len() - 1], (0.0, 16000.0));
        assert!(bounds[0].0.is_infinite());
        let fixed = c.fixed_poly_params();
        assert_eq!(&fixed[..2], &[true, true]);
        assert!(!fixed[2]);
        assert!(fixed[fixed.len() - 1]);
    }

    #[test]
    fn stored_table_keeps_raw_amplitudes_and_column_positions() {
        let mut c = chromatic(8, 12, 0);
        let mut poly = c.generate_test_poly_params().unwrap();
        poly[3] = -25.0;
        c.set_poly_params(poly.clone()).unwrap();
        for x in 0..8 {
            assert_eq!(c.table.params[[x, 0]], poly[x]);
            assert_eq!(c.table.params[[x, 1]], x as f64);
        }

        let shape_only = PolyParams(poly.slice(s![8..]).to_owned());
        c.set_poly_params(shape_only).unwrap();
        assert!(c.table.params.column(0).iter().all(|&a| a == 1.0));
        assert_eq!(c.table.params[[7, 1]], 7.0);
    }

    #[test]
    fn table_descriptors_and_rotation() {
        let mut c = chromatic(10, 40, 1);
        let poly = c.generate_test_poly_params().unwrap();
        c.set_poly_params(poly).unwrap();
        assert!(c.table.fwhm.iter().all(|&f| f > 0.0));
        assert_abs_diff_eq!(c.table.flux_integral[4], 200.0, epsilon = 1e-6);
        assert!(c.table.dy.iter().all(|&d| d.abs() < 1e-9));

        c.table.dx = Array1::range(0.0, 10.0, 1.0);
        c.table.dy.fill(0.0);
        c.table.dy_fwhm_inf.fill(0.0);
        c.table.dy_fwhm_sup.fill(0.0);
        c.table.rotate(45.0);
        let root2 = 2.0_f64.sqrt();
        for x in 0..10 {
            assert_abs_diff_eq!(c.table.dy[x], -(x as f64) / root2, epsilon = 1e-12);
            assert_abs_diff_eq!(c.table.dx[x], x as f64 / root2, epsilon = 1e-12);
            assert_abs_diff_eq!(c.table.dy_fwhm_sup[x], -(x as f64) / root2, epsilon = 1e-12);
        }
    }

    #[test]
    fn invalid_layouts_are_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert("beta".to_string(), 1);
        assert!(matches!(
            ChromaticPsf::new(PsfKind::Moffat, 10, 10, 1, overrides, 100.0),
            Err(LayoutError::Shape(ShapeError::UnknownParameter { .. }))
        ));
        assert!(matches!(
            ChromaticPsf::new(PsfKind::Moffat, 3, 10, 3, BTreeMap::new(), 100.0),
            Err(LayoutError::DegreeTooHigh { .. })
        ));
        assert!("full2d".parse::<FitGeometry>().is_ok());
        assert!("3d".parse::<FitGeometry>().is_err());
    }

    #[test]
    fn column_model_matches_amplitudes() {
        let c = chromatic(16, 30, 1);
        let poly = c.generate_test_poly_params().unwrap();
        let model = c.evaluate(poly.view(), FitGeometry::Columns).unwrap();
        assert_eq!(model.dim(), (30, 16));
        for x in 0..16 {
            assert_abs_diff_eq!(model.column(x).sum(), 50.0 * x as f64, epsilon = 1e-6);
        }
    }
}
