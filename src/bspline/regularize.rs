//! Bending-energy regularization of B-spline displacement fields.
//!
//! The penalty is the mean over the grid regions of
//!
//!   Σ_components (u_xx² + u_yy² + u_zz² + 2u_xy² + 2u_xz² + 2u_yz²)
//!
//! with derivatives taken in mm, multiplied by λ. Three ways of evaluating it
//! are provided: closed-form basis integrals (`Analytic`), Gauss-Legendre
//! quadrature of the per-region Hessians (`SemiAnalytic`, exact for cubic
//! splines) and central finite differences of the displacement at the voxel
//! centres of each region (`Numeric`).

use rayon::prelude::*;
use serde::Deserialize;

use super::{basis, BsplineXform, KNOTS_PER_REGION};
use crate::index::index1_to_3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regularization {
    #[default]
    None,
    Analytic,
    #[serde(alias = "semi-analytic")]
    SemiAnalytic,
    Numeric,
}

/// Derivative order along each axis, and multiplicity in the energy
const TERMS: [([usize; 3], f64); 6] = [
    ([2, 0, 0], 1.0),
    ([0, 2, 0], 1.0),
    ([0, 0, 2], 1.0),
    ([1, 1, 0], 2.0),
    ([1, 0, 1], 2.0),
    ([0, 1, 1], 2.0),
];

/// Penalty and its gradient with respect to `coeff`. `Regularization::None`
/// gives zero.
pub fn bending_energy(bxf: &BsplineXform, coeff: &[f64], flavor: Regularization, lambda: f64) -> (f64, Vec<f64>) {
    let region_size: [f64; 3] = [0, 1, 2].map(|d| bxf.vox_per_rgn[d] as f64 * bxf.img_spacing[d]);
    let (energy, mut grad) = match flavor {
        Regularization::None         => return (0.0, vec![0.0; coeff.len()]),
        Regularization::Analytic     => over_regions(bxf, coeff, &Exact::new(region_size)),
        Regularization::SemiAnalytic => over_regions(bxf, coeff, &Sampled::new(region_size, gauss_legendre_4(), basis_derivatives)),
        Regularization::Numeric      => {
            let fd = finite_differences(bxf.vox_per_rgn);
            over_regions(bxf, coeff, &Sampled::new(region_size, voxel_centres(bxf), fd))
        },
    };
    let scale = lambda / bxf.num_regions() as f64;
    grad.iter_mut().for_each(|g| *g *= scale);
    (energy * scale, grad)
}

/// Energy of one region for one displacement component, and its gradient
/// with respect to the 64 local coefficients.
trait RegionEnergy: Sync {
    fn energy(&self, c: &[f64; KNOTS_PER_REGION], grad: &mut [f64; KNOTS_PER_REGION]) -> f64;
}

fn over_regions(bxf: &BsplineXform, coeff: &[f64], form: &impl RegionEnergy) -> (f64, Vec<f64>) {
    let n_coeff = coeff.len();
    (0..bxf.num_regions())
        .into_par_iter()
        .fold(|| (0.0, vec![0.0; n_coeff]), |(mut energy, mut grad), region| {
            let knots = bxf.knots(region);
            for comp in 0..3 {
                let mut c = [0.0; KNOTS_PER_REGION];
                for (c, &knot) in c.iter_mut().zip(knots) { *c = coeff[3 * knot + comp] }
                let mut g = [0.0; KNOTS_PER_REGION];
                energy += form.energy(&c, &mut g);
                for (g, &knot) in g.iter().zip(knots) { grad[3 * knot + comp] += g }
            }
            (energy, grad)
        })
        .reduce(|| (0.0, vec![0.0; n_coeff]),
                |(ea, ga), (eb, gb)| (ea + eb, ga.iter().zip(&gb).map(|(a, b)| a + b).collect()))
}

// ----- Closed-form integrals ------------------------------------------------------

struct Exact {
    /// Quadratic form: region energy is `cᵀ Q c`
    q: Vec<f64>,
}

impl Exact {
    fn new(region_size: [f64; 3]) -> Self {
        let v = [basis::integral_matrix(0), basis::integral_matrix(1), basis::integral_matrix(2)];
        let mut q = vec![0.0; KNOTS_PER_REGION * KNOTS_PER_REGION];
        for (orders, multiplicity) in TERMS {
            let s = term_scale(orders, region_size);
            let factor = multiplicity * s * s;
            for n in 0..KNOTS_PER_REGION {
                let a = index1_to_3(n, [4; 3]);
                for m in 0..KNOTS_PER_REGION {
                    let b = index1_to_3(m, [4; 3]);
                    q[n * KNOTS_PER_REGION + m] += factor
                        * v[orders[0]][a[0]][b[0]]
                        * v[orders[1]][a[1]][b[1]]
                        * v[orders[2]][a[2]][b[2]];
                }
            }
        }
        Self { q }
    }
}

impl RegionEnergy for Exact {
    fn energy(&self, c: &[f64; KNOTS_PER_REGION], grad: &mut [f64; KNOTS_PER_REGION]) -> f64 {
        let mut energy = 0.0;
        for (n, row) in self.q.chunks(KNOTS_PER_REGION).enumerate() {
            let qc: f64 = row.iter().zip(c).map(|(q, c)| q * c).sum();
            energy += c[n] * qc;
            grad[n] = 2.0 * qc;
        }
        energy
    }
}

// ----- Sampled Hessians -----------------------------------------------------------

/// Second-derivative operators on the displacement at a set of points in
/// the unit region
struct Sampled {
    /// Per point: weight, then one row of 64 products for each term
    points: Vec<(f64, [[f64; KNOTS_PER_REGION]; 6])>,
}

impl Sampled {
    /// `samples[d]` are the `(u, weight)` pairs along axis `d`; the weights
    /// along each axis sum to 1. `derivatives(d, u)` gives, per basis
    /// function, the value and the first and second derivatives along axis
    /// `d` at `u`.
    fn new(
        region_size: [f64; 3],
        samples: [Vec<(f64, f64)>; 3],
        derivatives: impl Fn(usize, f64) -> [[f64; 4]; 3],
    ) -> Self {
        let mut points = vec![];
        for (&(uz, wz), &(uy, wy), &(ux, wx)) in itertools::iproduct!(&samples[2], &samples[1], &samples[0]) {
            let at = [ux, uy, uz];
            let per_axis: [[[f64; 4]; 3]; 3] = [0, 1, 2].map(|d| derivatives(d, at[d]));
            let mut rows = [[0.0; KNOTS_PER_REGION]; 6];
            for (row, (orders, _)) in rows.iter_mut().zip(TERMS) {
                let s = term_scale(orders, region_size);
                for (n, r) in row.iter_mut().enumerate() {
                    let [i, j, k] = index1_to_3(n, [4; 3]);
                    *r = s
                        * per_axis[0][orders[0]][i]
                        * per_axis[1][orders[1]][j]
                        * per_axis[2][orders[2]][k];
                }
            }
            points.push((wx * wy * wz, rows));
        }
        Self { points }
    }
}

impl RegionEnergy for Sampled {
    fn energy(&self, c: &[f64; KNOTS_PER_REGION], grad: &mut [f64; KNOTS_PER_REGION]) -> f64 {
        let mut energy = 0.0;
        for (weight, rows) in &self.points {
            for (row, (_, multiplicity)) in rows.iter().zip(TERMS) {
                let d: f64 = row.iter().zip(c).map(|(r, c)| r * c).sum();
                let w = weight * multiplicity;
                energy += w * d * d;
                for (g, r) in grad.iter_mut().zip(row) { *g += 2.0 * w * d * r }
            }
        }
        energy
    }
}

/// 4-point Gauss-Legendre rule on [0, 1] along each axis
fn gauss_legendre_4() -> [Vec<(f64, f64)>; 3] {
    const X: [f64; 2] = [0.339_981_043_584_856_3, 0.861_136_311_594_052_6];
    const W: [f64; 2] = [0.652_145_154_862_546_1, 0.347_854_845_137_453_9];
    let rule: Vec<(f64, f64)> = [(-X[1], W[1]), (-X[0], W[0]), (X[0], W[0]), (X[1], W[1])]
        .into_iter()
        .map(|(x, w)| ((x + 1.0) / 2.0, w / 2.0))
        .collect();
    [rule.clone(), rule.clone(), rule]
}

fn basis_derivatives(_axis: usize, u: f64) -> [[f64; 4]; 3] {
    [basis::weights(u), basis::first_derivatives(u), basis::second_derivatives(u)]
}

/// Centres of the voxel cells of a region, equally weighted
fn voxel_centres(bxf: &BsplineXform) -> [Vec<(f64, f64)>; 3] {
    bxf.vox_per_rgn.map(|n| (0..n).map(|q| ((q as f64 + 0.5) / n as f64, 1.0 / n as f64)).collect())
}

/// Central differences of the displacement with a step of half a voxel, so
/// that every stencil around a voxel centre stays inside its region.
fn finite_differences(vox_per_rgn: [usize; 3]) -> impl Fn(usize, f64) -> [[f64; 4]; 3] {
    move |axis, u| {
        let h = 0.5 / vox_per_rgn[axis] as f64;
        let (lo, mid, hi) = (basis::weights(u - h), basis::weights(u), basis::weights(u + h));
        [
            mid,
            [0, 1, 2, 3].map(|i| (hi[i] - lo[i]) / (2.0 * h)),
            [0, 1, 2, 3].map(|i| (hi[i] - 2.0 * mid[i] + lo[i]) / (h * h)),
        ]
    }
}

/// Converts derivatives with respect to the unit region coordinates into
/// derivatives with respect to mm.
fn term_scale(orders: [usize; 3], region_size: [f64; 3]) -> f64 {
    (0..3).map(|d| region_size[d].powi(-(orders[d] as i32))).product()
}

#[cfg(test)]
mod test {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;

    fn grid() -> BsplineXform {
        BsplineXform::new([0.0; 3], [1.0, 1.5, 2.0], [8, 6, 6], [0; 3], [8, 6, 6], [4, 2, 3]).unwrap()
    }

    /// x-displacement of every knot equal to the square of its x index
    fn quadratic(bxf: &BsplineXform) -> Vec<f64> {
        let mut coeff = vec![0.0; bxf.num_coeff()];
        for knot in 0..bxf.num_knots() {
            let i = index1_to_3(knot, bxf.cdims)[0] as f64;
            coeff[3 * knot] = i * i;
        }
        coeff
    }

    fn pseudo_random(bxf: &BsplineXform) -> Vec<f64> {
        (0..bxf.num_coeff()).map(|n| ((n * 7919 % 101) as f64 - 50.0) / 10.0).collect()
    }

    #[rstest(/**/ flavor,
             case(Regularization::Analytic),
             case(Regularization::SemiAnalytic),
             case(Regularization::Numeric),
    )]
    fn constant_curvature(flavor: Regularization) {
        let bxf = grid();
        // u_xx = 2 / h², with h = 4 voxels × 1 mm
        let (energy, _) = bending_energy(&bxf, &quadratic(&bxf), flavor, 1.0);
        assert_float_eq!(energy, 4.0 / 256.0, rmax <= 1e-10);
    }

    #[test]
    fn lambda_scales_linearly() {
        let bxf = grid();
        let coeff = pseudo_random(&bxf);
        let (e1, g1) = bending_energy(&bxf, &coeff, Regularization::Analytic, 1.0);
        let (e3, g3) = bending_energy(&bxf, &coeff, Regularization::Analytic, 3.0);
        assert_float_eq!(e3, 3.0 * e1, rmax <= 1e-12);
        assert_float_eq!(g3[17], 3.0 * g1[17], rmax <= 1e-12);
    }

    #[test]
    fn analytic_and_quadrature_agree() {
        let bxf = grid();
        let coeff = pseudo_random(&bxf);
        let (ea, ga) = bending_energy(&bxf, &coeff, Regularization::Analytic, 0.5);
        let (es, gs) = bending_energy(&bxf, &coeff, Regularization::SemiAnalytic, 0.5);
        assert_float_eq!(ea, es, rmax <= 1e-9);
        let scale = ga.iter().fold(0.0_f64, |m, g| m.max(g.abs()));
        for (a, s) in ga.iter().zip(&gs) {
            assert_float_eq!(*a, *s, abs <= 1e-9 * scale);
        }
    }

    /// x-displacement varying smoothly across the control grid
    fn smooth(bxf: &BsplineXform) -> Vec<f64> {
        let mut coeff = vec![0.0; bxf.num_coeff()];
        for knot in 0..bxf.num_knots() {
            let [i, j, k] = index1_to_3(knot, bxf.cdims).map(|x| x as f64);
            coeff[3 * knot] = (0.5 * i).sin() * (0.4 * j).cos() + 0.1 * k;
        }
        coeff
    }

    // Error shrinks with the square of the voxel size
    #[rstest(/**/ vpr, tolerance,
             case(2, 1e-2),
             case(4, 5e-3),
             case(8, 1e-3),
    )]
    fn numeric_converges_to_analytic(vpr: usize, tolerance: f64) {
        let bxf = BsplineXform::new([0.0; 3], [1.0; 3], [16; 3], [0; 3], [16; 3], [vpr; 3]).unwrap();
        let coeff = smooth(&bxf);
        let (ea, _) = bending_energy(&bxf, &coeff, Regularization::Analytic, 1.0);
        let (en, _) = bending_energy(&bxf, &coeff, Regularization::Numeric , 1.0);
        assert!(ea > 0.0);
        assert_float_eq!(en, ea, rmax <= tolerance);
    }

    #[rstest(/**/ flavor,
             case(Regularization::Analytic),
             case(Regularization::SemiAnalytic),
             case(Regularization::Numeric),
    )]
    fn gradient_matches_finite_differences(flavor: Regularization) {
        let bxf = grid();
        let mut coeff = pseudo_random(&bxf);
        let (_, grad) = bending_energy(&bxf, &coeff, flavor, 1.0);
        let h = 1e-4;
        for n in [0, 5, 40, 101, bxf.num_coeff() - 1] {
            let x = coeff[n];
            coeff[n] = x + h; let (hi, _) = bending_energy(&bxf, &coeff, flavor, 1.0);
            coeff[n] = x - h; let (lo, _) = bending_energy(&bxf, &coeff, flavor, 1.0);
            coeff[n] = x;
            assert_float_eq!((hi - lo) / (2.0 * h), grad[n], abs <= 1e-6);
        }
    }

    #[test]
    fn none_is_free() {
        let bxf = grid();
        let (energy, grad) = bending_energy(&bxf, &pseudo_random(&bxf), Regularization::None, 10.0);
        assert_eq!(energy, 0.0);
        assert!(grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn translations_are_free() {
        let bxf = grid();
        let mut coeff = vec![0.0; bxf.num_coeff()];
        for c in coeff.chunks_mut(3) { c.copy_from_slice(&[2.0, -1.0, 0.5]) }
        let (energy, _) = bending_energy(&bxf, &coeff, Regularization::Analytic, 1.0);
        assert_float_eq!(energy, 0.0, abs <= 1e-12);
    }
}
