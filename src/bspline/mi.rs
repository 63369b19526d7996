//! Mutual information with partial-volume joint histograms.
//!
//! Each fixed voxel adds its 8 trilinear weights to the joint histogram row
//! of its fixed bin, in the columns of the bins of the 8 moving voxels it
//! interpolates between. The gradient follows from the derivatives of those
//! weights with respect to the displacement.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::volume::Volume;
use super::score::{BsplineScore, HistogramType};

/// Resolution of the fine histogram from which variance-optimal bins are chosen
const VOPT_FINE_BINS: usize = 200;

#[derive(Clone, Debug, PartialEq)]
pub(super) struct MiState {
    fixed_binner: Binner,
    moving_binner: Binner,
    bins: [usize; 2],
}

impl MiState {
    pub fn new(fixed: &Volume, moving: &Volume, bins: [usize; 2], kind: HistogramType) -> Result<Self> {
        if bins.iter().any(|&b| b == 0) {
            return Err(Error::config("mi_histogram_bins", format!("{bins:?}")));
        }
        Ok(Self {
            fixed_binner : Binner::new(&fixed .data, bins[0], kind),
            moving_binner: Binner::new(&moving.data, bins[1], kind),
            bins,
        })
    }
}

/// Maps intensities to histogram bins
#[derive(Clone, Debug, PartialEq)]
enum Binner {
    EqualSpaced { lo: f32, width: f32, n: usize },
    /// Equal-width fine bins, grouped into contiguous coarse bins
    VOpt { fine: Box<Binner>, coarse: Vec<usize> },
}

impl Binner {
    fn new(data: &[f32], n: usize, kind: HistogramType) -> Self {
        match kind {
            HistogramType::Eqsp => Self::equal_spaced(data, n),
            HistogramType::Vopt => Self::v_optimal(data, n),
        }
    }

    fn equal_spaced(data: &[f32], n: usize) -> Self {
        let (lo, hi) = data.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let width = if hi > lo { (hi - lo) / n as f32 } else { 0.0 };
        Self::EqualSpaced { lo, width, n }
    }

    fn v_optimal(data: &[f32], n: usize) -> Self {
        let n_fine = VOPT_FINE_BINS.max(n);
        let fine = Self::equal_spaced(data, n_fine);
        let mut counts = vec![0.0; n_fine];
        for &v in data { counts[fine.bin(v)] += 1.0 }
        let coarse = v_optimal_partition(&counts, n);
        Self::VOpt { fine: Box::new(fine), coarse }
    }

    #[inline]
    fn bin(&self, v: f32) -> usize {
        match self {
            Self::EqualSpaced { lo, width, n } => {
                if *width <= 0.0 { return 0 }
                let b = ((v - lo) / width).floor();
                if b <= 0.0 { 0 } else { (b as usize).min(n - 1) }
            },
            Self::VOpt { fine, coarse } => coarse[fine.bin(v)],
        }
    }
}

/// Split the fine histogram `counts` into `n` contiguous groups minimizing
/// the total within-group variance of the fine bin positions. Returns the
/// group of each fine bin.
fn v_optimal_partition(counts: &[f64], n: usize) -> Vec<usize> {
    let m = counts.len();
    let n = n.min(m);
    // Prefix sums of count, count·x and count·x² over fine bin positions x
    let mut s0 = vec![0.0; m + 1];
    let mut s1 = vec![0.0; m + 1];
    let mut s2 = vec![0.0; m + 1];
    for (i, &c) in counts.iter().enumerate() {
        let x = i as f64;
        s0[i + 1] = s0[i] + c;
        s1[i + 1] = s1[i] + c * x;
        s2[i + 1] = s2[i] + c * x * x;
    }
    // Sum of squared deviations of fine bins a..b
    let sse = |a: usize, b: usize| {
        let w = s0[b] - s0[a];
        if w <= 0.0 { return 0.0 }
        let s = s1[b] - s1[a];
        (s2[b] - s2[a]) - s * s / w
    };

    // cost[g][b]: best cost of splitting fine bins 0..b into g+1 groups
    let mut cost = vec![vec![f64::INFINITY; m + 1]; n];
    let mut split = vec![vec![0; m + 1]; n];
    for b in 1..=m { cost[0][b] = sse(0, b) }
    for g in 1..n {
        for b in (g + 1)..=m {
            for a in g..b {
                let c = cost[g - 1][a] + sse(a, b);
                if c < cost[g][b] {
                    cost[g][b] = c;
                    split[g][b] = a;
                }
            }
        }
    }

    let mut group = vec![0; m];
    let mut end = m;
    for g in (0..n).rev() {
        let start = if g == 0 { 0 } else { split[g][end] };
        group[start..end].iter_mut().for_each(|x| *x = g);
        end = start;
    }
    group
}

// Per-thread accumulator for the joint histogram
struct Histograms {
    joint: Vec<f64>,
    fixed: Vec<f64>,
    moving: Vec<f64>,
    num_vox: usize,
}

impl Histograms {
    fn new([nf, nm]: [usize; 2]) -> Self {
        Self { joint: vec![0.0; nf * nm], fixed: vec![0.0; nf], moving: vec![0.0; nm], num_vox: 0 }
    }

    fn combine(mut self, other: Self) -> Self {
        let add = |a: &mut Vec<f64>, b: &[f64]| a.iter_mut().zip(b).for_each(|(a, b)| *a += b);
        add(&mut self.joint , &other.joint);
        add(&mut self.fixed , &other.fixed);
        add(&mut self.moving, &other.moving);
        self.num_vox += other.num_vox;
        self
    }
}

/// Negated mutual information and its gradient. Returns
/// `(score, grad, num_vox)`.
pub(super) fn score(s: &BsplineScore, coeff: &[f64]) -> (f64, Vec<f64>, usize) {
    let n_coeff = coeff.len();
    let Some(mi) = s.mi.as_ref() else { return (0.0, vec![0.0; n_coeff], 0) };
    let [nf, nm] = mi.bins;
    let moving = s.moving;

    // ----- Pass 1: joint histogram -----------------------------------------------
    let hist = (0..s.bxf.roi_voxels())
        .into_par_iter()
        .with_min_len(s.job_size())
        .fold(|| Histograms::new(mi.bins), |mut h, n| {
            if let Some(sample) = s.sample(coeff, n) {
                let fb = mi.fixed_binner.bin(sample.fixed_value);
                h.fixed[fb] += 1.0;
                h.num_vox += 1;
                for (idx, w) in sample.stencil.corners() {
                    let mb = mi.moving_binner.bin(moving.data[idx]);
                    h.joint[fb * nm + mb] += w;
                    h.moving[mb] += w;
                }
            }
            h
        })
        .reduce(|| Histograms::new(mi.bins), Histograms::combine);

    if hist.num_vox == 0 { return (0.0, vec![0.0; n_coeff], 0) }
    let total = hist.num_vox as f64;

    // ----- Score and its derivative with respect to each histogram cell ----------
    let mut mutual_information = 0.0;
    let mut dscore_dj = vec![0.0; nf * nm];
    for a in 0..nf {
        for b in 0..nm {
            let j = hist.joint[a * nm + b];
            if j <= 0.0 { continue }
            let ratio = (j * total / (hist.fixed[a] * hist.moving[b])).ln();
            mutual_information += j / total * ratio;
            // Terms common to all cells cancel: the weights of each voxel sum to 1
            dscore_dj[a * nm + b] = -ratio / total;
        }
    }

    // ----- Pass 2: chain into the coefficients -----------------------------------
    let spacing = moving.spacing;
    let grad = (0..s.bxf.roi_voxels())
        .into_par_iter()
        .with_min_len(s.job_size())
        .fold(|| vec![0.0; n_coeff], |mut grad, n| {
            if let Some(sample) = s.sample(coeff, n) {
                let fb = mi.fixed_binner.bin(sample.fixed_value);
                let corners = sample.stencil.corners();
                let dw = sample.stencil.corner_weight_derivatives();
                let mut dc_du = [0.0; 3];
                for ((idx, _), dw) in corners.iter().zip(dw.iter()) {
                    let mb = mi.moving_binner.bin(moving.data[*idx]);
                    let ds = dscore_dj[fb * nm + mb];
                    for d in 0..3 { dc_du[d] += dw[d] / spacing[d] * ds }
                }
                s.bxf.accumulate_gradient(&mut grad, sample.region, sample.local, dc_du);
            }
            grad
        })
        .reduce(|| vec![0.0; n_coeff], |mut a, b| {
            a.iter_mut().zip(&b).for_each(|(a, b)| *a += b);
            a
        });

    (-mutual_information, grad, hist.num_vox)
}
