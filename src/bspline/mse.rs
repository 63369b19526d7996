use rayon::prelude::*;

use super::score::BsplineScore;

// Per-thread accumulator threaded through `fold`
struct FoldState {
    sum_sq: f64,
    grad: Vec<f64>,
    num_vox: usize,
}

impl FoldState {
    fn new(n_coeff: usize) -> Self { Self { sum_sq: 0.0, grad: vec![0.0; n_coeff], num_vox: 0 } }

    fn combine(mut self, other: Self) -> Self {
        self.sum_sq  += other.sum_sq;
        self.num_vox += other.num_vox;
        self.grad.iter_mut().zip(&other.grad).for_each(|(a, b)| *a += b);
        self
    }
}

/// Mean squared difference over the fixed voxels which land inside the
/// moving image, with its gradient. Returns `(score, grad, num_vox)`.
pub(super) fn score(s: &BsplineScore, coeff: &[f64]) -> (f64, Vec<f64>, usize) {
    let n_coeff = coeff.len();
    let Some(moving_grad) = s.moving_grad.as_ref() else {
        return (0.0, vec![0.0; n_coeff], 0)
    };

    let state = (0..s.bxf.roi_voxels())
        .into_par_iter()
        .with_min_len(s.job_size())
        .fold(|| FoldState::new(n_coeff), |mut state, n| {
            if let Some(sample) = s.sample(coeff, n) {
                let m = sample.stencil.value(s.moving);
                let diff = m - sample.fixed_value as f64;
                let dm: [f64; 3] = [0, 1, 2].map(|d| sample.stencil.plane_value(moving_grad, d));
                state.sum_sq += diff * diff;
                state.num_vox += 1;
                s.bxf.accumulate_gradient(&mut state.grad, sample.region, sample.local, dm.map(|g| diff * g));
            }
            state
        })
        .reduce(|| FoldState::new(n_coeff), FoldState::combine);

    if state.num_vox == 0 { return (0.0, state.grad, 0) }
    let n = state.num_vox as f64;
    let mut grad = state.grad;
    grad.iter_mut().for_each(|g| *g *= 2.0 / n);
    (state.sum_sq / n, grad, state.num_vox)
}
