//! Trilinear interpolation with edge clamping.
//!
//! Coordinates are clamped so that the 2×2×2 stencil never leaves the grid:
//! sampling beyond the last voxel repeats the last slice, sampling before
//! the first repeats the first.

use crate::index::{Dim3, Index1};
use crate::volume::Volume;

/// Split a fractional coordinate `ma` into the lower stencil index, the
/// nearest index and the weights of the lower and upper neighbours.
///
/// `dmax` is the largest valid index (`dim - 1`). Coordinates below zero
/// give all weight to index 0; coordinates at or beyond `dmax` give all
/// weight to `dmax` while keeping the stencil at `dmax - 1`.
pub fn li_clamp(ma: f64, dmax: usize) -> (usize, usize, f64, f64) {
    if dmax == 0 || ma < 0.0 {
        (0, 0, 1.0, 0.0)
    } else if ma >= dmax as f64 {
        (dmax - 1, dmax, 0.0, 1.0)
    } else {
        let maf = ma.floor();
        let frac2 = ma - maf;
        (maf as usize, ma.round() as usize, 1.0 - frac2, frac2)
    }
}

/// The eight voxels and weights needed to interpolate at one point
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearStencil {
    /// Flat index of the lower corner
    pub base: Index1,
    /// Nearest voxel
    pub nearest: Index1,
    /// `[lower, upper]` weights per axis
    pub frac: [[f64; 2]; 3],
    // Flat-index distance to the upper neighbour along each axis (0 on
    // single-voxel axes)
    step: [usize; 3],
    // Axes on which the coordinate was clamped, and so has no derivative
    clamped: [bool; 3],
}

impl LinearStencil {

    pub fn new(mijk: [f64; 3], dim: Dim3) -> Self {
        let strides = [1, dim[0], dim[0] * dim[1]];
        let mut base = 0;
        let mut nearest = 0;
        let mut frac = [[1.0, 0.0]; 3];
        let mut step = [0; 3];
        let mut clamped = [true; 3];
        for d in 0..3 {
            let dmax = dim[d] - 1;
            let (f, r, f1, f2) = li_clamp(mijk[d], dmax);
            base    += f * strides[d];
            nearest += r * strides[d];
            frac[d] = [f1, f2];
            step[d] = if dmax > 0 { strides[d] } else { 0 };
            clamped[d] = dmax == 0 || mijk[d] < 0.0 || mijk[d] >= dmax as f64;
        }
        Self { base, nearest, frac, step, clamped }
    }

    /// Flat indices and weights of the 8 stencil voxels, x fastest
    pub fn corners(&self) -> [(Index1, f64); 8] {
        let mut out = [(0, 0.0); 8];
        for (n, slot) in out.iter_mut().enumerate() {
            let b = [n & 1, (n >> 1) & 1, (n >> 2) & 1];
            let index = self.base + b[0] * self.step[0] + b[1] * self.step[1] + b[2] * self.step[2];
            let weight = self.frac[0][b[0]] * self.frac[1][b[1]] * self.frac[2][b[2]];
            *slot = (index, weight);
        }
        out
    }

    /// Derivatives of the 8 corner weights with respect to the fractional
    /// coordinate along each axis (zero along clamped axes).
    pub fn corner_weight_derivatives(&self) -> [[f64; 3]; 8] {
        let mut out = [[0.0; 3]; 8];
        for (n, slot) in out.iter_mut().enumerate() {
            let b = [n & 1, (n >> 1) & 1, (n >> 2) & 1];
            for d in 0..3 {
                if self.clamped[d] { continue }
                let sign = if b[d] == 1 { 1.0 } else { -1.0 };
                let others: f64 = (0..3).filter(|&e| e != d).map(|e| self.frac[e][b[e]]).product();
                slot[d] = sign * others;
            }
        }
        out
    }

    /// Interpolate the values delivered by `value_at`, which maps the flat
    /// voxel index to whatever storage layout the caller uses.
    #[inline]
    pub fn value_with(&self, value_at: impl Fn(Index1) -> f32) -> f64 {
        self.corners()
            .iter()
            .map(|&(i, w)| w * value_at(i) as f64)
            .sum()
    }

    /// Interpolate a scalar volume
    pub fn value(&self, vol: &Volume) -> f64 {
        self.value_with(|i| vol.data[i])
    }

    /// Interpolate one plane of a vector volume, whichever its layout
    pub fn plane_value(&self, vol: &Volume, plane: usize) -> f64 {
        self.value_with(|i| vol.data[vol.plane_index(i, plane)])
    }
}

impl Volume {
    /// Interpolated value at fractional voxel coordinates
    pub fn interpolate(&self, mijk: [f64; 3]) -> f32 {
        LinearStencil::new(mijk, self.dim).value(self) as f32
    }
}
