//! Free-form deformation with uniform cubic B-splines.
//!
//! The region of interest (ROI) of the fixed image is split into regions of
//! `vox_per_rgn` voxels. Each region is influenced by the 4×4×4 control
//! points surrounding it, so there are `rdims + 3` control points along each
//! axis. Every control point carries a displacement in mm, stored
//! control-point-major with x, y, z adjacent.
//!
//! Two lookup tables avoid recomputing the basis at every voxel:
//!
//! + `q_lut`: the 64 basis products for each voxel position inside a region
//!   (identical for every region)
//!
//! + `c_lut`: the 64 control point indices for each region

pub mod basis;
pub mod check_grad;
pub mod regularize;
pub mod score;
pub mod xform_io;
mod mi;
mod mse;

pub use regularize::Regularization;
pub use score::{BsplineScore, HistogramType, Metric, ScoreParms, ScoreResult};

use rayon::prelude::*;

use geometry::Point;

use crate::error::{Error, Result};
use crate::index::{Dim3, Index1, Index3, index1_to_3, index3_to_1, n_voxels};
use crate::volume::{PixelType, Volume};

/// Number of control points influencing any voxel
pub const KNOTS_PER_REGION: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub struct BsplineXform {
    /// Position of voxel (0,0,0) of the image the transform is defined on
    pub img_origin: [f64; 3],
    pub img_spacing: [f64; 3],
    pub img_dim: Dim3,
    pub roi_offset: Index3,
    pub roi_dim: Dim3,
    pub vox_per_rgn: Dim3,
    /// Regions per axis
    pub rdims: Dim3,
    /// Control points per axis
    pub cdims: Dim3,
    pub coeff: Vec<f64>,
    q_lut: Vec<f64>,
    c_lut: Vec<Index1>,
}

impl BsplineXform {

    pub fn new(
        img_origin : [f64; 3],
        img_spacing: [f64; 3],
        img_dim    : Dim3,
        roi_offset : Index3,
        roi_dim    : Dim3,
        vox_per_rgn: Dim3,
    ) -> Result<Self> {
        if vox_per_rgn.iter().any(|&v| v == 0) {
            return Err(Error::config("vox_per_rgn", format!("{vox_per_rgn:?}")));
        }
        if (0..3).any(|d| roi_dim[d] == 0 || roi_offset[d] + roi_dim[d] > img_dim[d]) {
            return Err(Error::RoiOutsideImage { roi_offset, roi_dim, dim: img_dim });
        }
        let rdims: Dim3 = [0, 1, 2].map(|d| (roi_dim[d] + vox_per_rgn[d] - 1) / vox_per_rgn[d]);
        let cdims: Dim3 = rdims.map(|r| r + 3);

        let num_coeff = 3 * n_voxels(cdims);
        let mut coeff = Vec::new();
        coeff.try_reserve_exact(num_coeff).map_err(|_| Error::Allocation { elements: num_coeff })?;
        coeff.resize(num_coeff, 0.0);

        let q_lut = make_q_lut(vox_per_rgn);
        let c_lut = make_c_lut(rdims, cdims);
        Ok(Self { img_origin, img_spacing, img_dim, roi_offset, roi_dim, vox_per_rgn, rdims, cdims, coeff, q_lut, c_lut })
    }

    /// Transform whose ROI is the whole of `vol`
    pub fn covering(vol: &Volume, vox_per_rgn: Dim3) -> Result<Self> {
        Self::new(vol.offset, vol.spacing, vol.dim, [0; 3], vol.dim, vox_per_rgn)
    }

    pub fn num_coeff  (&self) -> usize { self.coeff.len() }
    pub fn num_knots  (&self) -> usize { n_voxels(self.cdims) }
    pub fn num_regions(&self) -> usize { n_voxels(self.rdims) }

    /// Number of voxels in the region of interest
    pub fn roi_voxels (&self) -> usize { n_voxels(self.roi_dim) }

    /// Physical position of ROI voxel `roi_ijk`
    pub fn roi_xyz(&self, roi_ijk: Index3) -> Point {
        let [o, s, r] = [self.img_origin, self.img_spacing, self.roi_offset.map(|x| x as f64)];
        Point::new(o[0] + (r[0] + roi_ijk[0] as f64) * s[0],
                   o[1] + (r[1] + roi_ijk[1] as f64) * s[1],
                   o[2] + (r[2] + roi_ijk[2] as f64) * s[2])
    }

    /// Region index and position within the region of ROI voxel `roi_ijk`
    #[inline]
    pub fn locate(&self, roi_ijk: Index3) -> (Index1, Index1) {
        let vpr = self.vox_per_rgn;
        let p = [0, 1, 2].map(|d| roi_ijk[d] / vpr[d]);
        let q = [0, 1, 2].map(|d| roi_ijk[d] % vpr[d]);
        (index3_to_1(p, self.rdims), index3_to_1(q, vpr))
    }

    /// Control point indices of `region`, x fastest
    #[inline]
    pub fn knots(&self, region: Index1) -> &[Index1] {
        &self.c_lut[region * KNOTS_PER_REGION..(region + 1) * KNOTS_PER_REGION]
    }

    /// Basis products at position `local` within any region
    #[inline]
    pub fn weights(&self, local: Index1) -> &[f64] {
        &self.q_lut[local * KNOTS_PER_REGION..(local + 1) * KNOTS_PER_REGION]
    }

    /// Displacement (mm) given by `coeff` at a voxel located by `locate`
    #[inline]
    pub fn displacement_with(&self, coeff: &[f64], region: Index1, local: Index1) -> [f64; 3] {
        let mut disp = [0.0; 3];
        for (&knot, &w) in self.knots(region).iter().zip(self.weights(local)) {
            let c = &coeff[3 * knot..3 * knot + 3];
            disp[0] += w * c[0];
            disp[1] += w * c[1];
            disp[2] += w * c[2];
        }
        disp
    }

    /// Displacement (mm) at ROI voxel `roi_ijk`
    pub fn displacement(&self, roi_ijk: Index3) -> [f64; 3] {
        let (region, local) = self.locate(roi_ijk);
        self.displacement_with(&self.coeff, region, local)
    }

    /// Chain `d score / d displacement` at one voxel into the coefficient
    /// gradient.
    #[inline]
    pub fn accumulate_gradient(&self, grad: &mut [f64], region: Index1, local: Index1, dc_du: [f64; 3]) {
        for (&knot, &w) in self.knots(region).iter().zip(self.weights(local)) {
            let g = &mut grad[3 * knot..3 * knot + 3];
            g[0] += w * dc_du[0];
            g[1] += w * dc_du[1];
            g[2] += w * dc_du[2];
        }
    }

    /// Displacement (mm) at an arbitrary physical position. Positions more
    /// than half a voxel outside the ROI are not displaced.
    pub fn displacement_at(&self, p: Point) -> [f64; 3] {
        let mut t = [0.0; 3];
        for d in 0..3 {
            t[d] = (p[d] - self.img_origin[d]) / self.img_spacing[d] - self.roi_offset[d] as f64;
            if t[d] < -0.5 || t[d] > self.roi_dim[d] as f64 - 0.5 { return [0.0; 3] }
        }
        let mut region = [0; 3];
        let mut w = [[0.0; 4]; 3];
        for d in 0..3 {
            let s = t[d].max(0.0) / self.vox_per_rgn[d] as f64;
            let r = (s.floor() as usize).min(self.rdims[d] - 1);
            region[d] = r;
            w[d] = basis::weights((s - r as f64).clamp(0.0, 1.0));
        }
        let mut disp = [0.0; 3];
        for (n, &knot) in self.knots(index3_to_1(region, self.rdims)).iter().enumerate() {
            let [i, j, k] = index1_to_3(n, [4; 3]);
            let weight = w[0][i] * w[1][j] * w[2][k];
            for (d, x) in disp.iter_mut().enumerate() {
                *x += weight * self.coeff[3 * knot + d];
            }
        }
        disp
    }

    fn roi_ijk_of(&self, ijk: Index3) -> Option<Index3> {
        let r = self.roi_offset;
        let inside = (0..3).all(|d| ijk[d] >= r[d] && ijk[d] < r[d] + self.roi_dim[d]);
        inside.then(|| [ijk[0] - r[0], ijk[1] - r[1], ijk[2] - r[2]])
    }

    /// Dense displacement field over the whole image, zero outside the ROI
    pub fn vector_field(&self) -> Result<Volume> {
        let mut vf = Volume::new(self.img_dim, self.img_origin, self.img_spacing, PixelType::VfFloatInterleaved, 3)?;
        let dim = self.img_dim;
        vf.data
            .par_chunks_mut(3)
            .enumerate()
            .for_each(|(n, v)| {
                if let Some(roi_ijk) = self.roi_ijk_of(index1_to_3(n, dim)) {
                    let d = self.displacement(roi_ijk);
                    v.iter_mut().zip(d).for_each(|(v, d)| *v = d as f32);
                }
            });
        Ok(vf)
    }

    /// Resample `moving` through the transform onto the image grid. Voxels
    /// mapped outside `moving` take `default_value`.
    pub fn warp(&self, moving: &Volume, default_value: f32) -> Result<Volume> {
        moving.require_scalar("warp")?;
        let mut out = Volume::new(self.img_dim, self.img_origin, self.img_spacing, moving.pixel_type, 1)?;
        let dim = self.img_dim;
        out.data
            .par_iter_mut()
            .enumerate()
            .for_each(|(n, v)| {
                let ijk = index1_to_3(n, dim);
                let d = self.roi_ijk_of(ijk).map_or([0.0; 3], |roi| self.displacement(roi));
                let fixed = out_xyz(self.img_origin, self.img_spacing, ijk);
                let mijk = moving.ijk_of_xyz(Point::new(fixed.x + d[0], fixed.y + d[1], fixed.z + d[2]));
                *v = if moving.contains_ijk(mijk) { moving.interpolate(mijk) } else { default_value };
            });
        Ok(out)
    }
}

fn out_xyz(origin: [f64; 3], spacing: [f64; 3], [i, j, k]: Index3) -> Point {
    Point::new(origin[0] + i as f64 * spacing[0],
               origin[1] + j as f64 * spacing[1],
               origin[2] + k as f64 * spacing[2])
}

fn make_q_lut(vox_per_rgn: Dim3) -> Vec<f64> {
    let per_axis: [Vec<[f64; 4]>; 3] = [0, 1, 2].map(|d| {
        let n = vox_per_rgn[d];
        (0..n).map(|q| basis::weights(q as f64 / n as f64)).collect()
    });
    let mut lut = Vec::with_capacity(n_voxels(vox_per_rgn) * KNOTS_PER_REGION);
    for (k, j, i) in itertools::iproduct!(0..vox_per_rgn[2], 0..vox_per_rgn[1], 0..vox_per_rgn[0]) {
        let [wx, wy, wz] = [&per_axis[0][i], &per_axis[1][j], &per_axis[2][k]];
        for (c, b, a) in itertools::iproduct!(0..4, 0..4, 0..4) {
            lut.push(wx[a] * wy[b] * wz[c]);
        }
    }
    lut
}

fn make_c_lut(rdims: Dim3, cdims: Dim3) -> Vec<Index1> {
    let mut lut = Vec::with_capacity(n_voxels(rdims) * KNOTS_PER_REGION);
    for (p, o, n) in itertools::iproduct!(0..rdims[2], 0..rdims[1], 0..rdims[0]) {
        for (k, j, i) in itertools::iproduct!(0..4, 0..4, 0..4) {
            lut.push(index3_to_1([n + i, o + j, p + k], cdims));
        }
    }
    lut
}

#[cfg(test)]
mod test {
    use super::*;
    use float_eq::assert_float_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    pub fn xform(dim: Dim3, vpr: Dim3) -> BsplineXform {
        BsplineXform::new([0.0; 3], [1.0; 3], dim, [0; 3], dim, vpr).unwrap()
    }

    #[rstest(/**/  roi_dim   ,    vpr    ,   rdims   ,   cdims   ,
             case([10, 10, 10], [5, 5, 5], [2, 2, 2], [5, 5, 5]),
             case([11, 10,  1], [5, 3, 2], [3, 4, 1], [6, 7, 4]),
             case([ 1,  1,  1], [1, 1, 1], [1, 1, 1], [4, 4, 4]),
    )]
    fn grid_sizes(roi_dim: Dim3, vpr: Dim3, rdims: Dim3, cdims: Dim3) {
        let x = xform(roi_dim, vpr);
        assert_eq!((x.rdims, x.cdims), (rdims, cdims));
        assert_eq!(x.num_coeff(), 3 * cdims[0] * cdims[1] * cdims[2]);
        assert_eq!(x.num_regions(), rdims[0] * rdims[1] * rdims[2]);
    }

    #[rstest(/**/ roi_offset,  roi_dim   ,
             case([0, 0, 0], [11, 10, 10]),
             case([1, 0, 0], [10, 10, 10]),
             case([0, 0, 0], [ 0, 10, 10]),
             case([0, 9, 0], [ 5,  2,  5]),
    )]
    fn roi_must_fit(roi_offset: Index3, roi_dim: Dim3) {
        let result = BsplineXform::new([0.0; 3], [1.0; 3], [10; 3], roi_offset, roi_dim, [4; 3]);
        assert!(matches!(result, Err(Error::RoiOutsideImage { .. })));
    }

    #[test]
    fn zero_vox_per_rgn_is_rejected() {
        let result = BsplineXform::new([0.0; 3], [1.0; 3], [10; 3], [0; 3], [10; 3], [4, 0, 4]);
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn q_lut_rows_sum_to_one() {
        let x = xform([9, 8, 7], [3, 4, 2]);
        for local in 0..24 {
            assert_float_eq!(x.weights(local).iter().sum::<f64>(), 1.0, abs <= 1e-9);
        }
    }

    #[test]
    fn c_lut_corners() {
        let x = xform([10, 10, 10], [5, 5, 5]);
        // Region (1,1,1) reaches from knot (1,1,1) to knot (4,4,4)
        let region = index3_to_1([1, 1, 1], x.rdims);
        let knots = x.knots(region);
        assert_eq!(knots[0], index3_to_1([1, 1, 1], x.cdims));
        assert_eq!(knots[63], index3_to_1([4, 4, 4], x.cdims));
        assert_eq!(knots[1], knots[0] + 1);
        assert_eq!(knots[4], knots[0] + x.cdims[0]);
    }

    #[test]
    fn zero_coefficients_do_not_move() {
        let x = xform([6, 5, 4], [2, 2, 2]);
        for n in 0..x.roi_voxels() {
            assert_eq!(x.displacement(index1_to_3(n, x.roi_dim)), [0.0; 3]);
        }
    }

    #[test]
    fn uniform_coefficients_translate() {
        let mut x = xform([6, 5, 4], [2, 3, 2]);
        for c in x.coeff.chunks_mut(3) { c.copy_from_slice(&[1.5, -2.0, 0.25]) }
        for n in 0..x.roi_voxels() {
            let d = x.displacement(index1_to_3(n, x.roi_dim));
            assert_float_eq!(d, [1.5, -2.0, 0.25], abs <= [1e-9; 3]);
        }
    }

    proptest! {
        #[test]
        fn continuous_evaluation_matches_lookup_tables(
            seed in 0_usize..1000,
            i in 0_usize..7, j in 0_usize..5, k in 0_usize..4,
        ) {
            let mut x = xform([7, 5, 4], [3, 2, 2]);
            for (n, c) in x.coeff.iter_mut().enumerate() { *c = ((n * 7919 + seed) % 23) as f64 - 11.0 }
            let from_lut = x.displacement([i, j, k]);
            let direct = x.displacement_at(x.roi_xyz([i, j, k]));
            assert_float_eq!(from_lut, direct, abs <= [1e-9; 3]);
        }
    }

    #[test]
    fn vector_field_is_zero_outside_roi() {
        let mut x = BsplineXform::new([0.0; 3], [1.0; 3], [6, 6, 6], [1, 1, 1], [4, 4, 4], [2; 3]).unwrap();
        for c in x.coeff.chunks_mut(3) { c.copy_from_slice(&[1.0, 0.0, 0.0]) }
        let vf = x.vector_field().unwrap();
        let at = |ijk: Index3| { let n = vf.index(ijk); [vf.data[3 * n], vf.data[3 * n + 1], vf.data[3 * n + 2]] };
        assert_eq!(at([0, 0, 0]), [0.0; 3]);
        assert_eq!(at([5, 2, 2]), [0.0; 3]);
        assert_float_eq!(at([2, 2, 2]), [1.0, 0.0, 0.0], abs <= [1e-6; 3]);
    }

    #[test]
    fn warp_by_whole_voxel_shift() {
        let mut moving = Volume::new([8, 3, 3], [0.0; 3], [2.0; 3], PixelType::Float, 1).unwrap();
        for n in 0..moving.npix() { moving[n] = moving.ijk(n)[0] as f32 }
        let mut x = BsplineXform::covering(&moving, [4, 3, 3]).unwrap();
        // One voxel (2 mm) along x
        for c in x.coeff.chunks_mut(3) { c.copy_from_slice(&[2.0, 0.0, 0.0]) }
        let warped = x.warp(&moving, -1.0).unwrap();
        for n in 0..warped.npix() {
            let i = warped.ijk(n)[0];
            // The last column maps a whole voxel beyond the edge
            let expected = if i + 1 < 8 { (i + 1) as f32 } else { -1.0 };
            assert_float_eq!(warped[n], expected, abs <= 1e-5);
        }
        // Large shift leaves the image
        for c in x.coeff.chunks_mut(3) { c.copy_from_slice(&[100.0, 0.0, 0.0]) }
        let warped = x.warp(&moving, -1.0).unwrap();
        assert!(warped.data.iter().all(|&v| v == -1.0));
    }
}
