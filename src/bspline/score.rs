//! Similarity of the fixed image and the deformed moving image, and its
//! gradient with respect to the B-spline coefficients.

use serde::Deserialize;

use geometry::Point;

use crate::error::{Error, Result};
use crate::index::{Index1, index1_to_3};
use crate::interpolate::LinearStencil;
use crate::volume::Volume;
use super::{mi, mse, regularize::{bending_energy, Regularization}, BsplineXform};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Mean squared intensity difference
    #[default]
    #[serde(alias = "MSE")]
    Mse,
    /// Negated mutual information
    #[serde(alias = "MI", alias = "mattes")]
    Mi,
}

/// How intensities are assigned to mutual-information histogram bins
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramType {
    /// Equal-width bins between the image minimum and maximum
    #[default]
    #[serde(alias = "EQSP")]
    Eqsp,
    /// Bins chosen to minimize the intensity variance within each bin
    #[serde(alias = "VOPT")]
    Vopt,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreParms {
    pub metric: Metric,
    /// Mutual-information bins for the fixed and moving images
    pub mi_bins: [usize; 2],
    pub histogram_type: HistogramType,
    pub regularization: Regularization,
    pub regularization_lambda: f64,
}

impl Default for ScoreParms {
    fn default() -> Self {
        Self {
            metric: Metric::Mse,
            mi_bins: [20, 20],
            histogram_type: HistogramType::Eqsp,
            regularization: Regularization::None,
            regularization_lambda: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScoreResult {
    /// Similarity plus regularization
    pub score: f64,
    /// Similarity term
    pub smetric: f64,
    /// Regularization term
    pub rmetric: f64,
    pub grad: Vec<f64>,
    /// Fixed voxels which mapped inside the moving image
    pub num_vox: usize,
}

impl ScoreResult {
    pub fn grad_norm(&self) -> f64 {
        self.grad.iter().map(|g| g * g).sum::<f64>().sqrt()
    }
}

pub struct BsplineScore<'a> {
    pub(super) bxf: &'a BsplineXform,
    pub(super) fixed: &'a Volume,
    pub(super) moving: &'a Volume,
    /// Spatial gradient of `moving`, only needed by MSE
    pub(super) moving_grad: Option<Volume>,
    pub(super) mi: Option<mi::MiState>,
    // Voxels where a mask is zero do not contribute
    fixed_mask: Option<&'a Volume>,
    moving_mask: Option<&'a Volume>,
    pub parms: ScoreParms,
}

/// Everything the metrics need to know about one fixed voxel
pub(super) struct Sample {
    pub region: Index1,
    pub local: Index1,
    pub fixed_value: f32,
    pub stencil: LinearStencil,
}

impl<'a> BsplineScore<'a> {

    pub fn new(bxf: &'a BsplineXform, fixed: &'a Volume, moving: &'a Volume, parms: ScoreParms) -> Result<Self> {
        fixed.require_scalar("fixed image")?;
        moving.require_scalar("moving image")?;
        if bxf.img_dim != fixed.dim {
            return Err(Error::Geometry(format!(
                "transform defined on a {:?} grid, fixed image is {:?}", bxf.img_dim, fixed.dim)));
        }
        let (moving_grad, mi) = match parms.metric {
            Metric::Mse => (Some(moving.gradient()?), None),
            Metric::Mi  => (None, Some(mi::MiState::new(fixed, moving, parms.mi_bins, parms.histogram_type)?)),
        };
        Ok(Self { bxf, fixed, moving, moving_grad, mi, fixed_mask: None, moving_mask: None, parms })
    }

    /// Restrict the score to fixed voxels where `fixed_mask` is non-zero and
    /// which map to moving voxels where `moving_mask` is non-zero. Each mask
    /// must have the grid of its image.
    pub fn with_masks(mut self, fixed_mask: Option<&'a Volume>, moving_mask: Option<&'a Volume>) -> Result<Self> {
        for (mask, image, name) in [(fixed_mask, self.fixed, "fixed"), (moving_mask, self.moving, "moving")] {
            if let Some(mask) = mask {
                if mask.dim != image.dim {
                    return Err(Error::Geometry(format!(
                        "{name} mask is {:?}, {name} image is {:?}", mask.dim, image.dim)));
                }
            }
        }
        self.fixed_mask = fixed_mask;
        self.moving_mask = moving_mask;
        Ok(self)
    }

    pub fn num_coeff(&self) -> usize { self.bxf.num_coeff() }

    /// Score and gradient for the coefficients `coeff`, which must have the
    /// layout of the transform this scorer was built with.
    pub fn score_and_gradient(&mut self, coeff: &[f64]) -> ScoreResult {
        let (smetric, mut grad, num_vox) = match self.parms.metric {
            Metric::Mse => mse::score(self, coeff),
            Metric::Mi  => mi::score(self, coeff),
        };
        let (rmetric, rgrad) = bending_energy(self.bxf, coeff, self.parms.regularization, self.parms.regularization_lambda);
        grad.iter_mut().zip(rgrad).for_each(|(g, r)| *g += r);
        log::trace!("score {smetric:.6} + {rmetric:.6} over {num_vox} voxels");
        ScoreResult { score: smetric + rmetric, smetric, rmetric, grad, num_vox }
    }

    /// Map ROI voxel `n` through the transform. `None` if it lands outside
    /// the moving image.
    #[inline]
    pub(super) fn sample(&self, coeff: &[f64], n: Index1) -> Option<Sample> {
        let bxf = self.bxf;
        let roi_ijk = index1_to_3(n, bxf.roi_dim);
        let (region, local) = bxf.locate(roi_ijk);
        let d = bxf.displacement_with(coeff, region, local);
        let p = bxf.roi_xyz(roi_ijk);
        let mijk = self.moving.ijk_of_xyz(Point::new(p.x + d[0], p.y + d[1], p.z + d[2]));
        if !self.moving.contains_ijk(mijk) { return None }
        let r = bxf.roi_offset;
        let fixed_ijk = [roi_ijk[0] + r[0], roi_ijk[1] + r[1], roi_ijk[2] + r[2]];
        if self.fixed_mask.is_some_and(|m| m[fixed_ijk] == 0.0) { return None }
        let stencil = LinearStencil::new(mijk, self.moving.dim);
        if self.moving_mask.is_some_and(|m| m[stencil.nearest] == 0.0) { return None }
        let fixed_value = self.fixed[fixed_ijk];
        Some(Sample { region, local, fixed_value, stencil })
    }

    /// Voxels per rayon job: roughly one job per thread, so that the
    /// per-thread gradient accumulators are few.
    pub(super) fn job_size(&self) -> usize {
        (self.bxf.roi_voxels() / rayon::current_num_threads()).max(1)
    }
}
