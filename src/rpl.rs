//! Radiological path length (RPL) of a diverging beam through a CT.
//!
//! One ray is cast from the source through the centre of every aperture
//! pixel. Along each ray the density of the CT is integrated, and the
//! running integral is stored every `ray_step` mm of geometric distance.
//! Depth index 0 lies on the front clipping plane: the distance from the
//! source at which the first ray enters the CT. Samples before a ray's own
//! entry point hold 0; samples more than one step beyond its exit point,
//! and every sample of a ray which misses the CT, hold
//! [`RPL_NOT_TRAVERSED`].

use rayon::prelude::*;
use serde::Deserialize;

use geometry::{Point, Vector};

use crate::error::{Error, Result};
use crate::index::Dim3;
use crate::interpolate::LinearStencil;
use crate::proj_matrix::ProjMatrix;
use crate::volume::{PixelType, Volume};

/// Path length of samples which the ray never reached
pub const RPL_NOT_TRAVERSED: f32 = -1.0;

/// How CT voxel values translate into density relative to water
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtUnits {
    /// Hounsfield units: `max(0, 1 + HU/1000)`
    #[default]
    Hu,
    /// Values are relative densities already
    Density,
}

impl CtUnits {
    #[inline]
    pub fn density(self, value: f32) -> f64 {
        match self {
            Self::Hu      => (1.0 + value as f64 / 1000.0).max(0.0),
            Self::Density => value as f64,
        }
    }
}

/// Aperture (beam's eye view) plane, perpendicular to the beam axis
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aperture {
    /// Roughly up in the aperture plane
    pub vup: Vector,
    /// Source to aperture distance (mm)
    pub distance: f64,
    /// Rays per row and column
    pub ires: [usize; 2],
    /// Pixel size (mm)
    pub spacing: [f64; 2],
    /// Pixel coordinates of the beam axis; `(ires - 1) / 2` if not given
    pub centre: Option<[f64; 2]>,
}

impl Default for Aperture {
    fn default() -> Self {
        Self {
            vup: Vector::new(0.0, 0.0, 1.0),
            distance: 100.0,
            ires: [200, 200],
            spacing: [1.0, 1.0],
            centre: None,
        }
    }
}

/// Aperture placed in the room for a beam from `src` towards `isocenter`.
///
/// Aperture pixel `(r, c)` sits at `ul_room + r·incr_r + c·incr_c`, and
/// `pmat` projects room positions (relative to the isocenter) onto the same
/// fractional `(r, c)` coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct BeamGeometry {
    pub src: Point,
    pub isocenter: Point,
    pub ires: [usize; 2],
    pub pmat: ProjMatrix,
    /// Where the beam axis crosses the aperture
    pub ic_room: Point,
    pub ul_room: Point,
    pub incr_r: Vector,
    pub incr_c: Vector,
}

impl BeamGeometry {

    pub fn new(src: Point, isocenter: Point, aperture: &Aperture) -> Result<Self> {
        let ires = aperture.ires;
        if ires.contains(&0) {
            return Err(Error::config("aperture.ires", format!("{ires:?}")));
        }
        if !(aperture.distance > 0.0) {
            return Err(Error::config("aperture.offset", aperture.distance));
        }
        if aperture.spacing.iter().any(|&s| !(s > 0.0)) {
            return Err(Error::config("aperture.spacing", format!("{:?}", aperture.spacing)));
        }
        let axis = src - isocenter;
        if !(axis.norm() > 0.0) {
            return Err(Error::Geometry("beam source coincides with the isocenter".into()));
        }
        if axis.normalize().cross(aperture.vup.normalize()).norm() < 1e-9 {
            return Err(Error::Geometry("aperture vup is parallel to the beam axis".into()));
        }
        let ic = aperture.centre.unwrap_or([(ires[0] as f64 - 1.0) / 2.0,
                                            (ires[1] as f64 - 1.0) / 2.0]);
        let pmat = ProjMatrix::new(Point::ORIGIN + axis, Point::ORIGIN, aperture.vup,
                                   aperture.distance, ic, aperture.spacing);
        let ic_room = src - pmat.nrm() * aperture.distance;
        let [incr_r, incr_c] = pmat.image_axes();
        let ul_room = ic_room - incr_r * ic[0] - incr_c * ic[1];
        Ok(Self { src, isocenter, ires, pmat, ic_room, ul_room, incr_r, incr_c })
    }

    /// Centre of aperture pixel `(r, c)` in room coordinates
    pub fn aperture_point(&self, r: usize, c: usize) -> Point {
        self.ul_room + self.incr_r * r as f64 + self.incr_c * c as f64
    }

    /// Fractional aperture coordinates of the ray through `p`
    pub fn aperture_coords(&self, p: Point) -> Option<[f64; 2]> {
        self.pmat.project(Point::ORIGIN + (p - self.isocenter))
    }

    pub fn num_rays(&self) -> usize { self.ires[0] * self.ires[1] }
}

/// Where one ray crosses the CT
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayClip {
    pub entry: Point,
    /// Unit direction from the source
    pub dir: Vector,
    /// Distances from the source to the entry and exit points
    pub t_in: f64,
    pub t_out: f64,
}

#[derive(Clone, Debug)]
pub struct RplVolume {
    /// `[ires0, ires1, steps]`, ray `(r, c)` at index `r + ires0·c`
    pub vol: Volume,
    pub geometry: BeamGeometry,
    pub ray_step: f64,
    /// Distance from the source to depth index 0
    pub front_clip: f64,
    /// Distance from the source to the furthest exit point
    pub back_clip: f64,
    rays: Vec<Option<RayClip>>,
}

impl RplVolume {

    /// Trace every aperture ray through `ct`.
    pub fn compute(ct: &Volume, geometry: BeamGeometry, ray_step: f64, units: CtUnits) -> Result<Self> {
        ct.require_scalar("ray tracing")?;
        if !(ray_step > 0.0) {
            return Err(Error::config("ray_step", ray_step));
        }
        let bounds = ct.bounds();
        let [nr, nc] = geometry.ires;
        let rays: Vec<Option<RayClip>> = (0..nr * nc)
            .into_par_iter()
            .map(|n| {
                let (r, c) = (n % nr, n / nr);
                let dir = (geometry.aperture_point(r, c) - geometry.src).normalize();
                bounds.clip_ray(geometry.src, dir).map(|(entry, exit)| RayClip {
                    entry,
                    dir,
                    t_in : (entry - geometry.src).norm(),
                    t_out: (exit  - geometry.src).norm(),
                })
            })
            .collect();

        let hits = rays.iter().flatten();
        let front_clip = hits.clone().map(|h| h.t_in ).fold(f64::INFINITY, f64::min);
        let back_clip  = hits.clone().map(|h| h.t_out).fold(0.0, f64::max);
        let (front_clip, steps) = if front_clip.is_finite() {
            (front_clip, ((back_clip - front_clip) / ray_step).ceil() as usize + 1)
        } else {
            log::warn!("no aperture ray reaches the CT");
            (0.0, 1)
        };
        log::debug!("RPL: {} rays, {} of them hit the CT, {steps} depth steps",
                    rays.len(), rays.iter().flatten().count());

        let dim: Dim3 = [nr, nc, steps];
        let spacing = [1.0, 1.0, ray_step];
        let mut vol = Volume::new(dim, [0.0; 3], spacing, PixelType::Float, 1)?;
        let columns: Vec<Vec<f32>> = rays
            .par_iter()
            .map(|ray| match ray {
                None      => vec![RPL_NOT_TRAVERSED; steps],
                Some(hit) => trace(ct, units, hit, front_clip, ray_step, steps),
            })
            .collect();
        let per_slice = nr * nc;
        for (n, column) in columns.into_iter().enumerate() {
            for (k, v) in column.into_iter().enumerate() {
                vol.data[n + k * per_slice] = v;
            }
        }
        Ok(Self { vol, geometry, ray_step, front_clip, back_clip, rays })
    }

    pub fn steps(&self) -> usize { self.vol.dim[2] }

    pub fn ray(&self, r: usize, c: usize) -> Option<&RayClip> {
        self.rays[r + self.geometry.ires[0] * c].as_ref()
    }

    #[inline]
    fn sample(&self, r: usize, c: usize, k: usize) -> f32 {
        self.vol[[r, c, k]]
    }

    /// Path length along ray `(r, c)` at fractional depth index `s`, or
    /// `None` beyond the traced samples.
    fn depth_along(&self, r: usize, c: usize, s: f64) -> Option<f64> {
        let last = self.steps() - 1;
        let k = s.floor() as usize;
        let lo = self.sample(r, c, k.min(last));
        if lo == RPL_NOT_TRAVERSED { return None }
        if k >= last {
            return (s <= last as f64).then_some(lo as f64);
        }
        let hi = self.sample(r, c, k + 1);
        if hi == RPL_NOT_TRAVERSED { return None }
        let f = s - k as f64;
        Some((1.0 - f) * lo as f64 + f * hi as f64)
    }

    /// Radiological depth (mm of water) of the room position `p`.
    ///
    /// Bilinear over the four rays surrounding `p` and linear in depth.
    /// Rays without samples at the depth of `p` are left out; if none
    /// remains, or `p` lies outside the aperture or in front of the front
    /// clipping plane, the result is [`RPL_NOT_TRAVERSED`].
    pub fn get_rgdepth(&self, p: Point) -> f64 {
        let miss = RPL_NOT_TRAVERSED as f64;
        let Some([a0, a1]) = self.geometry.aperture_coords(p) else { return miss };
        let [nr, nc] = self.geometry.ires;
        let inside = |a: f64, n: usize| a >= 0.0 && a <= (n - 1) as f64;
        if !inside(a0, nr) || !inside(a1, nc) { return miss }

        let s = ((p - self.geometry.src).norm() - self.front_clip) / self.ray_step;
        if s < 0.0 { return miss }

        let split = |a: f64, n: usize| {
            let lo = (a.floor() as usize).min(n.saturating_sub(2));
            let hi = (lo + 1).min(n - 1);
            let f = if hi == lo { 0.0 } else { a - lo as f64 };
            [(lo, 1.0 - f), (hi, f)]
        };
        let (mut sum, mut weight) = (0.0, 0.0);
        for (r, wr) in split(a0, nr) {
            for (c, wc) in split(a1, nc) {
                let w = wr * wc;
                if w == 0.0 { continue }
                if let Some(d) = self.depth_along(r, c, s) {
                    sum += w * d;
                    weight += w;
                }
            }
        }
        if weight > 0.0 { sum / weight } else { miss }
    }

    /// Water-equivalent-depth resampling of `ct`: sample `(r, c, k)` takes
    /// the value of the voxel of `ct` which lies `rpl[r, c, k]` mm beyond
    /// the entry point of ray `(r, c)`.
    ///
    /// Rays which miss the CT, untraversed samples and positions which
    /// leave `ct` give 0. The result has unit spacing and zero offset.
    pub fn compute_wed_volume(&self, ct: &Volume) -> Result<Volume> {
        ct.require_scalar("water equivalent depth")?;
        let mut wed = Volume::new(self.vol.dim, [0.0; 3], [1.0; 3], PixelType::Float, 1)?;
        let per_slice = self.geometry.num_rays();
        wed.data.par_iter_mut().enumerate().for_each(|(n, v)| {
            let ray = n % per_slice;
            let Some(hit) = &self.rays[ray] else { return };
            let depth = self.vol.data[n];
            if depth == RPL_NOT_TRAVERSED { return }
            let ijk = ct.ijk_of_xyz(hit.entry + hit.dir * depth as f64);
            if ct.contains_ijk(ijk) {
                *v = ct[LinearStencil::new(ijk, ct.dim).nearest];
            }
        });
        Ok(wed)
    }
}

/// Running path-length integral along one ray, sampled at the depth steps
fn trace(ct: &Volume, units: CtUnits, hit: &RayClip, front_clip: f64, step: f64, steps: usize) -> Vec<f32> {
    let last = (((hit.t_out - front_clip) / step).ceil() as usize).min(steps - 1);
    let mut column = vec![RPL_NOT_TRAVERSED; steps];
    let mut acc = 0.0;
    let mut t_prev = hit.t_in;
    for (k, value) in column.iter_mut().enumerate().take(last + 1) {
        let t = (front_clip + k as f64 * step).clamp(hit.t_in, hit.t_out);
        if t > t_prev {
            let mid = hit.entry + hit.dir * ((t_prev + t) / 2.0 - hit.t_in);
            acc += units.density(ct.interpolate(ct.ijk_of_xyz(mid))) * (t - t_prev);
            t_prev = t;
        }
        *value = acc as f32;
    }
    column
}
