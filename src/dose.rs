//! Proton dose on the grid of a CT, from the radiological depth of each
//! voxel along a diverging beam.
//!
//! The depth–dose curve of the beam is looked up at the radiological depth
//! given by the [`RplVolume`]. The `Scatter` and `Hong` flavors add the
//! lateral spread of the beam: dose reaches a voxel from scatterers on
//! circles around its ray, weighted by a Gaussian whose width grows with
//! depth.

use std::f64::consts::{PI, TAU};
use std::path::Path;

use indicatif::ProgressBar;
use rayon::prelude::*;

use geometry::{Point, Vector};

pub use crate::config::dose::{DoseFlavor, DoseParms};
use crate::diagnostics::DiagnosticSink;
use crate::error::{Error, Result};
use crate::rpl::{BeamGeometry, RplVolume};
use crate::utils::group_digits;
use crate::volume::{PixelType, Volume};

/// Radial step of the scatterer search (mm)
const R_STEP: f64 = 1.0;
/// Angular step of the scatterer search
const T_STEP: f64 = PI / 8.0;

// ----- Depth–dose curve ----------------------------------------------------------

/// Depth–dose (or energy) lookup table of a pristine beam in water
#[derive(Clone, Debug, PartialEq)]
pub struct ProtonBeam {
    depth: Vec<f64>,
    dose: Vec<f64>,
}

impl ProtonBeam {

    /// `depth` (mm) must increase strictly from a non-negative start
    pub fn new(depth: Vec<f64>, dose: Vec<f64>) -> Result<Self> {
        if depth.len() != dose.len() {
            return Err(Error::config("beam.dose", format!("{} values for {} depths", dose.len(), depth.len())));
        }
        if depth.len() < 2 {
            return Err(Error::config("beam.depth", "at least 2 samples are needed"));
        }
        if !(depth[0] >= 0.0) || depth.windows(2).any(|w| !(w[0] < w[1])) {
            return Err(Error::config("beam.depth", "must increase from a non-negative start"));
        }
        Ok(Self { depth, dose })
    }

    /// Two whitespace-separated columns, depth (mm) and dose. Blank lines
    /// and lines starting with `#` are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let parse_error = |n: usize, line: &str| Error::Parse {
            path: path.into(),
            message: format!("line {}: `{line}`", n + 1),
        };
        let (mut depth, mut dose) = (vec![], vec![]);
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') { continue }
            let mut fields = line.split_whitespace().map(str::parse::<f64>);
            match (fields.next(), fields.next()) {
                (Some(Ok(d)), Some(Ok(e))) => { depth.push(d); dose.push(e) },
                _ => return Err(parse_error(n, line)),
            }
        }
        Self::new(depth, dose)
    }

    pub fn num_samples(&self) -> usize { self.depth.len() }

    /// Shallowest depth in the table
    pub fn d0(&self) -> f64 { self.depth[0] }

    /// Deepest depth in the table
    pub fn dmax(&self) -> f64 { self.depth[self.depth.len() - 1] }

    /// Dose at `depth`, interpolated linearly between the table entries.
    /// Zero for depths outside the table.
    pub fn lookup_energy(&self, depth: f64) -> f64 {
        if !(depth >= 0.0 && depth <= self.dmax()) { return 0.0 }
        let above = self.depth.partition_point(|&d| d <= depth);
        if above == 0 { return 0.0 }
        let i = above - 1;
        if self.depth[i] == depth { return self.dose[i] }
        let (d0, d1) = (self.depth[i], self.depth[i + 1]);
        let (e0, e1) = (self.dose [i], self.dose [i + 1]);
        e0 + (depth - d0) * (e1 - e0) / (d1 - d0)
    }

    /// Lateral spread (mm) of the beam at radiological depth `depth`: a
    /// linear stand-in for the Highland formula, 0 at the start of the table
    /// and 3 at its end.
    pub fn highland(&self, depth: f64) -> f64 {
        3.0 * (depth - self.d0()) / (self.dmax() - self.d0())
    }
}

// ----- Kernel geometry -----------------------------------------------------------

/// Product of two normalized 1d Gaussians evaluated at the components of
/// `offset`. `sigma` is raised to `min_sigma` to keep the weight bounded.
pub fn gaus_kernel(offset: [f64; 2], sigma: f64, min_sigma: f64) -> f64 {
    let sigma = sigma.max(min_sigma);
    let sigma2 = sigma * sigma;
    let norm = 1.0 / (2.0 * PI * sigma2).sqrt();
    let w = |x: f64| norm * (-x * x / (2.0 * sigma2)).exp();
    w(offset[0]) * w(offset[1])
}

/// Rotate `p` by `t` radians about the line through `axis_point` along
/// `axis` (right-handed)
pub fn rotate_about_ray(p: Point, t: f64, axis_point: Point, axis: Vector) -> Point {
    let w = axis.normalize();
    let q = p - axis_point;
    let (s, c) = t.sin_cos();
    axis_point + q * c + w.cross(q) * s + w * (w.dot(q) * (1.0 - c))
}

// ----- Dose ----------------------------------------------------------------------

pub struct DoseOutcome {
    /// On the grid of the CT
    pub dose: Volume,
    pub rpl: RplVolume,
}

struct DoseCalc<'a> {
    parms: &'a DoseParms,
    rpl: &'a RplVolume,
    prt: Vector,
    pdn: Vector,
}

impl DoseCalc<'_> {

    fn at(&self, p: Point) -> f64 {
        match self.parms.flavor {
            DoseFlavor::Direct => self.direct(p),
            DoseFlavor::Scatter | DoseFlavor::Hong => self.scatter(p),
            DoseFlavor::Debug => self.rpl.get_rgdepth(p),
        }
    }

    fn direct(&self, p: Point) -> f64 {
        let depth = self.rpl.get_rgdepth(p);
        if depth < 0.0 { 0.0 } else { self.parms.beam.lookup_energy(depth) }
    }

    fn scatter(&self, p: Point) -> f64 {
        let beam = &self.parms.beam;
        let mut depth = self.rpl.get_rgdepth(p);
        if depth < 0.0 {
            // Not in the direct beam: only scatter can reach it
            if self.parms.detail == 1 { return 0.0 }
            depth = beam.dmax();
        }
        let r_max = 3.0 * beam.highland(depth);
        let axis = p - self.rpl.geometry.src;

        let mut dose = 0.0;
        let mut r = 0.0;
        while r < r_max {
            let start = p + self.pdn * r;
            let mut t = 0.0;
            while t < TAU {
                let s = rotate_about_ray(start, t, p, axis);
                let depth = self.rpl.get_rgdepth(s);
                if depth >= 0.0 {
                    let offset = s - p;
                    let w = gaus_kernel([offset.dot(self.prt), offset.dot(self.pdn)],
                                        beam.highland(depth), self.parms.min_sigma);
                    dose += beam.lookup_energy(depth) * w;
                }
                if r == 0.0 { break }
                t += T_STEP;
            }
            r += R_STEP;
        }
        dose
    }
}

fn describe(g: &BeamGeometry, sink: &dyn DiagnosticSink) {
    let p = |p: Point| format!("{:.3} {:.3} {:.3}", p.x, p.y, p.z);
    let v = |v: Vector| format!("{:.4} {:.4} {:.4}", v.x, v.y, v.z);
    sink.info(&format!("proton source at {}, isocenter {}", p(g.src), p(g.isocenter)));
    sink.info(&format!("aperture {} x {} rays, distance {:.3}", g.ires[0], g.ires[1], g.pmat.sid));
    sink.info(&format!("  centre {}  upper left {}", p(g.ic_room), p(g.ul_room)));
    sink.info(&format!("  normal {}  row++ {}  col++ {}", v(g.pmat.nrm()), v(g.incr_r), v(g.incr_c)));
}

/// Dose deposited by the beam of `parms` in every voxel of `ct`
pub fn compute_dose(ct: &Volume, parms: &DoseParms, sink: &dyn DiagnosticSink) -> Result<DoseOutcome> {
    compute_dose_with_progress(ct, parms, sink, &ProgressBar::hidden())
}

/// As [`compute_dose`], advancing `progress` by one per CT slice
pub fn compute_dose_with_progress(
    ct: &Volume,
    parms: &DoseParms,
    sink: &dyn DiagnosticSink,
    progress: &ProgressBar,
) -> Result<DoseOutcome> {
    let geometry = BeamGeometry::new(parms.source, parms.isocenter, &parms.aperture)?;
    describe(&geometry, sink);
    let rpl = RplVolume::compute(ct, geometry, parms.ray_step, parms.ct_units)?;
    sink.info(&format!("radiological depths: {} rays x {} steps of {} mm",
                       group_digits(rpl.geometry.num_rays()), rpl.steps(), parms.ray_step));

    let calc = DoseCalc {
        parms,
        rpl: &rpl,
        prt: rpl.geometry.pmat.prt(),
        pdn: rpl.geometry.pmat.pdn(),
    };
    let mut dose = ct.like(PixelType::Float, 1)?;
    let [ni, nj, nk] = ct.dim;
    progress.set_length(nk as u64);
    dose.data
        .par_chunks_mut(ni * nj)
        .enumerate()
        .for_each(|(k, slice)| {
            for (n, v) in slice.iter_mut().enumerate() {
                let (i, j) = (n % ni, n / ni);
                *v = calc.at(ct.xyz([i, j, k])) as f32;
            }
            progress.inc(1);
        });
    progress.finish_and_clear();
    let (lo, hi) = dose.min_max();
    sink.info(&format!("dose range {lo} .. {hi} ({:?})", parms.flavor));
    Ok(DoseOutcome { dose, rpl })
}
