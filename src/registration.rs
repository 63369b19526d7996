//! Running registration command files: expansion into jobs, output naming,
//! and the multi-stage B-spline driver.
//!
//! Stages are chained by composing displacement fields on the fixed grid:
//! each stage registers the fixed image against the moving image warped by
//! everything found so far, and its own displacement `u` is then composed
//! with the running field `v` as `x ↦ u(x) + v(x + u(x))`.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use geometry::Point;

pub use crate::config::registration::{
    BsplineFlavor, GlobalParms, GridSpec, ImgOutFmt, Implementation, RawGeometry,
    RegistrationParms, StageParms, Threading, XformType,
};
use crate::bspline::{xform_io, BsplineScore, BsplineXform, ScoreParms};
use crate::diagnostics::{DiagnosticSink, FileSink, LogSink};
use crate::error::{Error, Result};
use crate::index::{Dim3, Index1, index1_to_3};
use crate::interpolate::LinearStencil;
use crate::optimize::{optimizer, OptimizeReport, SteepestDescent};
use crate::utils::group_digits;
use crate::volume::{PixelType, Volume};

// ----- Jobs ----------------------------------------------------------------------------

/// Input and output files of one registration job
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobPaths {
    pub fixed: Option<PathBuf>,
    pub moving: Option<PathBuf>,
    pub img_out: Option<PathBuf>,
    pub vf_out: Option<PathBuf>,
}

fn suffixed(path: PathBuf, suffix: &str) -> PathBuf {
    let mut s = path.into_os_string();
    s.push(suffix);
    s.into()
}

/// Paths of the job whose files are called `fixed_job` in `fixed_dir` and
/// `moving_job` in `moving_dir`.
///
/// Outputs are named after the moving image:
///
/// + `img_out_dir` set: `img_out_dir/<job>.mha`, or `img_out_dir/warp/<job>.mha`
///   when `img_out_dir` is `moving_dir`; no `.mha` for DICOM output.
/// + otherwise, if `img_out` is set: `moving_dir/warp/<job>`.
/// + `vf_out_dir` set: `vf_out_dir/<job>_vf.mha`, or `img_out_dir/vf/<job>_vf.mha`
///   when `vf_out_dir` is `moving_dir`.
/// + otherwise, if `vf_out` is set: `moving_dir/vf/<job>`.
pub fn job_paths(global: &GlobalParms, fixed_job: &OsStr, moving_job: &OsStr) -> JobPaths {
    let g = global;
    let fixed  = g.fixed_dir .as_ref().map(|d| d.join(fixed_job )).or_else(|| g.fixed .clone());
    let moving = g.moving_dir.as_ref().map(|d| d.join(moving_job)).or_else(|| g.moving.clone());
    let moving_dir = g.moving_dir.clone().unwrap_or_default();
    let is_moving_dir = |dir: &PathBuf| g.moving_dir.as_ref() == Some(dir);

    let img_out = match &g.img_out_dir {
        Some(dir) => {
            let base = if is_moving_dir(dir) { dir.join("warp") } else { dir.clone() };
            let path = base.join(moving_job);
            Some(if g.img_out_fmt == ImgOutFmt::Dicom { path } else { suffixed(path, ".mha") })
        },
        None => g.img_out.as_ref().map(|_| moving_dir.join("warp").join(moving_job)),
    };
    let vf_out = match &g.vf_out_dir {
        Some(dir) => {
            let base = if is_moving_dir(dir) {
                g.img_out_dir.clone().unwrap_or_default().join("vf")
            } else { dir.clone() };
            Some(suffixed(base.join(moving_job), "_vf.mha"))
        },
        None => g.vf_out.as_ref().map(|_| moving_dir.join("vf").join(moving_job)),
    };
    JobPaths { fixed, moving, img_out, vf_out }
}

/// Regular files in `dir`, sorted by name
fn list_dir(dir: &Path) -> Result<Vec<OsString>> {
    let mut names = vec![];
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() { names.push(entry.file_name()) }
    }
    names.sort();
    Ok(names)
}

/// One job per file in `fixed_dir` / `moving_dir`, or a single job with the
/// `fixed`, `moving`, `img_out` and `vf_out` paths as given.
pub fn jobs(global: &GlobalParms) -> Result<Vec<JobPaths>> {
    let listing = |dir: &Option<PathBuf>| dir.as_deref().map(list_dir).transpose();
    let (fixed_jobs, moving_jobs) = (listing(&global.fixed_dir)?, listing(&global.moving_dir)?);
    let jobs = match (fixed_jobs, moving_jobs) {
        (None, None) => vec![JobPaths {
            fixed: global.fixed.clone(),
            moving: global.moving.clone(),
            img_out: global.img_out.clone(),
            vf_out: global.vf_out.clone(),
        }],
        (Some(f), Some(m)) => {
            if f.len() != m.len() {
                return Err(Error::config("fixed_dir", format!(
                    "{} files, but moving_dir has {}", f.len(), m.len())));
            }
            f.iter().zip(&m).map(|(f, m)| job_paths(global, f, m)).collect()
        },
        (Some(f), None) => f.iter().map(|f| job_paths(global, f, OsStr::new(""))).collect(),
        (None, Some(m)) => m.iter().map(|m| job_paths(global, OsStr::new(""), m)).collect(),
    };
    for job in &jobs {
        if job.fixed .is_none() { return Err(Error::config("fixed" , "missing")) }
        if job.moving.is_none() { return Err(Error::config("moving", "missing")) }
    }
    Ok(jobs)
}

// ----- Single stage -------------------------------------------------------------------

impl StageParms {
    pub fn score_parms(&self) -> ScoreParms {
        ScoreParms {
            metric: self.metric,
            mi_bins: self.mi_bins,
            histogram_type: self.histogram_type,
            regularization: self.regularization,
            regularization_lambda: self.regularization_lambda,
        }
    }

    pub fn steepest(&self) -> SteepestDescent {
        SteepestDescent {
            max_its: self.max_its,
            min_its: self.min_its,
            learn_rate: self.learn_rate,
            max_step: self.max_step,
            min_step: self.min_step,
            convergence_tol: self.convergence_tol,
            grad_tol: self.grad_tol,
        }
    }
}

/// Voxels per B-spline region on the grid of `fixed`
pub fn vox_per_rgn(grid: GridSpec, fixed: &Volume) -> Dim3 {
    match grid {
        GridSpec::Spacing(s) => [0, 1, 2].map(|d| ((s[d] / fixed.spacing[d]).floor() as usize).max(1)),
        // Three more control points than regions along each axis
        GridSpec::Count(n) => [0, 1, 2].map(|d| fixed.dim[d].div_ceil(n[d].saturating_sub(3).max(1)).max(1)),
    }
}

#[derive(Clone, Debug)]
pub struct StageOutcome {
    pub stage_no: usize,
    /// Defined on the subsampled fixed grid
    pub bxf: BsplineXform,
    pub report: OptimizeReport,
}

/// Register `moving` to `fixed` with one B-spline stage. Masks, if given,
/// share the grid of their image.
pub fn run_bspline_stage(
    stage: &StageParms,
    fixed: &Volume,
    moving: &Volume,
    fixed_mask: Option<&Volume>,
    moving_mask: Option<&Volume>,
    sink: &dyn DiagnosticSink,
) -> Result<StageOutcome> {
    if stage.xform != XformType::Bspline {
        return Err(Error::Unsupported { what: "transform", name: format!("{:?}", stage.xform).to_lowercase() });
    }
    if stage.implementation != Implementation::Plastimatch {
        return Err(Error::Unsupported { what: "implementation", name: format!("{:?}", stage.implementation).to_lowercase() });
    }
    let optimizer = optimizer(stage.optim, stage.steepest())?;

    let fixed_ss  = fixed .subsample(stage.fixed_subsample )?;
    let moving_ss = moving.subsample(stage.moving_subsample)?;
    let fixed_mask_ss  = fixed_mask .map(|m| m.subsample(stage.fixed_subsample )).transpose()?;
    let moving_mask_ss = moving_mask.map(|m| m.subsample(stage.moving_subsample)).transpose()?;

    let mut bxf = BsplineXform::covering(&fixed_ss, vox_per_rgn(stage.grid, &fixed_ss))?;
    sink.info(&format!(
        "stage {}: flavor {:?}, {:?}, fixed {:?} moving {:?}, vox_per_rgn {:?}, {} coefficients",
        stage.stage_no, stage.flavor, stage.metric, fixed_ss.dim, moving_ss.dim,
        bxf.vox_per_rgn, group_digits(bxf.num_coeff())));
    if stage.num_samples.is_some() {
        sink.info("num_samples only applies to ITK's Mattes metric: every voxel is used");
    }

    let run = || -> Result<(Vec<f64>, OptimizeReport)> {
        let mut score = BsplineScore::new(&bxf, &fixed_ss, &moving_ss, stage.score_parms())?
            .with_masks(fixed_mask_ss.as_ref(), moving_mask_ss.as_ref())?;
        let mut coeff = bxf.coeff.clone();
        let report = optimizer.minimize(&mut score, &mut coeff);
        Ok((coeff, report))
    };
    let (coeff, report) = match stage.threading {
        Threading::Single => rayon::ThreadPoolBuilder::new().num_threads(1).build()?.install(run)?,
        Threading::Openmp => run()?,
        Threading::Cuda => {
            sink.warn("cuda threading is not available: using CPU threads");
            run()?
        },
    };
    bxf.coeff = coeff;

    sink.info(&format!("stage {}: score {:.6} after {} iterations ({} evaluations){}",
                       stage.stage_no, report.score, report.iterations, report.evaluations,
                       if report.converged { "" } else { ", not converged" }));
    Ok(StageOutcome { stage_no: stage.stage_no, bxf, report })
}

// ----- Vector fields ---------------------------------------------------------------

fn zero_field(grid: &Volume) -> Result<Volume> {
    grid.like(PixelType::VfFloatInterleaved, 3)
}

fn displacement(vf: &Volume, n: Index1) -> [f64; 3] {
    [0, 1, 2].map(|d| vf.data[vf.plane_index(n, d)] as f64)
}

/// Displacement of `bxf` sampled on the grid of `grid`
pub fn sample_xform(bxf: &BsplineXform, grid: &Volume) -> Result<Volume> {
    let mut vf = zero_field(grid)?;
    let dim = grid.dim;
    vf.data
        .par_chunks_mut(3)
        .enumerate()
        .for_each(|(n, v)| {
            let d = bxf.displacement_at(grid.xyz(index1_to_3(n, dim)));
            v.iter_mut().zip(d).for_each(|(v, d)| *v = d as f32);
        });
    Ok(vf)
}

/// `x ↦ u(x) + field(x + u(x))` where `u` is the displacement of `bxf`
pub fn compose(field: &Volume, bxf: &BsplineXform) -> Result<Volume> {
    let mut out = zero_field(field)?;
    let dim = field.dim;
    out.data
        .par_chunks_mut(3)
        .enumerate()
        .for_each(|(n, v)| {
            let x = field.xyz(index1_to_3(n, dim));
            let u = bxf.displacement_at(x);
            let stencil = LinearStencil::new(field.ijk_of_xyz(Point::new(x.x + u[0], x.y + u[1], x.z + u[2])), dim);
            for d in 0..3 {
                v[d] = (u[d] + stencil.plane_value(field, d)) as f32;
            }
        });
    Ok(out)
}

fn mapped_ijk(moving: &Volume, vf: &Volume, n: Index1) -> [f64; 3] {
    let p = vf.xyz(vf.ijk(n));
    let d = displacement(vf, n);
    moving.ijk_of_xyz(Point::new(p.x + d[0], p.y + d[1], p.z + d[2]))
}

/// Resample `moving` onto the grid of the displacement field `vf`. Voxels
/// mapped outside `moving` take `default_value`.
pub fn warp_with_field(moving: &Volume, vf: &Volume, default_value: f32) -> Result<Volume> {
    moving.require_scalar("warp")?;
    let mut out = vf.like(moving.pixel_type, 1)?;
    out.data.par_iter_mut().enumerate().for_each(|(n, v)| {
        let mijk = mapped_ijk(moving, vf, n);
        *v = if moving.contains_ijk(mijk) { moving.interpolate(mijk) } else { default_value };
    });
    Ok(out)
}

/// 1 where `vf` maps inside `moving` (and inside its mask), 0 elsewhere
fn coverage(moving: &Volume, moving_mask: Option<&Volume>, vf: &Volume) -> Result<Volume> {
    let mut out = vf.like(PixelType::UChar, 1)?;
    out.data.par_iter_mut().enumerate().for_each(|(n, v)| {
        let mijk = mapped_ijk(moving, vf, n);
        let inside = moving.contains_ijk(mijk) && moving_mask
            .map_or(true, |m| m[LinearStencil::new(mijk, m.dim).nearest] != 0.0);
        *v = if inside { 1.0 } else { 0.0 };
    });
    Ok(out)
}

// ----- Whole registration ------------------------------------------------------------

pub struct RegistrationOutcome {
    /// Final displacement field on the fixed grid
    pub vf: Volume,
    pub stages: Vec<StageOutcome>,
}

fn save_image(image: &Volume, path: &Path, fmt: ImgOutFmt, pixel_type: Option<PixelType>) -> Result<()> {
    if fmt == ImgOutFmt::Dicom {
        return Err(Error::Unsupported { what: "image output format", name: "dicom".into() });
    }
    match pixel_type {
        Some(t) => image.convert(t)?.save(path),
        None    => image.save(path),
    }
}

fn load_optional(path: Option<&Path>, geometry: Option<&RawGeometry>) -> Result<Option<Volume>> {
    path.map(|p| Volume::load(p, geometry)).transpose()
}

/// Run every stage of `parms`, starting from `xf_in` if given. Per-stage
/// outputs are written as the stages complete.
pub fn run_registration(
    parms: &RegistrationParms,
    fixed: &Volume,
    moving: &Volume,
    xf_in: Option<&BsplineXform>,
    sink: &dyn DiagnosticSink,
) -> Result<RegistrationOutcome> {
    let mut vf = match xf_in {
        Some(bxf) => sample_xform(bxf, fixed)?,
        None      => zero_field(fixed)?,
    };
    let mut stages = vec![];
    for stage in &parms.stages {
        let fixed_mask  = load_optional(stage.fixed_mask .as_deref(), parms.fixed_geometry .as_ref())?;
        let moving_mask = load_optional(stage.moving_mask.as_deref(), parms.moving_geometry.as_ref())?;
        let warped = warp_with_field(moving, &vf, stage.default_value)?;
        let valid = coverage(moving, moving_mask.as_ref(), &vf)?;

        let outcome = run_bspline_stage(stage, fixed, &warped, fixed_mask.as_ref(), Some(&valid), sink)?;
        vf = compose(&vf, &outcome.bxf)?;

        if let Some(path) = &stage.img_out {
            let image = warp_with_field(moving, &vf, stage.default_value)?;
            save_image(&image, path, stage.img_out_fmt, stage.img_out_type)?;
        }
        if let Some(path) = &stage.vf_out { vf.save(path)? }
        for path in &stage.xf_out { xform_io::save(&outcome.bxf, path)? }
        stages.push(outcome);
    }
    Ok(RegistrationOutcome { vf, stages })
}

/// Load the images of `job`, register them and write the global outputs.
pub fn run_job(parms: &RegistrationParms, job: &JobPaths, sink: &dyn DiagnosticSink) -> Result<RegistrationOutcome> {
    let g = &parms.global;
    let missing = |key: &str| Error::config(key, "missing");
    let fixed_path  = job.fixed .as_deref().ok_or_else(|| missing("fixed" ))?;
    let moving_path = job.moving.as_deref().ok_or_else(|| missing("moving"))?;
    sink.info(&format!("fixed {}, moving {}", fixed_path.display(), moving_path.display()));

    let fixed  = Volume::load(fixed_path , parms.fixed_geometry .as_ref())?;
    let moving = Volume::load(moving_path, parms.moving_geometry.as_ref())?;
    let xf_in = g.xf_in.as_deref().map(xform_io::load).transpose()?;
    let outcome = run_registration(parms, &fixed, &moving, xf_in.as_ref(), sink)?;

    if let Some(path) = &job.img_out {
        let image = warp_with_field(&moving, &outcome.vf, g.default_value)?;
        save_image(&image, path, g.img_out_fmt, g.img_out_type)?;
        sink.info(&format!("warped image written to {}", path.display()));
    }
    if let Some(path) = &job.vf_out { outcome.vf.save(path)? }
    if !g.xf_out.is_empty() {
        match outcome.stages.last() {
            Some(last) => for path in &g.xf_out { xform_io::save(&last.bxf, path)? },
            None => sink.warn("no stages were run: xf_out not written"),
        }
    }
    Ok(outcome)
}

#[derive(Clone, Debug)]
pub struct JobReport {
    pub paths: JobPaths,
    pub stages: Vec<OptimizeReport>,
}

/// Run every job of a command file, reporting to the `log` file if one is
/// configured.
pub fn run(parms: &RegistrationParms) -> Result<Vec<JobReport>> {
    let file_sink;
    let sink: &dyn DiagnosticSink = match &parms.global.log {
        Some(path) => {
            file_sink = FileSink::create(path)?;
            &file_sink
        },
        None => &LogSink,
    };
    run_with(parms, sink)
}

pub fn run_with(parms: &RegistrationParms, sink: &dyn DiagnosticSink) -> Result<Vec<JobReport>> {
    let jobs = jobs(&parms.global)?;
    let n_jobs = jobs.len();
    jobs.into_iter().enumerate().map(|(n, paths)| {
        sink.info(&format!("job {} of {n_jobs}", n + 1));
        let outcome = run_job(parms, &paths, sink)?;
        Ok(JobReport { paths, stages: outcome.stages.into_iter().map(|s| s.report).collect() })
    }).collect()
}
