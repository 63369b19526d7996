//! Registration command files.
//!
//! ```toml
//! [global]
//! fixed  = "fixed.raw"
//! moving = "moving.raw"
//! img_out = "warped.raw"
//!
//! [fixed_geometry]
//! dim     = [64, 64, 40]
//! spacing = ["1 mm", "1 mm", "2.5 mm"]
//!
//! [[stage]]
//! xform = "bspline"
//! optim = "steepest"
//! res = [2, 2, 1]
//! grid_spac = ["30 mm", "30 mm", "30 mm"]
//!
//! [[stage]]
//! grid_spac = ["15 mm", "15 mm", "15 mm"]
//! ```
//!
//! Every stage starts as a copy of the previous one (the first from the
//! defaults and the global `default_value` and masks), and then applies its
//! own keys. Output files are not inherited.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::value::{Table, Value};

use units::{mm, Length};

use crate::bspline::{HistogramType, Metric, Regularization};
use crate::error::{Error, Result};
use crate::index::Dim3;
use crate::optimize::OptimizerKind;
use crate::volume::PixelType;
use super::{deserialize_uom_3d, deserialize_uom_3d_opt, mm3};

// ----- Keywords -------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XformType {
    Translation,
    #[serde(alias = "versor")]
    Rigid,
    Quaternion,
    Affine,
    #[default]
    Bspline,
    Vf,
    AlignCenter,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Implementation {
    None,
    Itk,
    #[default]
    Plastimatch,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threading {
    Single,
    #[default]
    Openmp,
    Cuda,
}

/// Variant of the B-spline score loop. All flavors share the same engine
/// here; the choice is recorded and reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BsplineFlavor { A, B, #[default] C, D, E, F, G, H, I, J, K }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImgOutFmt {
    #[default]
    Auto,
    Dicom,
}

/// How the B-spline control grid is chosen
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GridSpec {
    /// Control point spacing in mm, rounded down to whole voxels
    Spacing([f64; 3]),
    /// Number of control points per axis
    Count(Dim3),
}

// ----- Resolved parameters ------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GlobalParms {
    pub fixed: Option<PathBuf>,
    pub moving: Option<PathBuf>,
    pub fixed_dir: Option<PathBuf>,
    pub moving_dir: Option<PathBuf>,
    pub img_out_dir: Option<PathBuf>,
    pub vf_out_dir: Option<PathBuf>,
    pub xf_in: Option<PathBuf>,
    pub log: Option<PathBuf>,
    /// Value of warped voxels which map outside the moving image
    pub default_value: f32,
    pub fixed_mask: Option<PathBuf>,
    pub moving_mask: Option<PathBuf>,
    pub img_out: Option<PathBuf>,
    pub img_out_fmt: ImgOutFmt,
    pub img_out_type: Option<PixelType>,
    pub vf_out: Option<PathBuf>,
    pub xf_out: Vec<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageParms {
    /// 1-based
    pub stage_no: usize,
    pub xform: XformType,
    pub optim: OptimizerKind,
    pub implementation: Implementation,
    pub threading: Threading,
    pub flavor: BsplineFlavor,
    pub metric: Metric,
    pub histogram_type: HistogramType,
    pub regularization: Regularization,
    pub regularization_lambda: f64,
    pub default_value: f32,
    pub min_its: usize,
    pub max_its: usize,
    pub learn_rate: f64,
    pub grad_tol: f64,
    /// Projected gradient tolerance of L-BFGS-B
    pub pgtol: f64,
    pub max_step: f64,
    pub min_step: f64,
    pub convergence_tol: f64,
    pub mi_bins: [usize; 2],
    /// Spatial samples of the ITK Mattes metric
    pub num_samples: Option<usize>,
    pub fixed_subsample: Dim3,
    pub moving_subsample: Dim3,
    pub grid: GridSpec,
    pub fixed_mask: Option<PathBuf>,
    pub moving_mask: Option<PathBuf>,
    pub img_out: Option<PathBuf>,
    pub img_out_fmt: ImgOutFmt,
    pub img_out_type: Option<PixelType>,
    pub vf_out: Option<PathBuf>,
    pub xf_out: Vec<PathBuf>,
    // Whether a subsampling rate has been given explicitly in this stage or
    // an earlier one
    pub(crate) ss_explicit: bool,
}

impl Default for StageParms {
    fn default() -> Self {
        Self {
            stage_no: 1,
            xform: XformType::Bspline,
            optim: OptimizerKind::Steepest,
            implementation: Implementation::Plastimatch,
            threading: Threading::Openmp,
            flavor: BsplineFlavor::C,
            metric: Metric::Mse,
            histogram_type: HistogramType::Eqsp,
            regularization: Regularization::None,
            regularization_lambda: 0.0,
            default_value: 0.0,
            min_its: 2,
            max_its: 25,
            learn_rate: 1.0,
            grad_tol: 1e-5,
            pgtol: 1e-5,
            max_step: 10.0,
            min_step: 1e-3,
            convergence_tol: 1e-5,
            mi_bins: [20, 20],
            num_samples: None,
            fixed_subsample: [4, 4, 1],
            moving_subsample: [4, 4, 1],
            grid: GridSpec::Spacing([20.0; 3]),
            fixed_mask: None,
            moving_mask: None,
            img_out: None,
            img_out_fmt: ImgOutFmt::Auto,
            img_out_type: None,
            vf_out: None,
            xf_out: vec![],
            ss_explicit: false,
        }
    }
}

/// Raw voxel file geometry
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawGeometry {
    pub dim: Dim3,
    /// Centre of the first voxel
    #[serde(default = "origin", deserialize_with = "deserialize_uom_3d")]
    pub offset: [Length; 3],
    #[serde(deserialize_with = "deserialize_uom_3d")]
    pub spacing: [Length; 3],
}

fn origin() -> [Length; 3] { [mm(0.0); 3] }

impl RawGeometry {
    pub fn from_mm(dim: Dim3, offset: [f64; 3], spacing: [f64; 3]) -> Self {
        Self { dim, offset: offset.map(mm), spacing: spacing.map(mm) }
    }

    pub fn offset_mm (&self) -> [f64; 3] { mm3(self.offset) }
    pub fn spacing_mm(&self) -> [f64; 3] { mm3(self.spacing) }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrationParms {
    pub global: GlobalParms,
    pub stages: Vec<StageParms>,
    pub fixed_geometry: Option<RawGeometry>,
    /// Defaults to `fixed_geometry`
    pub moving_geometry: Option<RawGeometry>,
}

// ----- Raw TOML sections -----------------------------------------------------------

/// `xf_out` may be given once or as a list
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany { One(PathBuf), Many(Vec<PathBuf>) }

impl From<OneOrMany> for Vec<PathBuf> {
    fn from(x: OneOrMany) -> Self {
        match x { OneOrMany::One(p) => vec![p], OneOrMany::Many(v) => v }
    }
}

/// `mi_histogram_bins`: one count for both images, a pair, or the pair as
/// text (`"20 32"`)
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Bins { One(usize), Pair([usize; 2]), Text(String) }

impl std::fmt::Display for Bins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bins::One(n)       => write!(f, "{n}"),
            Bins::Pair([a, b]) => write!(f, "{a} {b}"),
            Bins::Text(t)      => write!(f, "{t}"),
        }
    }
}

impl Bins {
    fn resolve(self) -> Option<[usize; 2]> {
        let bins = match self {
            Bins::One(n) => [n, n],
            Bins::Pair(p) => p,
            Bins::Text(t) => {
                let n = t.split_whitespace().map(str::parse).collect::<std::result::Result<Vec<usize>, _>>().ok()?;
                match n[..] { [a] => [a, a], [a, b] => [a, b], _ => return None }
            },
        };
        (bins[0] > 0 && bins[1] > 0).then_some(bins)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGlobal {
    fixed: Option<PathBuf>,
    moving: Option<PathBuf>,
    fixed_dir: Option<PathBuf>,
    moving_dir: Option<PathBuf>,
    img_out_dir: Option<PathBuf>,
    vf_out_dir: Option<PathBuf>,
    #[serde(alias = "xform_in", alias = "vf_in")]
    xf_in: Option<PathBuf>,
    #[serde(alias = "logfile")]
    log: Option<PathBuf>,
    // ----- shared
    #[serde(alias = "background_val", alias = "background-val", alias = "default-value")]
    default_value: Option<f32>,
    #[serde(alias = "fixed_roi")]
    fixed_mask: Option<PathBuf>,
    #[serde(alias = "moving_roi")]
    moving_mask: Option<PathBuf>,
    #[serde(alias = "image_out")]
    img_out: Option<PathBuf>,
    img_out_fmt: Option<ImgOutFmt>,
    img_out_type: Option<PixelType>,
    vf_out: Option<PathBuf>,
    #[serde(alias = "xform_out")]
    xf_out: Option<OneOrMany>,
}

/// Keys allowed both globally and in stages
struct RawShared {
    default_value: Option<f32>,
    fixed_mask: Option<PathBuf>,
    moving_mask: Option<PathBuf>,
    img_out: Option<PathBuf>,
    img_out_fmt: Option<ImgOutFmt>,
    img_out_type: Option<PixelType>,
    vf_out: Option<PathBuf>,
    xf_out: Option<OneOrMany>,
}

// The shared keys are repeated in both raw sections: `deny_unknown_fields`
// does not work through `#[serde(flatten)]`
macro_rules! shared {
    ($raw:expr) => {
        RawShared {
            default_value: $raw.default_value,
            fixed_mask: $raw.fixed_mask,
            moving_mask: $raw.moving_mask,
            img_out: $raw.img_out,
            img_out_fmt: $raw.img_out_fmt,
            img_out_type: $raw.img_out_type,
            vf_out: $raw.vf_out,
            xf_out: $raw.xf_out,
        }
    };
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    xform: Option<XformType>,
    optim: Option<OptimizerKind>,
    #[serde(rename = "impl")]
    implementation: Option<Implementation>,
    threading: Option<Threading>,
    #[serde(alias = "alg_flavor")]
    flavor: Option<BsplineFlavor>,
    metric: Option<Metric>,
    histogram_type: Option<HistogramType>,
    regularization: Option<Regularization>,
    #[serde(alias = "young_modulus")]
    regularization_lambda: Option<f64>,
    min_its: Option<usize>,
    #[serde(alias = "iterations", alias = "max_iterations", alias = "its")]
    max_its: Option<usize>,
    learn_rate: Option<f64>,
    grad_tol: Option<f64>,
    pgtol: Option<f64>,
    max_step: Option<f64>,
    min_step: Option<f64>,
    convergence_tol: Option<f64>,
    #[serde(alias = "mattes_histogram_bins")]
    mi_histogram_bins: Option<Bins>,
    #[serde(alias = "mattes_num_spatial_samples", alias = "mi_num_spatial_samples")]
    num_samples: Option<usize>,
    #[serde(alias = "ss")]
    res: Option<Dim3>,
    #[serde(alias = "fixed_ss")]
    ss_fixed: Option<Dim3>,
    #[serde(alias = "moving_ss")]
    ss_moving: Option<Dim3>,
    num_grid: Option<Dim3>,
    #[serde(default, alias = "grid_spacing", deserialize_with = "deserialize_uom_3d_opt")]
    grid_spac: Option<[Length; 3]>,
    // ----- shared
    #[serde(alias = "background_val", alias = "background-val", alias = "default-value")]
    default_value: Option<f32>,
    #[serde(alias = "fixed_roi")]
    fixed_mask: Option<PathBuf>,
    #[serde(alias = "moving_roi")]
    moving_mask: Option<PathBuf>,
    #[serde(alias = "image_out")]
    img_out: Option<PathBuf>,
    img_out_fmt: Option<ImgOutFmt>,
    img_out_type: Option<PixelType>,
    vf_out: Option<PathBuf>,
    #[serde(alias = "xform_out")]
    xf_out: Option<OneOrMany>,
}

const GLOBAL_ONLY: &[&str] = &[
    "fixed", "moving", "fixed_dir", "moving_dir", "img_out_dir", "vf_out_dir",
    "xf_in", "xform_in", "vf_in", "log", "logfile",
];

const STAGE_ONLY: &[&str] = &[
    "xform", "optim", "impl", "threading", "flavor", "alg_flavor", "metric",
    "histogram_type", "regularization", "regularization_lambda", "young_modulus",
    "min_its", "max_its", "iterations", "max_iterations", "its", "learn_rate",
    "grad_tol", "pgtol", "max_step", "min_step", "convergence_tol",
    "mi_histogram_bins", "mattes_histogram_bins", "num_samples",
    "mattes_num_spatial_samples", "mi_num_spatial_samples", "res", "ss",
    "ss_fixed", "fixed_ss", "ss_moving", "moving_ss", "num_grid", "grid_spac",
    "grid_spacing",
];

/// Deserialize one table, reporting keys which belong to the other kind of
/// section, and pinning value errors on the first offending key.
fn section<T: DeserializeOwned>(table: &Table, foreign: &[&str], name: &'static str) -> Result<T> {
    if let Some(key) = table.keys().find(|k| foreign.contains(&k.as_str())) {
        return Err(Error::KeyNotAllowed { key: key.clone(), section: name });
    }
    Value::Table(table.clone()).try_into::<T>().map_err(|e| {
        table.iter()
            .find(|(k, v)| {
                let mut single = Table::new();
                single.insert((*k).clone(), (*v).clone());
                Value::Table(single).try_into::<T>().is_err()
            })
            .map_or(Error::Toml(e), |(k, v)| Error::config(k.as_str(), value_text(v)))
    })
}

fn value_text(v: &Value) -> String {
    v.as_str().map_or_else(|| v.to_string(), str::to_string)
}

fn table<'a>(v: &'a Value, key: &str) -> Result<&'a Table> {
    v.as_table().ok_or_else(|| Error::config(key, value_text(v)))
}

// ----- Parsing -----------------------------------------------------------------------

impl RegistrationParms {

    pub fn from_text(text: &str) -> Result<Self> {
        let doc: Value = text.parse()?;
        let mut parms = Self::default();
        let mut raw_stages = vec![];
        for (key, value) in table(&doc, "command file")? {
            match key.as_str() {
                "global" => {
                    let raw: RawGlobal = section(table(value, key)?, STAGE_ONLY, "the global section")?;
                    parms.global = raw.resolve()?;
                },
                "stage" => {
                    let list = value.as_array().ok_or_else(|| Error::config("stage", value_text(value)))?;
                    for stage in list {
                        raw_stages.push(section::<RawStage>(table(stage, key)?, GLOBAL_ONLY, "a stage section")?);
                    }
                },
                "fixed_geometry"  => parms.fixed_geometry  = Some(section(table(value, key)?, &[], "fixed_geometry")?),
                "moving_geometry" => parms.moving_geometry = Some(section(table(value, key)?, &[], "moving_geometry")?),
                // Free-form notes
                "comment" => {},
                _ => return Err(Error::config(key.as_str(), "unknown section")),
            }
        }
        parms.moving_geometry = parms.moving_geometry.or(parms.fixed_geometry);

        let mut previous = StageParms {
            default_value: parms.global.default_value,
            fixed_mask: parms.global.fixed_mask.clone(),
            moving_mask: parms.global.moving_mask.clone(),
            ..StageParms::default()
        };
        for (n, raw) in raw_stages.into_iter().enumerate() {
            let stage = raw.apply(previous.inherited(n + 1))?;
            previous = stage.clone();
            parms.stages.push(stage);
        }
        Ok(parms)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_text(&text)
    }
}

impl RawGlobal {
    fn resolve(self) -> Result<GlobalParms> {
        let s = shared!(self);
        Ok(GlobalParms {
            fixed: self.fixed,
            moving: self.moving,
            fixed_dir: self.fixed_dir,
            moving_dir: self.moving_dir,
            img_out_dir: self.img_out_dir,
            vf_out_dir: self.vf_out_dir,
            xf_in: self.xf_in,
            log: self.log,
            default_value: s.default_value.unwrap_or(0.0),
            fixed_mask: s.fixed_mask,
            moving_mask: s.moving_mask,
            img_out: s.img_out,
            img_out_fmt: s.img_out_fmt.unwrap_or_default(),
            img_out_type: s.img_out_type,
            vf_out: s.vf_out,
            xf_out: s.xf_out.map(Into::into).unwrap_or_default(),
        })
    }
}

impl StageParms {
    /// Starting point of the next stage
    fn inherited(&self, stage_no: usize) -> Self {
        Self {
            stage_no,
            img_out: None,
            vf_out: None,
            xf_out: vec![],
            ..self.clone()
        }
    }
}

macro_rules! take {
    ($raw:ident => $parms:ident: $($field:ident),+ $(,)?) => {
        $(if let Some(x) = $raw.$field { $parms.$field = x })+
    };
}

fn check_rate(key: &str, rate: Dim3) -> Result<Dim3> {
    if rate.contains(&0) { Err(Error::config(key, format!("{rate:?}"))) } else { Ok(rate) }
}

impl RawStage {
    fn apply(self, mut p: StageParms) -> Result<StageParms> {
        let raw = self;
        take!(raw => p: xform, optim, implementation, threading, flavor, metric,
              histogram_type, regularization, regularization_lambda, min_its, max_its,
              learn_rate, grad_tol, pgtol, max_step, min_step, convergence_tol);
        if raw.num_samples.is_some() { p.num_samples = raw.num_samples }
        if let Some(bins) = raw.mi_histogram_bins {
            let shown = bins.to_string();
            p.mi_bins = bins.resolve().ok_or_else(|| Error::config("mi_histogram_bins", shown))?;
        }

        if let Some(rate) = raw.res {
            let rate = check_rate("res", rate)?;
            p.fixed_subsample = rate;
            p.moving_subsample = rate;
            p.ss_explicit = true;
        }
        // A single explicit rate applies to both images until the other is
        // given too
        if let Some(rate) = raw.ss_fixed {
            p.fixed_subsample = check_rate("ss_fixed", rate)?;
            if !p.ss_explicit { p.moving_subsample = p.fixed_subsample }
            p.ss_explicit = true;
        }
        if let Some(rate) = raw.ss_moving {
            p.moving_subsample = check_rate("ss_moving", rate)?;
            if !p.ss_explicit { p.fixed_subsample = p.moving_subsample }
            p.ss_explicit = true;
        }

        p.grid = match (raw.num_grid, raw.grid_spac) {
            (Some(_), Some(_)) => return Err(Error::config("num_grid", "conflicts with grid_spac")),
            (Some(n), None) => {
                if n.iter().any(|&n| n < 4) { return Err(Error::config("num_grid", format!("{n:?}"))) }
                GridSpec::Count(n)
            },
            (None, Some(s)) => {
                let s = mm3(s);
                if s.iter().any(|&s| !(s > 0.0)) { return Err(Error::config("grid_spac", format!("{s:?}"))) }
                GridSpec::Spacing(s)
            },
            (None, None) => p.grid,
        };

        let s = shared!(raw);
        if let Some(v) = s.default_value { p.default_value = v }
        if s.fixed_mask .is_some() { p.fixed_mask  = s.fixed_mask  }
        if s.moving_mask.is_some() { p.moving_mask = s.moving_mask }
        if let Some(f) = s.img_out_fmt { p.img_out_fmt = f }
        if s.img_out_type.is_some() { p.img_out_type = s.img_out_type }
        p.img_out = s.img_out;
        p.vf_out = s.vf_out;
        p.xf_out = s.xf_out.map(Into::into).unwrap_or_default();
        Ok(p)
    }
}
