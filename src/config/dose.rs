//! Proton dose parameters
//!
//! ```toml
//! flavor   = "hong"
//! detail   = 0
//! ray_step = "1 mm"
//!
//! [beam]
//! source      = ["-2 m", "0 mm", "0 mm"]
//! isocenter   = ["0 mm", "0 mm", "0 mm"]
//! bragg_curve = "pdd.txt"
//!
//! [aperture]
//! vup     = [0, 0, 1]
//! offset  = "10 cm"
//! ires    = [200, 200]
//! spacing = ["1 mm", "1 mm"]
//! ```
//!
//! Instead of `bragg_curve`, the depth–dose table may be given inline with
//! `depth = ["0 mm", ...]` and `dose = [...]`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use geometry::{Point, Vector};
use units::{mm, mm_, Length};

use super::{deserialize_uom, deserialize_uom_3d, deserialize_uom_vec, mm3};
use crate::dose::ProtonBeam;
use crate::error::{Error, Result};
use crate::rpl::{Aperture, CtUnits};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseFlavor {
    /// Depth–dose table at the radiological depth of the voxel
    #[serde(alias = "a")]
    Direct,
    /// Gaussian lateral spread from scatterers around the voxel
    #[serde(alias = "b")]
    Scatter,
    /// Modified Hong pencil beam; currently the same sum as `Scatter`
    #[default]
    #[serde(alias = "c")]
    Hong,
    /// The radiological depth itself
    #[serde(alias = "d")]
    Debug,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DoseParms {
    pub source: Point,
    pub isocenter: Point,
    pub beam: ProtonBeam,
    pub aperture: Aperture,
    pub flavor: DoseFlavor,
    /// 1: voxels outside the direct beam get no scatter dose; otherwise
    /// their search radius assumes the maximum depth
    pub detail: u8,
    /// mm
    pub ray_step: f64,
    /// Smallest width (mm) of the lateral scatter kernel
    pub min_sigma: f64,
    pub ct_units: CtUnits,
}

// ----- TOML representation ---------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDose {
    beam: RawBeam,
    #[serde(default)]
    aperture: RawAperture,
    #[serde(default)]
    flavor: DoseFlavor,
    #[serde(default)]
    detail: u8,
    #[serde(default = "one_mm", deserialize_with = "deserialize_uom")]
    ray_step: Length,
    #[serde(default = "default_min_sigma", deserialize_with = "deserialize_uom")]
    min_sigma: Length,
    #[serde(default)]
    ct_units: CtUnits,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBeam {
    #[serde(alias = "src", deserialize_with = "deserialize_uom_3d")]
    source: [Length; 3],
    #[serde(default = "origin", deserialize_with = "deserialize_uom_3d")]
    isocenter: [Length; 3],
    #[serde(alias = "pdd")]
    bragg_curve: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_uom_vec")]
    depth: Vec<Length>,
    #[serde(default)]
    dose: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawAperture {
    vup: [f64; 3],
    #[serde(alias = "distance", deserialize_with = "deserialize_uom")]
    offset: Length,
    ires: [usize; 2],
    #[serde(deserialize_with = "deserialize_uom_2d")]
    spacing: [Length; 2],
    #[serde(alias = "ic")]
    centre: Option<[f64; 2]>,
}

impl Default for RawAperture {
    fn default() -> Self {
        let a = Aperture::default();
        Self {
            vup: a.vup.into(),
            offset: mm(a.distance),
            ires: a.ires,
            spacing: a.spacing.map(mm),
            centre: a.centre,
        }
    }
}

fn one_mm() -> Length { mm(1.0) }
fn default_min_sigma() -> Length { mm(0.4) }
fn origin() -> [Length; 3] { [mm(0.0); 3] }

fn deserialize_uom_2d<'d, D>(deserializer: D) -> std::result::Result<[Length; 2], D::Error>
where
    D: serde::Deserializer<'d>,
{
    let v: Vec<Length> = deserialize_uom_vec(deserializer)?;
    <[Length; 2]>::try_from(v)
        .map_err(|v| serde::de::Error::custom(format!("expected 2 lengths, found {}", v.len())))
}

impl DoseParms {

    /// Parse TOML text. A relative `bragg_curve` path is taken relative to
    /// `base_dir`.
    pub fn from_text(text: &str, base_dir: &Path) -> Result<Self> {
        let raw: RawDose = toml::from_str(text)?;
        let b = raw.beam;
        let beam = match (b.bragg_curve, b.depth.is_empty()) {
            (Some(path), true) => ProtonBeam::load(&base_dir.join(path))?,
            (None, false) => ProtonBeam::new(b.depth.iter().map(|&d| mm_(d)).collect(), b.dose)?,
            (Some(_), false) => return Err(Error::config("beam.depth", "conflicts with beam.bragg_curve")),
            (None, true) => return Err(Error::config("beam", "needs bragg_curve or depth and dose")),
        };
        let a = raw.aperture;
        let aperture = Aperture {
            vup: Vector::from(a.vup),
            distance: mm_(a.offset),
            ires: a.ires,
            spacing: a.spacing.map(mm_),
            centre: a.centre,
        };
        if raw.detail > 1 {
            log::warn!("detail = {} behaves like detail = 0", raw.detail);
        }
        Ok(Self {
            source: mm3(b.source).into(),
            isocenter: mm3(b.isocenter).into(),
            beam,
            aperture,
            flavor: raw.flavor,
            detail: raw.detail,
            ray_step: mm_(raw.ray_step),
            min_sigma: mm_(raw.min_sigma),
            ct_units: raw.ct_units,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_text(&text, path.parent().unwrap_or(Path::new("")))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;
    use tempfile::tempdir;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    const INLINE: &str = r#"
        flavor = "direct"
        ray_step = "0.5 mm"
        ct_units = "density"
        [beam]
        source = ["-2 m", "0 mm", "0 mm"]
        depth = ["0 mm", "1 cm", "2 cm"]
        dose = [0.5, 1.0, 0.0]
        [aperture]
        vup = [0, 0, 1]
        offset = "10 cm"
        ires = [20, 30]
        spacing = ["1 mm", "2 mm"]
    "#;

    #[test]
    fn inline_depth_dose_table() -> Result<()> {
        let p = DoseParms::from_text(INLINE, Path::new(""))?;
        assert_eq!(p.flavor, DoseFlavor::Direct);
        assert_float_eq!(<[f64; 3]>::from(p.source), [-2000.0, 0.0, 0.0], abs_all <= 1e-9);
        assert_eq!(p.isocenter, Point::ORIGIN);
        assert_eq!(p.aperture.ires, [20, 30]);
        assert_float_eq!(p.aperture.spacing, [1.0, 2.0], rmax_all <= 1e-12);
        assert_float_eq!(p.aperture.distance, 100.0, rmax <= 1e-12);
        assert_float_eq!(p.ray_step, 0.5, rmax <= 1e-12);
        assert_float_eq!(p.min_sigma, 0.4, rmax <= 1e-12);
        assert_eq!(p.ct_units, CtUnits::Density);
        assert_float_eq!(p.beam.dmax(), 20.0, rmax <= 1e-12);
        Ok(())
    }

    #[test]
    fn bragg_curve_next_to_the_config_file() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("pdd.txt"), "# depth dose\n0 1\n10 3\n\n25 0\n")?;
        let config = dir.path().join("dose.toml");
        std::fs::write(&config, r#"
            flavor = "c"
            [beam]
            src = ["0 mm", "-1 m", "0 mm"]
            pdd = "pdd.txt"
        "#)?;
        let p = DoseParms::load(&config)?;
        assert_eq!(p.flavor, DoseFlavor::Hong);
        assert_eq!(p.beam.dmax(), 25.0);
        assert_eq!(p.aperture.ires, Aperture::default().ires);
        assert_float_eq!(p.aperture.distance, 100.0, rmax <= 1e-12);
        assert_eq!(p.ct_units, CtUnits::Hu);
        Ok(())
    }

    #[rstest(/**/ text,
             case(r#"[beam]
                     source = ["0 mm", "0 mm", "1 m"]"#),
             case(r#"[beam]
                     source = ["0 mm", "0 mm", "1 m"]
                     bragg_curve = "x.txt"
                     depth = ["0 mm"]
                     dose = [1]"#),
             case(r#"[beam]
                     source = [0, 0, 1000]
                     depth = ["0 mm", "1 mm"]
                     dose = [1, 2]"#),
             case(r#"flavour = "direct"
                     [beam]
                     source = ["0 mm", "0 mm", "1 m"]
                     depth = ["0 mm", "1 mm"]
                     dose = [1, 2]"#),
    )]
    fn rejected(text: &str) {
        assert!(DoseParms::from_text(text, Path::new("")).is_err());
    }
}
