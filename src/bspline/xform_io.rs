//! Text interchange of B-spline transforms.
//!
//! A header line, six `key = x y z` geometry lines, then the coefficients one
//! per line: all x components (knot order), then all y, then all z.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::{Error, Result};
use super::BsplineXform;

const MAGIC: &str = "MGH_GPUIT_BSP <experimental>";

pub fn to_text(bxf: &BsplineXform) -> String {
    let mut s = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(s, "{MAGIC}");
    let triplet = |s: &mut String, key: &str, v: [String; 3]| { let _ = writeln!(s, "{key} = {} {} {}", v[0], v[1], v[2]); };
    triplet(&mut s, "img_origin" , bxf.img_origin .map(|x| x.to_string()));
    triplet(&mut s, "img_spacing", bxf.img_spacing.map(|x| x.to_string()));
    triplet(&mut s, "img_dim"    , bxf.img_dim    .map(|x| x.to_string()));
    triplet(&mut s, "roi_offset" , bxf.roi_offset .map(|x| x.to_string()));
    triplet(&mut s, "roi_dim"    , bxf.roi_dim    .map(|x| x.to_string()));
    triplet(&mut s, "vox_per_rgn", bxf.vox_per_rgn.map(|x| x.to_string()));
    for d in 0..3 {
        for c in bxf.coeff.iter().skip(d).step_by(3) {
            let _ = writeln!(s, "{c}");
        }
    }
    s
}

pub fn save(bxf: &BsplineXform, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() { std::fs::create_dir_all(dir)? }
    }
    std::fs::write(path, to_text(bxf))?;
    Ok(())
}

pub fn load(path: &Path) -> Result<BsplineXform> {
    let text = std::fs::read_to_string(path)?;
    from_text(&text).map_err(|e| match e {
        Error::Parse { message, .. } => Error::Parse { path: path.into(), message },
        other => other,
    })
}

pub fn from_text(text: &str) -> Result<BsplineXform> {
    let parse_error = |message: String| Error::Parse { path: "<text>".into(), message };
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some(MAGIC) => {},
        other => return Err(parse_error(format!("not a B-spline transform: {other:?}"))),
    }

    let mut triplet = |key: &str| -> Result<[f64; 3]> {
        let line = lines.next().ok_or_else(|| parse_error(format!("missing `{key}`")))?;
        let (k, values) = line.split_once('=').ok_or_else(|| parse_error(format!("expected `{key} = ...`, found `{line}`")))?;
        if k.trim() != key {
            return Err(parse_error(format!("expected `{key}`, found `{}`", k.trim())));
        }
        let v = values.split_whitespace()
            .map(|t| t.parse::<f64>().map_err(|e| parse_error(format!("{key}: `{t}`: {e}"))))
            .collect::<Result<Vec<_>>>()?;
        match v[..] {
            [x, y, z] => Ok([x, y, z]),
            _ => Err(parse_error(format!("{key}: expected 3 values, found {}", v.len()))),
        }
    };
    let whole = |v: [f64; 3]| v.map(|x| x as usize);

    let img_origin  = triplet("img_origin")?;
    let img_spacing = triplet("img_spacing")?;
    let img_dim     = whole(triplet("img_dim")?);
    let roi_offset  = whole(triplet("roi_offset")?);
    let roi_dim     = whole(triplet("roi_dim")?);
    let vox_per_rgn = whole(triplet("vox_per_rgn")?);
    let mut bxf = BsplineXform::new(img_origin, img_spacing, img_dim, roi_offset, roi_dim, vox_per_rgn)?;

    let values = lines
        .map(|t| t.parse::<f64>().map_err(|e| parse_error(format!("coefficient `{t}`: {e}"))))
        .collect::<Result<Vec<_>>>()?;
    if values.len() != bxf.num_coeff() {
        return Err(parse_error(format!("expected {} coefficients, found {}", bxf.num_coeff(), values.len())));
    }
    let n_knots = bxf.num_knots();
    for (n, v) in values.into_iter().enumerate() {
        let (d, knot) = (n / n_knots, n % n_knots);
        bxf.coeff[3 * knot + d] = v;
    }
    Ok(bxf)
}
