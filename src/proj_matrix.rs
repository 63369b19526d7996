//! Pinhole projection from room coordinates onto a detector (or beam
//! aperture) plane.

use std::fmt::Write as _;
use std::path::Path;

use geometry::{matrix::{mat43_mult_vec3, mat_mult_mat}, Point, Vector};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct ProjMatrix {
    /// Image centre in pixels
    pub ic: [f64; 2],
    /// `intrinsic × extrinsic`, 3×4 row-major
    pub matrix: [f64; 12],
    /// Source to axis distance
    pub sad: f64,
    /// Source to image distance
    pub sid: f64,
    pub cam: Point,
    /// Unit vector from the target towards the source
    pub nrm: Vector,
    pub extrinsic: [f64; 16],
    pub intrinsic: [f64; 12],
}

impl ProjMatrix {

    /// Projection for a source at `cam` looking at `tgt`, with the detector
    /// `sid` from the source and `ps` mm per pixel.
    ///
    /// `vup` must not be parallel to `cam - tgt`, and `cam` must differ from
    /// `tgt`; neither is checked. The source-axis distance is `|cam|`: room
    /// coordinates are expected to be centred on the target.
    pub fn new(cam: Point, tgt: Point, vup: Vector, sid: f64, ic: [f64; 2], ps: [f64; 2]) -> Self {
        let sad = cam.coords().norm();
        let nrm = (cam - tgt).normalize();
        let prt = nrm.cross(vup).normalize();
        let pdn = prt.cross(nrm).normalize();
        let tgt = tgt.coords();

        let mut extrinsic = [0.0; 16];
        for (row, axis) in [prt, pdn, nrm].into_iter().enumerate() {
            extrinsic[4*row    ] = -axis.x;
            extrinsic[4*row + 1] = -axis.y;
            extrinsic[4*row + 2] = -axis.z;
        }
        extrinsic[ 3] = prt.dot(tgt);
        extrinsic[ 7] = pdn.dot(tgt);
        extrinsic[11] = nrm.dot(tgt) + sad;
        extrinsic[15] = 1.0;

        let mut intrinsic = [0.0; 12];
        intrinsic[ 0] = 1.0 / ps[0];
        intrinsic[ 5] = 1.0 / ps[1];
        intrinsic[10] = 1.0 / sid;

        let mut matrix = [0.0; 12];
        mat_mult_mat(&mut matrix, &intrinsic, 3, 4, &extrinsic, 4);

        Self { ic, matrix, sad, sid, cam, nrm, extrinsic, intrinsic }
    }

    pub fn nrm(&self) -> Vector { self.nrm }

    /// Panel right: `nrm × vup`, normalized
    pub fn prt(&self) -> Vector { -self.extrinsic_row(0) }

    /// Panel down: `prt × nrm`, normalized
    pub fn pdn(&self) -> Vector { -self.extrinsic_row(1) }

    /// Room-space step corresponding to one unit of the first and second
    /// image coordinates, for a plane at the detector distance.
    pub fn image_axes(&self) -> [Vector; 2] {
        [self.extrinsic_row(0) / self.intrinsic[0],
         self.extrinsic_row(1) / self.intrinsic[5]]
    }

    fn extrinsic_row(&self, row: usize) -> Vector {
        let e = &self.extrinsic;
        Vector::new(e[4*row], e[4*row + 1], e[4*row + 2])
    }

    /// Image coordinates (pixels) of a room position, or `None` for
    /// positions in the plane of the source.
    pub fn project(&self, p: Point) -> Option<[f64; 2]> {
        let [u, v, w] = mat43_mult_vec3(&self.matrix, p);
        if w == 0.0 { return None }
        Some([self.ic[0] + u / w, self.ic[1] + v / w])
    }

    // ----- Text serialization -------------------------------------------------------

    pub fn to_text(&self) -> String {
        let mut s = String::new();
        let line = |s: &mut String, values: &[f64]| {
            let fields: Vec<_> = values.iter().map(|&x| fmt_e(x)).collect();
            // Writing to a String cannot fail
            let _ = writeln!(s, "{}", fields.join(" "));
        };
        line(&mut s, &self.ic);
        for row in self.matrix.chunks(4) { line(&mut s, row) }
        line(&mut s, &[self.sad]);
        line(&mut s, &[self.sid]);
        // Points from the target towards the source: the negation of the third
        // extrinsic row. `from_text` relies on this sign to place the camera.
        line(&mut s, &[self.nrm.x, self.nrm.y, self.nrm.z]);
        s.push_str("Extrinsic\n");
        for row in self.extrinsic.chunks(4) { line(&mut s, row) }
        s.push_str("Intrinsic\n");
        for row in self.intrinsic.chunks(4) { line(&mut s, row) }
        s
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() { std::fs::create_dir_all(dir)? }
        }
        std::fs::write(path, self.to_text())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_text(&text).map_err(|message| Error::Parse { path: path.into(), message })
    }

    pub fn from_text(text: &str) -> std::result::Result<Self, String> {
        let mut lines = Lines(text.lines().filter(|l| !l.trim().is_empty()));

        let ic = lines.numbers(2, "image centre")?;
        let mut matrix = [0.0; 12];
        for row in matrix.chunks_mut(4) { row.copy_from_slice(&lines.numbers(4, "projection matrix")?) }
        let sad = lines.numbers(1, "sad")?[0];
        let sid = lines.numbers(1, "sid")?[0];
        let nrm = lines.numbers(3, "nrm")?;

        let mut extrinsic = [0.0; 16];
        lines.header("Extrinsic")?;
        for row in extrinsic.chunks_mut(4) { row.copy_from_slice(&lines.numbers(4, "extrinsic")?) }
        let mut intrinsic = [0.0; 12];
        lines.header("Intrinsic")?;
        for row in intrinsic.chunks_mut(4) { row.copy_from_slice(&lines.numbers(4, "intrinsic")?) }

        let nrm = Vector::new(nrm[0], nrm[1], nrm[2]);
        let cam = camera_from_extrinsic(&extrinsic, sad, nrm);
        Ok(Self { ic: [ic[0], ic[1]], matrix, sad, sid, cam, nrm, extrinsic, intrinsic })
    }
}

struct Lines<I>(I);

impl<'a, I: Iterator<Item = &'a str>> Lines<I> {
    fn numbers(&mut self, n: usize, what: &str) -> std::result::Result<Vec<f64>, String> {
        let line = self.0.next().ok_or_else(|| format!("missing {what}"))?;
        let values = line.split_whitespace()
            .map(|t| t.parse::<f64>().map_err(|e| format!("{what}: `{t}`: {e}")))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if values.len() != n {
            return Err(format!("{what}: expected {n} values, found {}", values.len()));
        }
        Ok(values)
    }

    fn header(&mut self, name: &str) -> std::result::Result<(), String> {
        match self.0.next() {
            Some(t) if t.trim() == name => Ok(()),
            other => Err(format!("expected `{name}`, found {other:?}")),
        }
    }
}

/// Recover the source position from the extrinsic transform: the point that
/// sits `sad` along `nrm` from the target.
fn camera_from_extrinsic(e: &[f64; 16], sad: f64, nrm: Vector) -> Point {
    // Target in room coordinates: -Rᵀ (t - (0, 0, sad))
    let t = [e[3], e[7], e[11] - sad];
    let mut tgt = Point::ORIGIN;
    for row in 0..3 {
        let r = Vector::new(e[4*row], e[4*row + 1], e[4*row + 2]);
        tgt = tgt - r * t[row];
    }
    tgt + nrm * sad
}

/// `x` as C's `%18.8e` renders it: mantissa with 8 decimals, signed exponent
/// of at least two digits, right-aligned in 18 columns.
pub fn fmt_e(x: f64) -> String {
    let s = format!("{x:.8e}");
    let formatted = match s.split_once('e') {
        Some((mantissa, exp)) => match exp.parse::<i32>() {
            Ok(e) => format!("{mantissa}e{}{:02}", if e < 0 { '-' } else { '+' }, e.abs()),
            Err(_) => s.clone(),
        },
        None => s.clone(),
    };
    format!("{formatted:>18}")
}

// ----- Gantry angles ------------------------------------------------------------

/// Projection angles in radians: `n` angles starting at zero and separated
/// by `spacing`, or by `2π/n` when no spacing is given.
pub fn angle_series(n: usize, spacing: Option<f64>) -> Vec<f64> {
    let step = spacing.unwrap_or(2.0 * std::f64::consts::PI / n.max(1) as f64);
    (0..n).map(|i| i as f64 * step).collect()
}

/// One angle in degrees per line; blank lines are skipped. Returns radians.
pub fn read_angles(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(n, l)| l.parse::<f64>()
             .map(f64::to_radians)
             .map_err(|e| Error::Parse { path: path.into(), message: format!("angle {n}: `{l}`: {e}") }))
        .collect()
}

/// Projection for a source at `angle` on a circle of radius `sad` around
/// `isocenter` in the xy plane, with z up.
pub fn gantry_projection(angle: f64, isocenter: Point, sad: f64, sid: f64, ic: [f64; 2], ps: [f64; 2]) -> ProjMatrix {
    let cam = isocenter + Vector::new(angle.cos(), angle.sin(), 0.0) * sad;
    ProjMatrix::new(cam, isocenter, Vector::new(0.0, 0.0, 1.0), sid, ic, ps)
}

#[cfg(test)]
mod test {
    use super::*;
    use float_eq::assert_float_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use tempfile::tempdir;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    fn overhead() -> ProjMatrix {
        ProjMatrix::new(Point::new(0.0, 0.0, 1000.0), Point::ORIGIN, Vector::new(0.0, 1.0, 0.0),
                        1500.0, [191.5, 255.5], [0.78125, 0.78125])
    }

    #[test]
    fn overhead_source_axes() {
        let p = overhead();
        assert_eq!(p.nrm(), Vector::new( 0.0, 0.0, 1.0));
        assert_eq!(p.prt(), Vector::new(-1.0, 0.0, 0.0));
        assert_eq!(p.pdn(), Vector::new( 0.0, 1.0, 0.0));
        assert_eq!(p.sad, 1000.0);
        assert_eq!(p.extrinsic[11], 1000.0);
    }

    #[test]
    fn matrix_is_intrinsic_times_extrinsic() {
        let p = overhead();
        for r in 0..3 {
            for c in 0..4 {
                let expected: f64 = (0..4).map(|k| p.intrinsic[4*r + k] * p.extrinsic[4*k + c]).sum();
                assert_eq!(p.matrix[4*r + c], expected);
            }
        }
    }

    #[rstest(/**/         point          ,    image    ,
             case(Point::new(0.0, 0.0, 0.0), [191.5, 255.5]),
             // 1000 mm from source, 1500 mm to panel: magnification 1.5
             case(Point::new(-10.0, 0.0, 0.0), [191.5 - 15.0 / 0.78125, 255.5]),
             case(Point::new(0.0, 5.0, 0.0), [191.5, 255.5 - 7.5 / 0.78125]),
             // Halfway to the source: magnification 3
             case(Point::new(-10.0, 0.0, 500.0), [191.5 - 30.0 / 0.78125, 255.5]),
    )]
    fn overhead_projection(point: Point, image: [f64; 2]) {
        let got = overhead().project(point).unwrap();
        assert_float_eq!(got, image, abs <= [1e-9; 2]);
    }

    #[test]
    fn plane_of_source_does_not_project() {
        assert_eq!(overhead().project(Point::new(3.0, 4.0, 1000.0)), None);
    }

    #[test]
    fn image_axes_move_one_pixel() {
        let p = overhead();
        let [du, dv] = p.image_axes();
        // On the detector plane, one pixel step in room space is one pixel in the image
        let panel_centre = p.cam - p.nrm() * p.sid;
        let base = p.project(panel_centre).unwrap();
        let up = p.project(panel_centre + du).unwrap();
        let vp = p.project(panel_centre + dv).unwrap();
        assert_float_eq!(up, [base[0] + 1.0, base[1]], abs <= [1e-9; 2]);
        assert_float_eq!(vp, [base[0], base[1] + 1.0], abs <= [1e-9; 2]);
    }

    proptest! {
        #[test]
        fn axes_are_orthonormal(
            angle in 0.0..std::f64::consts::TAU,
            z in -500.0..500.0_f64,
        ) {
            let cam = Point::new(1000.0 * angle.cos(), 1000.0 * angle.sin(), z);
            let p = ProjMatrix::new(cam, Point::ORIGIN, Vector::new(0.0, 0.0, 1.0),
                                    1500.0, [10.0, 10.0], [1.0, 1.0]);
            let (n, r, d) = (p.nrm(), p.prt(), p.pdn());
            for v in [n, r, d] { assert_float_eq!(v.norm(), 1.0, abs <= 1e-12) }
            assert_float_eq!(n.dot(r), 0.0, abs <= 1e-12);
            assert_float_eq!(n.dot(d), 0.0, abs <= 1e-12);
            assert_float_eq!(r.dot(d), 0.0, abs <= 1e-12);
            let rxn = r.cross(n);
            assert_float_eq!(<[f64; 3]>::from(rxn), <[f64; 3]>::from(d), abs <= [1e-12; 3]);
        }
    }

    #[test]
    fn text_roundtrip() -> Result<()> {
        let original = gantry_projection(0.7, Point::ORIGIN, 1000.0, 1500.0, [191.5, 255.5], [0.78125, 0.78125]);
        let dir = tempdir()?;
        let path = dir.path().join("proj/out_0000.txt");
        original.save(&path)?;
        let reloaded = ProjMatrix::load(&path)?;
        assert_float_eq!(reloaded.matrix, original.matrix, rmax <= [1e-8; 12]);
        assert_float_eq!(reloaded.extrinsic, original.extrinsic, abs <= [1e-6; 16]);
        assert_float_eq!(reloaded.intrinsic, original.intrinsic, rmax <= [1e-8; 12]);
        assert_float_eq!(<[f64; 3]>::from(reloaded.cam), <[f64; 3]>::from(original.cam), abs <= [1e-4; 3]);
        assert_eq!((reloaded.sad, reloaded.sid), (1000.0, 1500.0));
        Ok(())
    }

    #[test]
    fn text_layout() {
        let text = overhead().to_text();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 1 + 3 + 2 + 1 + 1 + 4 + 1 + 3);
        assert_eq!(lines[0], "    1.91500000e+02     2.55500000e+02");
        assert_eq!(lines[4], "    1.00000000e+03");
        assert_eq!(lines[7], "Extrinsic");
        assert_eq!(lines[12], "Intrinsic");
    }

    #[test]
    fn nrm_line_points_towards_source() -> std::result::Result<(), String> {
        let p = overhead();
        let text = p.to_text();
        let nrm: Vec<f64> = text.lines().nth(6).unwrap()
            .split_whitespace().map(|t| t.parse().unwrap()).collect();
        assert_eq!(nrm, vec![0.0, 0.0, 1.0]);
        assert_eq!(nrm, vec![-p.extrinsic[8], -p.extrinsic[9], -p.extrinsic[10]]);
        let reloaded = ProjMatrix::from_text(&text)?;
        assert_eq!(reloaded.nrm(), p.nrm());
        assert_float_eq!(<[f64; 3]>::from(reloaded.cam), [0.0, 0.0, 1000.0], abs <= [1e-6; 3]);
        Ok(())
    }

    // Unit pixels on a 2×2 imager, centred at (0.5, 0.5)
    #[rstest(/**/       cam            ,  sid  ,
             case(Point::new(0.0, 0.0, 1000.0), 1500.0),
             case(Point::new(0.0, 0.0, 1000.0),  800.0),
    )]
    fn intrinsic_diagonal(cam: Point, sid: f64) {
        let p = ProjMatrix::new(cam, Point::ORIGIN, Vector::new(0.0, 1.0, 0.0), sid, [0.5, 0.5], [1.0, 1.0]);
        assert_eq!([p.intrinsic[0], p.intrinsic[5], p.intrinsic[10]], [1.0, 1.0, 1.0 / sid]);
        let off_diagonal = [1, 2, 3, 4, 6, 7, 8, 9, 11];
        assert!(off_diagonal.iter().all(|&i| p.intrinsic[i] == 0.0));
        assert_eq!(p.ic, [0.5, 0.5]);
        // The target lands on the image centre
        assert_float_eq!(p.project(Point::ORIGIN).unwrap(), [0.5, 0.5], abs <= [1e-12; 2]);
    }

    #[test]
    fn truncated_text_is_rejected() {
        let text = overhead().to_text();
        let cut: String = text.lines().take(9).map(|l| format!("{l}\n")).collect();
        assert!(ProjMatrix::from_text(&cut).is_err());
    }

    #[rstest(/**/     x      ,       expected      ,
             case(   0.0    , "    0.00000000e+00"),
             case(  -1.5    , "   -1.50000000e+00"),
             case(1.0e-120  , "   1.00000000e-120"),
             case(   6.4e-3 , "    6.40000000e-03"),
    )]
    fn c_style_exponent(x: f64, expected: &str) {
        assert_eq!(fmt_e(x), expected);
    }

    #[test]
    fn default_angle_series() {
        let angles = angle_series(4, None);
        assert_float_eq!(angles, vec![0.0, 0.5, 1.0, 1.5].into_iter().map(|f| f * std::f64::consts::PI).collect::<Vec<_>>(), abs_all <= 1e-12);
        assert_eq!(angle_series(3, Some(0.1)).len(), 3);
    }

    #[test]
    fn angle_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("angles.txt");
        std::fs::write(&path, "0\n90\n\n180\n")?;
        let angles = read_angles(&path)?;
        assert_float_eq!(angles, vec![0.0, std::f64::consts::FRAC_PI_2, std::f64::consts::PI], abs_all <= 1e-12);
        std::fs::write(&path, "0\nninety\n")?;
        assert!(matches!(read_angles(&path), Err(Error::Parse { .. })));
        Ok(())
    }
}
