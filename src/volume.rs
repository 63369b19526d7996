//! Regular 3d voxel grids: geometry, storage and derived volumes.

use std::path::Path;

use ndarray::ArrayView3;
use rayon::prelude::*;
use serde::Deserialize;

use geometry::{Aabb, Point};
use units::todo::Intensityf32;

use crate::config::registration::RawGeometry;
use crate::error::{Error, Result};
use crate::index::{Dim3, Index1, Index3, index1_to_3, index3_to_1, n_voxels};
use crate::io::{self, mha::ElementType};

/// Element type the voxel values are meant to represent.
///
/// Voxels are always held as `f32` in memory; the pixel type records the
/// range and precision the values were loaded from or will be saved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    UChar,
    Short,
    UShort,
    UInt32,
    Float,
    /// Vector field, planes of each voxel adjacent in memory
    #[serde(rename = "vf", alias = "vf_float_interleaved")]
    VfFloatInterleaved,
    /// Vector field, one whole volume per plane
    #[serde(rename = "vf_float_planar")]
    VfFloatPlanar,
}

impl PixelType {
    pub fn is_vector(self) -> bool {
        matches!(self, Self::VfFloatInterleaved | Self::VfFloatPlanar)
    }

    fn range(self) -> Option<(f32, f32)> {
        use PixelType::*;
        match self {
            UChar  => Some((0.0, u8 ::MAX as f32)),
            Short  => Some((i16::MIN as f32, i16::MAX as f32)),
            UShort => Some((0.0, u16::MAX as f32)),
            UInt32 => Some((0.0, u32::MAX as f32)),
            Float | VfFloatInterleaved | VfFloatPlanar => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    pub dim: Dim3,
    /// Position of the centre of voxel (0,0,0)
    pub offset: [f64; 3],
    pub spacing: [f64; 3],
    pub pixel_type: PixelType,
    pub vox_planes: usize,
    pub data: Vec<Intensityf32>,
}

impl core::ops::Index<Index1> for Volume {
    type Output = Intensityf32;
    #[inline]
    fn index(&self, i: Index1) -> &Self::Output { &self.data[i] }
}

impl core::ops::IndexMut<Index1> for Volume {
    #[inline]
    fn index_mut(&mut self, i: Index1) -> &mut Self::Output { &mut self.data[i] }
}

impl core::ops::Index<Index3> for Volume {
    type Output = Intensityf32;
    fn index(&self, ijk: Index3) -> &Self::Output { &self.data[self.index(ijk)] }
}

impl core::ops::IndexMut<Index3> for Volume {
    fn index_mut(&mut self, ijk: Index3) -> &mut Self::Output {
        let i = self.index(ijk);
        &mut self.data[i]
    }
}

/// Zero-filled buffer, reporting allocation failure rather than aborting
fn zeros(elements: usize) -> Result<Vec<Intensityf32>> {
    let mut data = Vec::new();
    data.try_reserve_exact(elements)
        .map_err(|_| Error::Allocation { elements })?;
    data.resize(elements, 0.0);
    Ok(data)
}

fn check_geometry(dim: Dim3, spacing: [f64; 3]) -> Result<()> {
    if let Some(d) = dim.iter().position(|&n| n == 0) {
        return Err(Error::config(format!("dim[{d}]"), 0));
    }
    if spacing.iter().any(|&s| !(s > 0.0)) {
        return Err(Error::Geometry(format!("voxel spacing must be positive: {spacing:?}")));
    }
    Ok(())
}

impl Volume {

    pub fn new(dim: Dim3, offset: [f64; 3], spacing: [f64; 3], pixel_type: PixelType, vox_planes: usize) -> Result<Self> {
        check_geometry(dim, spacing)?;
        if vox_planes == 0 {
            return Err(Error::config("vox_planes", 0));
        }
        let data = zeros(n_voxels(dim) * vox_planes)?;
        Ok(Self { dim, offset, spacing, pixel_type, vox_planes, data })
    }

    /// Scalar `f32` volume with the given contents
    pub fn from_data(dim: Dim3, offset: [f64; 3], spacing: [f64; 3], data: Vec<Intensityf32>) -> Result<Self> {
        check_geometry(dim, spacing)?;
        if data.len() != n_voxels(dim) {
            return Err(Error::Geometry(format!(
                "{} values do not fill a volume of size {dim:?}", data.len())));
        }
        Ok(Self { dim, offset, spacing, pixel_type: PixelType::Float, vox_planes: 1, data })
    }

    /// Same geometry, different contents
    pub fn like(&self, pixel_type: PixelType, vox_planes: usize) -> Result<Self> {
        Self::new(self.dim, self.offset, self.spacing, pixel_type, vox_planes)
    }

    pub fn npix(&self) -> usize { n_voxels(self.dim) }

    #[inline]
    pub fn index(&self, ijk: Index3) -> Index1 { index3_to_1(ijk, self.dim) }

    #[inline]
    pub fn ijk(&self, index: Index1) -> Index3 { index1_to_3(index, self.dim) }

    /// Physical position of the centre of voxel `ijk`
    pub fn xyz(&self, [i, j, k]: Index3) -> Point {
        self.xyz_of_ijk([i as f64, j as f64, k as f64])
    }

    pub fn xyz_of_ijk(&self, ijk: [f64; 3]) -> Point {
        let [o, s] = [self.offset, self.spacing];
        Point::new(o[0] + ijk[0] * s[0],
                   o[1] + ijk[1] * s[1],
                   o[2] + ijk[2] * s[2])
    }

    /// Fractional voxel coordinates of a physical position
    pub fn ijk_of_xyz(&self, p: Point) -> [f64; 3] {
        let [o, s] = [self.offset, self.spacing];
        [(p.x - o[0]) / s[0],
         (p.y - o[1]) / s[1],
         (p.z - o[2]) / s[2]]
    }

    /// Whether fractional coordinates fall within half a voxel of the grid
    pub fn contains_ijk(&self, ijk: [f64; 3]) -> bool {
        (0..3).all(|d| ijk[d] >= -0.5 && ijk[d] <= self.dim[d] as f64 - 0.5)
    }

    /// Region covered by the voxels (outer faces, not centres)
    pub fn bounds(&self) -> Aabb {
        let lo = self.xyz_of_ijk([-0.5; 3]);
        let hi = self.xyz_of_ijk([self.dim[0] as f64 - 0.5,
                                  self.dim[1] as f64 - 0.5,
                                  self.dim[2] as f64 - 0.5]);
        Aabb::new(lo, hi)
    }

    /// Position in `data` of `plane` of voxel `index`, honouring the layout
    /// of vector volumes.
    #[inline]
    pub fn plane_index(&self, index: Index1, plane: usize) -> usize {
        match self.pixel_type {
            PixelType::VfFloatPlanar => plane * self.npix() + index,
            _                        => index * self.vox_planes + plane,
        }
    }

    pub fn min_max(&self) -> (f32, f32) {
        self.data.iter().fold((f32::INFINITY, f32::NEG_INFINITY),
                              |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }

    // ----- Derived volumes --------------------------------------------------------

    /// Spatial gradient (intensity per mm) as an interleaved 3-plane vector
    /// volume. Central differences inside, one-sided at the edges.
    pub fn gradient(&self) -> Result<Self> {
        self.require_scalar("gradient")?;
        let mut grad = self.like(PixelType::VfFloatInterleaved, 3)?;
        let dim = self.dim;
        grad.data
            .par_chunks_mut(3)
            .enumerate()
            .for_each(|(n, g)| {
                let ijk = index1_to_3(n, dim);
                for d in 0..3 {
                    let (mut lo, mut hi) = (ijk, ijk);
                    if ijk[d] > 0          { lo[d] -= 1 }
                    if ijk[d] + 1 < dim[d] { hi[d] += 1 }
                    let steps = hi[d] - lo[d];
                    g[d] = if steps == 0 { 0.0 } else {
                        let dv = self[hi] as f64 - self[lo] as f64;
                        (dv / (steps as f64 * self.spacing[d])) as f32
                    };
                }
            });
        Ok(grad)
    }

    /// Reorder the axes so that the second and third are exchanged: axial
    /// slices become coronal ones.
    pub fn axial_to_coronal(&self) -> Result<Self> {
        self.permuted([0, 2, 1])
    }

    /// Reorder the axes `(i, j, k) -> (j, k, i)`: axial slices become sagittal
    /// ones.
    pub fn axial_to_sagittal(&self) -> Result<Self> {
        self.permuted([1, 2, 0])
    }

    // `order[n]` is the input axis which becomes output axis `n`
    fn permuted(&self, order: [usize; 3]) -> Result<Self> {
        self.require_scalar("reslice")?;
        let [ni, nj, nk] = self.dim;
        // ndarray wants the slowest axis first
        let view = ArrayView3::from_shape((nk, nj, ni), &self.data)
            .map_err(|e| Error::Geometry(e.to_string()))?;
        let slow_first = |d: usize| 2 - d;
        let resliced = view.permuted_axes([slow_first(order[2]), slow_first(order[1]), slow_first(order[0])]);
        let pick = |a: [f64; 3]| [a[order[0]], a[order[1]], a[order[2]]];
        let dim = [self.dim[order[0]], self.dim[order[1]], self.dim[order[2]]];
        let mut out = Self::new(dim, pick(self.offset), pick(self.spacing), self.pixel_type, 1)?;
        out.data.iter_mut().zip(resliced.iter()).for_each(|(o, &v)| *o = v);
        Ok(out)
    }

    /// Reduce resolution by averaging blocks of `rate` voxels along each axis.
    pub fn subsample(&self, rate: [usize; 3]) -> Result<Self> {
        self.require_scalar("subsample")?;
        if rate.iter().any(|&r| r == 0) {
            return Err(Error::config("subsampling rate", format!("{rate:?}")));
        }
        if rate == [1, 1, 1] { return Ok(self.clone()) }
        let dim: Dim3 = [0, 1, 2].map(|d| (self.dim[d] / rate[d]).max(1));
        let offset  = [0, 1, 2].map(|d| self.offset[d] + (rate[d] as f64 - 1.0) * self.spacing[d] / 2.0);
        let spacing = [0, 1, 2].map(|d| self.spacing[d] * rate[d] as f64);
        let mut out = Self::new(dim, offset, spacing, self.pixel_type, 1)?;
        out.data.par_iter_mut().enumerate().for_each(|(n, v)| {
            let o = index1_to_3(n, dim);
            let range = |d: usize| (o[d] * rate[d])..((o[d] + 1) * rate[d]).min(self.dim[d]);
            let (mut sum, mut count) = (0.0_f64, 0_usize);
            for (k, j, i) in itertools::iproduct!(range(2), range(1), range(0)) {
                sum += self[[i, j, k]] as f64;
                count += 1;
            }
            *v = (sum / count as f64) as f32;
        });
        Ok(out)
    }

    /// Copy with values rounded and clamped to the range of `pixel_type`, or
    /// with vector planes rearranged into its layout.
    pub fn convert(&self, pixel_type: PixelType) -> Result<Self> {
        if self.pixel_type.is_vector() != pixel_type.is_vector() {
            return Err(Error::Unsupported {
                what: "pixel type conversion",
                name: format!("{:?} -> {:?}", self.pixel_type, pixel_type),
            });
        }
        let mut out = self.like(pixel_type, self.vox_planes)?;
        if pixel_type.is_vector() {
            for n in 0..self.npix() {
                for p in 0..self.vox_planes {
                    let v = self.data[self.plane_index(n, p)];
                    let at = out.plane_index(n, p);
                    out.data[at] = v;
                }
            }
        } else {
            let range = pixel_type.range();
            out.data.par_iter_mut().zip(&self.data).for_each(|(o, &v)| {
                *o = match range {
                    Some((lo, hi)) => v.round().clamp(lo, hi),
                    None           => v,
                }
            });
        }
        Ok(out)
    }

    pub(crate) fn require_scalar(&self, what: &'static str) -> Result<()> {
        if self.vox_planes == 1 { Ok(()) }
        else { Err(Error::Unsupported { what, name: format!("{}-plane volume", self.vox_planes) }) }
    }

    // ----- Raw files ----------------------------------------------------------------

    pub fn read_raw(path: &Path, dim: Dim3, offset: [f64; 3], spacing: [f64; 3]) -> Result<Self> {
        let data = io::raw::read(path)?.collect::<std::io::Result<Vec<_>>>()?;
        Self::from_data(dim, offset, spacing, data).map_err(|e| Error::Parse {
            path: path.into(),
            message: e.to_string(),
        })
    }

    pub fn write_raw(&self, path: &Path) -> Result<()> {
        io::raw::write(self.data.iter().copied(), path)?;
        Ok(())
    }

    /// MetaImage files carry their own geometry; anything else is read as
    /// raw `f32`s with the given `geometry`.
    pub fn load(path: &Path, geometry: Option<&RawGeometry>) -> Result<Self> {
        if is_mha(path) {
            let (h, data) = io::mha::read(path)?;
            let pixel_type = match (h.channels, h.element) {
                (1, ElementType::UChar ) => PixelType::UChar,
                (1, ElementType::Short ) => PixelType::Short,
                (1, ElementType::UShort) => PixelType::UShort,
                (1, ElementType::UInt  ) => PixelType::UInt32,
                (1, ElementType::Float ) => PixelType::Float,
                (3, ElementType::Float ) => PixelType::VfFloatInterleaved,
                (c, e) => return Err(Error::Unsupported { what: "MetaImage", name: format!("{c} x {e:?}") }),
            };
            check_geometry(h.dim, h.spacing)?;
            return Ok(Self { dim: h.dim, offset: h.offset, spacing: h.spacing, pixel_type, vox_planes: h.channels, data })
        }
        let g = geometry.ok_or_else(|| Error::Parse {
            path: path.into(),
            message: "raw volume needs dim, offset and spacing".into(),
        })?;
        Self::read_raw(path, g.dim, g.offset_mm(), g.spacing_mm())
    }

    /// MetaImage for `.mha` paths, raw `f32`s otherwise
    pub fn save(&self, path: &Path) -> Result<()> {
        if !is_mha(path) { return self.write_raw(path) }
        let interleaved;
        let vol = if self.pixel_type == PixelType::VfFloatPlanar {
            interleaved = self.convert(PixelType::VfFloatInterleaved)?;
            &interleaved
        } else { self };
        let element = match vol.pixel_type {
            PixelType::UChar  => ElementType::UChar,
            PixelType::Short  => ElementType::Short,
            PixelType::UShort => ElementType::UShort,
            PixelType::UInt32 => ElementType::UInt,
            _                 => ElementType::Float,
        };
        let header = io::mha::Header {
            dim: vol.dim, offset: vol.offset, spacing: vol.spacing, channels: vol.vox_planes, element,
        };
        io::mha::write(&header, vol.data.iter().copied(), path)
    }
}

fn is_mha(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("mha"))
}

#[cfg(test)]
mod test {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    /// Volume whose value at (i,j,k) is `100k + 10j + i`
    fn labelled(dim: Dim3) -> Volume {
        let mut v = Volume::new(dim, [0.0; 3], [1.0; 3], PixelType::Float, 1).unwrap();
        for n in 0..v.npix() {
            let [i, j, k] = v.ijk(n);
            v[n] = (100 * k + 10 * j + i) as f32;
        }
        v
    }

    #[rstest(/**/ dim,
             case([0, 1, 1]),
             case([4, 0, 2]),
             case([4, 3, 0]),
    )]
    fn create_rejects_empty_axes(dim: Dim3) {
        let r = Volume::new(dim, [0.0; 3], [1.0; 3], PixelType::Float, 1);
        assert!(matches!(r, Err(Error::Config { .. })));
    }

    #[test]
    fn create_is_zero_filled() {
        let v = Volume::new([3, 4, 5], [1.0, 2.0, 3.0], [0.5, 1.0, 2.0], PixelType::Short, 1).unwrap();
        assert_eq!(v.data.len(), 60);
        assert!(v.data.iter().all(|&x| x == 0.0));
        let g = Volume::new([3, 4, 5], [0.0; 3], [1.0; 3], PixelType::VfFloatInterleaved, 3).unwrap();
        assert_eq!(g.data.len(), 180);
    }

    #[test]
    fn absurd_allocation_is_reported() {
        let huge = usize::MAX / 8;
        let r = Volume::new([huge, 2, 1], [0.0; 3], [1.0; 3], PixelType::Float, 1);
        assert!(matches!(r, Err(Error::Allocation { .. })));
    }

    #[test]
    fn physical_coordinates() {
        let v = Volume::new([10, 10, 10], [-5.0, 0.0, 20.0], [0.5, 2.0, 3.0], PixelType::Float, 1).unwrap();
        assert_eq!(v.xyz([0, 0, 0]), Point::new(-5.0,  0.0, 20.0));
        assert_eq!(v.xyz([2, 3, 4]), Point::new(-4.0,  6.0, 32.0));
        assert_eq!(v.ijk_of_xyz(Point::new(-4.0, 6.0, 32.0)), [2.0, 3.0, 4.0]);
        let b = v.bounds();
        assert_eq!(b.lo, Point::new(-5.25, -1.0, 18.5));
        assert_eq!(b.hi, Point::new(-0.25, 19.0, 48.5));
    }

    use proptest::prelude::*;
    proptest! {
        #[test]
        fn xyz_roundtrip(
            i in 0..50_usize, j in 0..50_usize, k in 0..50_usize,
            o in -300.0..300.0_f64, s in 0.1..5.0_f64,
        ) {
            let v = Volume::new([50, 50, 50], [o, -o, o / 2.0], [s, s * 2.0, s / 3.0], PixelType::Float, 1).unwrap();
            let back = v.ijk_of_xyz(v.xyz([i, j, k]));
            // Tolerate rounding of the order of the coordinate magnitudes
            assert_float_eq!(back, [i as f64, j as f64, k as f64], abs <= [1e-9; 3]);
        }
    }

    #[test]
    fn gradient_of_ramp() {
        // f = 2x + 3y - z, with anisotropic spacing
        let mut v = Volume::new([4, 3, 5], [0.0; 3], [0.5, 2.0, 1.0], PixelType::Float, 1).unwrap();
        for n in 0..v.npix() {
            let p = v.xyz(v.ijk(n));
            v[n] = (2.0 * p.x + 3.0 * p.y - p.z) as f32;
        }
        let g = v.gradient().unwrap();
        assert_eq!(g.vox_planes, 3);
        let expected: [f32; 3] = [2.0, 3.0, -1.0];
        for n in 0..v.npix() {
            let got = [g.data[3*n], g.data[3*n + 1], g.data[3*n + 2]];
            assert_float_eq!(got, expected, abs_all <= 1e-5);
        }
    }

    #[test]
    fn gradient_leaves_source_alone() {
        let v = labelled([3, 3, 3]);
        let before = v.clone();
        let _ = v.gradient().unwrap();
        assert_eq!(v, before);
    }

    #[test]
    fn coronal_reslice() {
        let v = labelled([4, 3, 2]);
        let c = v.axial_to_coronal().unwrap();
        assert_eq!(c.dim, [4, 2, 3]);
        for (i, j, k) in itertools::iproduct!(0..4, 0..3, 0..2) {
            assert_eq!(c[[i, k, j]], v[[i, j, k]]);
        }
    }

    #[test]
    fn sagittal_reslice() {
        let v = Volume { offset: [1.0, 2.0, 3.0], spacing: [0.5, 0.6, 0.7], ..labelled([4, 3, 2]) };
        let s = v.axial_to_sagittal().unwrap();
        assert_eq!(s.dim, [3, 2, 4]);
        assert_eq!(s.offset, [2.0, 3.0, 1.0]);
        assert_eq!(s.spacing, [0.6, 0.7, 0.5]);
        for (i, j, k) in itertools::iproduct!(0..4, 0..3, 0..2) {
            assert_eq!(s[[j, k, i]], v[[i, j, k]]);
        }
    }

    #[test]
    fn subsample_averages_blocks() {
        let v = labelled([4, 4, 2]);
        let s = v.subsample([2, 2, 2]).unwrap();
        assert_eq!(s.dim, [2, 2, 1]);
        assert_eq!(s.spacing, [2.0, 2.0, 2.0]);
        assert_eq!(s.offset, [0.5, 0.5, 0.5]);
        // Block (0,0,0) holds i,j in {0,1}, k in {0,1}: mean 50 + 5 + 0.5
        assert_float_eq!(s[[0, 0, 0]], 55.5, ulps <= 1);
        assert_float_eq!(s[[1, 1, 0]], 77.5, ulps <= 1);
    }

    #[test]
    fn convert_clamps_and_rounds() {
        let v = Volume::from_data([4, 1, 1], [0.0; 3], [1.0; 3], vec![-3.2, 12.6, 300.0, 70000.0]).unwrap();
        assert_eq!(v.convert(PixelType::UChar ).unwrap().data, vec![0.0, 13.0, 255.0, 255.0]);
        assert_eq!(v.convert(PixelType::Short ).unwrap().data, vec![-3.0, 13.0, 300.0, 32767.0]);
        assert_eq!(v.convert(PixelType::UShort).unwrap().data, vec![0.0, 13.0, 300.0, 65535.0]);
        assert!(v.convert(PixelType::VfFloatPlanar).is_err());
    }

    #[test]
    fn convert_vector_layout() {
        let mut v = Volume::new([2, 1, 1], [0.0; 3], [1.0; 3], PixelType::VfFloatInterleaved, 3).unwrap();
        v.data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let planar = v.convert(PixelType::VfFloatPlanar).unwrap();
        assert_eq!(planar.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(planar.convert(PixelType::VfFloatInterleaved).unwrap().data, v.data);
    }

    #[test]
    fn raw_file_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vol.raw");
        let v = labelled([3, 2, 2]);
        v.write_raw(&path)?;
        assert_eq!(Volume::read_raw(&path, [3, 2, 2], [0.0; 3], [1.0; 3])?, v);
        assert!(matches!(Volume::read_raw(&path, [3, 3, 3], [0.0; 3], [1.0; 3]), Err(Error::Parse { .. })));
        Ok(())
    }

    #[test]
    fn metaimage_carries_geometry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vol.mha");
        let mut v = labelled([3, 2, 2]);
        v.offset = [-3.0, 1.5, 10.0];
        v.spacing = [0.5, 0.75, 2.0];
        v.save(&path)?;
        assert_eq!(Volume::load(&path, None)?, v);

        let mut vf = v.like(PixelType::VfFloatPlanar, 3)?;
        vf.data.iter_mut().enumerate().for_each(|(n, x)| *x = n as f32);
        vf.save(&path)?;
        let back = Volume::load(&path, None)?;
        assert_eq!(back.pixel_type, PixelType::VfFloatInterleaved);
        assert_eq!(back, vf.convert(PixelType::VfFloatInterleaved)?);
        Ok(())
    }

    #[test]
    fn raw_load_needs_geometry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vol.raw");
        labelled([3, 2, 2]).save(&path)?;
        assert!(matches!(Volume::load(&path, None), Err(Error::Parse { .. })));
        Ok(())
    }
}
