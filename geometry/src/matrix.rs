//! Small dense matrices stored row-major in flat slices:
//! `element(i,j) = m[i * cols + j]`.

use crate::Point;

/// Product of an `m×n` matrix `a` and an `n×p` matrix `b`, written into the
/// `m×p` output `c`.
///
/// Panics if any slice is shorter than its stated shape requires.
pub fn mat_mult_mat(c: &mut [f64], a: &[f64], m: usize, n: usize, b: &[f64], p: usize) {
    for i in 0..m {
        for j in 0..p {
            let mut acc = 0.0;
            for k in 0..n {
                acc += a[i*n + k] * b[k*p + j];
            }
            c[i*p + j] = acc;
        }
    }
}

pub fn dot4(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

/// Apply a 3×4 affine/projective matrix to a point in homogeneous
/// coordinates `(x, y, z, 1)`.
pub fn mat43_mult_vec3(m: &[f64; 12], p: Point) -> [f64; 3] {
    let h = [p.x, p.y, p.z, 1.0];
    let row = |r: usize| [m[4*r], m[4*r + 1], m[4*r + 2], m[4*r + 3]];
    [dot4(&row(0), &h), dot4(&row(1), &h), dot4(&row(2), &h)]
}

#[cfg(test)]
mod tests {
    use super::*;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn identity_is_neutral() {
        let a = [1.0, 2.0, 3.0,
                 4.0, 5.0, 6.0];
        let id = [1.0, 0.0, 0.0,
                  0.0, 1.0, 0.0,
                  0.0, 0.0, 1.0];
        let mut c = [0.0; 6];
        mat_mult_mat(&mut c, &a, 2, 3, &id, 3);
        assert_eq!(c, a);
    }

    #[test]
    fn rectangular_product() {
        // (2×3)·(3×2)
        let a = [1.0, 2.0, 3.0,
                 4.0, 5.0, 6.0];
        let b = [ 7.0,  8.0,
                  9.0, 10.0,
                 11.0, 12.0];
        let mut c = [0.0; 4];
        mat_mult_mat(&mut c, &a, 2, 3, &b, 2);
        assert_eq!(c, [ 58.0,  64.0,
                       139.0, 154.0]);
    }

    #[test]
    fn affine_translation() {
        let m = [1.0, 0.0, 0.0, 10.0,
                 0.0, 1.0, 0.0, 20.0,
                 0.0, 0.0, 1.0, 30.0];
        assert_eq!(mat43_mult_vec3(&m, Point::new(1.0, 2.0, 3.0)), [11.0, 22.0, 33.0]);
    }
}
