//! Uniform cubic B-spline basis on a unit interval, and its derivatives.
//!
//! Function `i` of the four is the one which multiplies control point
//! `region + i`; `u` is the fractional position inside the region.

pub fn weights(u: f64) -> [f64; 4] {
    let v = 1.0 - u;
    [
        v * v * v / 6.0,
        (3.0 * u * u * u - 6.0 * u * u + 4.0) / 6.0,
        (-3.0 * u * u * u + 3.0 * u * u + 3.0 * u + 1.0) / 6.0,
        u * u * u / 6.0,
    ]
}

pub fn first_derivatives(u: f64) -> [f64; 4] {
    let v = 1.0 - u;
    [
        -0.5 * v * v,
         1.5 * u * u - 2.0 * u,
        -1.5 * u * u + u + 0.5,
         0.5 * u * u,
    ]
}

pub fn second_derivatives(u: f64) -> [f64; 4] {
    [1.0 - u, 3.0 * u - 2.0, 1.0 - 3.0 * u, u]
}

/// Polynomial coefficients (constant term first) of the basis functions and
/// of their first and second derivatives, indexed `[order][function]`.
pub const POLYNOMIALS: [[[f64; 4]; 4]; 3] = [
    [
        [ 1.0/6.0, -0.5,  0.5, -1.0/6.0],
        [ 4.0/6.0,  0.0, -1.0,  0.5    ],
        [ 1.0/6.0,  0.5,  0.5, -0.5    ],
        [ 0.0,      0.0,  0.0,  1.0/6.0],
    ],
    [
        [-0.5,  1.0, -0.5, 0.0],
        [ 0.0, -2.0,  1.5, 0.0],
        [ 0.5,  1.0, -1.5, 0.0],
        [ 0.0,  0.0,  0.5, 0.0],
    ],
    [
        [ 1.0, -1.0, 0.0, 0.0],
        [-2.0,  3.0, 0.0, 0.0],
        [ 1.0, -3.0, 0.0, 0.0],
        [ 0.0,  1.0, 0.0, 0.0],
    ],
];

/// `∫₀¹ Bᵢ⁽ᵒʳᵈᵉʳ⁾ Bⱼ⁽ᵒʳᵈᵉʳ⁾ du`, computed exactly from the polynomial
/// coefficients.
pub fn integral_matrix(order: usize) -> [[f64; 4]; 4] {
    let p = &POLYNOMIALS[order];
    let mut out = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            let mut sum = 0.0;
            for (a, ca) in p[i].iter().enumerate() {
                for (b, cb) in p[j].iter().enumerate() {
                    sum += ca * cb / (a + b + 1) as f64;
                }
            }
            out[i][j] = sum;
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use float_eq::assert_float_eq;
    use proptest::prelude::*;

    fn poly(c: &[f64; 4], u: f64) -> f64 {
        c[0] + u * (c[1] + u * (c[2] + u * c[3]))
    }

    proptest! {
        #[test]
        fn partition_of_unity(u in 0.0..1.0_f64) {
            assert_float_eq!(weights(u).iter().sum::<f64>(), 1.0, abs <= 1e-9);
            assert_float_eq!(first_derivatives(u).iter().sum::<f64>(), 0.0, abs <= 1e-9);
            assert_float_eq!(second_derivatives(u).iter().sum::<f64>(), 0.0, abs <= 1e-9);
        }

        #[test]
        fn polynomials_match_closed_forms(u in 0.0..1.0_f64) {
            let forms = [weights(u), first_derivatives(u), second_derivatives(u)];
            for (order, form) in forms.iter().enumerate() {
                for (f, expected) in form.iter().enumerate() {
                    assert_float_eq!(poly(&POLYNOMIALS[order][f], u), *expected, abs <= 1e-12);
                }
            }
        }

        #[test]
        fn derivatives_match_finite_differences(u in 0.01..0.99_f64) {
            let h = 1e-6;
            let (lo, hi) = (weights(u - h), weights(u + h));
            let d = first_derivatives(u);
            for i in 0..4 {
                assert_float_eq!((hi[i] - lo[i]) / (2.0 * h), d[i], abs <= 1e-6);
            }
        }
    }

    #[test]
    fn linear_functions_are_reproduced() {
        // Coefficients sampled from a line give back the line, shifted by one knot
        let u = 0.3;
        let w = weights(u);
        let value: f64 = (0..4).map(|i| w[i] * (2.0 * i as f64 + 5.0)).sum();
        assert_float_eq!(value, 2.0 * (u + 1.0) + 5.0, abs <= 1e-12);
    }

    #[test]
    fn integral_matrices_are_symmetric() {
        for order in 0..3 {
            let m = integral_matrix(order);
            for i in 0..4 { for j in 0..4 { assert_float_eq!(m[i][j], m[j][i], abs <= 1e-15) } }
        }
        // ∫ B₃² = ∫ u⁶/36 = 1/252
        assert_float_eq!(integral_matrix(0)[3][3], 1.0 / 252.0, abs <= 1e-15);
        // ∫ (B₃'')² = ∫ u² = 1/3
        assert_float_eq!(integral_matrix(2)[3][3], 1.0 / 3.0, abs <= 1e-15);
    }
}
