use std::ops::{Add, AddAssign, Div, Index, Mul, Neg, Sub, SubAssign};

/// Direction or displacement in room coordinates (mm)
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Vector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Add for Vector {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Vector {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
        }
    }
}

impl Sub for Vector {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Vector {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
        }
    }
}

impl AddAssign for Vector {
    fn add_assign(&mut self, rhs: Self) { *self = *self + rhs }
}

impl SubAssign for Vector {
    fn sub_assign(&mut self, rhs: Self) { *self = *self - rhs }
}

impl Neg for Vector {
    type Output = Self;
    fn neg(self) -> Self::Output { Vector { x: -self.x, y: -self.y, z: -self.z } }
}

impl Mul<f64> for Vector {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self::Output {
        Vector {
            x: self.x * rhs,
            y: self.y * rhs,
            z: self.z * rhs,
        }
    }
}

impl Mul<Vector> for f64 {
    type Output = Vector;
    fn mul(self, rhs: Vector) -> Self::Output { rhs * self }
}

impl Div<f64> for Vector {
    type Output = Self;
    fn div(self, rhs: f64) -> Self::Output { self * (1.0 / rhs) }
}

impl Index<usize> for Vector {
    type Output = f64;
    fn index(&self, index: usize) -> &Self::Output {
        match index {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("index {index} is out of bounds [0,2]")
        }
    }
}

impl From<[f64; 3]> for Vector {
    fn from([x, y, z]: [f64; 3]) -> Self { Self { x, y, z } }
}

impl From<Vector> for [f64; 3] {
    fn from(v: Vector) -> Self { [v.x, v.y, v.z] }
}

impl Vector {

    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self { Self { x, y, z } }

    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Self) -> Self {
        Vector {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn norm(self) -> f64 { self.dot(self).sqrt() }

    /// Unit vector in the same direction.
    ///
    /// Only meaningful for non-zero vectors: a zero vector yields NaNs, which
    /// is left to the caller to prevent.
    pub fn normalize(self) -> Self { self / self.norm() }

    /// Component-wise product
    pub fn component_mul(self, other: Self) -> Self {
        Vector::new(self.x * other.x, self.y * other.y, self.z * other.z)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;
    use proptest::prelude::*;

    #[rstest(/**/ x,  y,  z,  norm,
             case(0.0,  0.0,  0.0,  0.0),
             case(1.0,  0.0,  0.0,  1.0),
             case(0.0,  1.0,  0.0,  1.0),
             case(0.0,  0.0,  1.0,  1.0),
             case(3.0,  4.0,  0.0,  5.0),
             case(0.0, -3.0,  4.0,  5.0),
             case(5.0,  0.0, 12.0, 13.0),
    )]
    fn vector_norm(x: f64, y: f64, z: f64, norm: f64) {
        assert_eq!(Vector::new(x, y, z).norm(), norm);
    }

    #[rstest(/**/      a       ,       b       ,    expected    ,
             case([1.0,0.0,0.0], [0.0,1.0,0.0], [ 0.0, 0.0, 1.0]),
             case([0.0,1.0,0.0], [0.0,0.0,1.0], [ 1.0, 0.0, 0.0]),
             case([0.0,0.0,1.0], [1.0,0.0,0.0], [ 0.0, 1.0, 0.0]),
             case([0.0,1.0,0.0], [1.0,0.0,0.0], [ 0.0, 0.0,-1.0]),
             case([1.0,2.0,3.0], [4.0,5.0,6.0], [-3.0, 6.0,-3.0]),
    )]
    fn vector_cross(a: [f64; 3], b: [f64; 3], expected: [f64; 3]) {
        let c: [f64; 3] = Vector::from(a).cross(Vector::from(b)).into();
        assert_eq!(c, expected);
    }

    #[test]
    fn index_for_vector() {
        let v = Vector::new(1.0, 2.0, 3.0);
        assert_eq!([v[0], v[1], v[2]], [1.0, 2.0, 3.0]);
    }

    fn nonzero() -> impl Strategy<Value = Vector> {
        (-100.0..100.0_f64, -100.0..100.0_f64, -100.0..100.0_f64)
            .prop_filter("zero-length vector", |(x,y,z)| x*x + y*y + z*z > 1e-6)
            .prop_map(|(x,y,z)| Vector::new(x, y, z))
    }

    proptest! {
        #[test]
        fn normalized_has_unit_length(v in nonzero()) {
            assert_float_eq!(v.normalize().norm(), 1.0, abs <= 1e-12);
        }

        #[test]
        fn cross_is_orthogonal(a in nonzero(), b in nonzero()) {
            let c = a.cross(b);
            let scale = a.norm() * b.norm();
            assert_float_eq!(c.dot(a) / scale, 0.0, abs <= 1e-9);
            assert_float_eq!(c.dot(b) / scale, 0.0, abs <= 1e-9);
        }
    }
}
