use std::ops::{Add, AddAssign, Index, Sub};
use units::{Length, mm_};
use crate::Vector;

/// Position in room coordinates (mm)
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub const ORIGIN: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self { Self { x, y, z } }

    pub fn from_lengths([x, y, z]: [Length; 3]) -> Self {
        Self::new(mm_(x), mm_(y), mm_(z))
    }

    pub fn distance(self, other: Self) -> f64 { (self - other).norm() }

    /// Position vector relative to the origin
    pub fn coords(self) -> Vector { Vector::new(self.x, self.y, self.z) }
}

impl Sub for Point {
    type Output = Vector;
    fn sub(self, rhs: Self) -> Self::Output {
        Vector {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
        }
    }
}

impl Add<Vector> for Point {
    type Output = Self;
    fn add(self, rhs: Vector) -> Self::Output {
        Point {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
        }
    }
}

impl Sub<Vector> for Point {
    type Output = Self;
    fn sub(self, rhs: Vector) -> Self::Output { self + (-rhs) }
}

impl AddAssign<Vector> for Point {
    fn add_assign(&mut self, rhs: Vector) { *self = *self + rhs }
}

impl Index<usize> for Point {
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

impl From<[f64; 3]> for Point {
    fn from([x, y, z]: [f64; 3]) -> Self { Self { x, y, z } }
}

impl From<Point> for [f64; 3] {
    fn from(p: Point) -> Self { [p.x, p.y, p.z] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use units::{cm, mm};
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn point_minus_point_is_vector() {
        let lhs = Point::new(30.0,  20.0, 80.0);
        let rhs = Point::new(20.0,  40.0, 20.0);
        assert_eq!(lhs - rhs, Vector::new(10.0, -20.0, 60.0));
    }

    #[test]
    fn point_plus_vector_is_point() {
        let mut p = Point::new(1.0, 2.0, 3.0);
        p += Vector::new(1.0, 1.0, 1.0);
        assert_eq!(p, Point::new(2.0, 3.0, 4.0));
        assert_eq!(p - Vector::new(2.0, 3.0, 4.0), Point::ORIGIN);
    }

    #[test]
    fn point_from_lengths() {
        let p = Point::from_lengths([mm(10.0), cm(2.0), mm(-3.0)]);
        assert_eq!(p, Point::new(10.0, 20.0, -3.0));
    }

    #[test]
    fn distance_between_points() {
        assert_eq!(Point::new(0.0, 0.0, 0.0).distance(Point::new(3.0, 0.0, 4.0)), 5.0);
    }
}
