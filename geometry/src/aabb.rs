//! Axis-aligned box, used as the bounding region of a voxel grid when
//! clipping rays against it.

use ncollide3d as nc;
use nc::query::RayCast;
use nc::shape::Cuboid;

use crate::{Point, Vector};

type Ray      = nc::query::Ray    <f64>;
type Isometry = nc::math::Isometry<f64>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub lo: Point,
    pub hi: Point,
}

impl Aabb {

    pub fn new(lo: Point, hi: Point) -> Self { Self { lo, hi } }

    pub fn centre(&self) -> Point { self.lo + (self.hi - self.lo) * 0.5 }

    fn half_width(&self) -> Vector { (self.hi - self.lo) * 0.5 }

    pub fn contains(&self, p: Point) -> bool {
        (0..3).all(|d| p[d] >= self.lo[d] && p[d] <= self.hi[d])
    }

    /// Where a ray starting at `origin` and heading along `dir` enters and
    /// leaves the box, or `None` if it misses.
    ///
    /// An origin inside the box is its own entry point. `dir` need not be
    /// normalized but must be non-zero.
    pub fn clip_ray(&self, origin: Point, dir: Vector) -> Option<(Point, Point)> {
        let dir = dir.normalize();
        let c = self.centre();
        let h = self.half_width();
        let iso = Isometry::translation(c.x, c.y, c.z);
        let cuboid = Cuboid::new(nc::math::Vector::new(h.x, h.y, h.z));

        // Far enough that the reversed ray starts beyond the box
        let reach = (origin - c).norm() + 2.0 * h.norm() + 1.0;

        let forward = Ray::new(to_nc(origin), nc::math::Vector::new(dir.x, dir.y, dir.z));
        let t_in = cuboid.toi_with_ray(&iso, &forward, reach, true)?;

        let far = origin + dir * reach;
        let backward = Ray::new(to_nc(far), nc::math::Vector::new(-dir.x, -dir.y, -dir.z));
        let t_back = cuboid.toi_with_ray(&iso, &backward, reach, true)?;

        Some((origin + dir * t_in, far - dir * t_back))
    }
}

fn to_nc(p: Point) -> nc::math::Point<f64> { nc::math::Point::new(p.x, p.y, p.z) }

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;

    fn unit_box() -> Aabb { Aabb::new(Point::new(-1.0, -1.0, -1.0), Point::new(1.0, 1.0, 1.0)) }

    #[rstest(/**/      origin     ,        dir       ,     entry      ,      exit      ,
             case([-5.0, 0.0, 0.0], [ 1.0, 0.0, 0.0], [-1.0,0.0,0.0], [ 1.0,0.0,0.0]),
             case([ 0.0, 5.0, 0.0], [ 0.0,-1.0, 0.0], [ 0.0,1.0,0.0], [ 0.0,-1.0,0.0]),
             case([ 0.0, 0.0, 9.0], [ 0.0, 0.0,-2.0], [ 0.0,0.0,1.0], [ 0.0,0.0,-1.0]),
             case([ 0.0, 0.0, 0.0], [ 1.0, 0.0, 0.0], [ 0.0,0.0,0.0], [ 1.0,0.0,0.0]),
             case([-3.0,-3.0, 0.0], [ 1.0, 1.0, 0.0], [-1.0,-1.0,0.0], [ 1.0,1.0,0.0]),
    )]
    fn clip_through_box(origin: [f64; 3], dir: [f64; 3], entry: [f64; 3], exit: [f64; 3]) {
        let (a, b) = unit_box().clip_ray(origin.into(), dir.into()).unwrap();
        let a: [f64; 3] = a.into();
        let b: [f64; 3] = b.into();
        assert_float_eq!(a, entry, abs <= [1e-9; 3]);
        assert_float_eq!(b, exit , abs <= [1e-9; 3]);
    }

    #[rstest(/**/      origin     ,        dir       ,
             case([-5.0, 3.0, 0.0], [ 1.0, 0.0, 0.0]),
             case([-5.0, 0.0, 0.0], [-1.0, 0.0, 0.0]),
             case([ 0.0, 0.0, 5.0], [ 1.0, 1.0, 0.0]),
    )]
    fn miss_box(origin: [f64; 3], dir: [f64; 3]) {
        assert_eq!(unit_box().clip_ray(origin.into(), dir.into()), None);
    }

    #[test]
    fn offset_box_contains_its_centre() {
        let b = Aabb::new(Point::new(10.0, 20.0, 30.0), Point::new(12.0, 24.0, 38.0));
        assert_eq!(b.centre(), Point::new(11.0, 22.0, 34.0));
        assert!( b.contains(b.centre()));
        assert!(!b.contains(Point::ORIGIN));
    }
}
