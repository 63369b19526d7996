//! Physical quantities used at the edges of the toolkit (configuration files
//! and command lines), with pithy constructors and extractors.
//!
//! The numerical core works on plain `f64`s in millimetres: values are
//! converted with `mm_` et al. as soon as they have been parsed.

pub mod todo;

pub use uom;
pub use uom::si::f64::{Angle, Length, Ratio};

mod units {
  pub use uom::si::{length::{micrometer, millimeter, centimeter, meter},
                    angle ::{degree, radian},
                    ratio ::ratio,
  };
}

/// Generate a function called NAME which returns QUANTITY by interpreting its
/// argument as UNIT
///
/// wrap!(NAME QUANTITY UNIT);
macro_rules! wrap {
  ($name:ident $quantity:ident $unit:ident ) => {
    pub fn $name(x: f64) -> $quantity { $quantity::new::<units::$unit>(x) }
  };
}

wrap!(um     Length  micrometer);
wrap!(mm     Length  millimeter);
wrap!(cm     Length  centimeter);
wrap!(m      Length       meter);
wrap!(degree Angle       degree);
wrap!(radian Angle       radian);
wrap!(ratio  Ratio        ratio);

// Reverse direction of the above.
pub fn mm_    (x: Length) -> f64 { x.get::<units::millimeter>() }
pub fn degree_(x: Angle ) -> f64 { x.get::<units::degree>() }
pub fn radian_(x: Angle ) -> f64 { x.get::<units::radian>() }
pub fn ratio_ (x: Ratio ) -> f64 { x.get::<units::ratio>() }

/// Apply `mm_` to each element of a triplet of lengths
pub fn mm3_([x, y, z]: [Length; 3]) -> [f64; 3] { [mm_(x), mm_(y), mm_(z)] }

#[macro_export]
macro_rules! assert_uom_eq {
  ($unit:ident, $lhs:expr, $rhs:expr, $algo:ident <= $tol:expr) => {
    float_eq::assert_float_eq!($lhs.get::<$unit>(), $rhs.get::<$unit>(), $algo <= $tol)
  };
}

#[cfg(test)]
mod tests {
  use super::*;
  use uom::si::length::millimeter;
  use float_eq::assert_float_eq;

  #[test]
  fn constructors_agree() {
    assert_uom_eq!(millimeter, cm(2.5), mm(25.0), ulps <= 1);
    assert_uom_eq!(millimeter, m(0.001), mm(1.0), ulps <= 1);
    assert_uom_eq!(millimeter, um(1000.0), mm(1.0), ulps <= 1);
  }

  #[test]
  fn parse_lengths_with_units() {
    let l: Length = "78 cm".parse().unwrap();
    assert_float_eq!(mm_(l), 780.0, ulps <= 1);
    let l: Length = "2.5 mm".parse().unwrap();
    assert_float_eq!(mm_(l), 2.5, ulps <= 1);
  }

  #[test]
  fn angles_roundtrip() {
    assert_float_eq!(degree_(radian(std::f64::consts::PI)), 180.0, ulps <= 1);
    assert_float_eq!(radian_(degree(90.0)), std::f64::consts::FRAC_PI_2, ulps <= 1);
  }
}
