mod point;
mod vector;

pub use point::Point;
pub use vector::Vector;

pub mod matrix;
mod aabb;

pub use aabb::Aabb;
