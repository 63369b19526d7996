//! B-spline deformable registration and proton dose on regular voxel grids.

pub mod error;
pub mod index;
pub mod volume;
pub mod io;
pub mod interpolate;
pub mod proj_matrix;
pub mod bspline;
pub mod optimize;
pub mod diagnostics;
pub mod config;
pub mod registration;
pub mod rpl;
pub mod dose;
pub mod utils;
pub mod logging;

pub use error::{Error, Result};
pub use geometry::{Point, Vector};
pub use volume::{PixelType, Volume};
