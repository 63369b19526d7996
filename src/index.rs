//! Conversion between 3d voxel indices and positions in flat voxel buffers.
//!
//! The first index varies fastest: `i + dim0 * (j + dim1 * k)`.

use std::ops::{Add, Div, Mul, Rem};

pub type Index1 = usize;
pub type Index3 = [usize; 3];
pub type Dim3   = [usize; 3];

pub fn index3_to_1<T>([i, j, k]: [T; 3], [ni, nj, _nk]: [T; 3]) -> T
where
    T: Mul<Output = T> + Add<Output = T>
{
    i + (j + k * nj) * ni
}

#[allow(clippy::many_single_char_names)]
pub fn index1_to_3<T>(n: T, [ni, nj, _nk]: [T; 3]) -> [T; 3]
where
    T: Mul<Output = T> +
    Div<Output = T> +
    Rem<Output = T> +
    Copy
{
    let k = n / (ni * nj);
    let r = n % (ni * nj);
    let j = r / ni;
    let i = r % ni;
    [i, j, k]
}

/// Number of voxels in a grid of the given size
pub fn n_voxels([ni, nj, nk]: Dim3) -> usize { ni * nj * nk }
