/// Units which are simply type aliases for `f32` rather than having an
/// implementation as a `uom` `Quantity`.
///
/// These are the element types of voxel buffers: the voxel loops are too hot
/// to carry `uom` wrappers, but we still want some clues in the source as to
/// what the numbers represent.

pub type Intensityf32 = f32;
