pub mod mha;
pub mod raw;
