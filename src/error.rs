use std::path::PathBuf;

/// Everything that can make a stage, a beam computation or a file load fail.
///
/// Boundary conditions met while sampling (points outside a volume, rays
/// which miss the CT) are not errors: they have their own sentinels.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value `{value}` for `{key}`")]
    Config { key: String, value: String },

    #[error("`{key}` is not allowed in {section}")]
    KeyNotAllowed { key: String, section: &'static str },

    #[error("unsupported {what}: {name} (no fallback is attempted)")]
    Unsupported { what: &'static str, name: String },

    #[error("region of interest {roi_offset:?} + {roi_dim:?} does not fit in image of size {dim:?}")]
    RoiOutsideImage { roi_offset: [usize; 3], roi_dim: [usize; 3], dim: [usize; 3] },

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("could not allocate {elements} voxels")]
    Allocation { elements: usize },

    #[error("{path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(key: impl Into<String>, value: impl ToString) -> Self {
        Self::Config { key: key.into(), value: value.to_string() }
    }
}
