//! Per-scene cloud, cloud-shadow, snow, and water classification for
//! Landsat 4/5/7/8 top-of-atmosphere imagery.
//!
//! The pipeline runs in two stages: a six-pass potential mask
//! ([`potential`]) that flags cloud/shadow/snow/water candidates from
//! spectral tests and dynamic percentile thresholds, and an object matcher
//! ([`objects`]) that labels cloud components and geometrically projects
//! each one along the solar vector to find its shadow. [`pipeline`] drives a
//! whole scene from ESPA metadata to the categorical `cfmask` and
//! cloud-confidence rasters.

use std::path::{Path, PathBuf};

pub mod bands;
pub mod espa;
pub mod mask;
pub mod morphology;
pub mod objects;
pub mod pipeline;
pub mod potential;
pub mod raster;
pub mod scene;
pub mod stats;

pub use bands::BandSet;
pub use mask::Coverage;
pub use pipeline::{run, CfmaskConfig, CfmaskSummary};
pub use raster::Raster;
pub use scene::{BandId, Satellite, SceneMeta, Sensor};

pub const APP_NAME: &str = "cfmask";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fill sentinel in the input reflectance and thermal rasters.
pub const FILL_PIXEL: i16 = -9999;

/// Floating-point "close to zero" guard used in strict inequality checks.
pub const MINSIGMA: f32 = 1e-5;

/// Everything that can go wrong while classifying a scene. Any error aborts
/// the scene; no partial outputs are written.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad flags, metadata, or environment, detected before image buffers
    /// are allocated.
    #[error("configuration: {0}")]
    Config(String),

    /// File open/read/write failures, tagged with the offending path.
    #[error("{path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Scene metadata that does not parse.
    #[error("metadata: {0}")]
    Xml(String),

    /// Internal invariants (empty scene in the reconstruction, pixel-count
    /// mismatch during cloud re-enumeration, cloud-count overflow).
    #[error("invariant: {0}")]
    Invariant(String),
}

impl Error {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), message: source.to_string() }
    }

    pub(crate) fn io_message(path: &Path, message: String) -> Self {
        Self::Io { path: path.to_path_buf(), message }
    }
}
