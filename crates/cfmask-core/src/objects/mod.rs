//! Cloud objects: run-length labeling and per-object shadow matching.

mod label;
mod shadow;

pub use label::{identify_clouds, CloudLabels, Run};
pub use shadow::match_cloud_shadows;
