//! External-interface adapters: ESPA XML metadata, raw-binary band I/O, and
//! ENVI header emission. The classifier core never touches the filesystem
//! outside this module.

mod envi;
mod metadata;
mod raster_io;

pub use envi::write_envi_header;
pub use metadata::{
    append_output_bands, parse_metadata, parse_metadata_str, resolve_scene, BandFiles, BandMeta,
    EspaMetadata, GlobalMeta, OutputBand, SceneInputs,
};
pub use raster_io::{
    load_earth_sun_distances, read_band, read_reflectance_band, read_thermal_band, write_mask,
};
