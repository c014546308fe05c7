//! Minimal ENVI header emission for the 8-bit output rasters.

use std::fs;
use std::path::{Path, PathBuf};

use crate::Error;

/// Write the `.hdr` companion for a single-band 8-bit raster at `img_path`.
pub fn write_envi_header(
    img_path: &Path,
    rows: usize,
    cols: usize,
    description: &str,
) -> Result<PathBuf, Error> {
    let hdr_path = img_path.with_extension("hdr");
    let band_name = img_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "band".into());

    let content = format!(
        "ENVI\n\
         description = {{{description}}}\n\
         samples = {cols}\n\
         lines = {rows}\n\
         bands = 1\n\
         header offset = 0\n\
         file type = ENVI Standard\n\
         data type = 1\n\
         interleave = bsq\n\
         byte order = 0\n\
         band names = {{{band_name}}}\n"
    );
    fs::write(&hdr_path, content).map_err(|e| Error::io(&hdr_path, e))?;
    Ok(hdr_path)
}
