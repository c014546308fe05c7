//! Raw-binary band I/O: 16-bit little-endian input rasters, 8-bit mask
//! outputs, and the Earth-Sun distance table.

use std::env;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::raster::Raster;
use crate::scene::BandCal;
use crate::Error;

/// Read a full raw i16 band, row-major little-endian.
pub fn read_band(path: &Path, rows: usize, cols: usize) -> Result<Raster<i16>, Error> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut bytes = vec![0u8; rows * cols * 2];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::io(path, e))?;

    let data = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(Raster::from_vec(rows, cols, data))
}

/// Read a reflectance band and clamp saturated values to the band's
/// saturation ceiling.
pub fn read_reflectance_band(
    path: &Path,
    rows: usize,
    cols: usize,
    cal: &BandCal,
    fill: i16,
) -> Result<Raster<i16>, Error> {
    let mut band = read_band(path, rows, cols)?;
    for v in &mut band.data {
        if *v == cal.saturate_ref && *v != fill {
            *v = cal.saturate_max;
        }
    }
    Ok(band)
}

/// Read the brightness-temperature band: unscale to Kelvin, convert to
/// degC x 100. Fill stays fill; saturated values clamp to the thermal
/// ceiling (already in degC x 100).
pub fn read_thermal_band(
    path: &Path,
    rows: usize,
    cols: usize,
    cal: &BandCal,
    fill: i16,
    scale_factor: f64,
) -> Result<Raster<i16>, Error> {
    let mut band = read_band(path, rows, cols)?;
    for v in &mut band.data {
        if *v == fill {
            continue;
        }
        if *v == cal.saturate_ref {
            *v = cal.saturate_max;
            continue;
        }
        let celsius = f64::from(*v) * scale_factor - 273.15;
        *v = (100.0 * celsius).round() as i16;
    }
    Ok(band)
}

/// Write an 8-bit mask raster.
pub fn write_mask(path: &Path, mask: &Raster<u8>) -> Result<(), Error> {
    let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
    file.write_all(&mask.data).map_err(|e| Error::io(path, e))?;
    Ok(())
}

/// Load the 366-entry Earth-Sun distance table from `EarthSunDistance.txt`
/// in `dir`, or in the directory the `ESUN` environment variable names.
pub fn load_earth_sun_distances(dir: Option<&Path>) -> Result<Vec<f64>, Error> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from(
            env::var("ESUN").map_err(|_| {
                Error::Config("ESUN environment variable is not set".into())
            })?,
        ),
    };
    let path = dir.join("EarthSunDistance.txt");
    let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;

    let mut distances = Vec::with_capacity(366);
    for token in content.split_whitespace() {
        let value: f64 = token
            .parse()
            .map_err(|_| Error::io_message(&path, format!("unparseable distance: {token}")))?;
        distances.push(value);
    }
    if distances.len() < 366 {
        return Err(Error::io_message(
            &path,
            format!("expected 366 distances, found {}", distances.len()),
        ));
    }
    Ok(distances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FILL_PIXEL;
    use tempfile::tempdir;

    fn write_i16(path: &Path, values: &[i16]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn band_round_trip_little_endian() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("band.img");
        write_i16(&path, &[100, -200, 3000, FILL_PIXEL]);
        let band = read_band(&path, 2, 2).unwrap();
        assert_eq!(band.data, vec![100, -200, 3000, FILL_PIXEL]);
    }

    #[test]
    fn truncated_band_is_an_io_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.img");
        write_i16(&path, &[1, 2, 3]);
        assert!(read_band(&path, 2, 2).is_err());
    }

    #[test]
    fn saturated_reflectance_clamps_to_ceiling() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("refl.img");
        write_i16(&path, &[500, 20000, FILL_PIXEL, 700]);
        let cal = BandCal { gain: 1.0, bias: 0.0, saturate_ref: 20000, saturate_max: 5123 };
        let band = read_reflectance_band(&path, 2, 2, &cal, FILL_PIXEL).unwrap();
        assert_eq!(band.data, vec![500, 5123, FILL_PIXEL, 700]);
    }

    #[test]
    fn thermal_converts_kelvin_to_scaled_celsius() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bt.img");
        // 3001 * 0.1 = 300.1 K = 26.95 C -> 2695.
        write_i16(&path, &[3001, FILL_PIXEL, 20000, 2731]);
        let cal = BandCal { gain: 1.0, bias: 0.0, saturate_ref: 20000, saturate_max: 7000 };
        let band = read_thermal_band(&path, 2, 2, &cal, FILL_PIXEL, 0.1).unwrap();
        assert_eq!(band.data[0], 2695);
        assert_eq!(band.data[1], FILL_PIXEL);
        assert_eq!(band.data[2], 7000);
        // 273.1 K is just below freezing.
        assert_eq!(band.data[3], -5);
    }

    #[test]
    fn earth_sun_table_must_have_366_entries() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("EarthSunDistance.txt"), "0.98 0.99 1.0").unwrap();
        assert!(load_earth_sun_distances(Some(dir.path())).is_err());

        let full = vec!["1.0"; 366].join(" ");
        fs::write(dir.path().join("EarthSunDistance.txt"), full).unwrap();
        let table = load_earth_sun_distances(Some(dir.path())).unwrap();
        assert_eq!(table.len(), 366);
    }

    #[test]
    fn mask_write_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mask.img");
        let mask = Raster::from_vec(2, 2, vec![0u8, 4, 255, 2]);
        write_mask(&path, &mask).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0, 4, 255, 2]);
    }
}
