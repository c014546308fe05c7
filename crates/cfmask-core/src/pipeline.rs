//! Scene driver: ingest, potential mask, object match, flatten, emit.

use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::bands::BandSet;
use crate::espa::{
    append_output_bands, load_earth_sun_distances, parse_metadata, read_band,
    read_reflectance_band, read_thermal_band, resolve_scene, write_envi_header, write_mask,
    OutputBand,
};
use crate::mask::{flatten, Coverage};
use crate::objects::match_cloud_shadows;
use crate::potential::potential_cloud_shadow_snow_mask;
use crate::scene::BandId;
use crate::{Error, MINSIGMA};

/// Run configuration, mirroring the command-line surface.
#[derive(Debug, Clone)]
pub struct CfmaskConfig {
    pub xml_path: PathBuf,
    /// Added to the dynamic cloud-probability percentile.
    pub cloud_prob_threshold: f32,
    /// Cloud dilation half-window in pixels.
    pub cldpix: usize,
    /// Shadow dilation half-window in pixels.
    pub sdpix: usize,
    /// Include the cirrus term in cloud probability (OLI only).
    pub use_cirrus: bool,
    /// Use the brightness-temperature band.
    pub use_thermal: bool,
    /// Directory holding EarthSunDistance.txt; defaults to `$ESUN`.
    pub esun_dir: Option<PathBuf>,
}

impl CfmaskConfig {
    pub fn new(xml_path: impl Into<PathBuf>) -> Self {
        Self {
            xml_path: xml_path.into(),
            cloud_prob_threshold: 22.5,
            cldpix: 3,
            sdpix: 3,
            use_cirrus: false,
            use_thermal: true,
            esun_dir: None,
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, Serialize)]
pub struct CfmaskSummary {
    pub coverage: Coverage,
    pub mask_path: PathBuf,
    pub conf_path: PathBuf,
    pub elapsed_ms: u64,
}

const MASK_CLASSES: [(u8, &str); 6] = [
    (0, "clear"),
    (1, "water"),
    (2, "cloud_shadow"),
    (3, "snow"),
    (4, "cloud"),
    (255, "fill"),
];
const CONFIDENCE_CLASSES: [(u8, &str); 5] = [
    (0, "cloud confidence none"),
    (1, "cloud confidence low"),
    (2, "cloud confidence medium"),
    (3, "cloud confidence high"),
    (255, "fill"),
];

/// Classify one scene end to end. No output file is created until both
/// classification stages have succeeded.
pub fn run(config: &CfmaskConfig) -> Result<CfmaskSummary, Error> {
    let started = Instant::now();
    info!(xml = %config.xml_path.display(), "reading scene metadata");

    let metadata = parse_metadata(&config.xml_path)?;
    let inputs = resolve_scene(
        &metadata,
        &config.xml_path,
        config.use_thermal,
        config.use_cirrus,
    )?;
    let mut meta = inputs.meta;

    let dsun = load_earth_sun_distances(config.esun_dir.as_deref())?;
    meta.compute_saturation_ceilings(&dsun)?;

    // South-up scenes carry a north-down azimuth; rotate it for processing.
    // The metadata file keeps the original value.
    if meta.is_south_up() {
        meta.sun_azimuth += 180.0;
        if meta.sun_azimuth - 360.0 > MINSIGMA as f64 {
            meta.sun_azimuth -= 360.0;
        }
        info!(azimuth = meta.sun_azimuth, "south-up scene; solar azimuth rotated by 180 degrees");
    }
    debug!(
        rows = meta.rows,
        cols = meta.cols,
        zenith = meta.sun_zenith,
        azimuth = meta.sun_azimuth,
        "scene geometry"
    );

    info!("reading input bands");
    let (rows, cols) = (meta.rows, meta.cols);
    let load = |band: BandId, slot: usize| {
        read_reflectance_band(
            &inputs.files.reflectance[slot],
            rows,
            cols,
            &meta.cal[band as usize],
            meta.fill,
        )
    };
    let bands = BandSet {
        blue: load(BandId::Blue, 0)?,
        green: load(BandId::Green, 1)?,
        red: load(BandId::Red, 2)?,
        nir: load(BandId::Nir, 3)?,
        swir1: load(BandId::Swir1, 4)?,
        swir2: load(BandId::Swir2, 5)?,
        cirrus: match &inputs.files.cirrus {
            Some(path) => Some(read_band(path, rows, cols)?),
            None => None,
        },
        thermal: match &inputs.files.thermal {
            Some(path) => Some(read_thermal_band(
                path,
                rows,
                cols,
                &meta.cal[BandId::Thermal as usize],
                meta.fill,
                meta.thermal_scale,
            )?),
            None => None,
        },
        fill: meta.fill,
    };

    info!("building potential cloud/shadow/snow/water mask");
    let potential = potential_cloud_shadow_snow_mask(&meta, &bands, config.cloud_prob_threshold)?;
    let mut pixel_mask = potential.pixel_mask;
    let mut conf_mask = potential.conf_mask;

    info!("matching cloud objects to shadows");
    match_cloud_shadows(
        &meta,
        bands.thermal.as_ref(),
        potential.clear_ptm,
        potential.t_templ,
        potential.t_temph,
        config.cldpix,
        config.sdpix,
        &mut pixel_mask,
    )?;

    let coverage = flatten(&mut pixel_mask, &mut conf_mask);
    info!(
        clear = coverage.clear_percent,
        cloud = coverage.cloud_percent,
        cloud_shadow = coverage.cloud_shadow_percent,
        water = coverage.water_percent,
        snow = coverage.snow_percent,
        "class coverage (percent)"
    );

    // Emit outputs only now that every pass has succeeded.
    let stem = config
        .xml_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Config("input XML has no file name".into()))?;
    let out_dir = config
        .xml_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let mask_name = format!("{stem}_cfmask.img");
    let conf_name = format!("{stem}_cfmask_conf.img");
    let mask_path = out_dir.join(&mask_name);
    let conf_path = out_dir.join(&conf_name);

    info!(path = %mask_path.display(), "writing categorical mask");
    write_mask(&mask_path, &pixel_mask)?;
    write_envi_header(&mask_path, rows, cols, "cfmask cloud/shadow/snow/water mask")?;

    info!(path = %conf_path.display(), "writing cloud confidence");
    write_mask(&conf_path, &conf_mask)?;
    write_envi_header(&conf_path, rows, cols, "cfmask cloud confidence")?;

    append_output_bands(
        &config.xml_path,
        &meta,
        &inputs.ref_short_name,
        &[
            OutputBand {
                name: "cfmask",
                long_name: "cfmask cloud/shadow/snow/water mask",
                file_name: &mask_name,
                class_values: &MASK_CLASSES,
                coverage: Some(&coverage),
            },
            OutputBand {
                name: "cfmask_conf",
                long_name: "cfmask cloud confidence",
                file_name: &conf_name,
                class_values: &CONFIDENCE_CLASSES,
                coverage: None,
            },
        ],
    )?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(elapsed_ms, "scene complete");
    Ok(CfmaskSummary { coverage, mask_path, conf_path, elapsed_ms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{CLOUD_VALUE, FILL_VALUE, SHADOW_VALUE};
    use crate::raster::Raster;
    use crate::FILL_PIXEL;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    /// Synthetic ETM+ scene written to disk as an XML plus raw band files.
    struct SceneFixture {
        rows: usize,
        cols: usize,
        blue: Raster<i16>,
        green: Raster<i16>,
        red: Raster<i16>,
        nir: Raster<i16>,
        swir1: Raster<i16>,
        swir2: Raster<i16>,
        sun_zenith: f64,
        sun_azimuth: f64,
        ul_lat: f64,
        lr_lat: f64,
    }

    impl SceneFixture {
        fn uniform(rows: usize, cols: usize, vis: i16, nir: i16, swir1: i16, swir2: i16) -> Self {
            Self {
                rows,
                cols,
                blue: Raster::filled(rows, cols, vis),
                green: Raster::filled(rows, cols, vis),
                red: Raster::filled(rows, cols, vis),
                nir: Raster::filled(rows, cols, nir),
                swir1: Raster::filled(rows, cols, swir1),
                swir2: Raster::filled(rows, cols, swir2),
                sun_zenith: 30.0,
                sun_azimuth: 135.0,
                ul_lat: 45.0,
                lr_lat: 43.0,
            }
        }

        fn bands_mut(&mut self) -> [&mut Raster<i16>; 6] {
            [
                &mut self.blue,
                &mut self.green,
                &mut self.red,
                &mut self.nir,
                &mut self.swir1,
                &mut self.swir2,
            ]
        }

        fn set_all(&mut self, row: usize, col: usize, values: [i16; 6]) {
            for (band, v) in self.bands_mut().into_iter().zip(values) {
                band.set(row, col, v);
            }
        }

        fn fill_border(&mut self) {
            let (rows, cols) = (self.rows, self.cols);
            for band in self.bands_mut() {
                for c in 0..cols {
                    band.set(0, c, FILL_PIXEL);
                    band.set(rows - 1, c, FILL_PIXEL);
                }
                for r in 0..rows {
                    band.set(r, 0, FILL_PIXEL);
                    band.set(r, cols - 1, FILL_PIXEL);
                }
            }
        }

        /// Write band files, EarthSunDistance.txt, and the scene XML.
        /// Returns the XML path.
        fn write(&self, dir: &Path) -> PathBuf {
            let write_band = |name: &str, raster: &Raster<i16>| {
                let bytes: Vec<u8> = raster.data.iter().flat_map(|v| v.to_le_bytes()).collect();
                fs::write(dir.join(name), bytes).unwrap();
            };
            write_band("scene_toa_b1.img", &self.blue);
            write_band("scene_toa_b2.img", &self.green);
            write_band("scene_toa_b3.img", &self.red);
            write_band("scene_toa_b4.img", &self.nir);
            write_band("scene_toa_b5.img", &self.swir1);
            write_band("scene_toa_b7.img", &self.swir2);

            fs::write(
                dir.join("EarthSunDistance.txt"),
                vec!["1.0"; 366].join(" "),
            )
            .unwrap();

            let mut bands_xml = String::new();
            for (l1, toa, file) in [
                ("band1", "toa_band1", "scene_toa_b1.img"),
                ("band2", "toa_band2", "scene_toa_b2.img"),
                ("band3", "toa_band3", "scene_toa_b3.img"),
                ("band4", "toa_band4", "scene_toa_b4.img"),
                ("band5", "toa_band5", "scene_toa_b5.img"),
                ("band7", "toa_band7", "scene_toa_b7.img"),
            ] {
                bands_xml.push_str(&format!(
                    r#"    <band product="L1TP" name="{l1}" nlines="{rows}" nsamps="{cols}" fill_value="-9999">
      <short_name>LE07L1TP</short_name>
      <file_name>scene_{l1}.img</file_name>
      <pixel_size x="30" y="30" units="meters"/>
      <radiance gain="2.6" bias="0.0"/>
    </band>
    <band product="toa_refl" name="{toa}" nlines="{rows}" nsamps="{cols}" fill_value="-9999" saturate_value="20000">
      <short_name>LE07TOA</short_name>
      <file_name>{file}</file_name>
      <pixel_size x="30" y="30" units="meters"/>
    </band>
"#,
                    rows = self.rows,
                    cols = self.cols,
                ));
            }

            let xml = format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<espa_metadata version="2.0">
  <global_metadata>
    <satellite>LANDSAT_7</satellite>
    <instrument>ETM+</instrument>
    <acquisition_date>2002-06-15</acquisition_date>
    <scene_center_time>17:40:18.73Z</scene_center_time>
    <solar_angles zenith="{zenith}" azimuth="{azimuth}" units="degrees"/>
    <ul_corner latitude="{ul_lat}" longitude="-106.8"/>
    <lr_corner latitude="{lr_lat}" longitude="-104.4"/>
  </global_metadata>
  <bands>
{bands_xml}  </bands>
</espa_metadata>
"#,
                zenith = self.sun_zenith,
                azimuth = self.sun_azimuth,
                ul_lat = self.ul_lat,
                lr_lat = self.lr_lat,
            );
            let xml_path = dir.join("scene.xml");
            fs::write(&xml_path, xml).unwrap();
            xml_path
        }
    }

    fn run_fixture(fixture: &SceneFixture, dir: &Path, cldpix: usize, sdpix: usize) -> (CfmaskSummary, Vec<u8>, Vec<u8>) {
        let xml_path = fixture.write(dir);
        let mut config = CfmaskConfig::new(&xml_path);
        config.use_thermal = false;
        config.cldpix = cldpix;
        config.sdpix = sdpix;
        config.esun_dir = Some(dir.to_path_buf());
        let summary = run(&config).unwrap();
        let mask = fs::read(&summary.mask_path).unwrap();
        let conf = fs::read(&summary.conf_path).unwrap();
        (summary, mask, conf)
    }

    #[test]
    fn all_fill_scene_emits_fill_rasters() {
        let dir = tempdir().unwrap();
        let fixture =
            SceneFixture::uniform(4, 4, FILL_PIXEL, FILL_PIXEL, FILL_PIXEL, FILL_PIXEL);
        let (summary, mask, conf) = run_fixture(&fixture, dir.path(), 3, 3);
        assert!(mask.iter().all(|&v| v == FILL_VALUE));
        assert!(conf.iter().all(|&v| v == FILL_VALUE));
        assert_eq!(summary.coverage.data_count, 0);
        assert_eq!(summary.coverage.clear_percent, 0.0);
    }

    #[test]
    fn uniform_clear_land_is_all_clear() {
        let dir = tempdir().unwrap();
        let fixture = SceneFixture::uniform(4, 4, 500, 4000, 2000, 1500);
        let (summary, mask, conf) = run_fixture(&fixture, dir.path(), 3, 3);
        assert!(mask.iter().all(|&v| v == 0));
        assert!(conf.iter().all(|&v| v == 1));
        assert_eq!(summary.coverage.clear_percent, 100.0);
        assert_eq!(summary.coverage.cloud_percent, 0.0);

        // The appended metadata carries the recomputed coverage.
        let xml = fs::read_to_string(dir.path().join("scene.xml")).unwrap();
        assert!(xml.contains(r#"product="cfmask""#));
        assert!(xml.contains("LE0CFMASK"));
        assert!(xml.contains(">100.00<"));
        assert!(dir.path().join("scene_cfmask.hdr").exists());
        assert!(dir.path().join("scene_cfmask_conf.hdr").exists());
    }

    fn cloud_and_patch_fixture(sun_azimuth: f64, ul_lat: f64, lr_lat: f64) -> SceneFixture {
        let mut fixture = SceneFixture::uniform(32, 32, 500, 3000, 2000, 1500);
        fixture.sun_zenith = 45.0;
        fixture.sun_azimuth = sun_azimuth;
        fixture.ul_lat = ul_lat;
        fixture.lr_lat = lr_lat;
        fixture.fill_border();
        for r in 20..26 {
            for c in 20..26 {
                fixture.set_all(r, c, [8000, 8000, 8000, 8000, 5000, 5000]);
            }
        }
        // True shadow: darker NIR/SWIR1 at the geometric projection.
        for r in 13..19 {
            for c in 13..19 {
                fixture.nir.set(r, c, 800);
                fixture.swir1.set(r, c, 500);
            }
        }
        fixture
    }

    #[test]
    fn cloud_shadow_scene_matches_geometry() {
        let dir = tempdir().unwrap();
        let fixture = cloud_and_patch_fixture(135.0, 45.0, 43.0);
        let (summary, mask, _) = run_fixture(&fixture, dir.path(), 0, 0);

        let at = |r: usize, c: usize| mask[r * 32 + c];
        assert_eq!(at(0, 0), FILL_VALUE);
        assert_eq!(at(22, 22), CLOUD_VALUE);
        assert_eq!(at(16, 16), SHADOW_VALUE);
        // The unmatched candidate edge reverts to clear.
        assert_eq!(at(13, 13), 0);
        assert_eq!(at(2, 2), 0);

        // Shadow centroid within a pixel of the projected patch.
        let painted: Vec<(f32, f32)> = (0..32usize)
            .flat_map(|r| (0..32usize).map(move |c| (r, c)))
            .filter(|&(r, c)| at(r, c) == SHADOW_VALUE)
            .map(|(r, c)| (r as f32, c as f32))
            .collect();
        let n = painted.len() as f32;
        let row_c: f32 = painted.iter().map(|p| p.0).sum::<f32>() / n;
        let col_c: f32 = painted.iter().map(|p| p.1).sum::<f32>() / n;
        assert!((row_c - 15.5).abs() <= 1.5, "row centroid {row_c}");
        assert!((col_c - 15.5).abs() <= 1.5, "col centroid {col_c}");

        let total = summary.coverage.clear_percent
            + summary.coverage.cloud_percent
            + summary.coverage.cloud_shadow_percent
            + summary.coverage.water_percent
            + summary.coverage.snow_percent;
        assert!((total - 100.0).abs() < 1e-3);
    }

    #[test]
    fn south_up_scene_rotates_azimuth_for_processing_only() {
        let dir = tempdir().unwrap();
        // Equal corner latitudes mark the scene south-up; 315 + 180 = 135.
        let fixture = cloud_and_patch_fixture(315.0, 45.0, 45.0);
        let (_, mask, _) = run_fixture(&fixture, dir.path(), 0, 0);

        let at = |r: usize, c: usize| mask[r * 32 + c];
        assert_eq!(at(22, 22), CLOUD_VALUE);
        // Shadow still falls up-left of the cloud, as with azimuth 135.
        assert_eq!(at(16, 16), SHADOW_VALUE);

        // The metadata keeps the original azimuth.
        let xml = fs::read_to_string(dir.path().join("scene.xml")).unwrap();
        assert!(xml.contains(r#"azimuth="315""#));
    }

    #[test]
    fn dilation_radii_grow_both_classes() {
        let dir = tempdir().unwrap();
        let fixture = cloud_and_patch_fixture(135.0, 45.0, 43.0);
        let (_, mask, _) = run_fixture(&fixture, dir.path(), 2, 1);
        let at = |r: usize, c: usize| mask[r * 32 + c];
        // Two pixels beyond the cloud edge is now cloud.
        assert_eq!(at(18, 22), CLOUD_VALUE);
        // One pixel beyond the painted shadow is shadow.
        assert_eq!(at(13, 16), SHADOW_VALUE);
    }
}
