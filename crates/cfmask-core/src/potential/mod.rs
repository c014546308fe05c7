//! The potential cloud/shadow/snow/water mask: six top-to-bottom passes over
//! the band stack producing a per-pixel candidate bitmask, a cloud-confidence
//! byte, and the clear-sky statistics the object matcher needs.

mod spectral;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::bands::BandSet;
use crate::mask::{
    CLEAR_BIT, CLEAR_FILL_BIT, CLEAR_LAND_BIT, CLEAR_WATER_BIT, CLOUD_BIT, CONFIDENCE_HIGH,
    CONFIDENCE_LOW, CONFIDENCE_MEDIUM, CONFIDENCE_NONE, FILL_BIT, SHADOW_BIT, SNOW_BIT, WATER_BIT,
};
use crate::morphology::fill_local_minima;
use crate::raster::Raster;
use crate::scene::{BandId, SceneMeta};
use crate::stats::{prctile_f32, prctile_i16};
use crate::{Error, MINSIGMA};

pub use spectral::{basic_cloud_test, hot_test, ndsi, ndvi, ratio_test, snow_test, water_test, whiteness};

/// Buffer added to both background temperature percentiles (degC x 100).
const TEMPERATURE_BUFFER: f32 = 400.0;
/// Minimum NIR/SWIR1 darkening for a shadow candidate.
const SHADOW_PROB_THRESHOLD: i32 = 200;

/// Result of the potential-mask stage.
pub struct PotentialMask {
    pub pixel_mask: Raster<u8>,
    pub conf_mask: Raster<u8>,
    /// Fraction of imagery pixels that are clear.
    pub clear_ptm: f32,
    /// Buffered low/high background temperature percentiles (degC x 100);
    /// -1 on the all-cloud fast path.
    pub t_templ: f32,
    pub t_temph: f32,
}

#[derive(Default, Clone, Copy)]
struct ClearCounts {
    image_data: usize,
    clear: usize,
    clear_land: usize,
    clear_water: usize,
}

impl ClearCounts {
    fn merge(mut self, other: Self) -> Self {
        self.image_data += other.image_data;
        self.clear += other.clear;
        self.clear_land += other.clear_land;
        self.clear_water += other.clear_water;
        self
    }
}

/// Run all six passes. Thermal and cirrus participate exactly when their
/// band slots are present in `bands`.
pub fn potential_cloud_shadow_snow_mask(
    meta: &SceneMeta,
    bands: &BandSet,
    cloud_prob_threshold: f32,
) -> Result<PotentialMask, Error> {
    let nrows = bands.rows();
    let ncols = bands.cols();

    let mut pixel_mask = Raster::filled(nrows, ncols, 0u8);
    let mut conf_mask = Raster::filled(nrows, ncols, CONFIDENCE_NONE);
    let mut clear_mask = Raster::filled(nrows, ncols, 0u8);

    // Saturation ceilings for the visible-band whiteness override. A value
    // within one count of the ceiling reads as saturated.
    let blue_ceiling = meta.cal[BandId::Blue as usize].saturate_max;
    let green_ceiling = meta.cal[BandId::Green as usize].saturate_max;
    let red_ceiling = meta.cal[BandId::Red as usize].saturate_max;

    // ── Pass 1: per-pixel spectral tests ─────────────────────────────────────
    debug!("potential mask pass one: spectral tests");
    let counts = pixel_mask
        .data
        .par_chunks_mut(ncols)
        .zip(clear_mask.data.par_chunks_mut(ncols))
        .enumerate()
        .map(|(row, (mask_row, clear_row))| {
            let blue = bands.blue.row(row);
            let green = bands.green.row(row);
            let red = bands.red.row(row);
            let nir = bands.nir.row(row);
            let swir1 = bands.swir1.row(row);
            let swir2 = bands.swir2.row(row);
            let cirrus = bands.cirrus.as_ref().map(|r| r.row(row));
            let thermal = bands.thermal.as_ref().map(|r| r.row(row));

            let mut counts = ClearCounts::default();
            for col in 0..ncols {
                let idx = row * ncols + col;
                if bands.is_fill(idx) {
                    mask_row[col] = FILL_BIT;
                    clear_row[col] = CLEAR_FILL_BIT;
                    continue;
                }
                counts.image_data += 1;

                let bt = thermal.map(|t| t[col]);
                let nd_v = ndvi(red[col], nir[col]);
                let nd_s = ndsi(green[col], swir1[col]);

                let saturated = blue[col] >= blue_ceiling.saturating_sub(1)
                    || green[col] >= green_ceiling.saturating_sub(1)
                    || red[col] >= red_ceiling.saturating_sub(1);

                let mut is_cloud = basic_cloud_test(swir2[col], bt, nd_v, nd_s);
                if is_cloud {
                    let white = if saturated {
                        0.0
                    } else {
                        whiteness(blue[col], green[col], red[col])
                    };
                    is_cloud = (white - 0.7) < MINSIGMA;
                }
                is_cloud = is_cloud && (hot_test(blue[col], red[col]) || saturated);
                is_cloud = is_cloud && ratio_test(nir[col], swir1[col]);
                if let Some(ci) = cirrus {
                    is_cloud = is_cloud || f32::from(ci[col]) / 400.0 - 0.25 > MINSIGMA;
                }

                let is_snow = snow_test(green[col], nir[col], bt, nd_s);
                let is_water = water_test(nir[col], nd_v);

                let mut mask = 0u8;
                if is_cloud {
                    mask |= CLOUD_BIT;
                }
                if is_snow {
                    mask |= SNOW_BIT;
                }
                if is_water {
                    mask |= WATER_BIT;
                }
                mask_row[col] = mask;

                if is_cloud {
                    clear_row[col] = 0;
                } else {
                    counts.clear += 1;
                    if is_water {
                        counts.clear_water += 1;
                        clear_row[col] = CLEAR_BIT | CLEAR_WATER_BIT;
                    } else {
                        counts.clear_land += 1;
                        clear_row[col] = CLEAR_BIT | CLEAR_LAND_BIT;
                    }
                }
            }
            counts
        })
        .reduce(ClearCounts::default, ClearCounts::merge);

    let fraction = |n: usize| {
        if counts.image_data == 0 {
            0.0f32
        } else {
            n as f32 / counts.image_data as f32
        }
    };
    let clear_ptm = fraction(counts.clear);
    let land_ptm = fraction(counts.clear_land);
    let water_ptm = fraction(counts.clear_water);
    debug!(
        clear = counts.clear,
        clear_land = counts.clear_land,
        clear_water = counts.clear_water,
        imagery = counts.image_data,
        "clear-sky counts"
    );

    if clear_ptm <= 0.001 {
        // Essentially everything is cloud; skip the thermal and probability
        // passes and mark the remaining imagery as shadow.
        info!("scene is nearly all cloud; skipping probability passes");
        pixel_mask
            .data
            .par_iter_mut()
            .zip(conf_mask.data.par_iter_mut())
            .for_each(|(mask, conf)| {
                if *mask & FILL_BIT != 0 {
                    return;
                }
                if *mask & CLOUD_BIT != 0 {
                    *conf = CONFIDENCE_HIGH;
                } else {
                    *mask |= SHADOW_BIT;
                    *conf = CONFIDENCE_LOW;
                }
            });
        return Ok(PotentialMask {
            pixel_mask,
            conf_mask,
            clear_ptm,
            t_templ: -1.0,
            t_temph: -1.0,
        });
    }

    // Fall back to all clear pixels when a surface class is too rare for a
    // stable percentile.
    let land_bit = if land_ptm >= 0.001 { CLEAR_LAND_BIT } else { CLEAR_BIT };
    let water_bit = if water_ptm >= 0.001 { CLEAR_WATER_BIT } else { CLEAR_BIT };

    // ── Pass 2: clear-sky background temperatures ────────────────────────────
    let mut t_templ = 0.0f32;
    let mut t_temph = 0.0f32;
    let mut t_wtemp = 0.0f32;
    let mut temp_diff = 0.0f32;
    if let Some(thermal) = &bands.thermal {
        debug!("potential mask pass two: background temperatures");
        let mut f_temp: Vec<i16> = Vec::new();
        let mut f_wtemp: Vec<i16> = Vec::new();
        for (idx, &clear) in clear_mask.data.iter().enumerate() {
            if clear & CLEAR_FILL_BIT != 0 {
                continue;
            }
            if clear & land_bit != 0 {
                f_temp.push(thermal.data[idx]);
            }
            if clear & water_bit != 0 {
                f_wtemp.push(thermal.data[idx]);
            }
        }
        let bounds = |v: &[i16]| {
            let min = v.iter().copied().min().unwrap_or(0);
            let max = v.iter().copied().max().unwrap_or(0);
            (min, max)
        };
        let (t_min, t_max) = bounds(&f_temp);
        let (w_min, w_max) = bounds(&f_wtemp);

        t_templ = prctile_i16(&f_temp, t_min, t_max, 17.5) - TEMPERATURE_BUFFER;
        t_temph = prctile_i16(&f_temp, t_min, t_max, 82.5) + TEMPERATURE_BUFFER;
        t_wtemp = prctile_i16(&f_wtemp, w_min, w_max, 82.5);
        temp_diff = t_temph - t_templ;
        debug!(t_templ, t_temph, t_wtemp, "background temperature percentiles");
    }

    // ── Pass 3: per-pixel cloud probability ──────────────────────────────────
    debug!("potential mask pass three: cloud probability");
    let mut final_prob = Raster::filled(nrows, ncols, 0.0f32);
    let mut wfinal_prob = Raster::filled(nrows, ncols, 0.0f32);
    final_prob
        .data
        .par_chunks_mut(ncols)
        .zip(wfinal_prob.data.par_chunks_mut(ncols))
        .enumerate()
        .for_each(|(row, (land_row, water_row))| {
            let blue = bands.blue.row(row);
            let green = bands.green.row(row);
            let red = bands.red.row(row);
            let nir = bands.nir.row(row);
            let swir1 = bands.swir1.row(row);
            let cirrus = bands.cirrus.as_ref().map(|r| r.row(row));
            let thermal = bands.thermal.as_ref().map(|r| r.row(row));
            let mask_row = pixel_mask.row(row);

            for col in 0..ncols {
                if mask_row[col] & FILL_BIT != 0 {
                    continue;
                }
                let cirrus_term = cirrus.map_or(0.0, |ci| f32::from(ci[col]) / 400.0);

                if mask_row[col] & WATER_BIT != 0 {
                    // Cloud-over-water: SWIR1 brightness, tempered by the
                    // clear-water temperature when thermal is available.
                    let mut brightness_prob =
                        (f32::from(swir1[col]) / 1100.0).clamp(0.0, 1.0);
                    if let Some(t) = thermal {
                        let wtemp_prob = (t_wtemp - f32::from(t[col])) / 400.0;
                        brightness_prob *= wtemp_prob.max(0.0);
                    }
                    water_row[col] = 100.0 * (brightness_prob + cirrus_term);
                    land_row[col] = 0.0;
                } else {
                    let nd_v = ndvi(red[col], nir[col]).max(0.0);
                    let nd_s = ndsi(green[col], swir1[col]).max(0.0);
                    let saturated = blue[col] >= blue_ceiling.saturating_sub(1)
                        || green[col] >= green_ceiling.saturating_sub(1)
                        || red[col] >= red_ceiling.saturating_sub(1);
                    let white = if saturated {
                        0.0
                    } else {
                        whiteness(blue[col], green[col], red[col])
                    };
                    let mut vari_prob = 1.0 - nd_v.abs().max(nd_s.abs()).max(white);
                    if let Some(t) = thermal {
                        // Temperature probability is allowed to exceed one.
                        let temp_prob = (t_temph - f32::from(t[col])) / temp_diff;
                        vari_prob *= temp_prob.max(0.0);
                    }
                    land_row[col] = 100.0 * (vari_prob + cirrus_term);
                    water_row[col] = 0.0;
                }
            }
        });

    // Dynamic thresholds from the clear-pixel probability distributions.
    let dynamic_threshold = |probs: &Raster<f32>, bit: u8| {
        let mut samples: Vec<f32> = Vec::new();
        let mut min = 0.0f32;
        let mut max = 0.0f32;
        for (idx, &clear) in clear_mask.data.iter().enumerate() {
            if clear & CLEAR_FILL_BIT != 0 || clear & bit == 0 {
                continue;
            }
            let p = probs.data[idx];
            if p > max {
                max = p;
            }
            if p < min {
                min = p;
            }
            samples.push(p);
        }
        prctile_f32(&samples, min, max, 82.5) + cloud_prob_threshold
    };
    let clr_mask = dynamic_threshold(&final_prob, land_bit);
    let wclr_mask = dynamic_threshold(&wfinal_prob, water_bit);
    debug!(clr_mask, wclr_mask, "dynamic cloud probability thresholds");

    // ── Pass 4: final cloud decision and confidence ──────────────────────────
    debug!("potential mask pass four: cloud decision");
    let cold_cloud_limit = t_templ + TEMPERATURE_BUFFER - 3500.0;
    pixel_mask
        .data
        .par_chunks_mut(ncols)
        .zip(conf_mask.data.par_chunks_mut(ncols))
        .enumerate()
        .for_each(|(row, (mask_row, conf_row))| {
            let thermal = bands.thermal.as_ref().map(|r| r.row(row));
            let land_row = final_prob.row(row);
            let water_row = wfinal_prob.row(row);

            for col in 0..ncols {
                if mask_row[col] & FILL_BIT != 0 {
                    continue;
                }

                if let Some(t) = thermal {
                    // Anything this much colder than the clear-sky floor is
                    // cloud regardless of probability.
                    if f32::from(t[col]) < cold_cloud_limit {
                        conf_row[col] = CONFIDENCE_HIGH;
                        mask_row[col] |= CLOUD_BIT;
                    }
                }

                if conf_row[col] == CONFIDENCE_NONE {
                    let is_water = mask_row[col] & WATER_BIT != 0;
                    let candidate = mask_row[col] & CLOUD_BIT != 0;
                    let (prob, threshold) = if is_water {
                        (water_row[col], wclr_mask)
                    } else {
                        (land_row[col], clr_mask)
                    };

                    if candidate && prob > threshold {
                        conf_row[col] = CONFIDENCE_HIGH;
                        mask_row[col] |= CLOUD_BIT;
                    } else if candidate && prob > threshold - 10.0 {
                        conf_row[col] = CONFIDENCE_MEDIUM;
                        mask_row[col] &= !CLOUD_BIT;
                    } else {
                        conf_row[col] = CONFIDENCE_LOW;
                        mask_row[col] &= !CLOUD_BIT;
                    }
                }
            }
        });

    // ── Pass 5: clear-land background and morphological fill ─────────────────
    debug!("potential mask pass five: background fill");
    let mut nir_samples: Vec<i16> = Vec::new();
    let mut swir1_samples: Vec<i16> = Vec::new();
    for (idx, &clear) in clear_mask.data.iter().enumerate() {
        if clear & CLEAR_FILL_BIT != 0 || clear & land_bit == 0 {
            continue;
        }
        nir_samples.push(bands.nir.data[idx]);
        swir1_samples.push(bands.swir1.data[idx]);
    }
    let bounds = |v: &[i16]| {
        let min = v.iter().copied().min().unwrap_or(0);
        let max = v.iter().copied().max().unwrap_or(0);
        (min, max)
    };
    let (nir_min, nir_max) = bounds(&nir_samples);
    let (swir1_min, swir1_max) = bounds(&swir1_samples);
    let nir_boundary = prctile_i16(&nir_samples, nir_min, nir_max, 17.5);
    let swir1_boundary = prctile_i16(&swir1_samples, swir1_min, swir1_max, 17.5);
    debug!(nir_boundary, swir1_boundary, "background estimates");

    let (filled_nir, filled_swir1) = rayon::join(
        || fill_local_minima(&bands.nir, bands.fill, nir_boundary),
        || fill_local_minima(&bands.swir1, bands.fill, swir1_boundary),
    );
    let filled_nir = filled_nir?;
    let filled_swir1 = filled_swir1?;

    // ── Pass 6: shadow candidates ────────────────────────────────────────────
    debug!("potential mask pass six: shadow candidates");
    pixel_mask
        .data
        .par_chunks_mut(ncols)
        .enumerate()
        .for_each(|(row, mask_row)| {
            let nir = bands.nir.row(row);
            let swir1 = bands.swir1.row(row);
            let f_nir = filled_nir.row(row);
            let f_swir1 = filled_swir1.row(row);

            for col in 0..ncols {
                if mask_row[col] & FILL_BIT != 0 {
                    continue;
                }
                let nir_drop = i32::from(f_nir[col]) - i32::from(nir[col]);
                let swir1_drop = i32::from(f_swir1[col]) - i32::from(swir1[col]);
                if nir_drop.min(swir1_drop) > SHADOW_PROB_THRESHOLD {
                    mask_row[col] |= SHADOW_BIT;
                } else {
                    mask_row[col] &= !SHADOW_BIT;
                }

                // No confusion between water and cloud.
                if mask_row[col] & WATER_BIT != 0 && mask_row[col] & CLOUD_BIT != 0 {
                    mask_row[col] &= !WATER_BIT;
                }
            }
        });

    Ok(PotentialMask {
        pixel_mask,
        conf_mask,
        clear_ptm,
        t_templ,
        t_temph,
    })
}
