//! Object-based cloud/shadow matching: project every labeled cloud along the
//! solar vector over a range of base heights and keep the height whose
//! footprint best overlaps the independently detected shadow candidates.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::mask::{CLOUD_BIT, FILL_BIT, SHADOW_BIT};
use crate::morphology::dilate_bit;
use crate::objects::label::identify_clouds;
use crate::raster::Raster;
use crate::scene::SceneMeta;
use crate::stats::prctile_i16;
use crate::{Error, MINSIGMA};

/// Clouds at or below this pixel count are discarded before matching.
const MIN_CLOUD_OBJ: u32 = 9;
/// Similarity ceiling: once the recorded score reaches it, the search stops
/// improving and commits.
const MAX_SIMILAR: f32 = 0.95;
/// Inward ring width (pixels) excluded when picking the cloud base
/// temperature.
const NUM_INWARD_PIXELS: f32 = 3.0;
/// Wet and dry adiabatic lapse rates (degC/km).
const RATE_ELAPSE: f32 = 6.5;
const RATE_DLAPSE: f32 = 9.8;
/// Mean platform altitude (m) used for the true-footprint correction.
const PLATFORM_HEIGHT: f32 = 705_000.0;

/// Scene-track geometry: the line a*x + b*y + c = 0 through the midpoints of
/// the top and bottom edges of the imaged footprint, plus the precomputed
/// factors the per-pixel projection needs.
struct SceneGeometry {
    a: f32,
    b: f32,
    c: f32,
    inv_a_b_distance: f32,
    inv_cos_omiga_per_minus_par: f32,
    cos_omiga_par: f32,
    sin_omiga_par: f32,
}

impl SceneGeometry {
    /// Corners are (col, row) pairs of the four extreme non-fill pixels.
    fn from_corners(ul: (i32, i32), ur: (i32, i32), ll: (i32, i32), lr: (i32, i32)) -> Self {
        let x_u = (ul.0 + ur.0) as f32 / 2.0;
        let x_l = (ll.0 + lr.0) as f32 / 2.0;
        let y_u = (ul.1 + ur.1) as f32 / 2.0;
        let y_l = (ll.1 + lr.1) as f32 / 2.0;

        let k_ulr = if ul.0 != ur.0 {
            (ul.1 - ur.1) as f32 / (ul.0 - ur.0) as f32
        } else {
            0.0
        };
        let k_llr = if ll.0 != lr.0 {
            (ll.1 - lr.1) as f32 / (ll.0 - lr.0) as f32
        } else {
            0.0
        };

        let omiga_par = ((k_ulr + k_llr) / 2.0).atan();

        let a = y_u - y_l;
        let b = x_l - x_u;
        let c = y_l * x_u - x_l * y_u;
        let omiga_per = (b / a).atan();

        Self {
            a,
            b,
            c,
            inv_a_b_distance: 1.0 / (a * a + b * b).sqrt(),
            inv_cos_omiga_per_minus_par: 1.0 / (omiga_per - omiga_par).cos(),
            cos_omiga_par: omiga_par.cos(),
            sin_omiga_par: omiga_par.sin(),
        }
    }

    /// Shift a cloud pixel to its true ground footprint: the perpendicular
    /// distance from the central track, scaled by height over platform
    /// altitude, moves the pixel in the along-track direction.
    #[inline]
    fn true_position(&self, col: i32, row: i32, height: f32) -> (f32, f32) {
        let dist = (self.a * col as f32 + self.b * row as f32 + self.c) * self.inv_a_b_distance;
        let dist_par = dist * self.inv_cos_omiga_per_minus_par;
        let dist_move = dist_par * height / PLATFORM_HEIGHT;
        (
            col as f32 + dist_move * self.cos_omiga_par,
            row as f32 + dist_move * self.sin_omiga_par,
        )
    }
}

/// Find the four extreme non-fill pixels as (col, row). `None` when the
/// whole image is fill.
fn imagery_corners(pixel_mask: &Raster<u8>) -> Option<[(i32, i32); 4]> {
    let rows = pixel_mask.rows;
    let cols = pixel_mask.cols;
    let non_fill = |r: usize, c: usize| pixel_mask.get(r, c) & FILL_BIT == 0;

    let mut ul = None;
    'ul: for r in 0..rows {
        for c in 0..cols {
            if non_fill(r, c) {
                ul = Some((c as i32, r as i32));
                break 'ul;
            }
        }
    }
    let ul = ul?;

    let mut ur = (0, 0);
    'ur: for c in (0..cols).rev() {
        for r in 0..rows {
            if non_fill(r, c) {
                ur = (c as i32, r as i32);
                break 'ur;
            }
        }
    }
    let mut ll = (0, 0);
    'll: for c in 0..cols {
        for r in (0..rows).rev() {
            if non_fill(r, c) {
                ll = (c as i32, r as i32);
                break 'll;
            }
        }
    }
    let mut lr = (0, 0);
    'lr: for r in (0..rows).rev() {
        for c in (0..cols).rev() {
            if non_fill(r, c) {
                lr = (c as i32, r as i32);
                break 'lr;
            }
        }
    }

    Some([ul, ur, ll, lr])
}

/// Match every cloud object to its shadow, then dilate the surviving cloud
/// and shadow bits back into the pixel mask.
///
/// `clear_ptm` is the clear fraction from the potential-mask stage. When the
/// scene is nearly all cloud (`clear_ptm <= 0.1` or a revised cloud fraction
/// of 0.9 or more) matching is skipped and every non-cloud non-fill pixel
/// becomes shadow.
#[allow(clippy::too_many_arguments)]
pub fn match_cloud_shadows(
    meta: &SceneMeta,
    thermal: Option<&Raster<i16>>,
    clear_ptm: f32,
    t_templ: f32,
    t_temph: f32,
    cldpix: usize,
    sdpix: usize,
    pixel_mask: &mut Raster<u8>,
) -> Result<(), Error> {
    let (imagery_pixel_count, cloud_pixel_count) = pixel_mask
        .data
        .par_iter()
        .map(|&m| {
            if m & FILL_BIT != 0 {
                (0usize, 0usize)
            } else if m & CLOUD_BIT != 0 {
                (1, 1)
            } else {
                (1, 0)
            }
        })
        .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

    let revised_ptm = if imagery_pixel_count != 0 {
        cloud_pixel_count as f32 / imagery_pixel_count as f32
    } else {
        0.0
    };
    debug!(cloud_pixel_count, imagery_pixel_count, revised_ptm, "cloud fraction after potential mask");

    if clear_ptm <= 0.1 || revised_ptm >= 0.9 {
        // Too little clear sky to match against: non-cloud imagery pixels
        // are all declared shadow.
        info!("skipping shadow match; scene is nearly all cloud");
        for m in &mut pixel_mask.data {
            if *m & (FILL_BIT | CLOUD_BIT) == 0 {
                *m |= SHADOW_BIT;
            }
        }
        return Ok(());
    }

    let sun_elevation = (90.0 - meta.sun_zenith).to_radians();
    let tan_sun_elevation = sun_elevation.tan() as f32;
    let sun_tazi = (meta.sun_azimuth - 90.0).to_radians();
    let shadow_unit_vec = (sun_tazi.cos() as f32, sun_tazi.sin() as f32);
    let inv_shadow_step = 1.0 / (meta.pixel_size as f32 * tan_sun_elevation);
    let projection_sign = if meta.sun_azimuth - 180.0 < MINSIGMA as f64 {
        -1.0f32
    } else {
        1.0
    };

    // Iterate base heights two shadow pixels at a time; for near-horizontal
    // sun, fall back to two pixel-size steps.
    let pixel_size = meta.pixel_size as f32;
    let mut i_step = (2.0 * pixel_size * tan_sun_elevation).round() as i32;
    if i_step < (2.0 * pixel_size) as i32 {
        i_step = (2.0 * pixel_size) as i32;
    }

    let corners = imagery_corners(pixel_mask)
        .ok_or_else(|| Error::Invariant("no imagery pixels for scene geometry".into()))?;
    let geometry = SceneGeometry::from_corners(corners[0], corners[1], corners[2], corners[3]);

    info!("labeling clouds");
    let mut cloud_map = Raster::filled(pixel_mask.rows, pixel_mask.cols, 0i32);
    let mut labels = identify_clouds(pixel_mask, &mut cloud_map)?;

    // Discard clouds too small to match.
    let mut real_clouds = 0usize;
    for cloud in 1..labels.count() {
        if labels.pixel_count[cloud] <= MIN_CLOUD_OBJ {
            labels.pixel_count[cloud] = 0;
            labels.lookup[cloud] = -1;
        } else {
            real_clouds += 1;
        }
    }
    debug!(clouds = labels.count() - 1, real_clouds, "cloud objects labeled");

    // Working mask: cloud bits with the tiny objects removed; matched
    // shadows accumulate here and replace the candidates via dilation.
    let mut cal_mask = Raster::filled(pixel_mask.rows, pixel_mask.cols, 0u8);
    cal_mask
        .data
        .par_iter_mut()
        .zip(pixel_mask.data.par_iter())
        .zip(cloud_map.data.par_iter())
        .for_each(|((cal, &mask), &cloud)| {
            if mask & CLOUD_BIT != 0
                && mask & FILL_BIT == 0
                && labels.pixel_count[cloud as usize] != 0
            {
                *cal = CLOUD_BIT;
            }
        });

    info!("finding shadows");
    for cloud in 1..labels.count() {
        let cloud_pixels = labels.pixel_count[cloud] as usize;
        if cloud_pixels == 0 {
            continue;
        }

        // Larger clouds (over 10% of the imagery) get a laxer similarity
        // floor and a tighter improvement buffer, recovering shadows at
        // scene edges.
        let (t_similar, t_buffer) = if cloud_pixels <= imagery_pixel_count / 10 {
            (0.3f32, 0.95f32)
        } else {
            (0.1, 0.98)
        };

        let mut orig: Vec<(i32, i32)> = Vec::with_capacity(cloud_pixels);
        let mut temp_obj: Vec<i16> = Vec::new();
        let mut temp_min = i16::MAX;
        let mut temp_max = i16::MIN;
        for run in labels.runs_of(cloud) {
            let row = run.row as i32;
            for col in run.start_col..run.start_col + run.col_count {
                if let Some(th) = thermal {
                    let t = th.get(run.row as usize, col as usize);
                    temp_min = temp_min.min(t);
                    temp_max = temp_max.max(t);
                    temp_obj.push(t);
                }
                orig.push((col as i32, row));
            }
        }
        if orig.len() != cloud_pixels {
            return Err(Error::Invariant(format!(
                "cloud {cloud} enumerated {} pixels, expected {cloud_pixels}",
                orig.len()
            )));
        }

        // Base temperature: treat the object as a disk and take the
        // percentile that excludes the warm edge ring, or the minimum when
        // the object is too small to have an interior.
        let mut t_obj = 0.0f32;
        if thermal.is_some() {
            let radius = (cloud_pixels as f32 / (2.0 * std::f32::consts::PI)).sqrt();
            let pct_obj = (radius - NUM_INWARD_PIXELS).powi(2) / (radius * radius);
            if pct_obj - 1.0 >= MINSIGMA {
                t_obj = temp_min as f32;
            } else {
                t_obj = prctile_i16(&temp_obj, temp_min, temp_max, 100.0 * pct_obj);
            }
            let t_obj_int = t_obj.round() as i16;
            for t in &mut temp_obj {
                if *t > t_obj_int {
                    *t = t_obj_int;
                }
            }
        }

        let mut min_cl_height = 200i32;
        let mut max_cl_height = 12_000i32;
        if thermal.is_some() {
            let min_height = (10.0 * (t_templ - t_obj) / RATE_DLAPSE).round() as i32;
            let max_height = (10.0 * (t_temph - t_obj) / RATE_ELAPSE).round() as i32;
            if min_cl_height < min_height {
                min_cl_height = min_height;
            }
            if max_cl_height > max_height {
                max_cl_height = max_height;
            }
        }

        let mut cloud_height = vec![0.0f32; cloud_pixels];
        let mut matched_height = vec![0.0f32; cloud_pixels];
        let mut record_thresh = 0.0f32;

        let mut base_h = min_cl_height;
        while base_h <= max_cl_height {
            if thermal.is_some() {
                for (h, &t) in cloud_height.iter_mut().zip(&temp_obj) {
                    *h = 10.0 * (t_obj - t as f32) / RATE_ELAPSE + base_h as f32;
                }
            } else {
                cloud_height.fill(base_h as f32);
            }

            let (out_all, match_all, total_all) = orig
                .par_iter()
                .zip(cloud_height.par_iter())
                .map(|(&(col, row), &height)| {
                    let (true_col, true_row) = geometry.true_position(col, row, height);
                    let i_xy = height * inv_shadow_step;
                    let target_col =
                        (true_col + projection_sign * i_xy * shadow_unit_vec.0).round() as i32;
                    let target_row =
                        (true_row + projection_sign * i_xy * shadow_unit_vec.1).round() as i32;

                    if !pixel_mask.in_bounds(target_row as isize, target_col as isize) {
                        return (1usize, 0usize, 0usize);
                    }
                    let target = (target_row as usize, target_col as usize);
                    let map_value = cloud_map.get(target.0, target.1);
                    let mask = pixel_mask.get(target.0, target.1);

                    let is_match = mask & FILL_BIT != 0
                        || (map_value != cloud as i32 && mask & (CLOUD_BIT | SHADOW_BIT) != 0);
                    let in_total = map_value != cloud as i32;
                    (0, is_match as usize, in_total as usize)
                })
                .reduce(|| (0, 0, 0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2));

            let match_all = match_all + out_all;
            let total_all = total_all + out_all;
            let thresh_match = if total_all != 0 {
                match_all as f32 / total_all as f32
            } else {
                0.0
            };

            if thresh_match - t_buffer * record_thresh >= MINSIGMA
                && base_h < max_cl_height - i_step
                && record_thresh - MAX_SIMILAR < MINSIGMA
            {
                if thresh_match - record_thresh > MINSIGMA {
                    record_thresh = thresh_match;
                    matched_height.copy_from_slice(&cloud_height);
                }
            } else if record_thresh - t_similar > MINSIGMA {
                // Commit: re-project at the best heights and paint the
                // shadow, clamping landings to the image.
                for (&(col, row), &height) in orig.iter().zip(&matched_height) {
                    let (true_col, true_row) = geometry.true_position(col, row, height);
                    let i_vir = height * inv_shadow_step;
                    let target_col =
                        (true_col + projection_sign * i_vir * shadow_unit_vec.0).round() as i32;
                    let target_row =
                        (true_row + projection_sign * i_vir * shadow_unit_vec.1).round() as i32;
                    let target_col = target_col.clamp(0, cal_mask.cols as i32 - 1) as usize;
                    let target_row = target_row.clamp(0, cal_mask.rows as i32 - 1) as usize;
                    let m = cal_mask.get(target_row, target_col);
                    cal_mask.set(target_row, target_col, m | SHADOW_BIT);
                }
                break;
            } else {
                record_thresh = 0.0;
            }

            base_h += i_step;
        }
    }

    debug!(cldpix, "dilating matched clouds");
    dilate_bit(&cal_mask, pixel_mask, cldpix, CLOUD_BIT);
    debug!(sdpix, "dilating matched shadows");
    dilate_bit(&cal_mask, pixel_mask, sdpix, SHADOW_BIT);

    Ok(())
}
