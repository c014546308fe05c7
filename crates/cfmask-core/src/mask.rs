//! Pixel-mask bit layout, confidence values, and the final flatten pass.

use rayon::prelude::*;
use serde::Serialize;

use crate::raster::Raster;

// ── Pixel bitmask (accumulated through the potential-mask passes) ────────────

pub const WATER_BIT: u8 = 0x01;
pub const SHADOW_BIT: u8 = 0x02;
pub const SNOW_BIT: u8 = 0x04;
pub const CLOUD_BIT: u8 = 0x08;
pub const FILL_BIT: u8 = 0x10;

// ── Clear mask (working state, potential-mask only) ──────────────────────────

pub const CLEAR_BIT: u8 = 0x01;
pub const CLEAR_WATER_BIT: u8 = 0x02;
pub const CLEAR_LAND_BIT: u8 = 0x04;
pub const CLEAR_FILL_BIT: u8 = 0x08;

// ── Categorical output values ────────────────────────────────────────────────

pub const CLEAR_VALUE: u8 = 0;
pub const WATER_VALUE: u8 = 1;
pub const SHADOW_VALUE: u8 = 2;
pub const SNOW_VALUE: u8 = 3;
pub const CLOUD_VALUE: u8 = 4;
pub const FILL_VALUE: u8 = 255;

// ── Cloud confidence values ──────────────────────────────────────────────────

pub const CONFIDENCE_NONE: u8 = 0;
pub const CONFIDENCE_LOW: u8 = 1;
pub const CONFIDENCE_MEDIUM: u8 = 2;
pub const CONFIDENCE_HIGH: u8 = 3;

/// Per-category coverage of the categorical mask, as percentages of the
/// non-fill pixel count.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Coverage {
    pub data_count: usize,
    pub clear_percent: f32,
    pub cloud_percent: f32,
    pub cloud_shadow_percent: f32,
    pub water_percent: f32,
    pub snow_percent: f32,
}

#[derive(Default)]
struct CategoryCounts {
    clear: usize,
    cloud: usize,
    shadow: usize,
    snow: usize,
    water: usize,
}

impl CategoryCounts {
    fn merge(mut self, other: Self) -> Self {
        self.clear += other.clear;
        self.cloud += other.cloud;
        self.shadow += other.shadow;
        self.snow += other.snow;
        self.water += other.water;
        self
    }
}

/// Reduce the accumulated bitmask to categorical values in place, by the
/// priority FILL > CLOUD > SHADOW > SNOW > WATER > CLEAR, and tally coverage.
///
/// The confidence mask gets its fill sentinel applied here so it is correct
/// on every path, including the degenerate-scene fast paths.
pub fn flatten(pixel_mask: &mut Raster<u8>, conf_mask: &mut Raster<u8>) -> Coverage {
    let counts = pixel_mask
        .data
        .par_chunks_mut(1024)
        .zip(conf_mask.data.par_chunks_mut(1024))
        .map(|(mask_chunk, conf_chunk)| {
            let mut counts = CategoryCounts::default();
            for (mask, conf) in mask_chunk.iter_mut().zip(conf_chunk.iter_mut()) {
                if *mask & FILL_BIT != 0 {
                    *mask = FILL_VALUE;
                    *conf = FILL_VALUE;
                } else if *mask & CLOUD_BIT != 0 {
                    *mask = CLOUD_VALUE;
                    counts.cloud += 1;
                } else if *mask & SHADOW_BIT != 0 {
                    *mask = SHADOW_VALUE;
                    counts.shadow += 1;
                } else if *mask & SNOW_BIT != 0 {
                    *mask = SNOW_VALUE;
                    counts.snow += 1;
                } else if *mask & WATER_BIT != 0 {
                    *mask = WATER_VALUE;
                    counts.water += 1;
                } else {
                    *mask = CLEAR_VALUE;
                    counts.clear += 1;
                }
            }
            counts
        })
        .reduce(CategoryCounts::default, CategoryCounts::merge);

    let data_count = counts.clear + counts.cloud + counts.shadow + counts.snow + counts.water;
    let pct = |n: usize| {
        if data_count == 0 {
            0.0
        } else {
            100.0 * n as f32 / data_count as f32
        }
    };

    Coverage {
        data_count,
        clear_percent: pct(counts.clear),
        cloud_percent: pct(counts.cloud),
        cloud_shadow_percent: pct(counts.shadow),
        water_percent: pct(counts.water),
        snow_percent: pct(counts.snow),
    }
}
