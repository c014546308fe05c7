//! Per-pixel spectral tests. All thresholds are in the native scaled units:
//! reflectance x 10000, brightness temperature in degC x 100.

use crate::MINSIGMA;

/// Normalized difference vegetation index; 0.01 when the denominator is zero.
#[inline]
pub fn ndvi(red: i16, nir: i16) -> f32 {
    let sum = i32::from(nir) + i32::from(red);
    if sum != 0 {
        (i32::from(nir) - i32::from(red)) as f32 / sum as f32
    } else {
        0.01
    }
}

/// Normalized difference snow index; 0.01 when the denominator is zero.
#[inline]
pub fn ndsi(green: i16, swir1: i16) -> f32 {
    let sum = i32::from(green) + i32::from(swir1);
    if sum != 0 {
        (i32::from(green) - i32::from(swir1)) as f32 / sum as f32
    } else {
        0.01
    }
}

/// Basic cloud test: mid-range indices, bright SWIR2, and (when thermal is
/// available) a brightness temperature below 27 C.
#[inline]
pub fn basic_cloud_test(swir2: i16, thermal: Option<i16>, ndvi: f32, ndsi: f32) -> bool {
    let spectral = (ndsi - 0.8) < MINSIGMA && (ndvi - 0.8) < MINSIGMA && swir2 > 300;
    match thermal {
        Some(bt) if spectral => bt < 2700,
        _ => spectral,
    }
}

/// Snow test; catches snow under thin or icy clouds.
#[inline]
pub fn snow_test(green: i16, nir: i16, thermal: Option<i16>, ndsi: f32) -> bool {
    let spectral = (ndsi - 0.15) > MINSIGMA && nir > 1100 && green > 1000;
    match thermal {
        Some(bt) if spectral => bt < 1000,
        _ => spectral,
    }
}

/// Water test; holds up over thin cloud.
#[inline]
pub fn water_test(nir: i16, ndvi: f32) -> bool {
    ((ndvi - 0.01) < MINSIGMA && nir < 1100)
        || ((ndvi - 0.1) < MINSIGMA && ndvi > MINSIGMA && nir < 500)
}

/// Whiteness of the visible bands: mean absolute deviation over the mean.
/// A zero mean reports 100.0, which removes the pixel from cloud candidacy.
#[inline]
pub fn whiteness(blue: i16, green: i16, red: i16) -> f32 {
    let mean = (i32::from(blue) + i32::from(green) + i32::from(red)) as f32 / 3.0;
    if mean == 0.0 {
        return 100.0;
    }
    ((f32::from(blue) - mean).abs() + (f32::from(green) - mean).abs()
        + (f32::from(red) - mean).abs())
        / mean
}

/// Haze-optimized transform test: hazy or bright pixels keep the cloud bit.
#[inline]
pub fn hot_test(blue: i16, red: i16) -> bool {
    f32::from(blue) - 0.5 * f32::from(red) - 800.0 > MINSIGMA
}

/// NIR/SWIR1 ratio test; a zero SWIR1 fails the test.
#[inline]
pub fn ratio_test(nir: i16, swir1: i16) -> bool {
    swir1 != 0 && f32::from(nir) / f32::from(swir1) - 0.75 > MINSIGMA
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn indices_guard_zero_denominators() {
        assert_relative_eq!(ndvi(0, 0), 0.01);
        assert_relative_eq!(ndsi(0, 0), 0.01);
        assert_relative_eq!(ndvi(500, 4000), (4000.0 - 500.0) / 4500.0);
    }

    #[test]
    fn basic_cloud_needs_thermal_conjunction_only_when_present() {
        let (nd_v, nd_s) = (0.2, 0.2);
        assert!(basic_cloud_test(5000, None, nd_v, nd_s));
        assert!(basic_cloud_test(5000, Some(-2500), nd_v, nd_s));
        assert!(!basic_cloud_test(5000, Some(2800), nd_v, nd_s));
        assert!(!basic_cloud_test(200, None, nd_v, nd_s));
        assert!(!basic_cloud_test(5000, None, 0.9, nd_s));
    }

    #[test]
    fn snow_requires_bright_green_and_nir() {
        assert!(snow_test(9000, 5000, Some(500), 0.8));
        assert!(!snow_test(9000, 5000, Some(1500), 0.8));
        assert!(!snow_test(900, 5000, None, 0.8));
        assert!(!snow_test(9000, 900, None, 0.8));
        assert!(!snow_test(9000, 5000, None, 0.1));
    }

    #[test]
    fn water_test_branches() {
        // Low NDVI, moderately dark NIR.
        assert!(water_test(1000, 0.005));
        // Slightly vegetated but very dark NIR.
        assert!(water_test(400, 0.05));
        assert!(!water_test(1000, 0.05));
        assert!(!water_test(2000, 0.005));
    }

    #[test]
    fn whiteness_is_zero_for_flat_spectra() {
        assert_relative_eq!(whiteness(5000, 5000, 5000), 0.0);
        assert!(whiteness(1000, 5000, 9000) > 0.7);
        assert_relative_eq!(whiteness(0, 0, 0), 100.0);
    }

    #[test]
    fn hot_and_ratio_tests() {
        assert!(hot_test(8000, 8000));
        assert!(!hot_test(500, 500));
        assert!(ratio_test(8000, 5000));
        assert!(!ratio_test(3000, 5000));
        assert!(!ratio_test(3000, 0));
    }
}
