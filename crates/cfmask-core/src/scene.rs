//! Scene metadata: satellite/sensor variants, band calibration, and the
//! per-band saturation ceilings derived from gains, biases, and Earth-Sun
//! distance.

use crate::{Error, FILL_PIXEL};

/// Logical band roles. The numeric value indexes the per-band calibration
/// table in [`SceneMeta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandId {
    Blue = 0,
    Green = 1,
    Red = 2,
    Nir = 3,
    Swir1 = 4,
    Swir2 = 5,
    Cirrus = 6,
    Thermal = 7,
}

pub const BAND_COUNT: usize = 8;

/// The six reflectance bands every sensor carries, in calibration-table order.
pub const REFLECTANCE_BANDS: [BandId; 6] = [
    BandId::Blue,
    BandId::Green,
    BandId::Red,
    BandId::Nir,
    BandId::Swir1,
    BandId::Swir2,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satellite {
    Landsat4,
    Landsat5,
    Landsat7,
    Landsat8,
}

impl Satellite {
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "LANDSAT_4" => Ok(Self::Landsat4),
            "LANDSAT_5" => Ok(Self::Landsat5),
            "LANDSAT_7" => Ok(Self::Landsat7),
            "LANDSAT_8" => Ok(Self::Landsat8),
            other => Err(Error::Config(format!("unsupported satellite: {other}"))),
        }
    }

    /// Maximum digital number for the sensor's quantization.
    pub fn max_dn(self) -> f64 {
        match self {
            Self::Landsat8 => 65535.0,
            _ => 255.0,
        }
    }

    /// Thermal calibration constants (K1, K2). Landsat 8 carries them in the
    /// scene metadata instead.
    pub fn thermal_constants(self) -> Option<(f64, f64)> {
        match self {
            Self::Landsat4 => Some((671.62, 1284.30)),
            Self::Landsat5 => Some((607.76, 1260.56)),
            Self::Landsat7 => Some((666.09, 1282.71)),
            Self::Landsat8 => None,
        }
    }

    /// Mean exo-atmospheric solar irradiance per reflectance band. Landsat 8
    /// ceilings do not use esun.
    pub fn esun(self) -> Option<[f64; 6]> {
        match self {
            Self::Landsat4 => Some([1983.0, 1795.0, 1539.0, 1028.0, 219.8, 83.49]),
            Self::Landsat5 => Some([1983.0, 1796.0, 1536.0, 1031.0, 220.0, 83.44]),
            Self::Landsat7 => Some([1997.0, 1812.0, 1533.0, 1039.0, 230.8, 84.9]),
            Self::Landsat8 => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Tm,
    Etm,
    Oli,
    OliTirs,
}

impl Sensor {
    pub fn from_name(name: &str) -> Result<Self, Error> {
        if name == "OLI_TIRS" {
            Ok(Self::OliTirs)
        } else if name == "OLI" {
            Ok(Self::Oli)
        } else if name == "TM" {
            Ok(Self::Tm)
        } else if name.starts_with("ETM") {
            Ok(Self::Etm)
        } else {
            Err(Error::Config(format!("unsupported instrument: {name}")))
        }
    }

    pub fn has_cirrus(self) -> bool {
        matches!(self, Self::Oli | Self::OliTirs)
    }

    pub fn has_thermal(self) -> bool {
        !matches!(self, Self::Oli)
    }

    /// Level-1 band name in the scene metadata, used to locate gain/bias
    /// records. `None` when the sensor does not carry the band.
    pub fn l1_band_name(self, band: BandId) -> Option<&'static str> {
        match self {
            Self::Tm | Self::Etm => match band {
                BandId::Blue => Some("band1"),
                BandId::Green => Some("band2"),
                BandId::Red => Some("band3"),
                BandId::Nir => Some("band4"),
                BandId::Swir1 => Some("band5"),
                BandId::Swir2 => Some("band7"),
                BandId::Cirrus => None,
                BandId::Thermal => Some("band6"),
            },
            Self::Oli | Self::OliTirs => match band {
                BandId::Blue => Some("band2"),
                BandId::Green => Some("band3"),
                BandId::Red => Some("band4"),
                BandId::Nir => Some("band5"),
                BandId::Swir1 => Some("band6"),
                BandId::Swir2 => Some("band7"),
                BandId::Cirrus => Some("band9"),
                BandId::Thermal => {
                    if self == Self::OliTirs {
                        Some("band10")
                    } else {
                        None
                    }
                }
            },
        }
    }

    /// TOA product band name (`toa_bandN`, or `bt_bandN` for thermal).
    pub fn toa_band_name(self, band: BandId) -> Option<&'static str> {
        match (self, band) {
            (Self::Tm | Self::Etm, BandId::Blue) => Some("toa_band1"),
            (Self::Tm | Self::Etm, BandId::Green) => Some("toa_band2"),
            (Self::Tm | Self::Etm, BandId::Red) => Some("toa_band3"),
            (Self::Tm | Self::Etm, BandId::Nir) => Some("toa_band4"),
            (Self::Tm | Self::Etm, BandId::Swir1) => Some("toa_band5"),
            (Self::Tm | Self::Etm, BandId::Swir2) => Some("toa_band7"),
            (Self::Tm | Self::Etm, BandId::Cirrus) => None,
            (Self::Tm | Self::Etm, BandId::Thermal) => Some("bt_band6"),
            (Self::Oli | Self::OliTirs, BandId::Blue) => Some("toa_band2"),
            (Self::Oli | Self::OliTirs, BandId::Green) => Some("toa_band3"),
            (Self::Oli | Self::OliTirs, BandId::Red) => Some("toa_band4"),
            (Self::Oli | Self::OliTirs, BandId::Nir) => Some("toa_band5"),
            (Self::Oli | Self::OliTirs, BandId::Swir1) => Some("toa_band6"),
            (Self::Oli | Self::OliTirs, BandId::Swir2) => Some("toa_band7"),
            (Self::Oli | Self::OliTirs, BandId::Cirrus) => Some("toa_band9"),
            (Self::Oli, BandId::Thermal) => None,
            (Self::OliTirs, BandId::Thermal) => Some("bt_band10"),
        }
    }
}

/// Per-band radiometric calibration pulled from the Level-1 metadata.
#[derive(Debug, Clone, Copy)]
pub struct BandCal {
    pub gain: f64,
    pub bias: f64,
    /// DN the producer wrote for saturated pixels.
    pub saturate_ref: i16,
    /// Physical value a saturated DN clamps to (the saturation ceiling).
    pub saturate_max: i16,
}

impl Default for BandCal {
    fn default() -> Self {
        Self {
            gain: 1.0,
            bias: 0.0,
            saturate_ref: FILL_PIXEL,
            saturate_max: FILL_PIXEL,
        }
    }
}

/// Scene-level metadata consumed by the classifier.
#[derive(Debug, Clone)]
pub struct SceneMeta {
    pub satellite: Satellite,
    pub sensor: Sensor,
    pub rows: usize,
    pub cols: usize,
    /// Degrees, in [-90, 90].
    pub sun_zenith: f64,
    /// Degrees, in [-360, 360]. Adjusted by 180 for south-up scenes during
    /// processing; the value written back to metadata is the original.
    pub sun_azimuth: f64,
    pub fill: i16,
    /// Metres per pixel (x dimension).
    pub pixel_size: f64,
    /// 1..=366.
    pub day_of_year: u32,
    /// (lat, lon), when the producer supplied valid corners.
    pub ul_corner: Option<(f64, f64)>,
    pub lr_corner: Option<(f64, f64)>,
    /// Indexed by `BandId as usize`.
    pub cal: [BandCal; BAND_COUNT],
    /// Landsat 8 thermal constants from metadata.
    pub k1: f64,
    pub k2: f64,
    /// Thermal band scale factor (value -> Kelvin).
    pub thermal_scale: f64,
}

impl SceneMeta {
    /// True when the scene is south-up (ascending polar) and the solar
    /// azimuth must be rotated by 180 degrees for processing.
    pub fn is_south_up(&self) -> bool {
        match (self.ul_corner, self.lr_corner) {
            (Some((ul_lat, _)), Some((lr_lat, _))) => ul_lat - lr_lat < crate::MINSIGMA as f64,
            _ => false,
        }
    }

    /// Compute every band's saturation ceiling from the Level-1 gains and
    /// biases and the Earth-Sun distance for the acquisition day.
    ///
    /// `dsun` holds 366 distances in AU, indexed by day-of-year - 1.
    pub fn compute_saturation_ceilings(&mut self, dsun: &[f64]) -> Result<(), Error> {
        let doy = self.day_of_year as usize;
        if doy < 1 || doy > dsun.len() {
            return Err(Error::Config(format!("day of year {doy} out of range")));
        }
        let d = dsun[doy - 1];
        let cos_zen = (self.sun_zenith.to_radians()).cos();
        let max_dn = self.satellite.max_dn();

        for (i, band) in REFLECTANCE_BANDS.iter().enumerate() {
            let cal = &mut self.cal[*band as usize];
            let radiance = cal.gain * max_dn + cal.bias;
            let ceiling = match self.satellite.esun() {
                Some(esun) => {
                    (10000.0 * std::f64::consts::PI * radiance * d * d) / (esun[i] * cos_zen)
                }
                None => (10000.0 * radiance) / cos_zen,
            };
            cal.saturate_max = clamp_i16(ceiling.round());
        }

        if self.sensor.has_thermal() {
            let (k1, k2) = self
                .satellite
                .thermal_constants()
                .unwrap_or((self.k1, self.k2));
            let cal = &mut self.cal[BandId::Thermal as usize];
            let radiance = cal.gain * max_dn + cal.bias;
            let kelvin = k2 / ((k1 / radiance) + 1.0).ln();
            cal.saturate_max = clamp_i16((100.0 * (kelvin - 273.15)).round());
        }

        Ok(())
    }
}

fn clamp_i16(v: f64) -> i16 {
    v.max(i16::MIN as f64).min(i16::MAX as f64) as i16
}

/// Convert a calendar date to day-of-year, accounting for leap years.
pub fn day_of_year(year: i32, month: u32, day: u32) -> Result<u32, Error> {
    const DAYS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    if month < 1 || month > 12 {
        return Err(Error::Config(format!("invalid month: {month}")));
    }
    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    let month_days = if month == 2 && leap { 29 } else { DAYS[(month - 1) as usize] };
    if day < 1 || day > month_days {
        return Err(Error::Config(format!("invalid day of month: {day}")));
    }
    let mut doy = day;
    for m in 0..(month - 1) as usize {
        doy += DAYS[m];
        if m == 1 && leap {
            doy += 1;
        }
    }
    Ok(doy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l7_meta() -> SceneMeta {
        let mut cal = [BandCal::default(); BAND_COUNT];
        // Representative ETM+ band-1 gain/bias (W/m^2/sr/um per DN).
        cal[BandId::Blue as usize] = BandCal { gain: 0.778740, bias: -6.98, saturate_ref: 255, saturate_max: FILL_PIXEL };
        cal[BandId::Thermal as usize] = BandCal { gain: 0.067087, bias: -0.07, saturate_ref: 255, saturate_max: FILL_PIXEL };
        SceneMeta {
            satellite: Satellite::Landsat7,
            sensor: Sensor::Etm,
            rows: 4,
            cols: 4,
            sun_zenith: 30.0,
            sun_azimuth: 135.0,
            fill: FILL_PIXEL,
            pixel_size: 30.0,
            day_of_year: 180,
            ul_corner: None,
            lr_corner: None,
            cal,
            k1: 0.0,
            k2: 0.0,
            thermal_scale: 0.1,
        }
    }

    #[test]
    fn day_of_year_handles_leap_years() {
        assert_eq!(day_of_year(2013, 1, 1).unwrap(), 1);
        assert_eq!(day_of_year(2013, 12, 31).unwrap(), 365);
        assert_eq!(day_of_year(2012, 3, 1).unwrap(), 61);
        assert_eq!(day_of_year(2012, 12, 31).unwrap(), 366);
        assert!(day_of_year(2013, 2, 29).is_err());
    }

    #[test]
    fn etm_reflectance_ceiling_matches_formula() {
        let mut meta = l7_meta();
        let dsun = vec![1.0f64; 366];
        meta.compute_saturation_ceilings(&dsun).unwrap();

        let radiance = 0.778740 * 255.0 - 6.98;
        let expected = (10000.0 * std::f64::consts::PI * radiance)
            / (1997.0 * (30.0f64.to_radians()).cos());
        assert_eq!(
            meta.cal[BandId::Blue as usize].saturate_max,
            expected.round() as i16
        );
    }

    #[test]
    fn thermal_ceiling_is_in_scaled_celsius() {
        let mut meta = l7_meta();
        let dsun = vec![1.0f64; 366];
        meta.compute_saturation_ceilings(&dsun).unwrap();

        let radiance: f64 = 0.067087 * 255.0 - 0.07;
        let kelvin = 1282.71 / ((666.09 / radiance) + 1.0).ln();
        let expected = (100.0 * (kelvin - 273.15)).round() as i16;
        assert_eq!(meta.cal[BandId::Thermal as usize].saturate_max, expected);
    }

    #[test]
    fn landsat8_ceiling_skips_esun() {
        let mut meta = l7_meta();
        meta.satellite = Satellite::Landsat8;
        meta.sensor = Sensor::OliTirs;
        meta.cal[BandId::Blue as usize].gain = 2.0e-5;
        meta.cal[BandId::Blue as usize].bias = -0.1;
        meta.k1 = 774.89;
        meta.k2 = 1321.08;
        meta.cal[BandId::Thermal as usize].gain = 3.342e-4;
        meta.cal[BandId::Thermal as usize].bias = 0.1;
        let dsun = vec![1.0f64; 366];
        meta.compute_saturation_ceilings(&dsun).unwrap();

        let radiance = 2.0e-5 * 65535.0 - 0.1;
        let expected = (10000.0 * radiance / (30.0f64.to_radians()).cos()).round() as i16;
        assert_eq!(meta.cal[BandId::Blue as usize].saturate_max, expected);
    }

    #[test]
    fn sensor_band_roles_resolve_names() {
        assert_eq!(Sensor::Tm.l1_band_name(BandId::Swir2), Some("band7"));
        assert_eq!(Sensor::Tm.toa_band_name(BandId::Thermal), Some("bt_band6"));
        assert_eq!(Sensor::Tm.l1_band_name(BandId::Cirrus), None);
        assert_eq!(Sensor::OliTirs.toa_band_name(BandId::Cirrus), Some("toa_band9"));
        assert_eq!(Sensor::Oli.toa_band_name(BandId::Thermal), None);
        assert!(Sensor::from_name("ETM+").is_ok());
        assert!(Sensor::from_name("MSS").is_err());
    }

    #[test]
    fn south_up_requires_both_corners() {
        let mut meta = l7_meta();
        assert!(!meta.is_south_up());
        meta.ul_corner = Some((45.0, -120.0));
        meta.lr_corner = Some((43.0, -118.0));
        assert!(!meta.is_south_up());
        meta.lr_corner = Some((45.0, -118.0));
        assert!(meta.is_south_up());
    }
}
