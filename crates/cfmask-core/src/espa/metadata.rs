//! ESPA XML metadata: parsing the scene description the core consumes, and
//! appending the output band records after a successful run.

use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::mask::FILL_VALUE;
use crate::scene::{day_of_year, BandCal, BandId, Satellite, SceneMeta, Sensor, BAND_COUNT, REFLECTANCE_BANDS};
use crate::Coverage;
use crate::{Error, FILL_PIXEL};

/// One `<band>` record from the metadata file.
#[derive(Debug, Clone, Default)]
pub struct BandMeta {
    pub name: String,
    pub product: String,
    pub short_name: String,
    pub file_name: String,
    pub nlines: usize,
    pub nsamps: usize,
    pub fill_value: i16,
    pub saturate_value: Option<i16>,
    pub pixel_size: (f64, f64),
    pub scale_factor: Option<f64>,
    pub rad_gain: Option<f64>,
    pub rad_bias: Option<f64>,
    pub refl_gain: Option<f64>,
    pub refl_bias: Option<f64>,
    pub k1_const: Option<f64>,
    pub k2_const: Option<f64>,
}

/// Scene-global metadata.
#[derive(Debug, Clone, Default)]
pub struct GlobalMeta {
    pub satellite: String,
    pub instrument: String,
    pub acquisition_date: String,
    pub scene_center_time: String,
    pub solar_zenith: f64,
    pub solar_azimuth: f64,
    pub ul_corner: Option<(f64, f64)>,
    pub lr_corner: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct EspaMetadata {
    pub global: GlobalMeta,
    pub bands: Vec<BandMeta>,
}

fn attr_string(attr: &Attribute) -> Result<String, Error> {
    attr.unescape_value()
        .map(|v| v.into_owned())
        .map_err(|e| Error::Xml(format!("bad attribute value: {e}")))
}

fn parse_num<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Xml(format!("unparseable {what}: {value}")))
}

pub fn parse_metadata(path: &Path) -> Result<EspaMetadata, Error> {
    let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_metadata_str(&content)
}

/// Event-driven parse of the scene XML. Unknown elements are ignored so
/// producer additions do not break ingest.
pub fn parse_metadata_str(content: &str) -> Result<EspaMetadata, Error> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut metadata = EspaMetadata::default();
    let mut buf = Vec::new();
    let mut band: Option<BandMeta> = None;
    let mut text_target = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "band" => {
                        let mut record = BandMeta {
                            fill_value: FILL_PIXEL,
                            pixel_size: (30.0, 30.0),
                            ..BandMeta::default()
                        };
                        for attr in e.attributes() {
                            let attr =
                                attr.map_err(|e| Error::Xml(format!("bad band attribute: {e}")))?;
                            let value = attr_string(&attr)?;
                            match attr.key.as_ref() {
                                b"name" => record.name = value,
                                b"product" => record.product = value,
                                b"nlines" => record.nlines = parse_num(&value, "nlines")?,
                                b"nsamps" => record.nsamps = parse_num(&value, "nsamps")?,
                                b"fill_value" => {
                                    record.fill_value = parse_num(&value, "fill_value")?
                                }
                                b"saturate_value" => {
                                    record.saturate_value =
                                        Some(parse_num(&value, "saturate_value")?)
                                }
                                b"scale_factor" => {
                                    record.scale_factor = Some(parse_num(&value, "scale_factor")?)
                                }
                                _ => {}
                            }
                        }
                        band = Some(record);
                    }
                    "pixel_size" => {
                        if let Some(record) = band.as_mut() {
                            for attr in e.attributes() {
                                let attr = attr
                                    .map_err(|e| Error::Xml(format!("bad pixel_size: {e}")))?;
                                let value = attr_string(&attr)?;
                                match attr.key.as_ref() {
                                    b"x" => record.pixel_size.0 = parse_num(&value, "pixel size x")?,
                                    b"y" => record.pixel_size.1 = parse_num(&value, "pixel size y")?,
                                    _ => {}
                                }
                            }
                        }
                    }
                    "radiance" | "toa_reflectance" | "thermal_const" => {
                        if let Some(record) = band.as_mut() {
                            for attr in e.attributes() {
                                let attr =
                                    attr.map_err(|e| Error::Xml(format!("bad {name}: {e}")))?;
                                let value: f64 = parse_num(&attr_string(&attr)?, &name)?;
                                match (name.as_str(), attr.key.as_ref()) {
                                    ("radiance", b"gain") => record.rad_gain = Some(value),
                                    ("radiance", b"bias") => record.rad_bias = Some(value),
                                    ("toa_reflectance", b"gain") => record.refl_gain = Some(value),
                                    ("toa_reflectance", b"bias") => record.refl_bias = Some(value),
                                    ("thermal_const", b"k1") => record.k1_const = Some(value),
                                    ("thermal_const", b"k2") => record.k2_const = Some(value),
                                    _ => {}
                                }
                            }
                        }
                    }
                    "solar_angles" => {
                        for attr in e.attributes() {
                            let attr =
                                attr.map_err(|e| Error::Xml(format!("bad solar_angles: {e}")))?;
                            let value = attr_string(&attr)?;
                            match attr.key.as_ref() {
                                b"zenith" => {
                                    metadata.global.solar_zenith =
                                        parse_num(&value, "solar zenith")?
                                }
                                b"azimuth" => {
                                    metadata.global.solar_azimuth =
                                        parse_num(&value, "solar azimuth")?
                                }
                                _ => {}
                            }
                        }
                    }
                    "ul_corner" | "lr_corner" => {
                        let mut lat = None;
                        let mut lon = None;
                        for attr in e.attributes() {
                            let attr =
                                attr.map_err(|e| Error::Xml(format!("bad corner: {e}")))?;
                            let value = attr_string(&attr)?;
                            match attr.key.as_ref() {
                                b"latitude" => lat = Some(parse_num(&value, "latitude")?),
                                b"longitude" => lon = Some(parse_num(&value, "longitude")?),
                                _ => {}
                            }
                        }
                        if let (Some(lat), Some(lon)) = (lat, lon) {
                            if name == "ul_corner" {
                                metadata.global.ul_corner = Some((lat, lon));
                            } else {
                                metadata.global.lr_corner = Some((lat, lon));
                            }
                        }
                    }
                    "satellite" | "instrument" | "acquisition_date" | "scene_center_time"
                    | "short_name" | "file_name" => {
                        text_target = name;
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| Error::Xml(format!("bad text: {e}")))?
                    .into_owned();
                match text_target.as_str() {
                    "satellite" => metadata.global.satellite = text,
                    "instrument" => metadata.global.instrument = text,
                    "acquisition_date" => metadata.global.acquisition_date = text,
                    "scene_center_time" => metadata.global.scene_center_time = text,
                    "short_name" => {
                        if let Some(record) = band.as_mut() {
                            record.short_name = text;
                        }
                    }
                    "file_name" => {
                        if let Some(record) = band.as_mut() {
                            record.file_name = text;
                        }
                    }
                    _ => {}
                }
                text_target.clear();
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"band" {
                    if let Some(record) = band.take() {
                        metadata.bands.push(record);
                    }
                }
                text_target.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(format!("XML parse error: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(metadata)
}

/// Band file paths resolved from the metadata, relative to the XML location.
#[derive(Debug, Clone)]
pub struct BandFiles {
    /// One path per entry of [`REFLECTANCE_BANDS`].
    pub reflectance: [PathBuf; 6],
    pub cirrus: Option<PathBuf>,
    pub thermal: Option<PathBuf>,
}

/// Everything ingest needs: validated scene metadata, band paths, and the
/// reference short name the output records derive theirs from.
#[derive(Debug, Clone)]
pub struct SceneInputs {
    pub meta: SceneMeta,
    pub files: BandFiles,
    pub ref_short_name: String,
}

/// Resolve the parsed metadata into typed scene inputs, validating the
/// configuration before any image buffer is allocated.
pub fn resolve_scene(
    metadata: &EspaMetadata,
    xml_path: &Path,
    use_thermal: bool,
    use_cirrus: bool,
) -> Result<SceneInputs, Error> {
    let global = &metadata.global;
    let satellite = Satellite::from_name(&global.satellite)?;
    let sensor = Sensor::from_name(&global.instrument)?;

    if global.solar_zenith < -90.0 || global.solar_zenith > 90.0 {
        return Err(Error::Config(format!(
            "solar zenith angle out of range: {}",
            global.solar_zenith
        )));
    }
    if global.solar_azimuth < -360.0 || global.solar_azimuth > 360.0 {
        return Err(Error::Config(format!(
            "solar azimuth angle out of range: {}",
            global.solar_azimuth
        )));
    }
    if use_cirrus && !sensor.has_cirrus() {
        return Err(Error::Config(format!(
            "{} has no cirrus band",
            global.instrument
        )));
    }
    if use_thermal && !sensor.has_thermal() {
        return Err(Error::Config(format!(
            "{} has no thermal band; rerun without thermal processing",
            global.instrument
        )));
    }

    let base_dir = xml_path.parent().unwrap_or_else(|| Path::new("."));
    let find_l1 = |name: &str| {
        metadata
            .bands
            .iter()
            .find(|b| b.name == name && b.product.starts_with("L1"))
    };
    let find_toa = |name: &str, product: &str| {
        metadata
            .bands
            .iter()
            .find(|b| b.name == name && b.product == product)
    };

    let mut cal = [BandCal::default(); BAND_COUNT];
    let mut k1 = 0.0;
    let mut k2 = 0.0;
    let mut thermal_scale = 1.0;
    let mut reflectance_files: [Option<PathBuf>; 6] = Default::default();
    let mut cirrus_file = None;
    let mut thermal_file = None;
    let mut reference: Option<&BandMeta> = None;

    // Level-1 records carry the radiometric calibration.
    let mut wanted: Vec<BandId> = REFLECTANCE_BANDS.to_vec();
    if use_thermal {
        wanted.push(BandId::Thermal);
    }
    for band in &wanted {
        let Some(l1_name) = sensor.l1_band_name(*band) else { continue };
        let Some(record) = find_l1(l1_name) else { continue };
        let slot = &mut cal[*band as usize];
        match (sensor, *band) {
            (Sensor::Oli | Sensor::OliTirs, BandId::Thermal) => {
                slot.gain = record.rad_gain.unwrap_or(slot.gain);
                slot.bias = record.rad_bias.unwrap_or(slot.bias);
                k1 = record.k1_const.unwrap_or(0.0);
                k2 = record.k2_const.unwrap_or(0.0);
            }
            (Sensor::Oli | Sensor::OliTirs, _) => {
                slot.gain = record.refl_gain.unwrap_or(slot.gain);
                slot.bias = record.refl_bias.unwrap_or(slot.bias);
            }
            _ => {
                slot.gain = record.rad_gain.unwrap_or(slot.gain);
                slot.bias = record.rad_bias.unwrap_or(slot.bias);
            }
        }
    }

    // TOA records carry the actual rasters and saturation references.
    for (i, band) in REFLECTANCE_BANDS.iter().enumerate() {
        let toa_name = sensor.toa_band_name(*band).ok_or_else(|| {
            Error::Config(format!("{} lacks a required reflectance band", global.instrument))
        })?;
        let record = find_toa(toa_name, "toa_refl").ok_or_else(|| {
            Error::Config(format!("missing {toa_name} (toa_refl) band in metadata"))
        })?;
        if let Some(saturate) = record.saturate_value {
            cal[*band as usize].saturate_ref = saturate;
        }
        reflectance_files[i] = Some(base_dir.join(&record.file_name));
        if *band == BandId::Blue {
            reference = Some(record);
        }
    }

    if use_cirrus {
        let toa_name = sensor.toa_band_name(BandId::Cirrus).ok_or_else(|| {
            Error::Config(format!("{} has no cirrus band", global.instrument))
        })?;
        let record = find_toa(toa_name, "toa_refl").ok_or_else(|| {
            Error::Config(format!("missing {toa_name} (toa_refl) band in metadata"))
        })?;
        cirrus_file = Some(base_dir.join(&record.file_name));
    }

    if use_thermal {
        let bt_name = sensor.toa_band_name(BandId::Thermal).ok_or_else(|| {
            Error::Config(format!("{} has no thermal band", global.instrument))
        })?;
        let record = find_toa(bt_name, "toa_bt").ok_or_else(|| {
            Error::Config(format!("missing {bt_name} (toa_bt) band in metadata"))
        })?;
        if let Some(saturate) = record.saturate_value {
            cal[BandId::Thermal as usize].saturate_ref = saturate;
        }
        thermal_scale = record.scale_factor.ok_or_else(|| {
            Error::Config(format!("missing scale_factor on {bt_name}"))
        })?;
        thermal_file = Some(base_dir.join(&record.file_name));
    }

    let reference = reference.ok_or_else(|| {
        Error::Config("no reference reflectance band in metadata".into())
    })?;

    let date = &global.acquisition_date;
    let mut parts = date.splitn(3, '-');
    let (year, month, day) = match (parts.next(), parts.next(), parts.next()) {
        (Some(y), Some(m), Some(d)) => (
            parse_num::<i32>(y, "acquisition year")?,
            parse_num::<u32>(m, "acquisition month")?,
            parse_num::<u32>(d, "acquisition day")?,
        ),
        _ => return Err(Error::Config(format!("invalid acquisition date: {date}"))),
    };

    let meta = SceneMeta {
        satellite,
        sensor,
        rows: reference.nlines,
        cols: reference.nsamps,
        sun_zenith: global.solar_zenith,
        sun_azimuth: global.solar_azimuth,
        fill: reference.fill_value,
        pixel_size: reference.pixel_size.0,
        day_of_year: day_of_year(year, month, day)?,
        ul_corner: global.ul_corner,
        lr_corner: global.lr_corner,
        cal,
        k1,
        k2,
        thermal_scale,
    };

    let files = BandFiles {
        reflectance: match reflectance_files {
            [Some(b1), Some(b2), Some(b3), Some(b4), Some(b5), Some(b6)] => {
                [b1, b2, b3, b4, b5, b6]
            }
            _ => return Err(Error::Config("unresolved reflectance band path".into())),
        },
        cirrus: cirrus_file,
        thermal: thermal_file,
    };

    Ok(SceneInputs {
        meta,
        files,
        ref_short_name: reference.short_name.clone(),
    })
}

// ── Output band records ──────────────────────────────────────────────────────

pub struct OutputBand<'a> {
    pub name: &'a str,
    pub long_name: &'a str,
    pub file_name: &'a str,
    /// (value, description) pairs for the class table.
    pub class_values: &'a [(u8, &'a str)],
    /// Present only on the categorical band.
    pub coverage: Option<&'a Coverage>,
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event) -> Result<(), Error> {
    writer
        .write_event(event)
        .map_err(|e| Error::Xml(format!("writing output band record: {e}")))
}

fn emit_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    value: &str,
) -> Result<(), Error> {
    emit(writer, Event::Start(BytesStart::new(name)))?;
    emit(writer, Event::Text(BytesText::new(value)))?;
    emit(writer, Event::End(BytesEnd::new(name)))
}

fn band_element(
    writer: &mut Writer<Vec<u8>>,
    meta: &SceneMeta,
    short_prefix: &str,
    production_date: &str,
    band: &OutputBand,
) -> Result<(), Error> {
    let mut element = BytesStart::new("band");
    element.push_attribute(("product", "cfmask"));
    element.push_attribute(("source", "toa_refl"));
    element.push_attribute(("name", band.name));
    element.push_attribute(("category", "qa"));
    element.push_attribute(("data_type", "UINT8"));
    element.push_attribute(("nlines", meta.rows.to_string().as_str()));
    element.push_attribute(("nsamps", meta.cols.to_string().as_str()));
    element.push_attribute(("fill_value", FILL_VALUE.to_string().as_str()));
    emit(writer, Event::Start(element))?;

    let short_name = format!("{short_prefix}CFMASK");
    emit_text_element(writer, "short_name", &short_name)?;
    emit_text_element(writer, "long_name", band.long_name)?;
    emit_text_element(writer, "file_name", band.file_name)?;

    let mut pixel_size = BytesStart::new("pixel_size");
    pixel_size.push_attribute(("x", format!("{}", meta.pixel_size).as_str()));
    pixel_size.push_attribute(("y", format!("{}", meta.pixel_size).as_str()));
    pixel_size.push_attribute(("units", "meters"));
    emit(writer, Event::Empty(pixel_size))?;

    let app = format!("{}_{}", crate::APP_NAME, crate::APP_VERSION);
    emit_text_element(writer, "app_version", &app)?;
    emit_text_element(writer, "production_date", production_date)?;

    emit(writer, Event::Start(BytesStart::new("class_values")))?;
    for (value, description) in band.class_values {
        let mut class = BytesStart::new("class");
        class.push_attribute(("num", value.to_string().as_str()));
        emit(writer, Event::Start(class))?;
        emit(writer, Event::Text(BytesText::new(description)))?;
        emit(writer, Event::End(BytesEnd::new("class")))?;
    }
    emit(writer, Event::End(BytesEnd::new("class_values")))?;

    if let Some(coverage) = band.coverage {
        emit(writer, Event::Start(BytesStart::new("percent_coverage")))?;
        let entries = [
            ("clear", coverage.clear_percent),
            ("cloud", coverage.cloud_percent),
            ("cloud_shadow", coverage.cloud_shadow_percent),
            ("water", coverage.water_percent),
            ("snow", coverage.snow_percent),
        ];
        for (kind, percent) in entries {
            let mut cover = BytesStart::new("cover");
            cover.push_attribute(("type", kind));
            emit(writer, Event::Start(cover))?;
            emit(writer, Event::Text(BytesText::new(&format!("{percent:.2}"))))?;
            emit(writer, Event::End(BytesEnd::new("cover")))?;
        }
        emit(writer, Event::End(BytesEnd::new("percent_coverage")))?;
    }

    emit(writer, Event::End(BytesEnd::new("band")))
}

/// Append the categorical and confidence band records to the scene XML.
pub fn append_output_bands(
    xml_path: &Path,
    meta: &SceneMeta,
    ref_short_name: &str,
    bands: &[OutputBand],
) -> Result<(), Error> {
    let production_date = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let short_prefix: String = ref_short_name.chars().take(3).collect();

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    for band in bands {
        band_element(&mut writer, meta, &short_prefix, &production_date, band)?;
    }
    let records = String::from_utf8(writer.into_inner())
        .map_err(|e| Error::Xml(format!("output band record not UTF-8: {e}")))?;

    let content = fs::read_to_string(xml_path).map_err(|e| Error::io(xml_path, e))?;
    let Some(insert_at) = content.rfind("</bands>") else {
        return Err(Error::Xml("metadata has no </bands> element".into()));
    };
    let mut updated = String::with_capacity(content.len() + records.len() + 2);
    updated.push_str(&content[..insert_at]);
    updated.push_str(&records);
    updated.push('\n');
    updated.push_str(&content[insert_at..]);
    fs::write(xml_path, updated).map_err(|e| Error::io(xml_path, e))?;
    Ok(())
}
