/// Fmask identification of cloud, cloud shadow, snow, water, and clear
/// pixels in a Landsat scene from TOA reflectance and brightness
/// temperature.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cfmask_core::{run, CfmaskConfig};

#[derive(Parser, Debug)]
#[command(
    name = "cfmask",
    version,
    about = "Cloud/shadow/snow/water mask for Landsat TOA scenes"
)]
struct Args {
    /// Input XML file listing the TOA reflectance and brightness
    /// temperature bands.
    #[arg(long)]
    xml: PathBuf,

    /// Cloud probability threshold added to the dynamic percentile.
    #[arg(long = "prob", default_value_t = 22.5)]
    cloud_probability: f32,

    /// Cloud pixel buffer for image dilate.
    #[arg(long, default_value_t = 3)]
    cldpix: usize,

    /// Shadow pixel buffer for image dilate.
    #[arg(long, default_value_t = 3)]
    sdpix: usize,

    /// Use cirrus data in cloud detection (OLI only).
    #[arg(long = "with-cirrus")]
    with_cirrus: bool,

    /// Don't use thermal data during cloud detection and shadow height
    /// determination.
    #[arg(long = "without-thermal")]
    without_thermal: bool,

    /// Write a JSON run summary (coverage, output paths) to this file.
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Display intermediate diagnostics.
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("installing the log subscriber")?;

    let mut config = CfmaskConfig::new(&args.xml);
    config.cloud_prob_threshold = args.cloud_probability;
    config.cldpix = args.cldpix;
    config.sdpix = args.sdpix;
    config.use_cirrus = args.with_cirrus;
    config.use_thermal = !args.without_thermal;

    let summary = run(&config)?;

    if let Some(path) = &args.summary_json {
        let json = serde_json::to_string_pretty(&summary)
            .context("serializing the run summary")?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }

    println!("{}", summary.mask_path.display());
    println!("{}", summary.conf_path.display());
    Ok(())
}
