#![warn(clippy::all)]

use std::{
    path::PathBuf,
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use clap::{value_t, App, Arg};
use ground_algorithms::{
    detector::GroundDetector,
    params::{GroundDetectionParameters, ProcessingStrategy, Threshold},
    progress::{ProgressHook, ProgressSnapshot},
};
use ground_core::source::InMemoryPointSource;
use ground_tools::xyz::{read_positions_from_file, write_classified_to_file};
use log::info;

struct Args {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub overrides: Option<String>,
    pub slope: Option<Threshold>,
    pub height: Option<Threshold>,
    pub max_structure_size: Option<f64>,
    pub strategy: Option<ProcessingStrategy>,
    pub workers: Option<usize>,
    pub densify: Option<usize>,
    pub precision: usize,
}

fn get_args() -> Result<Args> {
    let matches = App::new("ground detect")
        .version("0.1")
        .about("Classifies the points of an XYZ point cloud into ground and non-ground")
        .arg(
            Arg::with_name("INPUT")
                .short("i")
                .long("input")
                .takes_value(true)
                .value_name("INPUT")
                .help("Input XYZ file")
                .required(true),
        )
        .arg(
            Arg::with_name("OUTPUT")
                .short("o")
                .long("output")
                .takes_value(true)
                .value_name("OUTPUT")
                .help("Output file, one 'x y z class' line per point")
                .required(true),
        )
        .arg(
            Arg::with_name("PARAMS")
                .short("p")
                .long("params")
                .takes_value(true)
                .value_name("PARAMS")
                .help("Parameter string 'slope height max_structure_size point_density strategy multithread'"),
        )
        .arg(
            Arg::with_name("SLOPE")
                .long("slope")
                .takes_value(true)
                .help("Slope threshold in degrees, or 'auto'"),
        )
        .arg(
            Arg::with_name("HEIGHT")
                .long("height")
                .takes_value(true)
                .help("Height threshold, or 'auto'"),
        )
        .arg(
            Arg::with_name("STRUCTURE_SIZE")
                .long("structure-size")
                .takes_value(true)
                .help("Edge length of the largest non-ground structure"),
        )
        .arg(
            Arg::with_name("STRATEGY")
                .long("strategy")
                .takes_value(true)
                .possible_values(&["cpu", "any", "non-display", "0", "1", "2"])
                .help("Where the per-point test runs"),
        )
        .arg(
            Arg::with_name("WORKERS")
                .short("j")
                .long("workers")
                .takes_value(true)
                .help("Number of worker threads that classify tiles"),
        )
        .arg(
            Arg::with_name("DENSIFY")
                .long("densify")
                .takes_value(true)
                .value_name("ITERATIONS")
                .help("Densify the ground surface for up to this many iterations before classifying"),
        )
        .arg(
            Arg::with_name("PRECISION")
                .long("precision")
                .takes_value(true)
                .default_value("3")
                .help("Decimal places of the written coordinates"),
        )
        .get_matches();

    let threshold = |name: &str| -> Result<Option<Threshold>> {
        matches
            .value_of(name)
            .map(|value| value.parse::<Threshold>())
            .transpose()
            .map_err(|why| anyhow!("Invalid value for {}: {}", name, why))
    };

    Ok(Args {
        input_file: PathBuf::from(matches.value_of("INPUT").ok_or_else(|| anyhow!("Missing input"))?),
        output_file: PathBuf::from(matches.value_of("OUTPUT").ok_or_else(|| anyhow!("Missing output"))?),
        overrides: matches.value_of("PARAMS").map(str::to_owned),
        slope: threshold("SLOPE")?,
        height: threshold("HEIGHT")?,
        max_structure_size: matches
            .value_of("STRUCTURE_SIZE")
            .map(|_| value_t!(matches, "STRUCTURE_SIZE", f64))
            .transpose()?,
        strategy: matches
            .value_of("STRATEGY")
            .map(|value| value.parse::<ProcessingStrategy>())
            .transpose()?,
        workers: matches
            .value_of("WORKERS")
            .map(|_| value_t!(matches, "WORKERS", usize))
            .transpose()?,
        densify: matches
            .value_of("DENSIFY")
            .map(|_| value_t!(matches, "DENSIFY", usize))
            .transpose()?,
        precision: value_t!(matches, "PRECISION", usize)?,
    })
}

fn build_params(args: &Args) -> GroundDetectionParameters {
    let mut params = GroundDetectionParameters::default();
    if let Some(overrides) = &args.overrides {
        params = params.with_override_string(overrides);
    }
    if let Some(slope) = args.slope {
        params = params.with_slope_threshold(slope);
    }
    if let Some(height) = args.height {
        params = params.with_height_threshold(height);
    }
    if let Some(size) = args.max_structure_size {
        params = params.with_max_structure_size(size);
    }
    if let Some(strategy) = args.strategy {
        params = params.with_processing_strategy(strategy);
    }
    if let Some(iterations) = args.densify {
        params = params.with_densification(iterations);
    }
    params
}

/// Logs the progress of a run, at most once per second
struct LogProgress {
    last_report: Mutex<Instant>,
}

impl ProgressHook for LogProgress {
    fn should_continue(&self, snapshot: &ProgressSnapshot) -> bool {
        if let Ok(mut last_report) = self.last_report.lock() {
            if last_report.elapsed() >= Duration::from_secs(1) {
                *last_report = Instant::now();
                match snapshot.remaining {
                    Some(remaining) => info!(
                        "{}: {:.0}% ({:.1}s left)",
                        snapshot.phase_name,
                        snapshot.fraction * 100.0,
                        remaining.as_secs_f64()
                    ),
                    None => info!("{}: {:.0}%", snapshot.phase_name, snapshot.fraction * 100.0),
                }
            }
        }
        true
    }

    fn phase_started(&self, phase: usize, name: &str) {
        info!("[{}/4] {}", phase, name);
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = get_args()?;
    let params = build_params(&args);

    let t_start = Instant::now();
    let positions = read_positions_from_file(&args.input_file)?;
    info!(
        "Read {} points from {} in {:.2}s",
        positions.len(),
        args.input_file.display(),
        t_start.elapsed().as_secs_f64()
    );

    let mut detector = GroundDetector::new(params);
    if let Some(workers) = args.workers {
        detector = detector.with_worker_count(workers);
    }
    let mut source = InMemoryPointSource::new(positions);
    let hook = LogProgress {
        last_report: Mutex::new(Instant::now()),
    };
    let t_detect = Instant::now();
    let summary = detector.run(&mut source, &hook)?;
    info!(
        "Ground detection took {:.2}s: {} ground, {} non-ground points in {} tiles",
        t_detect.elapsed().as_secs_f64(),
        summary.ground_points,
        summary.non_ground_points,
        summary.classified_tiles + summary.skipped_tiles
    );
    if summary.densification_iterations > 0 {
        info!(
            "Densification added {} points in {} iterations",
            summary.densified_points, summary.densification_iterations
        );
    }
    if let Some(thresholds) = summary.thresholds {
        info!(
            "Thresholds: slope {:.2} deg, height {:.3}",
            thresholds.slope, thresholds.height
        );
    }

    write_classified_to_file(
        &args.output_file,
        source.positions(),
        source.classification(),
        args.precision,
    )?;
    info!("Wrote {}", args.output_file.display());
    Ok(())
}
