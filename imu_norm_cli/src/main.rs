use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::panic;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use imu_norm::{
    content_digest, parse_with, process, write_series_csv, IngestConfig, Ingested, NormPoint,
    Processed, SummaryStats, TimeUnit,
};
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inertial sensor norm CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the norm series and summary statistics of a sensor log
    Plot(PlotArgs),
    /// Report how a sensor log was decoded and preview its first rows
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct PlotArgs {
    /// CSV/TXT sensor log (time, x, y, z in the first four columns)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output CSV path for the display series (`-` for stdout)
    #[arg(short, long, default_value = "norm.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Output PNG figure path (defaults next to CSV)
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Output SVG figure path
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Disable plot generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Unit of the time column
    #[arg(long, value_enum, default_value_t = UnitOpt::Ms)]
    unit: UnitOpt,

    /// Frame rate (Hz) used with `--unit frames`
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// Maximum number of points in the display series (0 keeps all)
    #[arg(long, default_value_t = 0)]
    max_points: usize,

    /// Optional ingest configuration JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Reuse parsed tables across runs from this directory (off unless given)
    #[arg(long, value_hint = ValueHint::DirPath)]
    cache_dir: Option<PathBuf>,

    /// Print statistics as JSON on stdout
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// CSV/TXT sensor log to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Number of parsed rows to preview
    #[arg(long, default_value_t = 30)]
    rows: usize,

    /// Optional ingest configuration JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum UnitOpt {
    Ms,
    S,
    Frames,
}

impl UnitOpt {
    fn to_time_unit(self, fps: f64) -> TimeUnit {
        match self {
            UnitOpt::Ms => TimeUnit::Milliseconds,
            UnitOpt::S => TimeUnit::Seconds,
            UnitOpt::Frames => TimeUnit::Frames { fps },
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Plot(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Plot(args) => handle_plot(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_plot(args: PlotArgs) -> Result<()> {
    check_stdout_use(&args)?;
    let config = load_config(args.config.as_deref())?;
    let unit = args.unit.to_time_unit(args.fps);
    let max_points = if args.max_points > 0 {
        Some(args.max_points)
    } else {
        None
    };

    let t_parse = Instant::now();
    if let Some(dir) = args.cache_dir.as_deref() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
    }
    let ingested = load_ingested(&args.input, &config, args.cache_dir.as_deref())?;
    if args.profile || args.verbose {
        info!(
            "Parse stage: {:.1} ms",
            t_parse.elapsed().as_secs_f64() * 1000.0
        );
    }
    log_report(&ingested);

    let t_compute = Instant::now();
    let processed = process(&ingested.table, unit, max_points)
        .with_context(|| format!("failed to process {}", args.input.display()))?;
    if args.profile || args.verbose {
        info!(
            "Compute stage: {:.1} ms ({} display points)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            processed.display.len()
        );
    }

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        write_series_csv(&processed.display, stdout.lock())?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        write_series_csv(&processed.display, file)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Wrote norm CSV: {}", args.output.display());
    }

    if !args.no_plot {
        let png_path = args.png.clone().or_else(|| {
            if args.output.as_os_str() == "-" {
                None
            } else {
                let mut path = args.output.clone();
                path.set_extension("png");
                Some(path)
            }
        });
        let t_plot = Instant::now();
        if let Some(path) = png_path.as_ref() {
            match render_chart_guard(&processed, path, ChartKind::Png) {
                Ok(()) => info!("Wrote plot: {}", path.display()),
                Err(err) => warn!("Skipping PNG render ({}): {}", path.display(), err),
            }
        }
        if let Some(path) = args.svg.as_ref() {
            match render_chart_guard(&processed, path, ChartKind::Svg) {
                Ok(()) => info!("Wrote plot: {}", path.display()),
                Err(err) => warn!("Skipping SVG render ({}): {}", path.display(), err),
            }
        }
        if args.profile || args.verbose {
            info!(
                "Plot stage: {:.1} ms",
                t_plot.elapsed().as_secs_f64() * 1000.0
            );
        }
    }

    // With `-o -` the CSV owns stdout, so statistics go to the log.
    if args.output.as_os_str() == "-" {
        log_stats(&processed.stats);
    } else if args.json {
        let summary = JsonSummary {
            file: args.input.display().to_string(),
            unit: unit.label(),
            report: &ingested.report,
            stats: &processed.stats,
            display_points: processed.display.len(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let mut out = io::stdout().lock();
        write_stats(&mut out, &processed.stats)?;
    }

    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let ingested = load_ingested(&args.input, &config, None)?;
    let report = &ingested.report;

    let mut out = io::stdout().lock();
    writeln!(out, "FILE: {}", args.input.display())?;
    writeln!(out, "  encoding: {}", report.encoding)?;
    writeln!(out, "  delimiter: {}", report.delimiter)?;
    writeln!(out, "  columns: {}", report.columns)?;
    writeln!(
        out,
        "  rows: {} read, {} kept, {} dropped",
        report.rows_read,
        report.rows_kept,
        report.rows_dropped()
    )?;
    writeln!(out, "  preview:")?;
    writeln!(
        out,
        "    {:>14} {:>12} {:>12} {:>12}",
        "time", "x", "y", "z"
    )?;
    for sample in ingested.table.head(args.rows) {
        writeln!(
            out,
            "    {:>14.3} {:>12.5} {:>12.5} {:>12.5}",
            sample.time, sample.x, sample.y, sample.z
        )?;
    }
    if ingested.table.len() > args.rows {
        writeln!(out, "    ... {} more", ingested.table.len() - args.rows)?;
    }
    Ok(())
}

/// Stdout carries at most one stream.
fn check_stdout_use(args: &PlotArgs) -> Result<()> {
    if args.json && args.output.as_os_str() == "-" {
        return Err(anyhow!(
            "--json and `-o -` both write to stdout; pick one or give -o a file path"
        ));
    }
    Ok(())
}

#[derive(Serialize)]
struct JsonSummary<'a> {
    file: String,
    unit: &'static str,
    report: &'a imu_norm::IngestReport,
    stats: &'a SummaryStats,
    display_points: usize,
}

fn load_config(path: Option<&Path>) -> Result<IngestConfig> {
    let Some(path) = path else {
        return Ok(IngestConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: IngestConfig = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid ingest config", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow!("{}: {}", path.display(), e))?;
    Ok(config)
}

fn load_ingested(path: &Path, config: &IngestConfig, cache_dir: Option<&Path>) -> Result<Ingested> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let key = match cache_dir {
        Some(_) => Some(cache_key(&data, config)?),
        None => None,
    };
    if let (Some(dir), Some(key)) = (cache_dir, key.as_deref()) {
        if let Some(cached) = read_cache(dir, key) {
            debug!("parse cache hit for {}", path.display());
            return Ok(cached);
        }
    }
    let ingested =
        parse_with(&data, config).with_context(|| format!("failed to parse {}", path.display()))?;
    if let (Some(dir), Some(key)) = (cache_dir, key.as_deref()) {
        // Best-effort cache write
        if let Err(err) = write_cache(dir, key, &ingested) {
            debug!("cache write skipped: {err:#}");
        }
    }
    Ok(ingested)
}

/// Content digest plus config digest, so a changed heuristic never serves a stale table.
fn cache_key(data: &[u8], config: &IngestConfig) -> Result<String> {
    let config_json = serde_json::to_string(config)?;
    Ok(format!(
        "{}-{}",
        content_digest(data),
        &content_digest(config_json.as_bytes())[..12]
    ))
}

fn read_cache(dir: &Path, key: &str) -> Option<Ingested> {
    let path = dir.join(format!("{}.json", key));
    let text = fs::read_to_string(&path).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_cache(dir: &Path, key: &str, ingested: &Ingested) -> Result<()> {
    let path = dir.join(format!("{}.json", key));
    let text = serde_json::to_string(ingested)?;
    fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn log_report(ingested: &Ingested) {
    let report = &ingested.report;
    info!(
        "Loaded {} samples ({} of {} rows kept, {} columns, {}, {}-delimited)",
        ingested.table.len(),
        report.rows_kept,
        report.rows_read,
        report.columns,
        report.encoding,
        report.delimiter
    );
    if report.rows_dropped() > 0 {
        debug!("Dropped {} non-numeric rows", report.rows_dropped());
    }
}

fn log_stats(stats: &SummaryStats) {
    info!(
        "Norm stats: count={} mean={:.4} rms={:.4} min={:.4} max={:.4}",
        stats.count, stats.mean, stats.rms, stats.min, stats.max
    );
}

fn write_stats<W: Write>(out: &mut W, stats: &SummaryStats) -> io::Result<()> {
    writeln!(out, "count: {}", stats.count)?;
    writeln!(out, "mean:  {:.4}", stats.mean)?;
    writeln!(out, "rms:   {:.4}", stats.rms)?;
    writeln!(out, "min:   {:.4}", stats.min)?;
    writeln!(out, "max:   {:.4}", stats.max)?;
    Ok(())
}

enum ChartKind {
    Png,
    Svg,
}

fn render_chart_guard(processed: &Processed, path: &Path, kind: ChartKind) -> Result<(), String> {
    let render = || -> Result<(), String> {
        let drawn = match kind {
            ChartKind::Png => {
                let root = BitMapBackend::new(path, (1280, 720)).into_drawing_area();
                draw_norm_chart(root, &processed.display, &processed.stats)
            }
            ChartKind::Svg => {
                let root = SVGBackend::new(path, (1280, 720)).into_drawing_area();
                draw_norm_chart(root, &processed.display, &processed.stats)
            }
        };
        drawn.map_err(|e| format!("plotting error: {}", e))
    };

    // Font lookup can panic on hosts without system fonts.
    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

fn draw_norm_chart<DB>(
    root: DrawingArea<DB, plotters::coord::Shift>,
    series: &[NormPoint],
    stats: &SummaryStats,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    if series.is_empty() {
        return Ok(());
    }
    let (x_min, x_max) = axis_range(series.iter().map(|p| p.time_s));
    let y_max = stats.max.max(1e-9) * 1.1;

    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(25)
        .caption(
            "Norm (x, y, z) vs time",
            FontDesc::new(FontFamily::SansSerif, 26.0, FontStyle::Normal),
        )
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 50)
        .build_cartesian_2d(x_min..x_max, 0.0..y_max)?;

    chart
        .configure_mesh()
        .x_desc("Time (s)")
        .y_desc("Norm")
        .x_label_formatter(&|v| format!("{:.2}", v))
        .y_label_formatter(&|v| format!("{:.2}", v))
        .label_style(FontDesc::new(
            FontFamily::SansSerif,
            18.0,
            FontStyle::Normal,
        ))
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            series.iter().map(|p| (p.time_s, p.norm)),
            &RGBColor(0, 114, 178),
        ))?
        .label("Norm")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], RGBColor(0, 114, 178)));

    chart
        .draw_series(LineSeries::new(
            [(x_min, stats.rms), (x_max, stats.rms)],
            RGBColor(200, 0, 100).stroke_width(1),
        ))?
        .label(format!("RMS {:.3}", stats.rms))
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], RGBColor(200, 0, 100)));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.7))
        .border_style(BLACK.mix(0.3))
        .label_font(FontDesc::new(
            FontFamily::SansSerif,
            16.0,
            FontStyle::Normal,
        ))
        .position(SeriesLabelPosition::UpperRight)
        .draw()?;

    root.present()?;
    Ok(())
}

/// Finite, non-degenerate range over `values`.
fn axis_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    if (hi - lo).abs() < f64::EPSILON {
        return (lo - 0.5, hi + 0.5);
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_log(dir: &Path) -> PathBuf {
        let path = dir.join("gyro.csv");
        let mut text = String::from("Tempo;X;Y;Z\n");
        for i in 0..8 {
            text.push_str(&format!("{};0,6;0,8;0\n", i * 10));
        }
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_axis_range() {
        assert_eq!(axis_range([2.0, 1.0, 3.0].into_iter()), (1.0, 3.0));
        assert_eq!(axis_range([2.0].into_iter()), (1.5, 2.5));
        assert_eq!(axis_range(std::iter::empty()), (0.0, 1.0));
        assert_eq!(axis_range([f64::NAN, 4.0, 5.0].into_iter()), (4.0, 5.0));
    }

    #[test]
    fn test_load_config_defaults_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.json");
        fs::write(&path, r#"{ "min_samples": 3 }"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.min_samples, 3);
        assert_eq!(config.sniff_chars, 8000);

        fs::write(&path, r#"{ "min_samples": 0 }"#).unwrap();
        assert!(load_config(Some(&path)).is_err());
        assert_eq!(load_config(None).unwrap(), IngestConfig::default());
    }

    #[test]
    fn test_disk_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(dir.path());
        let cache = dir.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let config = IngestConfig::default();

        let cold = load_ingested(&log, &config, Some(&cache)).unwrap();
        assert_eq!(fs::read_dir(&cache).unwrap().count(), 1);
        let warm = load_ingested(&log, &config, Some(&cache)).unwrap();
        assert_eq!(cold, warm);
        assert_eq!(cold.table.len(), 8);
        assert!((cold.table.samples()[0].norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cache_key_depends_on_config() {
        let data = b"0,1,0,0\n";
        let a = cache_key(data, &IngestConfig::default()).unwrap();
        let b = cache_key(
            data,
            &IngestConfig {
                min_samples: 1,
                ..IngestConfig::default()
            },
        )
        .unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(&content_digest(data)));
    }

    #[test]
    fn test_json_rejected_with_stdout_csv() {
        let args = Cli::parse_from(["imu-norm", "plot", "log.csv", "-o", "-", "--json"]);
        let Command::Plot(args) = args.command else {
            panic!("expected plot");
        };
        assert!(check_stdout_use(&args).is_err());

        let args = Cli::parse_from(["imu-norm", "plot", "log.csv", "--json"]);
        let Command::Plot(args) = args.command else {
            panic!("expected plot");
        };
        assert!(check_stdout_use(&args).is_ok());
    }

    #[test]
    fn test_cache_dir_is_opt_in() {
        let args = Cli::parse_from(["imu-norm", "plot", "log.csv"]);
        let Command::Plot(args) = args.command else {
            panic!("expected plot");
        };
        assert!(args.cache_dir.is_none());

        let dir = tempfile::tempdir().unwrap();
        let log = write_log(dir.path());
        load_ingested(&log, &IngestConfig::default(), None).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_stats() {
        let stats = SummaryStats {
            count: 6,
            mean: 1.0,
            rms: 1.0,
            min: 1.0,
            max: 1.0,
        };
        let mut buf = Vec::new();
        write_stats(&mut buf, &stats).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("count: 6\n"));
        assert!(text.contains("rms:   1.0000"));
    }
}
