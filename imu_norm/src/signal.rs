//! Norm series, display decimation and summary statistics.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ImuError, Sample, SampleTable};

/// Below this many samples the rayon split costs more than it saves.
#[cfg(feature = "parallel")]
const PARALLEL_MIN_SAMPLES: usize = 16_384;

/// Unit of the time column in the uploaded file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Frames { fps: f64 },
}

impl Default for TimeUnit {
    fn default() -> Self {
        TimeUnit::Milliseconds
    }
}

impl TimeUnit {
    /// Divisor that turns a raw time value into seconds.
    pub fn seconds_divisor(&self) -> Result<f64, ImuError> {
        match *self {
            TimeUnit::Milliseconds => Ok(1000.0),
            TimeUnit::Seconds => Ok(1.0),
            TimeUnit::Frames { fps } if fps.is_finite() && fps > 0.0 => Ok(fps),
            TimeUnit::Frames { fps } => Err(ImuError::InvalidFrameRate(fps)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Seconds => "s",
            TimeUnit::Frames { .. } => "frames",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct NormPoint {
    pub time_s: f64,
    pub norm: f64,
}

impl NormPoint {
    fn from_sample(sample: &Sample, divisor: f64) -> Self {
        Self {
            time_s: sample.time / divisor,
            norm: sample.norm(),
        }
    }
}

pub type NormSeries = Vec<NormPoint>;
pub type DisplaySeries = Vec<NormPoint>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SummaryStats {
    pub count: usize,
    pub mean: f64,
    pub rms: f64,
    pub min: f64,
    pub max: f64,
}

impl SummaryStats {
    /// Statistics of a norm sequence; `None` when it is empty.
    pub fn from_norms(norms: &[f64]) -> Option<Self> {
        let norms = Array1::from_vec(norms.to_vec());
        let mean = norms.mean()?;
        let mean_square = norms.mapv(|v| v * v).mean()?;
        let min = norms.fold(f64::INFINITY, |acc, &v| acc.min(v));
        let max = norms.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        Some(Self {
            count: norms.len(),
            mean,
            rms: mean_square.sqrt(),
            min,
            max,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Processed {
    pub display: DisplaySeries,
    pub stats: SummaryStats,
}

/// Time in seconds and Euclidean norm for every sample, in table order.
pub fn norm_series(table: &SampleTable, unit: TimeUnit) -> Result<NormSeries, ImuError> {
    let divisor = unit.seconds_divisor()?;
    Ok(compute_points(table.samples(), divisor))
}

#[cfg(feature = "parallel")]
fn compute_points(samples: &[Sample], divisor: f64) -> NormSeries {
    use rayon::prelude::*;

    if samples.len() < PARALLEL_MIN_SAMPLES {
        return samples
            .iter()
            .map(|s| NormPoint::from_sample(s, divisor))
            .collect();
    }
    samples
        .par_iter()
        .map(|s| NormPoint::from_sample(s, divisor))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn compute_points(samples: &[Sample], divisor: f64) -> NormSeries {
    samples
        .iter()
        .map(|s| NormPoint::from_sample(s, divisor))
        .collect()
}

/// Uniform-stride subsampling to at most `max_points` points, starting at index 0.
///
/// `None` or `Some(0)` means no budget.
pub fn decimate(series: &[NormPoint], max_points: Option<usize>) -> DisplaySeries {
    match max_points.filter(|&m| m > 0) {
        Some(budget) if series.len() > budget => {
            let step = series.len().div_ceil(budget);
            series.iter().step_by(step).copied().collect()
        }
        _ => series.to_vec(),
    }
}

/// Derive the display series and statistics for one parsed upload.
///
/// Statistics always describe the full series; the point budget only affects `display`.
pub fn process(
    table: &SampleTable,
    unit: TimeUnit,
    max_points: Option<usize>,
) -> Result<Processed, ImuError> {
    let series = norm_series(table, unit)?;
    let norms: Vec<f64> = series.iter().map(|p| p.norm).collect();
    let stats = SummaryStats::from_norms(&norms).ok_or(ImuError::NoValidRows)?;
    let shown = decimate(&series, max_points);
    debug!(
        samples = series.len(),
        displayed = shown.len(),
        unit = unit.label(),
        "processed norm series"
    );
    Ok(Processed {
        display: shown,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[(f64, f64, f64, f64)]) -> SampleTable {
        SampleTable::try_from(
            rows.iter()
                .map(|&(time, x, y, z)| Sample { time, x, y, z })
                .collect::<Vec<_>>(),
        )
        .unwrap()
    }

    fn ramp(n: usize) -> SampleTable {
        table(
            &(0..n)
                .map(|i| (i as f64 * 10.0, i as f64 * 0.1, -(i as f64), 0.5))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_unit_norm_end_to_end() {
        let table = table(&(0..6).map(|t| (t as f64, 1.0, 0.0, 0.0)).collect::<Vec<_>>());
        let out = process(&table, TimeUnit::Milliseconds, None).unwrap();
        let expected = [0.0, 0.001, 0.002, 0.003, 0.004, 0.005];
        assert_eq!(out.display.len(), 6);
        for (point, want) in out.display.iter().zip(expected.iter()) {
            assert!((point.time_s - want).abs() < 1e-12);
            assert_eq!(point.norm, 1.0);
        }
        assert_eq!(
            out.stats,
            SummaryStats {
                count: 6,
                mean: 1.0,
                rms: 1.0,
                min: 1.0,
                max: 1.0
            }
        );
    }

    #[test]
    fn test_time_units() {
        let table = table(&[(120.0, 0.0, 3.0, 4.0)]);
        let secs = norm_series(&table, TimeUnit::Seconds).unwrap();
        assert_eq!(secs[0].time_s, 120.0);
        assert_eq!(secs[0].norm, 5.0);
        let frames = norm_series(&table, TimeUnit::Frames { fps: 60.0 }).unwrap();
        assert_eq!(frames[0].time_s, 2.0);
    }

    #[test]
    fn test_invalid_frame_rate() {
        let table = ramp(5);
        for fps in [0.0, -30.0, f64::NAN, f64::INFINITY] {
            let err = process(&table, TimeUnit::Frames { fps }, None).unwrap_err();
            assert!(matches!(err, ImuError::InvalidFrameRate(_)));
        }
    }

    #[test]
    fn test_rms_identity() {
        let table = ramp(37);
        let out = process(&table, TimeUnit::Seconds, None).unwrap();
        let norms: Vec<f64> = table.iter().map(|s| s.norm()).collect();
        let expected = (norms.iter().map(|v| v * v).sum::<f64>() / norms.len() as f64).sqrt();
        assert!(((out.stats.rms - expected) / expected).abs() < 1e-9);
        // RMS and mean only coincide for constant series.
        assert!(out.stats.rms > out.stats.mean);
        assert_eq!(out.stats.count, 37);
        assert_eq!(out.stats.min, norms[0]);
        assert_eq!(out.stats.max, norms[36]);
    }

    #[test]
    fn test_decimation_does_not_change_stats() {
        let table = ramp(101);
        let full = process(&table, TimeUnit::Milliseconds, None).unwrap();
        for budget in [1, 2, 7, 50, 100, 101, 1000] {
            let out = process(&table, TimeUnit::Milliseconds, Some(budget)).unwrap();
            assert_eq!(out.stats, full.stats);
            assert!(out.display.len() <= budget);
        }
    }

    #[test]
    fn test_decimate_stride() {
        let series: Vec<NormPoint> = (0..10)
            .map(|i| NormPoint {
                time_s: i as f64,
                norm: 1.0,
            })
            .collect();
        // ceil(10 / 4) = 3 -> indices 0, 3, 6, 9
        let times: Vec<f64> = decimate(&series, Some(4)).iter().map(|p| p.time_s).collect();
        assert_eq!(times, vec![0.0, 3.0, 6.0, 9.0]);
        assert_eq!(decimate(&series, Some(10)), series);
        assert_eq!(decimate(&series, Some(0)), series);
        assert_eq!(decimate(&series, None), series);
        assert_eq!(decimate(&series, Some(1)).len(), 1);
    }

    #[test]
    fn test_debug_logging_with_subscriber() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let out = tracing::subscriber::with_default(subscriber, || {
            process(&ramp(12), TimeUnit::Milliseconds, Some(4)).unwrap()
        });
        assert_eq!(out.display.len(), 4);
        assert_eq!(out.stats.count, 12);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_path_keeps_order() {
        let n = PARALLEL_MIN_SAMPLES + 3_616;
        let table = table(
            &(0..n)
                .map(|i| (i as f64 * 1000.0, i as f64, 0.0, 0.0))
                .collect::<Vec<_>>(),
        );
        let out = process(&table, TimeUnit::Milliseconds, None).unwrap();
        assert_eq!(out.display.len(), n);
        for (i, (point, sample)) in out.display.iter().zip(table.iter()).enumerate() {
            assert_eq!(point.time_s, i as f64);
            assert_eq!(point.norm, i as f64);
            assert_eq!(*point, NormPoint::from_sample(sample, 1000.0));
        }
        assert_eq!(out.stats.max, (n - 1) as f64);
    }

    #[test]
    fn test_stats_empty() {
        assert!(SummaryStats::from_norms(&[]).is_none());
    }

    #[test]
    fn test_time_unit_serde_tag() {
        let json = serde_json::to_string(&TimeUnit::Frames { fps: 30.0 }).unwrap();
        assert_eq!(json, r#"{"unit":"frames","fps":30.0}"#);
        let back: TimeUnit = serde_json::from_str(r#"{"unit":"milliseconds"}"#).unwrap();
        assert_eq!(back, TimeUnit::Milliseconds);
    }
}
