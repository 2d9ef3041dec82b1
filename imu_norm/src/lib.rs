//! Core ingestion and norm computation for smartphone inertial sensor logs.
//!
//! The pipeline has two stages: [`parse`] turns an uploaded byte buffer into a
//! validated [`SampleTable`], and [`process`] derives the norm series, the
//! decimated display series and the summary statistics from it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod export;
pub mod ingest;
pub mod signal;

pub use cache::{content_digest, ParseCache};
pub use export::{series_csv_string, write_series_csv};
pub use ingest::{parse, parse_with, Delimiter, IngestReport, Ingested, TextEncoding};
pub use signal::{
    decimate, norm_series, process, DisplaySeries, NormPoint, NormSeries, Processed,
    SummaryStats, TimeUnit,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImuError {
    #[error("could not decode the file with any supported encoding")]
    DecodeError,
    #[error("file has {found} columns; at least 4 are required (time, x, y, z)")]
    InsufficientColumns { found: usize },
    #[error("no rows with numeric values in the first four columns")]
    NoValidRows,
    #[error("only {found} valid rows after cleaning; at least {required} are required")]
    InsufficientSamples { found: usize, required: usize },
    #[error("invalid frame rate {0}: must be a finite value greater than zero")]
    InvalidFrameRate(f64),
    #[error("tabular read/write failed: {0}")]
    Csv(String),
    #[error("invalid ingest configuration: {0}")]
    InvalidConfig(String),
}

impl From<csv::Error> for ImuError {
    fn from(err: csv::Error) -> Self {
        ImuError::Csv(err.to_string())
    }
}

/// Heuristics used by the ingestion parser.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Number of leading characters inspected when choosing the delimiter.
    pub sniff_chars: usize,
    /// Fewest rows that must survive numeric filtering.
    pub min_samples: usize,
    /// Positional columns read from every row.
    pub required_columns: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sniff_chars: 8000,
            min_samples: 5,
            required_columns: 4,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), ImuError> {
        if self.sniff_chars == 0 {
            return Err(ImuError::InvalidConfig("sniff_chars must be > 0".into()));
        }
        if self.min_samples == 0 {
            return Err(ImuError::InvalidConfig("min_samples must be > 0".into()));
        }
        // Output rows are always (time, x, y, z).
        if self.required_columns != 4 {
            return Err(ImuError::InvalidConfig(format!(
                "required_columns must be 4, got {}",
                self.required_columns
            )));
        }
        Ok(())
    }
}

/// One validated sensor reading. `time` is in the unit of the source file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Sample {
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Non-empty, ordered table of samples produced by the parser.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Vec<Sample>", into = "Vec<Sample>")]
pub struct SampleTable {
    samples: Vec<Sample>,
}

impl SampleTable {
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false; kept for the `len`/`is_empty` pairing.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    /// Leading rows, for previews.
    pub fn head(&self, n: usize) -> &[Sample] {
        &self.samples[..n.min(self.samples.len())]
    }
}

impl TryFrom<Vec<Sample>> for SampleTable {
    type Error = ImuError;

    fn try_from(samples: Vec<Sample>) -> Result<Self, Self::Error> {
        if samples.is_empty() {
            return Err(ImuError::NoValidRows);
        }
        Ok(Self { samples })
    }
}

impl From<SampleTable> for Vec<Sample> {
    fn from(table: SampleTable) -> Self {
        table.samples
    }
}

impl<'a> IntoIterator for &'a SampleTable {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: f64) -> Sample {
        Sample {
            time: t,
            x: 3.0,
            y: 4.0,
            z: 0.0,
        }
    }

    #[test]
    fn test_sample_norm() {
        assert!((sample(0.0).norm() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_table_rejects_empty() {
        assert_eq!(SampleTable::try_from(Vec::<Sample>::new()), Err(ImuError::NoValidRows));
    }

    #[test]
    fn test_table_deserialize_revalidates() {
        let empty: Result<SampleTable, _> = serde_json::from_str("[]");
        assert!(empty.is_err());

        let table = SampleTable::try_from(vec![sample(0.0), sample(1.0)]).unwrap();
        let json = serde_json::to_string(&table).unwrap();
        let back: SampleTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_head_clamps() {
        let table = SampleTable::try_from(vec![sample(0.0), sample(1.0)]).unwrap();
        assert_eq!(table.head(30).len(), 2);
        assert_eq!(table.head(1)[0].time, 0.0);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(IngestConfig::default().validate().is_ok());
        let bad = IngestConfig {
            min_samples: 0,
            ..IngestConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ImuError::InvalidConfig(_))));
    }
}
