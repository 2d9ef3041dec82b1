//! Byte buffer → [`SampleTable`].
//!
//! Files come from whatever export tool the phone ran, so nothing about them is
//! trusted: the encoding is guessed, the delimiter is sniffed, any header is
//! ignored and rows are kept only when their first four fields are numeric.

use std::borrow::Cow;
use std::fmt;

use csv::ReaderBuilder;
use encoding_rs::{UTF_8, WINDOWS_1252};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ImuError, IngestConfig, Sample, SampleTable};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8Bom,
    Utf8,
    Windows1252,
    Latin1,
}

impl TextEncoding {
    /// Candidates in the order they are tried.
    pub const CANDIDATES: [TextEncoding; 4] = [
        TextEncoding::Utf8Bom,
        TextEncoding::Utf8,
        TextEncoding::Windows1252,
        TextEncoding::Latin1,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            TextEncoding::Utf8Bom => "utf-8-sig",
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Windows1252 => "cp1252",
            TextEncoding::Latin1 => "latin-1",
        }
    }

    fn decode<'a>(&self, raw: &'a [u8]) -> Option<Cow<'a, str>> {
        match self {
            TextEncoding::Utf8Bom => {
                let (text, had_errors) = UTF_8.decode_with_bom_removal(raw);
                if had_errors {
                    None
                } else {
                    Some(text)
                }
            }
            TextEncoding::Utf8 => UTF_8.decode_without_bom_handling_and_without_replacement(raw),
            TextEncoding::Windows1252 => {
                // Five code points are unassigned in cp1252; treat them as a decode failure.
                if raw
                    .iter()
                    .any(|b| matches!(b, 0x81 | 0x8D | 0x8F | 0x90 | 0x9D))
                {
                    None
                } else {
                    WINDOWS_1252.decode_without_bom_handling_and_without_replacement(raw)
                }
            }
            TextEncoding::Latin1 => Some(Cow::Owned(raw.iter().map(|&b| char::from(b)).collect())),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Delimiter {
    Comma,
    Semicolon,
}

impl Delimiter {
    pub fn as_byte(&self) -> u8 {
        match self {
            Delimiter::Comma => b',',
            Delimiter::Semicolon => b';',
        }
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Delimiter::Comma => "comma",
            Delimiter::Semicolon => "semicolon",
        })
    }
}

/// What the parser decided and how much of the file survived.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    pub encoding: TextEncoding,
    pub delimiter: Delimiter,
    /// Widest row seen after splitting.
    pub columns: usize,
    pub rows_read: usize,
    pub rows_kept: usize,
}

impl IngestReport {
    pub fn rows_dropped(&self) -> usize {
        self.rows_read - self.rows_kept
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Ingested {
    pub table: SampleTable,
    pub report: IngestReport,
}

/// Parse an uploaded sensor log with the default heuristics.
pub fn parse(raw: &[u8]) -> Result<SampleTable, ImuError> {
    parse_with(raw, &IngestConfig::default()).map(|ingested| ingested.table)
}

/// Parse an uploaded sensor log, returning the table together with an [`IngestReport`].
pub fn parse_with(raw: &[u8], config: &IngestConfig) -> Result<Ingested, ImuError> {
    config.validate()?;

    let (text, encoding) = decode_bytes(raw)?;
    let delimiter = infer_delimiter(&text, config.sniff_chars);
    debug!(%encoding, %delimiter, bytes = raw.len(), "decoded upload");

    let split = split_rows(&text, delimiter, config)?;
    let report = IngestReport {
        encoding,
        delimiter,
        columns: split.columns,
        rows_read: split.rows_read,
        rows_kept: split.table.len(),
    };
    debug!(
        rows_read = report.rows_read,
        rows_kept = report.rows_kept,
        columns = report.columns,
        "filtered rows"
    );

    Ok(Ingested {
        table: split.table,
        report,
    })
}

struct SplitRows {
    table: SampleTable,
    columns: usize,
    rows_read: usize,
}

/// Split decoded text on `delimiter` and keep the rows whose first four fields are numeric.
fn split_rows(
    text: &str,
    delimiter: Delimiter,
    config: &IngestConfig,
) -> Result<SplitRows, ImuError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter.as_byte())
        .from_reader(text.as_bytes());

    let mut columns = 0usize;
    let mut rows_read = 0usize;
    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows_read += 1;
        columns = columns.max(record.len());
        if let Some(sample) = parse_row(record.iter()) {
            samples.push(sample);
        }
    }

    if columns < config.required_columns {
        return Err(ImuError::InsufficientColumns { found: columns });
    }
    if samples.is_empty() {
        return Err(ImuError::NoValidRows);
    }
    if samples.len() < config.min_samples {
        return Err(ImuError::InsufficientSamples {
            found: samples.len(),
            required: config.min_samples,
        });
    }

    Ok(SplitRows {
        table: SampleTable::try_from(samples)?,
        columns,
        rows_read,
    })
}

/// First candidate encoding that decodes cleanly and is not blank.
fn decode_bytes(raw: &[u8]) -> Result<(Cow<'_, str>, TextEncoding), ImuError> {
    for encoding in TextEncoding::CANDIDATES {
        match encoding.decode(raw) {
            Some(text) if !text.trim().is_empty() => return Ok((text, encoding)),
            Some(_) => debug!(%encoding, "decoded to blank text"),
            None => debug!(%encoding, "decode failed"),
        }
    }
    Err(ImuError::DecodeError)
}

/// Semicolon wins only on a strictly higher count within the sniff window.
fn infer_delimiter(text: &str, sniff_chars: usize) -> Delimiter {
    let (semicolons, commas) = text
        .chars()
        .take(sniff_chars)
        .fold((0usize, 0usize), |(s, c), ch| match ch {
            ';' => (s + 1, c),
            ',' => (s, c + 1),
            _ => (s, c),
        });
    if semicolons > commas {
        Delimiter::Semicolon
    } else {
        Delimiter::Comma
    }
}

/// Trim, accept a decimal comma, parse. NaN counts as missing.
fn parse_field(field: &str) -> Option<f64> {
    let normalized = field.trim().replace(',', ".");
    normalized.parse::<f64>().ok().filter(|v| !v.is_nan())
}

fn parse_row<'a>(mut fields: impl Iterator<Item = &'a str>) -> Option<Sample> {
    let time = parse_field(fields.next()?)?;
    let x = parse_field(fields.next()?)?;
    let y = parse_field(fields.next()?)?;
    let z = parse_field(fields.next()?)?;
    Some(Sample { time, x, y, z })
}
