//! CSV output of a norm/display series.

use std::io;

use crate::signal::NormPoint;
use crate::ImuError;

pub const SERIES_HEADER: [&str; 2] = ["time_s", "norm"];

/// Write `time_s,norm` rows with six decimals.
pub fn write_series_csv<W: io::Write>(series: &[NormPoint], writer: W) -> Result<(), ImuError> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(SERIES_HEADER)?;
    for point in series {
        writer.write_record([
            format!("{:.6}", point.time_s),
            format!("{:.6}", point.norm),
        ])?;
    }
    writer.flush().map_err(|e| ImuError::Csv(e.to_string()))?;
    Ok(())
}

pub fn series_csv_string(series: &[NormPoint]) -> Result<String, ImuError> {
    let mut buf = Vec::new();
    write_series_csv(series, &mut buf)?;
    String::from_utf8(buf).map_err(|e| ImuError::Csv(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_csv() {
        let series = [
            NormPoint {
                time_s: 0.0,
                norm: 1.0,
            },
            NormPoint {
                time_s: 0.0015,
                norm: 9.80665,
            },
        ];
        let text = series_csv_string(&series).unwrap();
        assert_eq!(text, "time_s,norm\n0.000000,1.000000\n0.001500,9.806650\n");
    }

    #[test]
    fn test_empty_series_has_header() {
        assert_eq!(series_csv_string(&[]).unwrap(), "time_s,norm\n");
    }
}
