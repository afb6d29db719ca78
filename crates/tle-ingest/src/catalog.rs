//! TLE text-catalog parsing and format validation.
//!
//! Catalogs are the classic CelesTrak layout: an optional display-name line
//! followed by the two 69-character element lines. Records failing length,
//! checksum, or epoch validation are dropped and counted; the caller
//! decides whether the drop rate is acceptable.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, warn};

use crate::{Constellation, Result, TleError, TleRecord};

pub const TLE_LINE_LENGTH: usize = 69;

/// Modulo-10 TLE checksum over the first 68 columns: digits count as their
/// value, `-` counts as 1, everything else as 0.
pub fn tle_checksum(line: &str) -> u8 {
    (line
        .bytes()
        .take(68)
        .map(|b| {
            if b.is_ascii_digit() {
                (b - b'0') as u16
            } else if b == b'-' {
                1u16
            } else {
                0u16
            }
        })
        .sum::<u16>()
        % 10) as u8
}

fn verify_line(line: &str, line_number: u8) -> Result<()> {
    if line.len() != TLE_LINE_LENGTH {
        return Err(TleError::LineLength(line.len()));
    }
    let expected = tle_checksum(line);
    let actual = line
        .as_bytes()
        .get(68)
        .filter(|b| b.is_ascii_digit())
        .map(|b| b - b'0')
        .ok_or(TleError::Checksum {
            line: line_number,
            expected,
            actual: 255,
        })?;
    if actual != expected {
        return Err(TleError::Checksum {
            line: line_number,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Epoch from line 1 columns 19-32: two-digit year plus fractional
/// day-of-year, preserved at sub-second resolution.
pub fn parse_epoch(line1: &str) -> Result<DateTime<Utc>> {
    let year_field = line1
        .get(18..20)
        .and_then(|s| s.trim().parse::<i32>().ok())
        .ok_or_else(|| TleError::Parse("epoch year field".to_string()))?;
    let year = if year_field < 57 {
        2000 + year_field
    } else {
        1900 + year_field
    };
    let day = line1
        .get(20..32)
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|d| *d >= 1.0 && *d < 367.0)
        .ok_or_else(|| TleError::Parse("epoch day field".to_string()))?;

    let jan1 = Utc
        .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| TleError::Parse(format!("epoch year {year}")))?;
    let nanos = ((day - 1.0) * 86_400.0 * 1e9).round() as i64;
    Ok(jan1 + Duration::nanoseconds(nanos))
}

fn parse_norad_id(line: &str) -> Result<u32> {
    line.get(2..7)
        .and_then(|s| s.trim().parse::<u32>().ok())
        .ok_or_else(|| TleError::Parse("NORAD id field".to_string()))
}

/// Validate one record and build the catalog entry. The element pair is
/// also run through the SGP4 parser so anything the propagator cannot
/// consume is rejected here instead of mid-run.
pub fn parse_record(name: &str, line1: &str, line2: &str) -> Result<TleRecord> {
    verify_line(line1, 1)?;
    verify_line(line2, 2)?;

    let norad1 = parse_norad_id(line1)?;
    let norad2 = parse_norad_id(line2)?;
    if norad1 != norad2 {
        return Err(TleError::Parse(format!(
            "NORAD id mismatch between lines: {norad1} vs {norad2}"
        )));
    }

    let epoch = parse_epoch(line1)?;

    sgp4::Elements::from_tle(None, line1.as_bytes(), line2.as_bytes())
        .map_err(|e| TleError::Parse(format!("{e:?}")))?;

    let name = name.trim();
    let display = if name.is_empty() {
        format!("NORAD-{norad1:05}")
    } else {
        name.to_string()
    };

    Ok(TleRecord {
        satellite_id: norad1.to_string(),
        name: display.clone(),
        norad_id: norad1,
        constellation: Constellation::from_name(&display),
        tle_line1: line1.to_string(),
        tle_line2: line2.to_string(),
        epoch_datetime: epoch,
    })
}

/// Parse a whole catalog text. Returns the valid records plus the number
/// of dropped element sets.
pub fn parse_catalog(text: &str) -> (Vec<TleRecord>, usize) {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();

    let mut records = Vec::new();
    let mut dropped = 0;
    let mut pending_name: Option<&str> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("1 ") && i + 1 < lines.len() && lines[i + 1].starts_with("2 ") {
            let name = pending_name.take().unwrap_or("");
            match parse_record(name, line, lines[i + 1]) {
                Ok(record) => {
                    debug!("parsed {} ({})", record.name, record.norad_id);
                    records.push(record);
                }
                Err(err) => {
                    warn!("dropping element set near line {}: {err}", i + 1);
                    dropped += 1;
                }
            }
            i += 2;
        } else {
            // Anything that is not an element line is a display name.
            pending_name = Some(line);
            i += 1;
        }
    }

    (records, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticTle;
    use chrono::Timelike;

    #[test]
    fn test_checksum_counts_minus_as_one() {
        // Six digits summing to 21, one '-' adds 1 => 22 % 10 == 2.
        let line = format!("{:<68}", "123456-");
        assert_eq!(tle_checksum(&line), 2);
    }

    #[test]
    fn test_parse_epoch_subsecond() {
        let record = SyntheticTle::new(44713, "STARLINK-1007")
            .epoch(Utc.with_ymd_and_hms(2025, 10, 5, 12, 34, 56).unwrap())
            .build_record();
        let epoch = parse_epoch(&record.tle_line1).unwrap();
        assert_eq!(epoch.date_naive(), chrono::NaiveDate::from_ymd_opt(2025, 10, 5).unwrap());
        assert_eq!(epoch.hour(), 12);
        assert_eq!(epoch.minute(), 34);
        // Fractional-day encoding keeps sub-second resolution.
        assert!((epoch.second() as i64 - 56).abs() <= 1);
    }

    #[test]
    fn test_parse_catalog_three_line_groups() {
        let a = SyntheticTle::new(44713, "STARLINK-1007").build_lines();
        let b = SyntheticTle::new(48000, "ONEWEB-0001")
            .mean_motion(13.0)
            .inclination_deg(87.9)
            .build_lines();
        let text = format!("STARLINK-1007\n{}\n{}\nONEWEB-0001\n{}\n{}\n", a.0, a.1, b.0, b.1);

        let (records, dropped) = parse_catalog(&text);
        assert_eq!(records.len(), 2);
        assert_eq!(dropped, 0);
        assert_eq!(records[0].constellation, Constellation::Starlink);
        assert_eq!(records[1].constellation, Constellation::OneWeb);
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let (line1, line2) = SyntheticTle::new(44713, "STARLINK-1007").build_lines();
        // Corrupt the final checksum digit of line 1.
        let mut corrupted = line1.clone();
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == '0' { '1' } else { '0' });
        let text = format!("STARLINK-1007\n{corrupted}\n{line2}\n");

        let (records, dropped) = parse_catalog(&text);
        assert!(records.is_empty());
        assert_eq!(dropped, 1);
    }
}
