use crate::importer::{FormatAdapter, ParseReport};
use crate::model::{Connection, ConnectionMode, ValidWindow};

use chrono::NaiveTime;

use std::fmt;

/// Adapter for ALF-style fixed-link files. Two variants circulate: the
/// key=value form (`M=WALK,O=AFK,D=ASI,T=5,S=0001,E=2359,...`) and a legacy
/// fixed-width form with the mode letter in column 0. Both are accepted.
#[derive(Default)]
pub struct ConnectionAdapter;

#[derive(Debug)]
enum AlfFieldError {
    MissingField(&'static str),
    InvalidMode(String),
    InvalidDuration(String),
    InvalidTime(String),
}

impl fmt::Display for AlfFieldError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AlfFieldError::MissingField(x) => write!(f, "missing field {}", x),
            AlfFieldError::InvalidMode(x) => write!(f, "invalid link mode {}", x),
            AlfFieldError::InvalidDuration(x) => write!(f, "invalid duration {}", x),
            AlfFieldError::InvalidTime(x) => write!(f, "invalid time {}", x),
        }
    }
}

fn parse_mode(field: &str) -> Result<ConnectionMode, AlfFieldError> {
    match field.to_uppercase().as_str() {
        "WALK" => Ok(ConnectionMode::Walk),
        "TRANSFER" | "INTERCHANGE" | "TUBE" | "METRO" | "BUS" | "FERRY" => {
            Ok(ConnectionMode::Interchange)
        }
        x => Err(AlfFieldError::InvalidMode(x.to_string())),
    }
}

fn parse_hhmm(field: &str) -> Result<NaiveTime, AlfFieldError> {
    if field.len() != 4 || !field.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(AlfFieldError::InvalidTime(field.to_string()));
    }
    let hours = field[0..2].parse::<u32>().unwrap_or(99);
    let minutes = field[2..4].parse::<u32>().unwrap_or(99);
    NaiveTime::from_hms_opt(hours, minutes, 0)
        .ok_or_else(|| AlfFieldError::InvalidTime(field.to_string()))
}

impl ConnectionAdapter {
    fn parse_key_value(&self, line: &str) -> Result<Connection, AlfFieldError> {
        let mut mode = None;
        let mut from = None;
        let mut to = None;
        let mut duration = None;
        let mut window_from = None;
        let mut window_until = None;

        for item in line.split(',') {
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            match key.trim() {
                "M" => mode = Some(parse_mode(value.trim())?),
                "O" => from = Some(value.trim().to_uppercase()),
                "D" => to = Some(value.trim().to_uppercase()),
                "T" => {
                    duration = Some(
                        value
                            .trim()
                            .parse::<u32>()
                            .map_err(|_| AlfFieldError::InvalidDuration(value.to_string()))?,
                    )
                }
                "S" => window_from = Some(parse_hhmm(value.trim())?),
                "E" => window_until = Some(parse_hhmm(value.trim())?),
                // priority, day mask and the interchange metadata keys are
                // not part of the stored record shape
                _ => (),
            }
        }

        let valid_window = match (window_from, window_until) {
            (Some(from), Some(until)) => Some(ValidWindow { from, until }),
            _ => None,
        };

        Ok(Connection {
            from_tiploc: from.ok_or(AlfFieldError::MissingField("O"))?,
            to_tiploc: to.ok_or(AlfFieldError::MissingField("D"))?,
            mode: mode.ok_or(AlfFieldError::MissingField("M"))?,
            duration_minutes: duration.ok_or(AlfFieldError::MissingField("T"))?,
            valid_window,
        })
    }

    // legacy tight-packed layout: mode letter, origin 1..8, destination
    // 8..15, minutes 15..18, then an optional hhmm window at 18..26
    fn parse_fixed_width(&self, line: &str) -> Result<Connection, AlfFieldError> {
        let mut padded = line.to_string();
        while padded.len() < 26 {
            padded.push(' ');
        }
        let mode = match &padded[0..1] {
            "W" => ConnectionMode::Walk,
            "I" | "X" => ConnectionMode::Interchange,
            x => return Err(AlfFieldError::InvalidMode(x.to_string())),
        };
        let from = padded[1..8].trim().to_uppercase();
        let to = padded[8..15].trim().to_uppercase();
        if from.is_empty() {
            return Err(AlfFieldError::MissingField("origin"));
        }
        if to.is_empty() {
            return Err(AlfFieldError::MissingField("destination"));
        }
        let duration_field = padded[15..18].trim();
        let duration_minutes = duration_field
            .parse::<u32>()
            .map_err(|_| AlfFieldError::InvalidDuration(duration_field.to_string()))?;

        let valid_window = match (parse_hhmm(&padded[18..22]), parse_hhmm(&padded[22..26])) {
            (Ok(from), Ok(until)) => Some(ValidWindow { from, until }),
            _ => None,
        };

        Ok(Connection {
            from_tiploc: from,
            to_tiploc: to,
            mode,
            duration_minutes,
            valid_window,
        })
    }
}

impl FormatAdapter for ConnectionAdapter {
    type Record = Connection;

    fn parse(&self, data: &[u8]) -> (Vec<Connection>, ParseReport) {
        let mut records = Vec::new();
        let mut report = ParseReport::default();

        let text = String::from_utf8_lossy(data);
        for (index, raw_line) in text.lines().enumerate() {
            let number = index + 1;
            let line = raw_line.trim_end();
            if line.is_empty() || line.starts_with('#') || line.starts_with('/') {
                continue;
            }
            let parsed = if line.contains('=') {
                self.parse_key_value(line)
            } else {
                self.parse_fixed_width(line)
            };
            match parsed {
                Ok(connection) => {
                    report.record();
                    records.push(connection);
                }
                Err(e) => report.error(number, e.to_string()),
            }
        }

        (records, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_variant() {
        let text = "M=WALK,O=AFK,D=ASI,T=5,S=0001,E=2359,P=4,R=0000001\n";
        let (records, report) = ConnectionAdapter.parse(text.as_bytes());
        assert!(report.parse_errors.is_empty());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].from_tiploc, "AFK");
        assert_eq!(records[0].to_tiploc, "ASI");
        assert_eq!(records[0].mode, ConnectionMode::Walk);
        assert_eq!(records[0].duration_minutes, 5);
        let window = records[0].valid_window.unwrap();
        assert_eq!(window.from, NaiveTime::from_hms_opt(0, 1, 0).unwrap());
        assert_eq!(window.until, NaiveTime::from_hms_opt(23, 59, 0).unwrap());
    }

    #[test]
    fn parses_legacy_fixed_width_variant() {
        let text = "IEDINBURGLASGOC005180022000        \n";
        let (records, report) = ConnectionAdapter.parse(text.as_bytes());
        assert!(report.parse_errors.is_empty(), "{:?}", report.parse_errors);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].from_tiploc, "EDINBUR");
        assert_eq!(records[0].to_tiploc, "GLASGOC");
        assert_eq!(records[0].mode, ConnectionMode::Interchange);
        assert_eq!(records[0].duration_minutes, 5);
        let window = records[0].valid_window.unwrap();
        assert_eq!(window.from, NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        assert_eq!(window.until, NaiveTime::from_hms_opt(22, 0, 0).unwrap());
    }

    #[test]
    fn fixed_width_walk_without_window() {
        let text = "WEUSTON EUSTONX004\n";
        let (records, report) = ConnectionAdapter.parse(text.as_bytes());
        assert!(report.parse_errors.is_empty(), "{:?}", report.parse_errors);
        assert_eq!(records[0].from_tiploc, "EUSTON");
        assert_eq!(records[0].to_tiploc, "EUSTONX");
        assert_eq!(records[0].mode, ConnectionMode::Walk);
        assert_eq!(records[0].duration_minutes, 4);
        assert!(records[0].valid_window.is_none());
    }

    #[test]
    fn tube_links_map_to_interchange() {
        let text = "M=TUBE,O=EUS,D=KGX,T=15\n";
        let (records, _) = ConnectionAdapter.parse(text.as_bytes());
        assert_eq!(records[0].mode, ConnectionMode::Interchange);
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let text = "M=WALK,O=AFK,D=ASI,T=5\nM=WALK,O=AFK,T=5\nM=HOVERCRAFT,O=A,D=B,T=1\n# comment\n";
        let (records, report) = ConnectionAdapter.parse(text.as_bytes());
        assert_eq!(records.len(), 1);
        assert_eq!(report.record_count, 3);
        assert_eq!(report.parse_errors.len(), 2);
    }
}
