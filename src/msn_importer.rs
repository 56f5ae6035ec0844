use crate::importer::{FormatAdapter, ParseReport};
use crate::model::{AliasType, Station, StationAlias};

use std::fmt;

/// Adapter for MSN-style master station name files. `A` records carry the
/// station proper, `L` records carry an alias for the station on the
/// preceding `A` record.
#[derive(Default)]
pub struct StationAdapter;

#[derive(Clone, Debug, PartialEq)]
pub enum StationRecord {
    Station(Station),
    Alias(StationAlias),
}

#[derive(Debug)]
enum MsnFieldError {
    MissingName,
    MissingTiploc,
    OrphanAlias,
}

impl fmt::Display for MsnFieldError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MsnFieldError::MissingName => write!(f, "record has no station name"),
            MsnFieldError::MissingTiploc => write!(f, "record has no tiploc"),
            MsnFieldError::OrphanAlias => write!(f, "alias record with no preceding station"),
        }
    }
}

fn pad(line: &str) -> String {
    let mut padded = line.trim_end_matches(['\r', '\n']).to_string();
    while padded.len() < 82 {
        padded.push(' ');
    }
    padded
}

// grid references are in 100 m units with the MSN false origins applied;
// good to a few hundred metres, which is all the dashboard needs
fn grid_to_lat_lon(easting: u32, northing: u32) -> (f64, f64) {
    let east_m = (easting as f64 - 10_000.0) * 100.0;
    let north_m = (northing as f64 - 60_000.0) * 100.0;
    let latitude = 49.0 + (north_m + 100_000.0) / 111_320.0;
    let longitude = -2.0 + (east_m - 400_000.0) / (111_320.0 * latitude.to_radians().cos());
    (latitude, longitude)
}

fn parse_grid_field(field: &str) -> Option<u32> {
    let cleaned = field.trim().trim_start_matches('E').trim_start_matches('N');
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<u32>().ok()
}

impl StationAdapter {
    fn parse_station(&self, line: &str) -> Result<Station, MsnFieldError> {
        let station_name = line[5..35].trim().to_string();
        if station_name.is_empty() {
            return Err(MsnFieldError::MissingName);
        }
        let tiploc = line[36..44].trim().to_string();
        if tiploc.is_empty() {
            return Err(MsnFieldError::MissingTiploc);
        }
        let crs_code = match line[49..52].trim() {
            "" => None,
            crs => Some(crs.to_uppercase()),
        };

        let easting = parse_grid_field(&line[53..58]);
        let northing = parse_grid_field(&line[58..64]);
        // the invariant is both-or-neither, so a half-parsed grid reference
        // is treated as absent
        let (latitude, longitude) = match (easting, northing) {
            (Some(east), Some(north)) => {
                let (lat, lon) = grid_to_lat_lon(east, north);
                (Some(lat), Some(lon))
            }
            _ => (None, None),
        };

        Ok(Station {
            tiploc,
            crs_code,
            station_name,
            country: None,
            region: None,
            latitude,
            longitude,
            is_active: true,
        })
    }

    fn parse_alias(&self, line: &str, owner: &str) -> Result<StationAlias, MsnFieldError> {
        let alias_name = line[36..66].trim().to_string();
        if alias_name.is_empty() {
            return Err(MsnFieldError::MissingName);
        }
        Ok(StationAlias {
            tiploc: owner.to_string(),
            alias_name,
            alias_type: AliasType::Common,
            is_primary: false,
        })
    }
}

impl FormatAdapter for StationAdapter {
    type Record = StationRecord;

    fn parse(&self, data: &[u8]) -> (Vec<StationRecord>, ParseReport) {
        let mut records = Vec::new();
        let mut report = ParseReport::default();
        let mut last_tiploc: Option<String> = None;

        let text = String::from_utf8_lossy(data);
        for (index, raw_line) in text.lines().enumerate() {
            let number = index + 1;
            if raw_line.trim().is_empty() {
                continue;
            }
            let line = pad(raw_line);
            match &line[0..1] {
                "A" => match self.parse_station(&line) {
                    Ok(station) => {
                        report.record();
                        last_tiploc = Some(station.tiploc.clone());
                        records.push(StationRecord::Station(station));
                    }
                    Err(e) => report.error(number, e.to_string()),
                },
                "L" => match &last_tiploc {
                    Some(owner) => match self.parse_alias(&line, owner) {
                        Ok(alias) => {
                            report.record();
                            records.push(StationRecord::Alias(alias));
                        }
                        Err(e) => report.error(number, e.to_string()),
                    },
                    None => report.error(number, MsnFieldError::OrphanAlias.to_string()),
                },
                // header, routing group and trailer records
                _ => (),
            }
        }

        (records, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a_record(name: &str, tiploc: &str, crs: &str, easting: &str, northing: &str) -> String {
        let mut line = String::new();
        line.push('A');
        line.push_str("    ");
        line.push_str(&format!("{:<30}", name));
        line.push('2'); // interchange status
        line.push_str(&format!("{:<8}", tiploc));
        line.push_str(&format!("{:<3}", crs)); // subsidiary CRS
        line.push_str("  ");
        line.push_str(&format!("{:<3}", crs));
        line.push(' ');
        line.push_str(&format!("{:<5}", easting));
        line.push_str(&format!("{:<6}", northing));
        line.push('4');
        line
    }

    fn l_record(alias: &str) -> String {
        format!("L    {:<31}{:<30}", "", alias)
    }

    #[test]
    fn parses_station_with_coordinates() {
        let text = a_record("EDINBURGH", "EDINBUR", "EDB", "13257", "66737");
        let (records, report) = StationAdapter.parse(text.as_bytes());
        assert!(report.parse_errors.is_empty());
        assert_eq!(records.len(), 1);
        let StationRecord::Station(station) = &records[0] else {
            panic!("expected a station record");
        };
        assert_eq!(station.tiploc, "EDINBUR");
        assert_eq!(station.crs_code.as_deref(), Some("EDB"));
        assert_eq!(station.station_name, "EDINBURGH");
        assert!(station.is_active);
        let latitude = station.latitude.unwrap();
        let longitude = station.longitude.unwrap();
        assert!((latitude - 55.95).abs() < 0.05, "latitude {}", latitude);
        assert!((longitude + 3.19).abs() < 0.05, "longitude {}", longitude);
    }

    #[test]
    fn alias_attaches_to_preceding_station() {
        let mut text = a_record("EDINBURGH", "EDINBUR", "EDB", "13257", "66737");
        text.push('\n');
        text.push_str(&l_record("EDINBURGH WAVERLEY"));
        let (records, report) = StationAdapter.parse(text.as_bytes());
        assert!(report.parse_errors.is_empty());
        assert_eq!(records.len(), 2);
        let StationRecord::Alias(alias) = &records[1] else {
            panic!("expected an alias record");
        };
        assert_eq!(alias.tiploc, "EDINBUR");
        assert_eq!(alias.alias_name, "EDINBURGH WAVERLEY");
    }

    #[test]
    fn orphan_alias_and_blank_name_are_counted() {
        let mut text = l_record("LONELY ALIAS");
        text.push('\n');
        text.push_str(&a_record("", "NOWHERE", "NWH", "", ""));
        let (records, report) = StationAdapter.parse(text.as_bytes());
        assert!(records.is_empty());
        assert_eq!(report.parse_errors.len(), 2);
    }

    #[test]
    fn missing_grid_reference_leaves_both_coordinates_empty() {
        let text = a_record("SOMEWHERE", "SMWHERE", "SMW", "13259", "");
        let (records, _) = StationAdapter.parse(text.as_bytes());
        let StationRecord::Station(station) = &records[0] else {
            panic!("expected a station record");
        };
        assert!(station.latitude.is_none());
        assert!(station.longitude.is_none());
    }
}
