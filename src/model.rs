use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

// times travel as "HH:MM" everywhere: the snapshot file, the JSON API and
// the dashboard all use the same rendering
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, "%H:%M").map_err(serde::de::Error::custom)
    }
}

pub mod hhmm_opt {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        time: &Option<NaiveTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => serializer.serialize_some(&t.format("%H:%M").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveTime>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(s) => NaiveTime::parse_from_str(&s, "%H:%M")
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Minutes from `from` to `to` within one service day. A target earlier
/// than the start is read as crossing midnight into the next day, which is
/// how wrap-around stop times are interpreted for durations.
pub fn minutes_between(from: NaiveTime, to: NaiveTime) -> i64 {
    let delta = to.signed_duration_since(from).num_minutes();
    if delta < 0 {
        delta + 24 * 60
    } else {
        delta
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub tiploc: String,
    pub crs_code: Option<String>,
    pub station_name: String,
    pub country: Option<String>,
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasType {
    Common,
    Official,
    Historical,
    Colloquial,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationAlias {
    pub tiploc: String, // canonical tiploc of the owning station
    pub alias_name: String,
    pub alias_type: AliasType,
    pub is_primary: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TiplocMapping {
    pub source_tiploc: String,
    pub canonical_tiploc: String,
    pub data_source: String,
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Passenger,
    Freight,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StpIndicator {
    Permanent,
    New,
    Overlay,
    Cancelled,
}

impl StpIndicator {
    // cancelled > overlay > new > permanent
    pub fn precedence(&self) -> u8 {
        match self {
            StpIndicator::Cancelled => 3,
            StpIndicator::Overlay => 2,
            StpIndicator::New => 1,
            StpIndicator::Permanent => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaysRun {
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
    pub sunday: bool,
}

impl DaysRun {
    pub fn get_by_weekday(&self, weekday: Weekday) -> bool {
        match weekday {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }

    /// Parse a seven-character 0/1 mask, Monday first.
    pub fn from_mask(mask: &str) -> Option<DaysRun> {
        let bits = mask.chars().collect::<Vec<char>>();
        if bits.len() != 7 || bits.iter().any(|c| *c != '0' && *c != '1') {
            return None;
        }
        Some(DaysRun {
            monday: bits[0] == '1',
            tuesday: bits[1] == '1',
            wednesday: bits[2] == '1',
            thursday: bits[3] == '1',
            friday: bits[4] == '1',
            saturday: bits[5] == '1',
            sunday: bits[6] == '1',
        })
    }

    pub fn never() -> DaysRun {
        DaysRun {
            monday: false,
            tuesday: false,
            wednesday: false,
            thursday: false,
            friday: false,
            saturday: false,
            sunday: false,
        }
    }

    pub fn any(&self) -> bool {
        self.into_iter().any(|day| day)
    }
}

impl IntoIterator for &DaysRun {
    type Item = bool;
    type IntoIter = std::array::IntoIter<bool, 7>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIterator::into_iter([
            self.monday,
            self.tuesday,
            self.wednesday,
            self.thursday,
            self.friday,
            self.saturday,
            self.sunday,
        ])
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceAttributes {
    pub speed_mph: Option<u16>,
    pub train_class: Option<String>,
    pub sleepers: Option<String>,
    pub reservations: Option<String>,
    pub catering: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: u64,
    pub train_uid: String,
    pub headcode: Option<String>,
    pub operator_code: String,
    pub service_type: ServiceType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub days_run: DaysRun,
    pub stp_indicator: StpIndicator,
    pub attributes: ServiceAttributes,
}

impl Schedule {
    /// Active means the date falls inside the validity window (inclusive at
    /// both ends) and the day-of-week bit is set.
    pub fn active_on(&self, date: NaiveDate) -> bool {
        self.start_date <= date
            && date <= self.end_date
            && self.days_run.get_by_weekday(date.weekday())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopType {
    Origin,
    Intermediate,
    Terminus,
    Pass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStop {
    pub schedule_id: u64,
    pub sequence: u32,
    pub tiploc: String,
    pub stop_type: StopType,
    #[serde(default, with = "hhmm_opt", skip_serializing_if = "Option::is_none")]
    pub arrival_time: Option<NaiveTime>,
    #[serde(default, with = "hhmm_opt", skip_serializing_if = "Option::is_none")]
    pub departure_time: Option<NaiveTime>,
    #[serde(default, with = "hhmm_opt", skip_serializing_if = "Option::is_none")]
    pub pass_time: Option<NaiveTime>,
    pub platform: Option<String>,
    pub activities: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Walk,
    Interchange,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from_tiploc: String,
    pub to_tiploc: String,
    pub mode: ConnectionMode,
    pub duration_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_window: Option<ValidWindow>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidWindow {
    #[serde(with = "hhmm")]
    pub from: NaiveTime,
    #[serde(with = "hhmm")]
    pub until: NaiveTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Schedule,
    Station,
    Connection,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub file_type: FileType,
    pub file_hash: String,
    pub sequence_number: u64,
    pub record_count: u64,
    pub records_imported: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub errors: Vec<String>,
}

/// A cancellation as decoded off the push-port wire, before enrichment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub rid: String,
    pub train_service_code: Option<String>,
    pub reason_code: Option<String>,
    pub reason_text: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceOrigin {
    pub tiploc: String,
    pub station_name: Option<String>,
    #[serde(with = "hhmm")]
    pub scheduled_departure: NaiveTime,
    pub platform: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceDestination {
    pub tiploc: String,
    pub station_name: Option<String>,
    #[serde(with = "hhmm")]
    pub scheduled_arrival: NaiveTime,
    pub platform: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallingPoint {
    pub tiploc: String,
    pub station_name: Option<String>,
    #[serde(default, with = "hhmm_opt", skip_serializing_if = "Option::is_none")]
    pub arrival: Option<NaiveTime>,
    #[serde(default, with = "hhmm_opt", skip_serializing_if = "Option::is_none")]
    pub departure: Option<NaiveTime>,
    pub platform: Option<String>,
}

/// A cancellation held in the cache. The schedule projection is a value
/// copy taken at decode time, so entries stay meaningful across store
/// re-imports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveCancellation {
    pub rid: String,
    pub train_service_code: Option<String>,
    pub reason_code: Option<String>,
    pub reason_text: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub darwin_enriched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ServiceOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<ServiceDestination>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calling_points: Vec<CallingPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn days_run_mask_round_trip() {
        let days = DaysRun::from_mask("1111100").unwrap();
        assert!(days.monday && days.friday);
        assert!(!days.saturday && !days.sunday);
        assert!(days.any());
        assert!(!DaysRun::never().any());
        assert!(DaysRun::from_mask("111110").is_none());
        assert!(DaysRun::from_mask("11111x0").is_none());
    }

    #[test]
    fn schedule_active_inclusive_at_both_ends() {
        let schedule = Schedule {
            schedule_id: 1,
            train_uid: "C12345".to_string(),
            headcode: None,
            operator_code: "VT".to_string(),
            service_type: ServiceType::Passenger,
            start_date: NaiveDate::from_ymd_opt(2025, 12, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 12, 5).unwrap(),
            days_run: DaysRun::from_mask("1111100").unwrap(),
            stp_indicator: StpIndicator::Permanent,
            attributes: ServiceAttributes::default(),
        };
        assert!(schedule.active_on(NaiveDate::from_ymd_opt(2025, 12, 1).unwrap()));
        assert!(schedule.active_on(NaiveDate::from_ymd_opt(2025, 12, 5).unwrap()));
        assert!(!schedule.active_on(NaiveDate::from_ymd_opt(2025, 11, 30).unwrap()));
        assert!(!schedule.active_on(NaiveDate::from_ymd_opt(2025, 12, 6).unwrap()));
    }

    #[test]
    fn days_run_mask_all_zero_never_active() {
        let schedule = Schedule {
            schedule_id: 2,
            train_uid: "C00000".to_string(),
            headcode: None,
            operator_code: "SR".to_string(),
            service_type: ServiceType::Passenger,
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
            days_run: DaysRun::from_mask("0000000").unwrap(),
            stp_indicator: StpIndicator::Permanent,
            attributes: ServiceAttributes::default(),
        };
        let mut date = schedule.start_date;
        for _ in 0..7 {
            assert!(!schedule.active_on(date));
            date = date.succ_opt().unwrap();
        }
    }

    #[test]
    fn durations_cross_midnight_forwards() {
        let dep = NaiveTime::from_hms_opt(23, 40, 0).unwrap();
        let arr = NaiveTime::from_hms_opt(0, 25, 0).unwrap();
        assert_eq!(minutes_between(dep, arr), 45);
        assert_eq!(minutes_between(arr, dep), 23 * 60 + 15);
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        assert_eq!(minutes_between(noon, noon), 0);
    }

    #[test]
    fn hhmm_serde_round_trip() {
        let stop = ScheduleStop {
            schedule_id: 1,
            sequence: 0,
            tiploc: "EUSTON".to_string(),
            stop_type: StopType::Origin,
            arrival_time: None,
            departure_time: NaiveTime::from_hms_opt(18, 0, 0),
            pass_time: None,
            platform: Some("2".to_string()),
            activities: None,
        };
        let json = serde_json::to_value(&stop).unwrap();
        assert_eq!(json["departure_time"], "18:00");
        assert!(json.get("arrival_time").is_none());
        let back: ScheduleStop = serde_json::from_value(json).unwrap();
        assert_eq!(back, stop);
    }
}
