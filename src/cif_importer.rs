use crate::importer::{FormatAdapter, ParseReport};
use crate::model::{
    DaysRun, Schedule, ScheduleStop, ServiceAttributes, ServiceType, StopType, StpIndicator,
};

use chrono::{NaiveDate, NaiveTime};

use std::fmt;

/// Adapter for CIF-style schedule files. Emits one record per train: the
/// schedule header plus its stops, with `schedule_id` left at zero for the
/// store to assign. Cancellation records (STP indicator C) carry no stops.
#[derive(Default)]
pub struct ScheduleAdapter;

#[derive(Clone, Debug, PartialEq)]
pub struct TrainRecord {
    pub schedule: Schedule,
    pub stops: Vec<ScheduleStop>,
}

#[derive(Debug)]
enum CifFieldError {
    InvalidRecordType(String),
    InvalidTransactionType(String),
    InvalidStpIndicator(String),
    InvalidDate(String),
    InvalidTime(String),
    InvalidDaysOfWeek(String),
    InvalidSpeed(String),
    MissingOrigin,
    MissingTerminus,
    StopsOutsideTrain(String),
}

impl fmt::Display for CifFieldError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CifFieldError::InvalidRecordType(x) => write!(f, "invalid record type {}", x),
            CifFieldError::InvalidTransactionType(x) => {
                write!(f, "invalid transaction type {}", x)
            }
            CifFieldError::InvalidStpIndicator(x) => write!(f, "invalid STP indicator {}", x),
            CifFieldError::InvalidDate(x) => write!(f, "invalid date {}", x),
            CifFieldError::InvalidTime(x) => write!(f, "invalid time {}", x),
            CifFieldError::InvalidDaysOfWeek(x) => write!(f, "invalid days of week {}", x),
            CifFieldError::InvalidSpeed(x) => write!(f, "invalid speed {}", x),
            CifFieldError::MissingOrigin => write!(f, "train has no origin record"),
            CifFieldError::MissingTerminus => write!(f, "train has no terminus record"),
            CifFieldError::StopsOutsideTrain(x) => {
                write!(f, "{} record with no open BS record", x)
            }
        }
    }
}

// records are nominally 80 columns; short lines are padded so the fixed
// slices below never fall off the end
fn pad(line: &str) -> String {
    let mut padded = line.trim_end_matches(['\r', '\n']).to_string();
    while padded.len() < 80 {
        padded.push(' ');
    }
    padded
}

fn trimmed(field: &str) -> Option<String> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_date(field: &str) -> Result<NaiveDate, CifFieldError> {
    NaiveDate::parse_from_str(field, "%y%m%d")
        .map_err(|_| CifFieldError::InvalidDate(field.to_string()))
}

// working times are hhmm with an optional trailing H for the half minute,
// which we drop; all blank means no time at this calling point
fn parse_time(field: &str) -> Result<Option<NaiveTime>, CifFieldError> {
    let field = field.trim().trim_end_matches('H');
    if field.is_empty() {
        return Ok(None);
    }
    if field.len() != 4 || !field.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(CifFieldError::InvalidTime(field.to_string()));
    }
    let hours = field[0..2].parse::<u32>().unwrap_or(99);
    let minutes = field[2..4].parse::<u32>().unwrap_or(99);
    match NaiveTime::from_hms_opt(hours, minutes, 0) {
        Some(time) => Ok(Some(time)),
        None => Err(CifFieldError::InvalidTime(field.to_string())),
    }
}

fn parse_stp(field: &str) -> Result<StpIndicator, CifFieldError> {
    match field {
        "P" | " " => Ok(StpIndicator::Permanent),
        "N" => Ok(StpIndicator::New),
        "O" => Ok(StpIndicator::Overlay),
        "C" => Ok(StpIndicator::Cancelled),
        x => Err(CifFieldError::InvalidStpIndicator(x.to_string())),
    }
}

// the train status column gives the coarse split; the category column
// refines it where the status is blank or contradictory
fn parse_service_type(status: &str, category: &str) -> ServiceType {
    match category {
        "OL" | "OO" | "OU" | "OW" | "XC" | "XD" | "XI" | "XR" | "XU" | "XX" | "XZ" | "BR"
        | "BS" | "SS" => return ServiceType::Passenger,
        "DD" | "DH" | "DI" | "DQ" | "DT" | "DY" | "H0" | "H1" | "H2" | "H3" | "H4" | "H5"
        | "H6" | "H8" | "H9" | "J2" | "J3" | "J4" | "J5" | "J6" | "J8" | "J9" | "A0" | "B0"
        | "B1" | "B4" | "B5" | "B6" | "B7" | "E0" => return ServiceType::Freight,
        "EE" | "EL" | "ES" | "JJ" | "PM" | "PP" | "PV" | "ZB" | "ZZ" | "OS" => {
            return ServiceType::Other
        }
        _ => (),
    }
    match status {
        "P" | "1" | "B" | "5" | "S" | "4" => ServiceType::Passenger,
        "F" | "2" => ServiceType::Freight,
        _ => ServiceType::Other,
    }
}

fn parse_seating_class(field: &str) -> Option<String> {
    match field {
        "B" => Some("First and standard".to_string()),
        "S" => Some("Standard only".to_string()),
        "F" => Some("First only".to_string()),
        _ => None,
    }
}

fn parse_sleepers(field: &str) -> Option<String> {
    match field {
        "B" => Some("First and standard class sleepers".to_string()),
        "F" => Some("First class sleepers".to_string()),
        "S" => Some("Standard class sleepers".to_string()),
        _ => None,
    }
}

fn parse_reservations(field: &str) -> Option<String> {
    match field {
        "A" => Some("Reservations mandatory".to_string()),
        "E" => Some("Reservations for bicycles essential".to_string()),
        "R" => Some("Reservations recommended".to_string()),
        "S" => Some("Reservations possible".to_string()),
        _ => None,
    }
}

fn parse_catering(field: &str) -> Option<String> {
    let mut services = Vec::new();
    for code in field.chars() {
        match code {
            'C' => services.push("Buffet"),
            'F' => services.push("Restaurant for first class"),
            'H' => services.push("Hot food"),
            'M' => services.push("Meal for first class"),
            'R' => services.push("Restaurant"),
            'T' => services.push("Trolley"),
            _ => (),
        }
    }
    if services.is_empty() {
        None
    } else {
        Some(services.join(", "))
    }
}

struct OpenTrain {
    schedule: Schedule,
    stops: Vec<ScheduleStop>,
    sequence: u32,
    saw_terminus: bool,
}

impl ScheduleAdapter {
    fn parse_bs(&self, line: &str) -> Result<Option<OpenTrain>, CifFieldError> {
        match &line[2..3] {
            "N" | "R" => (),
            // deletes carry no stop records and nothing we store
            "D" => return Ok(None),
            x => return Err(CifFieldError::InvalidTransactionType(x.to_string())),
        }

        let train_uid = line[3..9].trim().to_string();
        let start_date = parse_date(&line[9..15])?;
        let end_date = parse_date(&line[15..21])?;
        let days_run = DaysRun::from_mask(&line[21..28])
            .ok_or_else(|| CifFieldError::InvalidDaysOfWeek(line[21..28].to_string()))?;
        let service_type = parse_service_type(&line[29..30], &line[30..32]);
        let headcode = trimmed(&line[32..36]);
        let speed_mph = match line[57..60].trim() {
            "" => None,
            x => Some(
                x.parse::<u16>()
                    .map_err(|_| CifFieldError::InvalidSpeed(x.to_string()))?,
            ),
        };
        let stp_indicator = parse_stp(&line[79..80])?;

        let schedule = Schedule {
            schedule_id: 0,
            train_uid,
            headcode,
            operator_code: "ZZ".to_string(), // refined by the BX record
            service_type,
            start_date,
            end_date,
            days_run,
            stp_indicator,
            attributes: ServiceAttributes {
                speed_mph,
                train_class: parse_seating_class(&line[66..67]),
                sleepers: parse_sleepers(&line[67..68]),
                reservations: parse_reservations(&line[68..69]),
                catering: parse_catering(&line[70..74]),
            },
        };

        Ok(Some(OpenTrain {
            schedule,
            stops: Vec::new(),
            sequence: 0,
            saw_terminus: false,
        }))
    }

    fn parse_lo(&self, line: &str, train: &mut OpenTrain) -> Result<(), CifFieldError> {
        let departure = parse_time(&line[10..15])?;
        train.stops.push(ScheduleStop {
            schedule_id: 0,
            sequence: train.sequence,
            tiploc: line[2..9].trim().to_string(),
            stop_type: StopType::Origin,
            arrival_time: None,
            departure_time: departure,
            pass_time: None,
            platform: trimmed(&line[19..22]),
            activities: trimmed(&line[29..41]),
        });
        train.sequence += 1;
        Ok(())
    }

    fn parse_li(&self, line: &str, train: &mut OpenTrain) -> Result<(), CifFieldError> {
        let arrival = parse_time(&line[10..15])?;
        let departure = parse_time(&line[15..20])?;
        let pass = parse_time(&line[20..25])?;
        let stop_type = if pass.is_some() {
            StopType::Pass
        } else {
            StopType::Intermediate
        };
        train.stops.push(ScheduleStop {
            schedule_id: 0,
            sequence: train.sequence,
            tiploc: line[2..9].trim().to_string(),
            stop_type,
            arrival_time: arrival,
            departure_time: departure,
            pass_time: pass,
            platform: trimmed(&line[33..36]),
            activities: trimmed(&line[42..54]),
        });
        train.sequence += 1;
        Ok(())
    }

    fn parse_lt(&self, line: &str, train: &mut OpenTrain) -> Result<(), CifFieldError> {
        let arrival = parse_time(&line[10..15])?;
        train.stops.push(ScheduleStop {
            schedule_id: 0,
            sequence: train.sequence,
            tiploc: line[2..9].trim().to_string(),
            stop_type: StopType::Terminus,
            arrival_time: arrival,
            departure_time: None,
            pass_time: None,
            platform: trimmed(&line[19..22]),
            activities: trimmed(&line[25..37]),
        });
        train.sequence += 1;
        train.saw_terminus = true;
        Ok(())
    }

    fn close_train(
        &self,
        train: OpenTrain,
        line_number: usize,
        records: &mut Vec<TrainRecord>,
        report: &mut ParseReport,
    ) {
        report.record();
        if train.schedule.stp_indicator == StpIndicator::Cancelled {
            // STP cancellations are bare BS records: no route, just a date
            // range to suppress
            records.push(TrainRecord {
                schedule: train.schedule,
                stops: Vec::new(),
            });
            return;
        }
        if train.stops.first().map(|stop| stop.stop_type) != Some(StopType::Origin) {
            report.parse_errors.push(format!(
                "line {}: {}",
                line_number,
                CifFieldError::MissingOrigin
            ));
            return;
        }
        if !train.saw_terminus {
            report.parse_errors.push(format!(
                "line {}: {}",
                line_number,
                CifFieldError::MissingTerminus
            ));
            return;
        }
        records.push(TrainRecord {
            schedule: train.schedule,
            stops: train.stops,
        });
    }
}

impl FormatAdapter for ScheduleAdapter {
    type Record = TrainRecord;

    fn parse(&self, data: &[u8]) -> (Vec<TrainRecord>, ParseReport) {
        let mut records = Vec::new();
        let mut report = ParseReport::default();
        let mut open: Option<OpenTrain> = None;

        let text = String::from_utf8_lossy(data);
        for (index, raw_line) in text.lines().enumerate() {
            let number = index + 1;
            if raw_line.trim().is_empty() {
                continue;
            }
            let line = pad(raw_line);
            match &line[0..2] {
                "BS" => {
                    if let Some(train) = open.take() {
                        self.close_train(train, number, &mut records, &mut report);
                    }
                    match self.parse_bs(&line) {
                        Ok(train) => open = train,
                        Err(e) => report.error(number, e.to_string()),
                    }
                }
                "BX" => {
                    if let Some(ref mut train) = open {
                        if let Some(atoc) = trimmed(&line[11..13]) {
                            train.schedule.operator_code = atoc;
                        }
                    }
                }
                "LO" | "LI" | "LT" => {
                    let record_type = line[0..2].to_string();
                    let mut abandon = false;
                    match open {
                        Some(ref mut train) => {
                            let result = match record_type.as_str() {
                                "LO" => self.parse_lo(&line, train),
                                "LI" => self.parse_li(&line, train),
                                _ => self.parse_lt(&line, train),
                            };
                            if let Err(e) = result {
                                report.error(number, e.to_string());
                                abandon = true;
                            }
                        }
                        None => {
                            report.error(number, CifFieldError::StopsOutsideTrain(record_type).to_string());
                        }
                    }
                    if abandon {
                        open = None;
                    }
                }
                // header, trailer, tiploc and association records carry
                // nothing this store keeps
                "HD" | "ZZ" | "TI" | "TA" | "TD" | "AA" | "CR" => (),
                x => report.error(number, CifFieldError::InvalidRecordType(x.to_string()).to_string()),
            }
        }
        if let Some(train) = open.take() {
            let line_count = text.lines().count();
            self.close_train(train, line_count, &mut records, &mut report);
        }

        (records, report)
    }
}
