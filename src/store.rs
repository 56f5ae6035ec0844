use crate::alf_importer::ConnectionAdapter;
use crate::cif_importer::ScheduleAdapter;
use crate::importer::{detect_file_type, FormatAdapter};
use crate::model::{
    Connection, FileType, ImportRecord, Schedule, ScheduleStop, Station, StationAlias,
    StopType, StpIndicator, TiplocMapping,
};
use crate::msn_importer::{StationAdapter, StationRecord};
use crate::resolver;

use chrono::offset::Utc;
use chrono::{Days, NaiveDate, TimeZone};
use chrono_tz::Europe::London;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
pub enum StoreError {
    IoError(std::io::Error),
    SnapshotError(serde_json::Error),
    InvalidSchedule(String),
    UnknownFileType(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::IoError(x) => write!(f, "Schedule store I/O error: {}", x),
            StoreError::SnapshotError(x) => write!(f, "Schedule store snapshot error: {}", x),
            StoreError::InvalidSchedule(x) => write!(f, "Invalid schedule: {}", x),
            StoreError::UnknownFileType(x) => {
                write!(f, "Cannot tell what kind of schedule file {} is", x)
            }
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        StoreError::IoError(error)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::SnapshotError(error)
    }
}

/// Split a push-port RID into its service date (leading eight digits) and
/// train UID segment (trailing six characters, letter first). Returns None
/// for the date or UID piece it cannot find.
pub fn parse_rid(rid: &str) -> (Option<NaiveDate>, Option<String>) {
    let date = if rid.len() >= 8 && rid[0..8].bytes().all(|byte| byte.is_ascii_digit()) {
        NaiveDate::parse_from_str(&rid[0..8], "%Y%m%d").ok()
    } else {
        None
    };
    let uid = if rid.len() >= 14 {
        let tail = &rid[rid.len() - 6..];
        let mut bytes = tail.bytes();
        let first_is_letter = bytes.next().map(|b| b.is_ascii_uppercase()).unwrap_or(false);
        if first_is_letter && bytes.all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            Some(tail.to_string())
        } else {
            None
        }
    } else {
        None
    };
    (date, uid)
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResolveOutcome {
    Resolved(Schedule, Vec<ScheduleStop>),
    NoRid,
    NoSchedule,
    Ambiguous,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportDisposition {
    Accept,
    Duplicate,
    Replace,
}

#[derive(Clone, Debug, Serialize)]
pub struct StoreStatistics {
    pub schedules: usize,
    pub stops: usize,
    pub stations: usize,
    pub connections: usize,
    pub imports: usize,
    pub last_import_success: Option<bool>,
    pub db_size_bytes: u64,
}

// everything the snapshot file holds; the lookup indices are rebuilt on
// load rather than persisted
#[derive(Clone, Default, Serialize, Deserialize)]
struct StoreData {
    stations: HashMap<String, Station>,
    aliases: HashMap<String, Vec<StationAlias>>,
    mappings: HashMap<String, Vec<TiplocMapping>>,
    schedules: HashMap<u64, Schedule>,
    stops: HashMap<u64, Vec<ScheduleStop>>,
    connections: HashMap<String, Vec<Connection>>,
    imports: Vec<ImportRecord>,
    next_schedule_id: u64,
    #[serde(skip)]
    index: StoreIndex,
}

#[derive(Clone, Default)]
struct StoreIndex {
    by_crs: HashMap<String, String>,
    by_name: HashMap<String, String>,
    by_uid: HashMap<String, Vec<u64>>,
}

impl StoreData {
    fn rebuild_index(&mut self) {
        let mut index = StoreIndex::default();
        for station in self.stations.values() {
            if let Some(crs) = &station.crs_code {
                index.by_crs.insert(crs.clone(), station.tiploc.clone());
            }
            index
                .by_name
                .insert(resolver::normalize(&station.station_name), station.tiploc.clone());
        }
        for (id, schedule) in &self.schedules {
            index
                .by_uid
                .entry(schedule.train_uid.clone())
                .or_default()
                .push(*id);
        }
        for ids in index.by_uid.values_mut() {
            ids.sort_unstable();
        }
        self.index = index;
    }

    fn put_station(&mut self, mut station: Station) {
        station.tiploc = station.tiploc.trim().to_uppercase();
        station.crs_code = station
            .crs_code
            .map(|crs| crs.trim().to_uppercase())
            .filter(|crs| !crs.is_empty());
        // coordinates are both-or-neither
        if station.latitude.is_none() || station.longitude.is_none() {
            station.latitude = None;
            station.longitude = None;
        }
        if let Some(previous) = self.stations.get(&station.tiploc) {
            if let Some(crs) = &previous.crs_code {
                self.index.by_crs.remove(crs);
            }
            self.index
                .by_name
                .remove(&resolver::normalize(&previous.station_name));
        }
        if let Some(crs) = &station.crs_code {
            self.index.by_crs.insert(crs.clone(), station.tiploc.clone());
        }
        self.index
            .by_name
            .insert(resolver::normalize(&station.station_name), station.tiploc.clone());
        self.stations.insert(station.tiploc.clone(), station);
    }

    fn put_alias(&mut self, alias: StationAlias) {
        let entry = self.aliases.entry(alias.tiploc.clone()).or_default();
        if alias.is_primary {
            // at most one primary alias per station
            for existing in entry.iter_mut() {
                existing.is_primary = false;
            }
        }
        entry.retain(|existing| existing.alias_name != alias.alias_name);
        entry.push(alias);
    }

    fn put_mapping(&mut self, mapping: TiplocMapping) {
        let entry = self.mappings.entry(mapping.source_tiploc.clone()).or_default();
        entry.retain(|existing| existing.data_source != mapping.data_source);
        entry.push(mapping);
    }

    fn put_connection(&mut self, connection: Connection) {
        let entry = self
            .connections
            .entry(connection.from_tiploc.clone())
            .or_default();
        entry.retain(|existing| {
            existing.to_tiploc != connection.to_tiploc || existing.mode != connection.mode
        });
        entry.push(connection);
    }

    fn validate_stops(schedule: &Schedule, stops: &[ScheduleStop]) -> Result<(), StoreError> {
        if schedule.stp_indicator == StpIndicator::Cancelled && stops.is_empty() {
            return Ok(());
        }
        let origins = stops
            .iter()
            .filter(|stop| stop.stop_type == StopType::Origin)
            .count();
        let termini = stops
            .iter()
            .filter(|stop| stop.stop_type == StopType::Terminus)
            .count();
        if origins != 1 || termini != 1 {
            return Err(StoreError::InvalidSchedule(format!(
                "{} needs exactly one origin and one terminus, got {} and {}",
                schedule.train_uid, origins, termini
            )));
        }
        for (position, stop) in stops.iter().enumerate() {
            if stop.sequence != position as u32 {
                return Err(StoreError::InvalidSchedule(format!(
                    "{} stop sequence is not dense at position {}",
                    schedule.train_uid, position
                )));
            }
            let time_ok = match stop.stop_type {
                StopType::Origin => stop.departure_time.is_some(),
                StopType::Terminus => stop.arrival_time.is_some(),
                StopType::Pass => stop.pass_time.is_some(),
                StopType::Intermediate => {
                    stop.arrival_time.is_some() || stop.departure_time.is_some()
                }
            };
            if !time_ok {
                return Err(StoreError::InvalidSchedule(format!(
                    "{} stop {} at {} is missing its defining time",
                    schedule.train_uid, stop.sequence, stop.tiploc
                )));
            }
        }
        Ok(())
    }

    fn put_schedule(
        &mut self,
        mut schedule: Schedule,
        mut stops: Vec<ScheduleStop>,
    ) -> Result<u64, StoreError> {
        if schedule.start_date > schedule.end_date {
            return Err(StoreError::InvalidSchedule(format!(
                "{} runs from {} to {}",
                schedule.train_uid, schedule.start_date, schedule.end_date
            )));
        }
        stops.sort_by_key(|stop| stop.sequence);
        Self::validate_stops(&schedule, &stops)?;

        // (train_uid, start_date, stp_indicator) is unique; a re-import of
        // the same triple replaces the earlier row
        let replaced = self
            .schedules
            .iter()
            .find(|(_, existing)| {
                existing.train_uid == schedule.train_uid
                    && existing.start_date == schedule.start_date
                    && existing.stp_indicator == schedule.stp_indicator
            })
            .map(|(id, _)| *id);
        if let Some(id) = replaced {
            self.remove_schedule(id);
        }

        self.next_schedule_id += 1;
        let id = self.next_schedule_id;
        schedule.schedule_id = id;
        for stop in stops.iter_mut() {
            stop.schedule_id = id;
        }
        self.index
            .by_uid
            .entry(schedule.train_uid.clone())
            .or_default()
            .push(id);
        self.schedules.insert(id, schedule);
        self.stops.insert(id, stops);
        Ok(id)
    }

    fn remove_schedule(&mut self, id: u64) {
        if let Some(schedule) = self.schedules.remove(&id) {
            self.stops.remove(&id);
            if let Some(ids) = self.index.by_uid.get_mut(&schedule.train_uid) {
                ids.retain(|existing| *existing != id);
                if ids.is_empty() {
                    self.index.by_uid.remove(&schedule.train_uid);
                }
            }
        }
    }

    fn canonical_tiploc(&self, key: &str) -> String {
        match self.mappings.get(key).and_then(|list| list.first()) {
            Some(mapping) => mapping.canonical_tiploc.clone(),
            None => key.to_string(),
        }
    }

    fn lookup_station(&self, key: &str) -> Option<Station> {
        let folded = self.canonical_tiploc(key.trim().to_uppercase().as_str());
        if let Some(station) = self.stations.get(&folded) {
            return Some(station.clone());
        }
        if let Some(tiploc) = self.index.by_crs.get(&folded) {
            return self.stations.get(tiploc).cloned();
        }
        if let Some(tiploc) = self.index.by_name.get(&resolver::normalize(key)) {
            return self.stations.get(tiploc).cloned();
        }
        for aliases in self.aliases.values() {
            for alias in aliases {
                if resolver::normalize(&alias.alias_name) == resolver::normalize(key) {
                    return self.stations.get(&alias.tiploc).cloned();
                }
            }
        }
        None
    }

    // STP precedence on one service date: a cancellation overlay suppresses
    // the whole date, otherwise overlay beats new beats permanent
    fn effective_schedule(&self, uid: &str, date: NaiveDate) -> ResolveOutcome {
        let Some(ids) = self.index.by_uid.get(uid) else {
            return ResolveOutcome::NoSchedule;
        };
        let mut candidates = ids
            .iter()
            .filter_map(|id| self.schedules.get(id))
            .filter(|schedule| schedule.active_on(date))
            .collect::<Vec<&Schedule>>();
        if candidates.is_empty() {
            return ResolveOutcome::NoSchedule;
        }
        candidates.sort_by(|a, b| {
            b.stp_indicator
                .precedence()
                .cmp(&a.stp_indicator.precedence())
                .then(a.schedule_id.cmp(&b.schedule_id))
        });
        let winner = candidates[0];
        if winner.stp_indicator == StpIndicator::Cancelled {
            return ResolveOutcome::NoSchedule;
        }
        let rivals = candidates
            .iter()
            .filter(|candidate| {
                candidate.stp_indicator == winner.stp_indicator
                    && candidate.schedule_id != winner.schedule_id
            })
            .count();
        if rivals > 0 {
            return ResolveOutcome::Ambiguous;
        }
        let stops = self.stops.get(&winner.schedule_id).cloned().unwrap_or_default();
        ResolveOutcome::Resolved(winner.clone(), stops)
    }
}

/// The schedule store: one writer (the import path), many readers, one
/// JSON snapshot file on disk. Readers take the `RwLock` briefly; import
/// batches serialize on the async write lock and swap fully staged data
/// in, so a failed import never leaves half a file behind.
pub struct ScheduleStore {
    data: RwLock<StoreData>,
    write_lock: Mutex<()>,
    path: PathBuf,
    retention_days: u32,
}

impl ScheduleStore {
    pub async fn open(path: &Path, retention_days: u32) -> Result<ScheduleStore, StoreError> {
        let mut data = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<StoreData>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(StoreError::IoError(e)),
        };
        data.rebuild_index();
        let store = ScheduleStore {
            data: RwLock::new(data),
            write_lock: Mutex::new(()),
            path: path.to_path_buf(),
            retention_days,
        };
        store.apply_retention();
        Ok(store)
    }

    fn read(&self) -> RwLockReadGuard<StoreData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<StoreData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_station(&self, station: Station) {
        self.write().put_station(station);
    }

    pub fn put_alias(&self, alias: StationAlias) {
        self.write().put_alias(alias);
    }

    pub fn put_mapping(&self, mapping: TiplocMapping) {
        self.write().put_mapping(mapping);
    }

    pub fn put_connection(&self, connection: Connection) {
        self.write().put_connection(connection);
    }

    pub fn put_schedule(
        &self,
        schedule: Schedule,
        stops: Vec<ScheduleStop>,
    ) -> Result<u64, StoreError> {
        self.write().put_schedule(schedule, stops)
    }

    pub fn resolve_schedule(&self, rid: &str) -> ResolveOutcome {
        let (date, uid) = parse_rid(rid);
        let (Some(date), Some(uid)) = (date, uid) else {
            return ResolveOutcome::NoRid;
        };
        self.read().effective_schedule(&uid, date)
    }

    pub fn get_stops(&self, schedule_id: u64) -> Vec<ScheduleStop> {
        let mut stops = self
            .read()
            .stops
            .get(&schedule_id)
            .cloned()
            .unwrap_or_default();
        stops.sort_by_key(|stop| stop.sequence);
        stops
    }

    pub fn lookup_station(&self, key: &str) -> Option<Station> {
        self.read().lookup_station(key)
    }

    pub fn search_stations(&self, query: &str, limit: usize) -> Vec<(Station, u8)> {
        let data = self.read();
        let canonical = if resolver::looks_like_identifier(query.trim()) {
            data.canonical_tiploc(query.trim())
        } else {
            query.trim().to_string()
        };
        resolver::search_stations(data.stations.values(), &data.aliases, &canonical, limit)
    }

    /// Schedules effective on the given date, STP overlays applied, sorted
    /// by train UID.
    pub fn schedules_active_on(&self, date: NaiveDate) -> Vec<Schedule> {
        let data = self.read();
        let mut uids = data.index.by_uid.keys().cloned().collect::<Vec<String>>();
        uids.sort_unstable();
        uids.into_iter()
            .filter_map(|uid| match data.effective_schedule(&uid, date) {
                ResolveOutcome::Resolved(schedule, _) => Some(schedule),
                _ => None,
            })
            .collect()
    }

    pub fn connections_from(&self, tiploc: &str) -> Vec<Connection> {
        let data = self.read();
        let canonical = data.canonical_tiploc(tiploc.trim().to_uppercase().as_str());
        data.connections.get(&canonical).cloned().unwrap_or_default()
    }

    pub fn statistics(&self) -> StoreStatistics {
        let data = self.read();
        StoreStatistics {
            schedules: data.schedules.len(),
            stops: data.stops.values().map(Vec::len).sum(),
            stations: data.stations.len(),
            connections: data.connections.values().map(Vec::len).sum(),
            imports: data.imports.len(),
            last_import_success: data.imports.last().map(|record| record.success),
            db_size_bytes: std::fs::metadata(&self.path)
                .map(|meta| meta.len())
                .unwrap_or(0),
        }
    }

    pub fn import_records(&self) -> Vec<ImportRecord> {
        self.read().imports.clone()
    }

    pub fn begin_import(&self, file_type: FileType, file_hash: &str) -> ImportDisposition {
        let data = self.read();
        if data
            .imports
            .iter()
            .any(|record| record.file_hash == file_hash && record.success)
        {
            return ImportDisposition::Duplicate;
        }
        if data
            .imports
            .iter()
            .any(|record| record.file_type == file_type && record.success)
        {
            return ImportDisposition::Replace;
        }
        ImportDisposition::Accept
    }

    fn apply_retention(&self) {
        let today = London.from_utc_datetime(&Utc::now().naive_utc()).date_naive();
        let Some(cutoff) = today.checked_sub_days(Days::new(self.retention_days as u64)) else {
            return;
        };
        let mut data = self.write();
        let expired = data
            .schedules
            .iter()
            .filter(|(_, schedule)| schedule.end_date < cutoff)
            .map(|(id, _)| *id)
            .collect::<Vec<u64>>();
        let dropped = expired.len();
        for id in expired {
            data.remove_schedule(id);
        }
        if dropped > 0 {
            tracing::info!(target: "store", dropped, "retention sweep removed expired schedules");
        }
    }

    /// Write the snapshot file: serialize under the read lock, then write
    /// to a temp file and rename over the old snapshot.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let bytes = {
            let data = self.read();
            serde_json::to_vec(&*data)?
        };
        let temp = self.path.with_extension("tmp");
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    /// Import one file: detect the format, run the adapter, apply every
    /// record to a staged copy and swap it in only if nothing went wrong.
    pub async fn import_file(
        &self,
        path: &Path,
    ) -> Result<(ImportDisposition, ImportRecord), StoreError> {
        let _guard = self.write_lock.lock().await;
        let started_at = Utc::now();

        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let file_type = detect_file_type(&name, &bytes)
            .ok_or_else(|| StoreError::UnknownFileType(name.clone()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let file_hash = format!("{:x}", hasher.finalize());

        let disposition = self.begin_import(file_type, &file_hash);
        if disposition == ImportDisposition::Duplicate {
            tracing::info!(target: "store", file = %name, "skipping already-imported file");
            let existing = self
                .read()
                .imports
                .iter()
                .rev()
                .find(|record| record.file_hash == file_hash && record.success)
                .cloned();
            if let Some(record) = existing {
                return Ok((disposition, record));
            }
        }

        let mut staged = self.read().clone();
        let mut errors;
        let record_count;
        let mut imported = 0u64;

        match file_type {
            FileType::Schedule => {
                let (records, report) = ScheduleAdapter.parse(&bytes);
                record_count = report.record_count;
                errors = report.parse_errors;
                for train in records {
                    match staged.put_schedule(train.schedule, train.stops) {
                        Ok(_) => imported += 1,
                        Err(e) => errors.push(e.to_string()),
                    }
                }
            }
            FileType::Station => {
                let (records, report) = StationAdapter.parse(&bytes);
                record_count = report.record_count;
                errors = report.parse_errors;
                for record in records {
                    match record {
                        StationRecord::Station(station) => staged.put_station(station),
                        StationRecord::Alias(alias) => staged.put_alias(alias),
                    }
                    imported += 1;
                }
            }
            FileType::Connection => {
                let (records, report) = ConnectionAdapter.parse(&bytes);
                record_count = report.record_count;
                errors = report.parse_errors;
                for connection in records {
                    staged.put_connection(connection);
                    imported += 1;
                }
            }
        }

        let success = errors.is_empty();
        let record = ImportRecord {
            file_type,
            file_hash,
            sequence_number: self.read().imports.len() as u64 + 1,
            record_count,
            records_imported: imported,
            started_at,
            finished_at: Some(Utc::now()),
            success,
            errors,
        };

        {
            let mut data = self.write();
            if success {
                // the staged copy becomes the store; the import log lives in
                // whichever copy survives
                staged.imports.push(record.clone());
                *data = staged;
            } else {
                data.imports.push(record.clone());
            }
        }
        if success {
            self.apply_retention();
            self.persist().await?;
            tracing::info!(
                target: "store",
                file = %name,
                imported = record.records_imported,
                "import complete"
            );
        } else {
            tracing::warn!(
                target: "store",
                file = %name,
                errors = record.errors.len(),
                "import failed, keeping previous store contents"
            );
        }

        Ok((disposition, record))
    }
}
