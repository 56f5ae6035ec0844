use crate::model::{
    ActiveCancellation, CallingPoint, DecodedEvent, ScheduleStop, ServiceDestination,
    ServiceOrigin, StopType,
};
use crate::store::{parse_rid, ResolveOutcome, ScheduleStore};

use serde::Serialize;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct EnrichmentStats {
    pub decoded_total: AtomicU64,
    pub decode_errors: AtomicU64,
    pub cancellations_total: AtomicU64,
    pub enriched_total: AtomicU64,
    pub failures_no_rid: AtomicU64,
    pub failures_no_schedule: AtomicU64,
    pub failures_ambiguous: AtomicU64,
    pub failures_store_error: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct FailuresByReason {
    pub no_rid: u64,
    pub no_schedule: u64,
    pub ambiguous: u64,
    pub store_error: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct EnrichmentStatsSnapshot {
    pub decoded_total: u64,
    pub decode_errors: u64,
    pub cancellations_total: u64,
    pub enriched_total: u64,
    pub enrichment_failures_by_reason: FailuresByReason,
}

impl EnrichmentStats {
    pub fn snapshot(&self) -> EnrichmentStatsSnapshot {
        EnrichmentStatsSnapshot {
            decoded_total: self.decoded_total.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            cancellations_total: self.cancellations_total.load(Ordering::Relaxed),
            enriched_total: self.enriched_total.load(Ordering::Relaxed),
            enrichment_failures_by_reason: FailuresByReason {
                no_rid: self.failures_no_rid.load(Ordering::Relaxed),
                no_schedule: self.failures_no_schedule.load(Ordering::Relaxed),
                ambiguous: self.failures_ambiguous.load(Ordering::Relaxed),
                store_error: self.failures_store_error.load(Ordering::Relaxed),
            },
        }
    }
}

/// Turns decoded cancellation events into cache rows by correlating the
/// RID against the schedule store. Read-only with respect to the store.
pub struct Enricher {
    store: Arc<ScheduleStore>,
    stats: Arc<EnrichmentStats>,
}

impl Enricher {
    pub fn new(store: Arc<ScheduleStore>, stats: Arc<EnrichmentStats>) -> Enricher {
        Enricher { store, stats }
    }

    fn station_name(&self, tiploc: &str) -> Option<String> {
        // a name we cannot resolve just stays empty
        self.store
            .lookup_station(tiploc)
            .map(|station| station.station_name)
    }

    fn basic(&self, event: DecodedEvent) -> ActiveCancellation {
        ActiveCancellation {
            rid: event.rid,
            train_service_code: event.train_service_code,
            reason_code: event.reason_code,
            reason_text: event.reason_text,
            observed_at: event.received_at,
            darwin_enriched: false,
            train_uid: None,
            headcode: None,
            operator_code: None,
            service_date: None,
            origin: None,
            destination: None,
            calling_points: Vec::new(),
        }
    }

    fn project_calling_points(&self, stops: &[ScheduleStop]) -> Vec<CallingPoint> {
        stops
            .iter()
            .filter(|stop| stop.stop_type == StopType::Intermediate)
            .map(|stop| CallingPoint {
                tiploc: stop.tiploc.clone(),
                station_name: self.station_name(&stop.tiploc),
                arrival: stop.arrival_time.or(stop.departure_time),
                departure: stop.departure_time.or(stop.arrival_time),
                platform: stop.platform.clone(),
            })
            .collect()
    }

    pub fn enrich(&self, event: DecodedEvent) -> ActiveCancellation {
        self.stats.cancellations_total.fetch_add(1, Ordering::Relaxed);

        let outcome = self.store.resolve_schedule(&event.rid);
        let (schedule, stops) = match outcome {
            ResolveOutcome::Resolved(schedule, stops) => (schedule, stops),
            ResolveOutcome::NoRid => {
                self.stats.failures_no_rid.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target: "enricher", rid = %event.rid, "no train UID in RID");
                return self.basic(event);
            }
            ResolveOutcome::NoSchedule => {
                self.stats
                    .failures_no_schedule
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target: "enricher", rid = %event.rid, "no matching schedule");
                return self.basic(event);
            }
            ResolveOutcome::Ambiguous => {
                self.stats
                    .failures_ambiguous
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target: "enricher", rid = %event.rid, "schedule match is ambiguous");
                return self.basic(event);
            }
        };

        let origin_stop = stops
            .iter()
            .find(|stop| stop.stop_type == StopType::Origin)
            .and_then(|stop| stop.departure_time.map(|time| (stop, time)));
        let terminus_stop = stops
            .iter()
            .find(|stop| stop.stop_type == StopType::Terminus)
            .and_then(|stop| stop.arrival_time.map(|time| (stop, time)));
        let (Some((origin_stop, departure)), Some((terminus_stop, arrival))) =
            (origin_stop, terminus_stop)
        else {
            // a schedule that resolves but has no usable endpoints is store
            // data we cannot project
            self.stats
                .failures_store_error
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(target: "enricher", rid = %event.rid, "resolved schedule has no usable endpoints");
            return self.basic(event);
        };

        let (service_date, _) = parse_rid(&event.rid);
        let enriched = ActiveCancellation {
            origin: Some(ServiceOrigin {
                tiploc: origin_stop.tiploc.clone(),
                station_name: self.station_name(&origin_stop.tiploc),
                scheduled_departure: departure,
                platform: origin_stop.platform.clone(),
            }),
            destination: Some(ServiceDestination {
                tiploc: terminus_stop.tiploc.clone(),
                station_name: self.station_name(&terminus_stop.tiploc),
                scheduled_arrival: arrival,
                platform: terminus_stop.platform.clone(),
            }),
            calling_points: self.project_calling_points(&stops),
            train_uid: Some(schedule.train_uid.clone()),
            headcode: schedule.headcode.clone(),
            operator_code: Some(schedule.operator_code.clone()),
            service_date,
            darwin_enriched: true,
            ..self.basic(event)
        };

        self.stats.enriched_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "enricher",
            rid = %enriched.rid,
            train_uid = %schedule.train_uid,
            origin = %origin_stop.tiploc,
            destination = %terminus_stop.tiploc,
            "cancellation enriched"
        );
        enriched
    }
}
