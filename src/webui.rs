use crate::cache::{CacheStats, CancellationCache};
use crate::config::Config;
use crate::darwin_subscriber::{StateCell, SubscriberState};
use crate::enricher::{EnrichmentStats, EnrichmentStatsSnapshot};
use crate::error::Error;
use crate::model::{ActiveCancellation, Connection, Station};
use crate::store::{ScheduleStore, StoreStatistics};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::{ContentType, Header, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::status;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::{catch, catchers, get, routes, Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug)]
pub struct WebUiError {
    what: String,
}

impl fmt::Display for WebUiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error in web UI: {}", self.what)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

// ---------------------------------------------------------------- rate limit

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum LimitClass {
    Health,
    Default,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-source-address token buckets, one per limit class. Capacity equals
/// the per-minute budget so a quiet client can burst up to it.
pub struct RateLimiter {
    buckets: Mutex<HashMap<(IpAddr, LimitClass), Bucket>>,
    default_per_minute: u32,
    health_per_minute: u32,
}

impl RateLimiter {
    pub fn new(default_per_minute: u32, health_per_minute: u32) -> RateLimiter {
        RateLimiter {
            buckets: Mutex::new(HashMap::new()),
            default_per_minute,
            health_per_minute,
        }
    }

    fn budget(&self, class: LimitClass) -> u32 {
        match class {
            LimitClass::Health => self.health_per_minute,
            LimitClass::Default => self.default_per_minute,
        }
    }

    /// Take one token; on refusal returns how many whole seconds until one
    /// is available again.
    fn check(&self, source: IpAddr, class: LimitClass) -> Result<(), u64> {
        let budget = self.budget(class) as f64;
        let refill_per_second = budget / 60.0;
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.entry((source, class)).or_insert(Bucket {
            tokens: budget,
            last_refill: Instant::now(),
        });
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(budget);
        bucket.last_refill = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / refill_per_second;
            Err(wait.ceil() as u64)
        }
    }
}

struct RetryAfterSeconds(u64);

pub struct RateLimited;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RateLimited {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<RateLimited, ()> {
        let Some(limiter) = req.rocket().state::<RateLimiter>() else {
            return Outcome::Success(RateLimited);
        };
        let source = req
            .client_ip()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let class = if req.uri().path().starts_with("/health") {
            LimitClass::Health
        } else {
            LimitClass::Default
        };
        if let Some(metrics) = req.rocket().state::<RequestMetrics>() {
            match class {
                LimitClass::Health => metrics.health_requests.fetch_add(1, Ordering::Relaxed),
                LimitClass::Default => metrics.default_requests.fetch_add(1, Ordering::Relaxed),
            };
        }
        match limiter.check(source, class) {
            Ok(()) => Outcome::Success(RateLimited),
            Err(retry_after) => {
                if let Some(metrics) = req.rocket().state::<RequestMetrics>() {
                    metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
                }
                req.local_cache(|| RetryAfterSeconds(retry_after));
                Outcome::Error((Status::TooManyRequests, ()))
            }
        }
    }
}

struct TooManyRequests {
    retry_after: u64,
}

impl<'r> Responder<'r, 'static> for TooManyRequests {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let body = Json(ErrorBody {
            error: "rate limit exceeded".to_string(),
        });
        Response::build_from(body.respond_to(req)?)
            .status(Status::TooManyRequests)
            .raw_header("Retry-After", self.retry_after.to_string())
            .ok()
    }
}

// --------------------------------------------------------------- fairings

/// Monotonic request ids for error correlation; echoed on every response.
pub struct RequestIdFairing {
    next: AtomicU64,
}

struct RequestId(u64);

#[rocket::async_trait]
impl Fairing for RequestIdFairing {
    fn info(&self) -> Info {
        Info {
            name: "request ids",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, req: &mut rocket::Request<'_>, _data: &mut rocket::Data<'_>) {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        req.local_cache(|| RequestId(id));
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        let id = req.local_cache(|| RequestId(0)).0;
        res.set_header(Header::new("X-Request-Id", id.to_string()));
        if res.status().code >= 500 {
            tracing::error!(
                target: "webui",
                request_id = id,
                status = res.status().code,
                path = %req.uri().path(),
                "request failed"
            );
        }
    }
}

pub struct Cors {
    origins: Vec<String>,
}

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "cors allowlist",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        if self.origins.iter().any(|origin| origin == "*") {
            res.set_header(Header::new("Access-Control-Allow-Origin", "*"));
            return;
        }
        let Some(origin) = req.headers().get_one("Origin") else {
            return;
        };
        if self.origins.iter().any(|allowed| allowed == origin) {
            res.set_header(Header::new("Access-Control-Allow-Origin", origin.to_string()));
            res.set_header(Header::new("Vary", "Origin"));
        }
    }
}

// ---------------------------------------------------------------- metrics

#[derive(Default)]
pub struct RequestMetrics {
    pub default_requests: AtomicU64,
    pub health_requests: AtomicU64,
    pub rate_limited: AtomicU64,
}

// ----------------------------------------------------------------- health

#[derive(Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub healthy: bool,
    pub detail: String,
}

#[derive(Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: Vec<HealthCheck>,
}

/// Readiness checks with a small TTL cache so health probes cannot turn
/// into store traffic.
pub struct HealthManager {
    subscriber: StateCell,
    store: Arc<ScheduleStore>,
    ttl: Duration,
    check_timeout: Duration,
    cached: Mutex<Option<(Instant, HealthReport)>>,
}

impl HealthManager {
    pub fn new(
        subscriber: StateCell,
        store: Arc<ScheduleStore>,
        ttl: Duration,
        check_timeout: Duration,
    ) -> HealthManager {
        HealthManager {
            subscriber,
            store,
            ttl,
            check_timeout,
            cached: Mutex::new(None),
        }
    }

    async fn run_checks(&self) -> HealthReport {
        let state = self.subscriber.get();
        let feed_healthy = matches!(
            state,
            SubscriberState::Subscribed | SubscriberState::Receiving
        );
        let feed = HealthCheck {
            name: "push_port_feed".to_string(),
            healthy: feed_healthy,
            detail: format!("subscriber is {}", state),
        };

        let store = self.store.clone();
        let store_check =
            tokio::time::timeout(self.check_timeout, async move { store.statistics() }).await;
        let store = match store_check {
            Ok(statistics) => HealthCheck {
                name: "schedule_store".to_string(),
                healthy: true,
                detail: format!(
                    "{} schedules, {} stations",
                    statistics.schedules, statistics.stations
                ),
            },
            Err(_) => HealthCheck {
                name: "schedule_store".to_string(),
                healthy: false,
                detail: "statistics timed out".to_string(),
            },
        };

        let healthy = feed.healthy && store.healthy;
        HealthReport {
            healthy,
            checks: vec![feed, store],
        }
    }

    pub async fn report(&self) -> HealthReport {
        {
            let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((at, report)) = cached.as_ref() {
                if at.elapsed() < self.ttl {
                    return report.clone();
                }
            }
        }
        let report = self.run_checks().await;
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        *cached = Some((Instant::now(), report.clone()));
        report
    }
}

// ------------------------------------------------------------------ routes

fn parse_limit(limit: Option<&str>) -> Result<usize, String> {
    match limit {
        None => Ok(DEFAULT_LIMIT),
        Some(raw) => raw
            .parse::<usize>()
            .map(|parsed| parsed.min(MAX_LIMIT))
            .map_err(|_| format!("limit is not a number: {}", raw)),
    }
}

fn parse_since(since: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match since {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|_| format!("since is not an ISO-8601 timestamp: {}", raw)),
    }
}

type BadRequest = status::BadRequest<Json<ErrorBody>>;

fn bad_request(error: String) -> BadRequest {
    status::BadRequest(Json(ErrorBody { error }))
}

#[get("/cancellations?<limit>&<since>")]
fn cancellations(
    limit: Option<&str>,
    since: Option<&str>,
    cache: &State<Arc<CancellationCache>>,
    _rate: RateLimited,
) -> Result<Json<Vec<ActiveCancellation>>, BadRequest> {
    let limit = parse_limit(limit).map_err(bad_request)?;
    let since = parse_since(since).map_err(bad_request)?;
    Ok(Json(cache.recent(limit, since)))
}

#[get("/cancellations/enriched?<limit>&<since>")]
fn cancellations_enriched(
    limit: Option<&str>,
    since: Option<&str>,
    cache: &State<Arc<CancellationCache>>,
    _rate: RateLimited,
) -> Result<Json<Vec<ActiveCancellation>>, BadRequest> {
    let limit = parse_limit(limit).map_err(bad_request)?;
    let since = parse_since(since).map_err(bad_request)?;
    Ok(Json(cache.enriched(limit, since)))
}

#[derive(Clone, Serialize)]
struct RouteRow {
    origin: String,
    destination: String,
    count: u64,
    last_seen: DateTime<Utc>,
}

fn route_rows(cache: &CancellationCache) -> Vec<RouteRow> {
    cache
        .by_route()
        .into_iter()
        .map(|((origin, destination), entry)| RouteRow {
            origin,
            destination,
            count: entry.count,
            last_seen: entry.last_seen,
        })
        .sorted_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(a.origin.cmp(&b.origin))
                .then(a.destination.cmp(&b.destination))
        })
        .collect()
}

#[get("/cancellations/by-route")]
fn cancellations_by_route(
    cache: &State<Arc<CancellationCache>>,
    _rate: RateLimited,
) -> Json<Vec<RouteRow>> {
    Json(route_rows(cache))
}

#[derive(Serialize)]
struct StatsResponse {
    cache: CacheStats,
    enrichment: EnrichmentStatsSnapshot,
    schedule_store: StoreStatistics,
}

#[get("/cancellations/stats")]
async fn cancellations_stats(
    cache: &State<Arc<CancellationCache>>,
    stats: &State<Arc<EnrichmentStats>>,
    store: &State<Arc<ScheduleStore>>,
    deadline: &State<RequestDeadline>,
    _rate: RateLimited,
) -> Result<Json<StatsResponse>, Status> {
    let store = store.inner().clone();
    let statistics = tokio::time::timeout(deadline.0, async move { store.statistics() })
        .await
        .map_err(|_| Status::ServiceUnavailable)?;
    Ok(Json(StatsResponse {
        cache: cache.stats(),
        enrichment: stats.snapshot(),
        schedule_store: statistics,
    }))
}

#[derive(Serialize)]
struct DashboardRow {
    rid: String,
    train: String,
    enriched: bool,
    route: String,
    departs: String,
    duration: String,
    reason: String,
    observed_at: String,
}

fn dashboard_row(cancellation: &ActiveCancellation) -> DashboardRow {
    let train = cancellation
        .headcode
        .clone()
        .or_else(|| cancellation.train_service_code.clone())
        .unwrap_or_else(|| "-".to_string());
    let (route, departs, duration) = match (&cancellation.origin, &cancellation.destination) {
        (Some(origin), Some(destination)) => {
            let minutes = crate::model::minutes_between(
                origin.scheduled_departure,
                destination.scheduled_arrival,
            );
            (
                format!(
                    "{} to {}",
                    origin.station_name.as_deref().unwrap_or(&origin.tiploc),
                    destination
                        .station_name
                        .as_deref()
                        .unwrap_or(&destination.tiploc)
                ),
                origin.scheduled_departure.format("%H:%M").to_string(),
                format!("{}h {:02}m", minutes / 60, minutes % 60),
            )
        }
        _ => (
            "not enriched".to_string(),
            "-".to_string(),
            "-".to_string(),
        ),
    };
    let reason = cancellation
        .reason_text
        .clone()
        .or_else(|| cancellation.reason_code.as_ref().map(|code| format!("code {}", code)))
        .unwrap_or_else(|| "-".to_string());
    DashboardRow {
        rid: cancellation.rid.clone(),
        train,
        enriched: cancellation.darwin_enriched,
        route,
        departs,
        duration,
        reason,
        observed_at: cancellation.observed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

#[get("/cancellations/dashboard")]
fn dashboard(
    cache: &State<Arc<CancellationCache>>,
    stats: &State<Arc<EnrichmentStats>>,
    store: &State<Arc<ScheduleStore>>,
    subscriber: &State<StateCell>,
    _rate: RateLimited,
) -> Template {
    let cache_stats = cache.stats();
    let recent = cache
        .recent(25, None)
        .iter()
        .map(dashboard_row)
        .collect::<Vec<DashboardRow>>();
    let routes = route_rows(cache);
    Template::render(
        "dashboard",
        context! {
            cache_stats,
            enrichment: stats.snapshot(),
            store: store.statistics(),
            recent,
            routes,
            subscriber_state: subscriber.get().to_string(),
            generated_at: Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        },
    )
}

#[derive(Serialize)]
struct StationHit {
    tiploc: String,
    crs_code: Option<String>,
    station_name: String,
    score: u8,
}

#[get("/stations/search?<q>&<limit>")]
async fn stations_search(
    q: Option<&str>,
    limit: Option<&str>,
    store: &State<Arc<ScheduleStore>>,
    deadline: &State<RequestDeadline>,
    _rate: RateLimited,
) -> Result<Json<Vec<StationHit>>, BadRequest> {
    let Some(query) = q.map(str::to_string).filter(|q| !q.trim().is_empty()) else {
        return Err(bad_request("q is required".to_string()));
    };
    let limit = match limit {
        None => 5,
        Some(raw) => raw
            .parse::<usize>()
            .map(|parsed| parsed.clamp(1, 50))
            .map_err(|_| bad_request(format!("limit is not a number: {}", raw)))?,
    };
    let store = store.inner().clone();
    let hits = tokio::time::timeout(deadline.0, async move {
        store.search_stations(&query, limit)
    })
    .await
    .unwrap_or_default();
    Ok(Json(
        hits.into_iter()
            .map(|(station, score)| StationHit {
                tiploc: station.tiploc,
                crs_code: station.crs_code,
                station_name: station.station_name,
                score,
            })
            .collect(),
    ))
}

#[get("/stations/<key>", rank = 2)]
fn station_lookup(
    key: &str,
    store: &State<Arc<ScheduleStore>>,
    _rate: RateLimited,
) -> Option<Json<Station>> {
    store.lookup_station(key).map(Json)
}

#[get("/stations/<key>/connections")]
fn station_connections(
    key: &str,
    store: &State<Arc<ScheduleStore>>,
    _rate: RateLimited,
) -> Json<Vec<Connection>> {
    Json(store.connections_from(key))
}

#[derive(Serialize)]
struct Liveness {
    status: &'static str,
}

#[get("/health/live")]
fn health_live(_rate: RateLimited) -> Json<Liveness> {
    Json(Liveness { status: "alive" })
}

#[get("/health/ready")]
async fn health_ready(
    health: &State<Arc<HealthManager>>,
    _rate: RateLimited,
) -> status::Custom<Json<HealthReport>> {
    let report = health.report().await;
    let code = if report.healthy {
        Status::Ok
    } else {
        Status::ServiceUnavailable
    };
    status::Custom(code, Json(report))
}

#[get("/health/deep")]
async fn health_deep(
    health: &State<Arc<HealthManager>>,
    _rate: RateLimited,
) -> Json<HealthReport> {
    Json(health.report().await)
}

struct MetricsText(String);

impl<'r> Responder<'r, 'static> for MetricsText {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        Response::build_from(self.0.respond_to(req)?)
            .header(ContentType::new("text", "plain"))
            .ok()
    }
}

#[get("/metrics")]
fn metrics(
    cache: &State<Arc<CancellationCache>>,
    stats: &State<Arc<EnrichmentStats>>,
    store: &State<Arc<ScheduleStore>>,
    subscriber: &State<StateCell>,
    requests: &State<RequestMetrics>,
    _rate: RateLimited,
) -> MetricsText {
    let enrichment = stats.snapshot();
    let cache_stats = cache.stats();
    let store_stats = store.statistics();
    let mut out = String::new();

    out.push_str(&format!(
        "darwin_decoded_messages_total {}\n",
        enrichment.decoded_total
    ));
    out.push_str(&format!(
        "darwin_decode_errors_total {}\n",
        enrichment.decode_errors
    ));
    out.push_str(&format!(
        "darwin_cancellations_total {}\n",
        enrichment.cancellations_total
    ));
    out.push_str(&format!(
        "darwin_enriched_total {}\n",
        enrichment.enriched_total
    ));
    let failures = &enrichment.enrichment_failures_by_reason;
    for (reason, value) in [
        ("no_rid", failures.no_rid),
        ("no_schedule", failures.no_schedule),
        ("ambiguous", failures.ambiguous),
        ("store_error", failures.store_error),
    ] {
        out.push_str(&format!(
            "darwin_enrichment_failures_total{{reason=\"{}\"}} {}\n",
            reason, value
        ));
    }
    out.push_str(&format!("darwin_cache_entries {}\n", cache_stats.total));
    out.push_str(&format!(
        "darwin_cache_enriched_entries {}\n",
        cache_stats.enriched
    ));
    out.push_str(&format!(
        "darwin_store_schedules {}\n",
        store_stats.schedules
    ));
    out.push_str(&format!("darwin_store_stops {}\n", store_stats.stops));
    out.push_str(&format!("darwin_store_stations {}\n", store_stats.stations));
    out.push_str(&format!(
        "darwin_store_db_size_bytes {}\n",
        store_stats.db_size_bytes
    ));
    out.push_str(&format!(
        "darwin_subscriber_state{{state=\"{}\"}} 1\n",
        subscriber.get()
    ));
    out.push_str(&format!(
        "http_requests_total{{class=\"default\"}} {}\n",
        requests.default_requests.load(Ordering::Relaxed)
    ));
    out.push_str(&format!(
        "http_requests_total{{class=\"health\"}} {}\n",
        requests.health_requests.load(Ordering::Relaxed)
    ));
    out.push_str(&format!(
        "http_requests_rate_limited_total {}\n",
        requests.rate_limited.load(Ordering::Relaxed)
    ));
    MetricsText(out)
}

// ---------------------------------------------------------------- catchers

#[catch(404)]
fn not_found() -> Json<ErrorBody> {
    Json(ErrorBody {
        error: "no such route".to_string(),
    })
}

#[catch(400)]
fn invalid_request() -> Json<ErrorBody> {
    Json(ErrorBody {
        error: "invalid request".to_string(),
    })
}

#[catch(429)]
fn too_many_requests(req: &Request) -> TooManyRequests {
    TooManyRequests {
        retry_after: req.local_cache(|| RetryAfterSeconds(60)).0,
    }
}

#[catch(500)]
fn internal_error(req: &Request) -> Json<ErrorBody> {
    let id = req.local_cache(|| RequestId(0)).0;
    Json(ErrorBody {
        error: format!("internal error, request id {}", id),
    })
}

struct RequestDeadline(Duration);

/// Assemble the Rocket instance. Everything the handlers need is managed
/// state built once by the composition root.
pub fn build_rocket(
    config: &Config,
    listen: SocketAddr,
    store: Arc<ScheduleStore>,
    cache: Arc<CancellationCache>,
    stats: Arc<EnrichmentStats>,
    subscriber_state: StateCell,
) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", listen.ip().to_string()))
        .merge(("port", listen.port()))
        .merge(("cli_colors", false));

    let health = Arc::new(HealthManager::new(
        subscriber_state.clone(),
        store.clone(),
        Duration::from_millis(config.health.cache_ttl_ms),
        Duration::from_millis(config.health.check_timeout_ms),
    ));

    rocket::custom(figment)
        .mount(
            "/",
            routes![
                cancellations,
                cancellations_enriched,
                cancellations_by_route,
                cancellations_stats,
                dashboard,
                stations_search,
                station_lookup,
                station_connections,
                health_live,
                health_ready,
                health_deep,
                metrics,
            ],
        )
        .register(
            "/",
            catchers![not_found, invalid_request, too_many_requests, internal_error],
        )
        .attach(Template::fairing())
        .attach(RequestIdFairing {
            next: AtomicU64::new(1),
        })
        .attach(Cors {
            origins: config.cors.origins.clone(),
        })
        .manage(store)
        .manage(cache)
        .manage(stats)
        .manage(subscriber_state)
        .manage(health)
        .manage(RequestMetrics::default())
        .manage(RateLimiter::new(
            config.rate_limit.default,
            config.rate_limit.health,
        ))
        .manage(RequestDeadline(Duration::from_millis(
            config.server.request_timeout_ms,
        )))
}

/// Launch and serve until shutdown is requested.
pub async fn serve(rocket: Rocket<Build>) -> Result<(), Error> {
    rocket.launch().await?;
    Ok(())
}
