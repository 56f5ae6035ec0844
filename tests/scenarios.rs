//! End-to-end flows: schedule files in at one end, JSON out at the other.

use darwin_cancellations::cache::CancellationCache;
use darwin_cancellations::config::Config;
use darwin_cancellations::darwin_subscriber::StateCell;
use darwin_cancellations::enricher::{Enricher, EnrichmentStats};
use darwin_cancellations::pipeline::process_frame;
use darwin_cancellations::store::{ResolveOutcome, ScheduleStore};
use darwin_cancellations::webui::build_rocket;

use rocket::http::Status;
use rocket::local::blocking::Client;
use tempfile::TempDir;

use std::net::SocketAddr;
use std::sync::Arc;

fn bs_line(uid: &str, from: &str, to: &str, days: &str, stp: &str) -> String {
    let mut line = String::from("BSN");
    line.push_str(&format!("{:<6}", uid));
    line.push_str(from);
    line.push_str(to);
    line.push_str(days);
    line.push(' ');
    line.push('P');
    line.push_str("XX");
    line.push_str("1A23");
    while line.len() < 79 {
        line.push(' ');
    }
    line.push_str(stp);
    line
}

fn timetable_file() -> String {
    let mut text = String::new();
    // permanent Monday-to-Friday service, overlaid on the 3rd of December
    text.push_str(&bs_line("C12345", "251201", "251207", "1111100", "P"));
    text.push('\n');
    text.push_str("BX         VT                                                                   \n");
    text.push_str("LOEUSTON  1800 18002         TB                                                 \n");
    text.push_str("LIMKTCENT 1825 1825      182518253                                              \n");
    text.push_str("LTBHAMNS  1935 19355      TF                                                    \n");
    text.push_str(&bs_line("C12345", "251203", "251203", "0011000", "O"));
    text.push('\n');
    text.push_str("BX         VT                                                                   \n");
    text.push_str("LOWATFDJ  1815 18151         TB                                                 \n");
    text.push_str("LTBHAMNS  1950 19505      TF                                                    \n");
    text
}

fn station_file() -> String {
    let mut line = String::new();
    line.push('A');
    line.push_str("    ");
    line.push_str(&format!("{:<30}", "London Euston"));
    line.push('2');
    line.push_str(&format!("{:<8}", "EUSTON"));
    line.push_str("EUS  EUS ");
    line.push_str("15298");
    line.push_str("61827 ");
    line.push('1');
    line
}

struct World {
    _dir: TempDir,
    store: Arc<ScheduleStore>,
    cache: Arc<CancellationCache>,
    stats: Arc<EnrichmentStats>,
    enricher: Enricher,
}

fn build_world(max_entries: usize) -> World {
    let dir = TempDir::new().unwrap();
    let store = rocket::execute(async {
        let store = Arc::new(
            ScheduleStore::open(&dir.path().join("store.json"), 3650)
                .await
                .unwrap(),
        );
        let timetable = dir.path().join("december.cif");
        tokio::fs::write(&timetable, timetable_file()).await.unwrap();
        store.import_file(&timetable).await.unwrap();
        let stations = dir.path().join("stations.msn");
        tokio::fs::write(&stations, station_file()).await.unwrap();
        store.import_file(&stations).await.unwrap();
        store
    });
    let cache = Arc::new(CancellationCache::new(
        max_entries,
        chrono::Duration::hours(24),
    ));
    let stats = Arc::new(EnrichmentStats::default());
    let enricher = Enricher::new(store.clone(), stats.clone());
    World {
        _dir: dir,
        store,
        cache,
        stats,
        enricher,
    }
}

fn cancellation_frame(rid: &str) -> String {
    format!(
        r#"<Pport xmlns="http://www.thalesgroup.com/rtti/PushPort/v16"><uR><schedule rid="{}" uid="C12345" trainId="1A23"><cancelReason>104</cancelReason></schedule></uR></Pport>"#,
        rid
    )
}

fn api_client(world: &World, config: &Config) -> Client {
    let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let rocket = build_rocket(
        config,
        listen,
        world.store.clone(),
        world.cache.clone(),
        world.stats.clone(),
        StateCell::default(),
    );
    Client::tracked(rocket).unwrap()
}

fn test_config() -> Config {
    toml::from_str(
        r#"
            [broker]
            host = "broker.example"
            port = 61613
            user = "u"
            password = "p"
        "#,
    )
    .unwrap()
}

#[test]
fn enrichment_happy_path_to_the_api() {
    let world = build_world(500);
    rocket::execute(process_frame(
        cancellation_frame("202512010000C12345").as_bytes(),
        &world.enricher,
        &world.cache,
        &world.stats,
    ));

    let client = api_client(&world, &test_config());
    let response = client.get("/cancellations/enriched?limit=1").dispatch();
    assert_eq!(response.status(), Status::Ok);
    let body: Vec<serde_json::Value> = response.into_json().unwrap();
    assert_eq!(body.len(), 1);
    let record = &body[0];
    assert_eq!(record["darwin_enriched"], true);
    assert_eq!(record["origin"]["tiploc"], "EUSTON");
    assert_eq!(record["origin"]["station_name"], "London Euston");
    assert_eq!(record["origin"]["scheduled_departure"], "18:00");
    assert_eq!(record["origin"]["platform"], "2");
    assert_eq!(record["destination"]["tiploc"], "BHAMNS");
    assert_eq!(record["destination"]["scheduled_arrival"], "19:35");
    assert_eq!(record["calling_points"][0]["tiploc"], "MKTCENT");
    assert_eq!(record["calling_points"][0]["arrival"], "18:25");
    assert_eq!(record["calling_points"][0]["departure"], "18:25");
    assert_eq!(record["reason_code"], "104");
    assert_eq!(record["reason_text"], "Signal failure");
}

#[test]
fn enrichment_miss_is_visible_but_not_enriched() {
    let world = build_world(500);
    rocket::execute(process_frame(
        cancellation_frame("202512019999X99999").as_bytes(),
        &world.enricher,
        &world.cache,
        &world.stats,
    ));

    let client = api_client(&world, &test_config());
    let all: Vec<serde_json::Value> = client
        .get("/cancellations")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0]["darwin_enriched"], false);

    let enriched: Vec<serde_json::Value> = client
        .get("/cancellations/enriched")
        .dispatch()
        .into_json()
        .unwrap();
    assert!(enriched.is_empty());

    let stats: serde_json::Value = client
        .get("/cancellations/stats")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(
        stats["enrichment"]["enrichment_failures_by_reason"]["no_schedule"],
        1
    );
}

#[test]
fn overlay_wins_on_its_date() {
    let world = build_world(500);

    match world.store.resolve_schedule("202512030000C12345") {
        ResolveOutcome::Resolved(schedule, stops) => {
            assert_eq!(schedule.operator_code, "VT");
            assert_eq!(stops[0].tiploc, "WATFDJ");
        }
        other => panic!("expected the overlay, got {:?}", other),
    }

    rocket::execute(process_frame(
        cancellation_frame("202512030000C12345").as_bytes(),
        &world.enricher,
        &world.cache,
        &world.stats,
    ));
    let enriched = world.cache.enriched(1, None);
    assert_eq!(enriched[0].origin.as_ref().unwrap().tiploc, "WATFDJ");

    // the day before, the permanent schedule is the one that resolves
    rocket::execute(process_frame(
        cancellation_frame("202512020000C12345").as_bytes(),
        &world.enricher,
        &world.cache,
        &world.stats,
    ));
    let enriched = world.cache.enriched(1, None);
    assert_eq!(enriched[0].origin.as_ref().unwrap().tiploc, "EUSTON");
}

#[test]
fn cache_keeps_the_newest_three() {
    let world = build_world(3);
    for day in ["01", "02", "03", "04"] {
        let rid = format!("202512{}9999X99999", day);
        rocket::execute(process_frame(
            cancellation_frame(&rid).as_bytes(),
            &world.enricher,
            &world.cache,
            &world.stats,
        ));
    }

    let client = api_client(&world, &test_config());
    let body: Vec<serde_json::Value> = client
        .get("/cancellations?limit=10")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(body.len(), 3);
    assert_eq!(body[0]["rid"], "202512049999X99999");
    assert_eq!(body[1]["rid"], "202512039999X99999");
    assert_eq!(body[2]["rid"], "202512029999X99999");

    let stats: serde_json::Value = client
        .get("/cancellations/stats")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(stats["cache"]["total"], 3);
}

#[test]
fn the_rate_limit_kicks_in_after_the_budget() {
    let world = build_world(500);
    let client = api_client(&world, &test_config());
    let mut accepted = 0;
    for _ in 0..130 {
        let response = client.get("/cancellations").dispatch();
        if response.status() == Status::TooManyRequests {
            // the bucket holds one minute's budget, so the whole budget
            // must have been served first
            assert!(accepted >= 120, "only {} requests accepted", accepted);
            assert!(response.headers().get_one("Retry-After").is_some());
            return;
        }
        accepted += 1;
    }
    panic!("rate limit never triggered after {} requests", accepted);
}

#[test]
fn reimporting_the_same_file_is_a_no_op() {
    let world = build_world(500);
    let before = world.store.statistics();
    rocket::execute(async {
        let timetable = world._dir.path().join("december.cif");
        let (disposition, _) = world.store.import_file(&timetable).await.unwrap();
        assert_eq!(
            disposition,
            darwin_cancellations::store::ImportDisposition::Duplicate
        );
    });
    let after = world.store.statistics();
    assert_eq!(before.schedules, after.schedules);
    assert_eq!(before.stops, after.stops);
    assert_eq!(before.imports, after.imports);
}
