use crate::model::{Station, StationAlias};

use itertools::Itertools;

use std::collections::{BTreeSet, HashMap};

// ranking tiers: exact tiploc/crs 100, exact name 95, exact alias 90,
// prefix 80..90, fuzzy capped below prefix so a lucky token match can never
// out-rank a literal one
const SCORE_EXACT_CODE: u8 = 100;
const SCORE_EXACT_NAME: u8 = 95;
const SCORE_EXACT_ALIAS: u8 = 90;
const FUZZY_THRESHOLD: u8 = 70;
const FUZZY_CAP: u8 = 79;

/// Identifier detection: 3-7 uppercase letters/digits, no spaces. Queries
/// that look like codes never go through prefix or fuzzy matching, so a
/// real TIPLOC cannot be hijacked by a similarly spelled station name.
pub fn looks_like_identifier(query: &str) -> bool {
    let length = query.chars().count();
    (3..=7).contains(&length)
        && query
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Case-fold and collapse runs of whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().join(" ").to_lowercase()
}

fn token_set(text: &str) -> BTreeSet<String> {
    normalize(text)
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    strsim::normalized_levenshtein(a, b)
}

/// Token-set ratio over case-folded, whitespace-collapsed strings, scaled
/// to 0..100. The shared tokens are compared against each side's full
/// token set and the best of the three pairings wins, so word order and
/// duplicated words do not matter.
pub fn token_set_ratio(a: &str, b: &str) -> u8 {
    let tokens_a = token_set(a);
    let tokens_b = token_set(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0;
    }

    let shared = tokens_a
        .intersection(&tokens_b)
        .cloned()
        .collect::<Vec<String>>();
    let only_a = tokens_a
        .difference(&tokens_b)
        .cloned()
        .collect::<Vec<String>>();
    let only_b = tokens_b
        .difference(&tokens_a)
        .cloned()
        .collect::<Vec<String>>();

    let base = shared.join(" ");
    let with_a = [shared.clone(), only_a].concat().join(" ");
    let with_b = [shared, only_b].concat().join(" ");

    let best = [
        similarity(&base, &with_a),
        similarity(&base, &with_b),
        similarity(&with_a, &with_b),
    ]
    .into_iter()
    .fold(0.0_f64, f64::max);

    (best * 100.0).round() as u8
}

fn prefix_score(query: &str, candidate: &str) -> Option<u8> {
    let query = normalize(query);
    let candidate = normalize(candidate);
    if query.is_empty() || !candidate.starts_with(&query) {
        return None;
    }
    let ratio = query.chars().count() as f64 / candidate.chars().count() as f64;
    Some(80 + (ratio * 10.0).round() as u8)
}

struct Hit {
    station: Station,
    score: u8,
    via_primary_alias: bool,
}

fn score_station(
    station: &Station,
    aliases: &[StationAlias],
    query: &str,
    identifier: bool,
) -> Option<Hit> {
    let folded = query.to_uppercase();
    let mut score = 0u8;
    let mut via_primary_alias = false;

    if station.tiploc == folded {
        score = SCORE_EXACT_CODE;
    } else if station.crs_code.as_deref() == Some(folded.as_str()) {
        score = SCORE_EXACT_CODE;
    } else if normalize(&station.station_name) == normalize(query) {
        score = SCORE_EXACT_NAME;
    } else {
        for alias in aliases {
            if normalize(&alias.alias_name) == normalize(query) {
                score = score.max(SCORE_EXACT_ALIAS);
                via_primary_alias |= alias.is_primary;
            }
        }
    }

    if score == 0 && !identifier {
        if let Some(prefix) = prefix_score(query, &station.station_name) {
            score = score.max(prefix);
        }
        for alias in aliases {
            if let Some(prefix) = prefix_score(query, &alias.alias_name) {
                score = score.max(prefix);
                via_primary_alias |= alias.is_primary;
            }
        }
    }

    if score == 0 && !identifier {
        let mut haystack = station.station_name.clone();
        for alias in aliases {
            haystack.push(' ');
            haystack.push_str(&alias.alias_name);
        }
        let fuzzy = token_set_ratio(query, &haystack);
        if fuzzy >= FUZZY_THRESHOLD {
            score = fuzzy.min(FUZZY_CAP);
        }
    }

    if score == 0 {
        None
    } else {
        Some(Hit {
            station: station.clone(),
            score,
            via_primary_alias,
        })
    }
}

/// Rank stations against a free-text query. Ties break towards active
/// stations, then primary-alias matches, then alphabetical name.
pub fn search_stations<'a>(
    stations: impl Iterator<Item = &'a Station>,
    aliases: &HashMap<String, Vec<StationAlias>>,
    query: &str,
    limit: usize,
) -> Vec<(Station, u8)> {
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }
    let identifier = looks_like_identifier(query);
    let empty: Vec<StationAlias> = Vec::new();

    stations
        .filter_map(|station| {
            let station_aliases = aliases.get(&station.tiploc).unwrap_or(&empty);
            score_station(station, station_aliases, query, identifier)
        })
        .sorted_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(b.station.is_active.cmp(&a.station.is_active))
                .then(b.via_primary_alias.cmp(&a.via_primary_alias))
                .then(a.station.station_name.cmp(&b.station.station_name))
        })
        .take(limit)
        .map(|hit| (hit.station, hit.score))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AliasType;

    fn station(tiploc: &str, crs: &str, name: &str) -> Station {
        Station {
            tiploc: tiploc.to_string(),
            crs_code: Some(crs.to_string()),
            station_name: name.to_string(),
            country: None,
            region: None,
            latitude: None,
            longitude: None,
            is_active: true,
        }
    }

    fn fixtures() -> (Vec<Station>, HashMap<String, Vec<StationAlias>>) {
        let stations = vec![
            station("EUSTON", "EUS", "London Euston"),
            station("BHAMNS", "BHM", "Birmingham New Street"),
            station("EDINBUR", "EDB", "Edinburgh"),
            station("GLGC", "GLC", "Glasgow Central"),
        ];
        let mut aliases = HashMap::new();
        aliases.insert(
            "EDINBUR".to_string(),
            vec![StationAlias {
                tiploc: "EDINBUR".to_string(),
                alias_name: "Edinburgh Waverley".to_string(),
                alias_type: AliasType::Common,
                is_primary: true,
            }],
        );
        (stations, aliases)
    }

    #[test]
    fn exact_tiploc_and_crs_score_100() {
        let (stations, aliases) = fixtures();
        let results = search_stations(stations.iter(), &aliases, "EUSTON", 5);
        assert_eq!(results[0].0.tiploc, "EUSTON");
        assert_eq!(results[0].1, 100);

        let results = search_stations(stations.iter(), &aliases, "bhm", 5);
        assert_eq!(results[0].0.tiploc, "BHAMNS");
        assert_eq!(results[0].1, 100);
    }

    #[test]
    fn exact_name_beats_fuzzy() {
        let (stations, aliases) = fixtures();
        let results = search_stations(stations.iter(), &aliases, "london euston", 5);
        assert_eq!(results[0].0.tiploc, "EUSTON");
        assert_eq!(results[0].1, 95);
    }

    #[test]
    fn every_station_finds_itself_by_name() {
        let (stations, aliases) = fixtures();
        for s in &stations {
            let results = search_stations(stations.iter(), &aliases, &s.station_name, 1);
            assert_eq!(results[0].0.tiploc, s.tiploc, "query {}", s.station_name);
        }
    }

    #[test]
    fn alias_match_scores_90() {
        let (stations, aliases) = fixtures();
        let results = search_stations(stations.iter(), &aliases, "Edinburgh Waverley", 5);
        assert_eq!(results[0].0.tiploc, "EDINBUR");
        assert_eq!(results[0].1, 90);
    }

    #[test]
    fn prefix_match_lands_between_80_and_90() {
        let (stations, aliases) = fixtures();
        let results = search_stations(stations.iter(), &aliases, "Birmingham", 5);
        assert_eq!(results[0].0.tiploc, "BHAMNS");
        assert!(
            (80..=90).contains(&results[0].1),
            "score {} out of band",
            results[0].1
        );
    }

    #[test]
    fn fuzzy_match_never_beats_prefix_band() {
        let (stations, aliases) = fixtures();
        let results = search_stations(stations.iter(), &aliases, "euston london", 5);
        assert_eq!(results[0].0.tiploc, "EUSTON");
        assert!(results[0].1 <= 79, "fuzzy score {} over cap", results[0].1);
    }

    #[test]
    fn identifier_queries_skip_fuzzy_matching() {
        let (stations, aliases) = fixtures();
        // looks like a TIPLOC, matches nothing exactly: must return nothing
        // rather than fuzzy-matching some station name
        let results = search_stations(stations.iter(), &aliases, "GLGCX", 5);
        assert!(results.is_empty());
        assert!(looks_like_identifier("GLGC"));
        assert!(!looks_like_identifier("Glasgow Central"));
        assert!(!looks_like_identifier("glgc"));
    }

    #[test]
    fn inactive_stations_rank_below_active_on_ties() {
        let (mut stations, aliases) = fixtures();
        let mut ghost = station("GLGCOLD", "GLC", "Glasgow Central");
        ghost.is_active = false;
        ghost.crs_code = None;
        stations.push(ghost);
        let results = search_stations(stations.iter(), &aliases, "Glasgow Central", 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.tiploc, "GLGC");
        assert!(results[0].0.is_active);
    }

    #[test]
    fn results_are_capped_at_limit() {
        let (stations, aliases) = fixtures();
        let results = search_stations(stations.iter(), &aliases, "e", 2);
        assert!(results.len() <= 2);
    }

    #[test]
    fn token_set_ratio_ignores_word_order() {
        assert_eq!(
            token_set_ratio("London Euston", "euston   LONDON"),
            100
        );
        assert!(token_set_ratio("Glasgow Central", "Edinburgh") < 70);
    }
}
