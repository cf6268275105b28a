// 🇫🇷 French levels - regions, departements, communes, EPCIs and their history
//
// Identity and validity come from the historical datasets (preprocessors);
// extractors only attach geometries to already-known incarnations.
// Postprocessors attach parents, roll populations up and enrich from Wikidata.

use crate::aggregate::Members;
use crate::db::{Aggregation, ZoneStore};
use crate::enrichment::{lookup_chunked, Entity, EntityQuery};
use crate::error::Result;
use crate::level::{LevelRegistry, StageContext};
use crate::levels::world::{COUNTRY, COUNTRY_SUBSET};
use crate::sources::{text, GeoRecord, Row, Source};
use crate::geometry;
use crate::wiki;
use crate::zone::{TextField, Validity, Zone, ZoneUpdate};
use anyhow::Context;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

pub const REGION: &str = "fr:region";
pub const EPCI: &str = "fr:epci";
pub const DEPARTEMENT: &str = "fr:departement";
pub const COLLECTIVITE: &str = "fr:collectivite";
pub const ARRONDISSEMENT: &str = "fr:arrondissement";
pub const COMMUNE: &str = "fr:commune";

/// Parents shared by every French zone
const FR_PARENTS: [&str; 3] = ["country:fr", "country-group:ue", "country-group:world"];

/// Communes history starts with the 1942 reference
const DEBUT: &str = "1942-01-01";

/// Geohisto "end of time" marker
const GEOHISTO_EOT: &str = "9999-12-31";

const GEOHISTO_BASE: &str = "https://github.com/etalab/geohisto/raw/master/";

const COMMUNES_HISTORY_URL: &str =
    "https://github.com/etalab/decoupage-administratif/releases/download/v0.5.0/historique-communes.json";
const COMMUNES_URL: &str =
    "http://etalab-datasets.geo.data.gouv.fr/contours-administratifs/2019/geojson/communes-100m.geojson";
const DEPARTEMENTS_URL: &str =
    "http://etalab-datasets.geo.data.gouv.fr/contours-administratifs/2019/geojson/departements-100m.geojson";
const REGIONS_URL: &str =
    "http://etalab-datasets.geo.data.gouv.fr/contours-administratifs/2019/geojson/regions-100m.geojson";
const EPCIS_HISTORY_URL: &str = "https://static.data.gouv.fr/resources/liste-et-historique-des-epci-a-fiscalite-propre/20190419-175019/historique-epcis.json";
const CURRENT_COMMUNES_URL: &str =
    "https://github.com/etalab/decoupage-administratif/releases/download/v0.5.0/communes.json";
const POSTAL_CODES_URL: &str = "https://unpkg.com/codes-postaux@3.2.0/codes-postaux-full.json";

const FLAG_OF_FRANCE: &str = "http://commons.wikimedia.org/wiki/Special:FilePath/Flag%20of%20France.svg";

/// Cities split into municipal districts, with their district codes
const CITIES_WITH_DISTRICTS: [(&str, &str, std::ops::RangeInclusive<u32>); 3] = [
    ("75056", "751", 1..=20),
    ("13055", "132", 1..=16),
    ("69123", "6938", 1..=8),
];

/// Attributes shared by every Wikidata query below
const WIKIDATA_COMMON: [&str; 9] = [
    "population", "area", "flag", "blazon", "logo", "site", "wikipedia", "osm", "geonames",
];

const DEPARTEMENT_SPARQL: &str = r#"
SELECT DISTINCT ?dpt ?insee ?population ?area ?iso2 ?siren ?fips ?nuts3
                ?geonames ?flag ?blazon ?logo ?site ?wikipedia ?osm
WHERE {
  VALUES ?insee { {ids} }
  ?dpt wdt:P31 wd:Q6465;
       wdt:P2586 ?insee.
  OPTIONAL {?dpt p:P300 ?iso2Stmt.
            ?iso2Stmt ps:P300 ?iso2.
            FILTER NOT EXISTS { ?iso2Stmt pq:P582 [] } .
            }
  OPTIONAL {?dpt wdt:P901 ?fips.}
  OPTIONAL {?dpt wdt:P1566 ?geonames.}
  OPTIONAL {?dpt p:P605 ?nutsStmt.
            ?nutsStmt ps:P605 ?nuts3.
            FILTER (regex(?nuts3, '^FR\\d{3}$')) .
            FILTER NOT EXISTS { ?nutsStmt pq:P582 [] } .
            }
  OPTIONAL {?dpt wdt:P1616 ?siren.}
  OPTIONAL {?dpt wdt:P2046 ?area.}
  OPTIONAL {?dpt wdt:P1082 ?population.}
  OPTIONAL {?dpt wdt:P41 ?flag. FILTER (?flag != <{flag_of_france}>)}
  OPTIONAL {?dpt wdt:P94 ?blazon.}
  OPTIONAL {?dpt wdt:P154 ?logo.}
  OPTIONAL {?dpt wdt:P856 ?site.}
  OPTIONAL {?dpt wdt:P402 ?osm.}
  OPTIONAL {
    ?wikipedia schema:about ?dpt;
               schema:inLanguage 'fr';
               schema:isPartOf <https://fr.wikipedia.org/>.
  }
}
"#;

const REGION_SPARQL: &str = r#"
SELECT DISTINCT ?region ?insee ?population ?area ?iso2 ?siren ?fips ?nuts2
                ?geonames ?flag ?blazon ?logo ?site ?wikipedia ?osm
WHERE {
  VALUES ?insee { {ids} }
  ?region wdt:P31 wd:Q36784;
          wdt:P2585 ?insee.
  OPTIONAL {?region p:P300 ?iso2Stmt.
            ?iso2Stmt ps:P300 ?iso2.
            FILTER NOT EXISTS { ?iso2Stmt pq:P582 [] } .
            }
  OPTIONAL {?region wdt:P901 ?fips.}
  OPTIONAL {?region wdt:P1566 ?geonames.}
  OPTIONAL {?region p:P605 ?nutsStmt.
            ?nutsStmt ps:P605 ?nuts2.
            FILTER (regex(?nuts2, '^FR\\d{2}$')) .
            FILTER NOT EXISTS { ?nutsStmt pq:P582 [] } .
            }
  OPTIONAL {?region wdt:P1616 ?siren.}
  OPTIONAL {?region wdt:P2046 ?area.}
  OPTIONAL {?region wdt:P1082 ?population.}
  OPTIONAL {?region wdt:P41 ?flag. FILTER (?flag != <{flag_of_france}>)}
  OPTIONAL {?region wdt:P94 ?blazon.}
  OPTIONAL {?region wdt:P154 ?logo.}
  OPTIONAL {?region wdt:P856 ?site.}
  OPTIONAL {?region wdt:P402 ?osm.}
  OPTIONAL {
    ?wikipedia schema:about ?region;
               schema:inLanguage 'fr';
               schema:isPartOf <https://fr.wikipedia.org/>.
  }
}
"#;

const COMMUNE_SPARQL: &str = r#"
SELECT DISTINCT ?commune ?insee ?population ?area ?siren ?geonames ?flag
                ?blazon ?logo ?site ?wikipedia ?osm
WHERE {
  VALUES ?insee { {ids} }
  ?commune wdt:P374 ?insee
  OPTIONAL {?commune wdt:P1566 ?geonames.}
  OPTIONAL {?commune wdt:P1616 ?siren.}
  OPTIONAL {?commune wdt:P2046 ?area.}
  OPTIONAL {?commune wdt:P1082 ?population.}
  OPTIONAL {?commune wdt:P41 ?flag. FILTER (?flag != <{flag_of_france}>)}
  OPTIONAL {?commune wdt:P94 ?blazon.}
  OPTIONAL {?commune wdt:P154 ?logo.}
  OPTIONAL {?commune wdt:P856 ?site.}
  OPTIONAL {?commune wdt:P402 ?osm.}
  OPTIONAL {
    ?wikipedia schema:about ?commune;
               schema:inLanguage 'fr';
               schema:isPartOf <https://fr.wikipedia.org/>.
  }
}
"#;

const EPCI_SPARQL: &str = r#"
SELECT DISTINCT ?epci ?siren ?population ?area ?flag ?blazon ?logo ?site
                ?wikipedia ?osm
WHERE {
  VALUES ?siren { {ids} }
  ?epci wdt:P1616 ?siren.
  OPTIONAL {?epci wdt:P2046 ?area.}
  OPTIONAL {?epci wdt:P1082 ?population.}
  OPTIONAL {?epci wdt:P41 ?flag. FILTER (?flag != <{flag_of_france}>)}
  OPTIONAL {?epci wdt:P94 ?blazon.}
  OPTIONAL {?epci wdt:P154 ?logo.}
  OPTIONAL {?epci wdt:P856 ?site.}
  OPTIONAL {?epci wdt:P402 ?osm.}
  OPTIONAL {
    ?wikipedia schema:about ?epci;
               schema:inLanguage 'fr';
               schema:isPartOf <https://fr.wikipedia.org/>.
  }
}
"#;

// Entity ids are inlined as literals, then turned back into entity IRIs
const COUNTRY_SUBSET_SPARQL: &str = r#"
SELECT DISTINCT ?subset ?wdid ?population ?area ?geonames ?flag ?site
                ?wikipedia ?osm
WHERE {
  VALUES ?wdid { {ids} }
  BIND(IRI(CONCAT("http://www.wikidata.org/entity/", ?wdid)) AS ?subset)
  OPTIONAL {?subset wdt:P1566 ?geonames.}
  OPTIONAL {?subset wdt:P2046 ?area.}
  OPTIONAL {?subset wdt:P1082 ?population.}
  OPTIONAL {?subset wdt:P41 ?flag. FILTER (?flag != <{flag_of_france}>)}
  OPTIONAL {?subset wdt:P856 ?site.}
  OPTIONAL {?subset wdt:P402 ?osm.}
  OPTIONAL {
    ?wikipedia schema:about ?subset;
               schema:inLanguage 'fr';
               schema:isPartOf <https://fr.wikipedia.org/>.
  }
}
"#;

pub fn register(registry: &mut LevelRegistry) -> Result<()> {
    registry.register(REGION, "French region", 40, &[COUNTRY])?;
    registry.register(EPCI, "French intermunicipal (EPCI)", 68, &[COUNTRY])?;
    registry.register(DEPARTEMENT, "French county", 60, &[REGION])?;
    registry.register(COLLECTIVITE, "French overseas collectivities", 60, &[REGION])?;
    registry.register(ARRONDISSEMENT, "French arrondissement", 70, &[DEPARTEMENT])?;
    registry.register(COMMUNE, "French town", 80, &[ARRONDISSEMENT, EPCI])?;

    // Preprocessors: identities and validity
    registry.preprocessor(
        REGION,
        "load_regions",
        Some(Source::new(format!("{}exports/regions/regions.csv", GEOHISTO_BASE))),
        load_regions,
    )?;
    registry.preprocessor(
        DEPARTEMENT,
        "load_departements",
        Some(Source::new(format!("{}exports/departements/departements.csv", GEOHISTO_BASE))),
        load_departements,
    )?;
    registry.preprocessor(
        COLLECTIVITE,
        "load_collectivites",
        Some(Source::new(format!("{}exports/collectivites/collectivites.csv", GEOHISTO_BASE))),
        load_collectivites,
    )?;
    registry.preprocessor(
        COMMUNE,
        "load_communes_history",
        Some(Source::new(COMMUNES_HISTORY_URL)),
        load_communes_history,
    )?;
    registry.preprocessor(EPCI, "load_epcis_history", Some(Source::new(EPCIS_HISTORY_URL)), load_epcis_history)?;

    // Extractors: geometries
    registry.extractor(REGION, "extract_french_regions", Source::new(REGIONS_URL), None, extract_french_regions)?;
    registry.extractor(
        DEPARTEMENT,
        "extract_french_departements",
        Source::new(DEPARTEMENTS_URL),
        None,
        extract_french_departements,
    )?;
    registry.extractor(COMMUNE, "extract_french_communes", Source::new(COMMUNES_URL), None, extract_french_communes)?;

    // Postprocessors, order matters within a level
    registry.postprocessor(
        COUNTRY_SUBSET,
        "fetch_french_country_subset_wikidata_metadata",
        None,
        fetch_french_country_subset_wikidata_metadata,
    )?;
    registry.postprocessor(REGION, "fetch_region_data_from_wikidata", None, fetch_region_data_from_wikidata)?;
    // Departements are visited before communes: commune parents must be
    // attached before the departement rollups read them.
    registry.postprocessor(
        DEPARTEMENT,
        "attach_current_french_communes_parents",
        Some(Source::new(CURRENT_COMMUNES_URL)),
        attach_current_french_communes_parents,
    )?;
    registry.postprocessor(DEPARTEMENT, "commune_with_districts", None, commune_with_districts)?;
    registry.postprocessor(
        DEPARTEMENT,
        "compute_departement_area_and_population",
        None,
        compute_departement_area_and_population,
    )?;
    registry.postprocessor(
        DEPARTEMENT,
        "fetch_departement_data_from_wikidata",
        None,
        fetch_departement_data_from_wikidata,
    )?;
    // Needs departement population
    registry.postprocessor(DEPARTEMENT, "compute_region_population", None, compute_region_population)?;
    registry.postprocessor(ARRONDISSEMENT, "compute_district_population", None, compute_district_population)?;
    registry.postprocessor(COMMUNE, "fr_postal_codes", Some(Source::new(POSTAL_CODES_URL)), fr_postal_codes)?;
    registry.postprocessor(COMMUNE, "fetch_communes_data_from_wikidata", None, fetch_communes_data_from_wikidata)?;
    // Needs communes population, geometry and area
    registry.postprocessor(COMMUNE, "attach_epci", None, attach_epci)?;
    registry.postprocessor(EPCI, "fetch_epci_data_from_wikidata", None, fetch_epci_data_from_wikidata)?;

    // Country subsets
    registry.aggregate(
        COUNTRY_SUBSET,
        "fr:metro",
        "Metropolitan France",
        Members::dynamic(|ctx| current_departements(ctx, |code| code.len() == 2)),
        subset_properties(Some("fr:France_métropolitaine")),
    )?;
    registry.aggregate(
        COUNTRY_SUBSET,
        "fr:drom",
        "DROM",
        Members::dynamic(|ctx| current_departements(ctx, |code| code.len() == 3)),
        subset_properties(None),
    )?;
    registry.aggregate(
        COUNTRY_SUBSET,
        "fr:dromcom",
        "DROM-COM",
        Members::dynamic(|ctx| {
            let mut ids = current_departements(ctx, |code| code.len() == 3)?;
            ids.extend(ctx.store.level(COLLECTIVITE, Some(ctx.today))?.into_iter().map(|z| z.id));
            Ok(ids)
        }),
        subset_properties(Some("fr:France_d%27outre-mer")),
    )?;

    Ok(())
}

fn subset_properties(wikipedia: Option<&str>) -> BTreeMap<String, Value> {
    let mut properties = BTreeMap::new();
    properties.insert("parents".to_string(), json!(FR_PARENTS));
    if let Some(wikipedia) = wikipedia {
        properties.insert("wikipedia".to_string(), json!(wikipedia));
    }
    properties
}

/// Ids of the departements valid today whose code passes `keep`
fn current_departements<F>(ctx: &StageContext<'_>, keep: F) -> anyhow::Result<Vec<String>>
where
    F: Fn(&str) -> bool,
{
    Ok(ctx
        .store
        .level(DEPARTEMENT, Some(ctx.today))?
        .into_iter()
        .filter(|zone| keep(&zone.code))
        .map(|zone| zone.id)
        .collect())
}

// ============================================================================
// ROW HELPERS
// ============================================================================

fn parse_date(value: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").with_context(|| format!("invalid date {:?}", value))
}

/// Geohisto datetime (`2016-01-01 00:00:00`) as a date, end-of-time as `None`
pub fn geohisto_date(value: &str) -> anyhow::Result<Option<NaiveDate>> {
    let date = value.split(' ').next().unwrap_or_default().trim();
    if date.is_empty() || date == GEOHISTO_EOT {
        return Ok(None);
    }
    parse_date(date).map(Some)
}

fn split_list(row: &Row, column: &str) -> Vec<String> {
    text(row, column)
        .map(|value| {
            value
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// JSON list column (strings or numbers), e.g. EPCI members
fn list(row: &Row, column: &str) -> Vec<String> {
    match row.get(column) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => split_list(row, column),
    }
}

/// Dotted path into nested objects (`collectiviteOutremer.code`)
fn nested_text(row: &Row, path: &str) -> Option<String> {
    let mut parts = path.split('.');
    let mut value = row.get(parts.next()?)?;
    for part in parts {
        value = value.get(part)?;
    }
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required(row: &Row, column: &str) -> anyhow::Result<String> {
    text(row, column).with_context(|| format!("missing column {}", column))
}

/// History link (`COM-01001@1942-01-01`) as a commune id
fn commune_link(row: &Row, column: &str) -> Vec<String> {
    text(row, column)
        .map(|value| vec![value.replacen("COM-", "fr:commune:", 1)])
        .unwrap_or_default()
}

/// Build zones from rows, logging and skipping malformed ones
fn zones_from_rows<F>(rows: Vec<Row>, level: &str, build: F) -> Vec<Zone>
where
    F: Fn(&Row) -> anyhow::Result<Option<Zone>>,
{
    rows.iter()
        .filter_map(|row| match build(row) {
            Ok(zone) => zone.map(|mut zone| {
                zone.level = level.to_string();
                zone
            }),
            Err(e) => {
                error!("Malformed {} record {:?}: {:#}", level, row, e);
                None
            }
        })
        .collect()
}

/// Common part of the geohisto exports (regions, departements, collectivites)
fn geohisto_zone(row: &Row) -> anyhow::Result<Zone> {
    let code = required(row, "insee_code")?;
    let mut zone = Zone::draft(code.clone(), required(row, "name")?)
        .with_parents(FR_PARENTS)
        .with_parents(split_list(row, "parents"))
        .with_key("insee", code)
        .with_validity(Validity::new(
            geohisto_date(&text(row, "start_datetime").unwrap_or_default())?,
            geohisto_date(&text(row, "end_datetime").unwrap_or_default())?,
        ));
    zone.id = required(row, "id")?;
    zone.successors = split_list(row, "successors");
    zone.ancestors = split_list(row, "ancestors");
    Ok(zone)
}

// ============================================================================
// PREPROCESSORS
// ============================================================================

pub fn load_communes_history(ctx: &StageContext<'_>, rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    let zones = zones_from_rows(rows.unwrap_or_default(), COMMUNE, |row| {
        if text(row, "type").as_deref() != Some("COM") {
            return Ok(None);
        }
        let code = required(row, "code")?;
        let start = text(row, "dateDebut");
        let mut zone = Zone::draft(code.clone(), required(row, "nom")?)
            .with_parents(FR_PARENTS)
            .with_key("insee", code.clone())
            .with_key("histo", text(row, "id"))
            .with_validity(Validity::new(
                start.as_deref().map(parse_date).transpose()?,
                text(row, "dateFin").as_deref().map(parse_date).transpose()?,
            ));
        zone.id = format!("{}:{}@{}", COMMUNE, code, start.as_deref().unwrap_or(DEBUT));
        zone.successors = commune_link(row, "successeur");
        zone.ancestors = commune_link(row, "predecesseur");
        Ok(Some(zone))
    });

    let count = ctx.store.safe_bulk_insert(zones)?;
    info!("✓ Loaded {} french commune(s)", count);
    Ok(count)
}

pub fn load_departements(ctx: &StageContext<'_>, rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    let zones = zones_from_rows(rows.unwrap_or_default(), DEPARTEMENT, |row| geohisto_zone(row).map(Some));
    let count = ctx.store.safe_bulk_insert(zones)?;
    info!("✓ Loaded {} french departement(s)", count);
    Ok(count)
}

pub fn load_collectivites(ctx: &StageContext<'_>, rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    let zones = zones_from_rows(rows.unwrap_or_default(), COLLECTIVITE, |row| {
        let mut zone = geohisto_zone(row)?;
        if let Some(iso2) = text(row, "iso2") {
            zone.extra.insert("iso2".to_string(), json!(iso2));
        }
        Ok(Some(zone))
    });
    let count = ctx.store.safe_bulk_insert(zones)?;
    info!("✓ Loaded {} french oversea collectivities", count);
    Ok(count)
}

pub fn load_regions(ctx: &StageContext<'_>, rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    let zones = zones_from_rows(rows.unwrap_or_default(), REGION, |row| {
        let mut zone = geohisto_zone(row)?.with_key("nuts2", text(row, "nuts_code"));
        zone.area = text(row, "surface").and_then(|v| v.parse().ok());
        zone.population = text(row, "population").and_then(|v| v.parse().ok());
        zone.wikipedia = text(row, "wikipedia");
        Ok(Some(zone))
    });
    let count = ctx.store.safe_bulk_insert(zones)?;
    info!("✓ Loaded {} french region(s)", count);
    Ok(count)
}

/// EPCI history; members are kept as commune codes until `attach_epci`
pub fn load_epcis_history(ctx: &StageContext<'_>, rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    let zones = zones_from_rows(rows.unwrap_or_default(), EPCI, |row| {
        let siren = required(row, "siren")?;
        let epci_id = |id: String| format!("{}:{}", EPCI, id);
        let mut zone = Zone::draft(siren.clone(), required(row, "nom")?)
            .with_parents(FR_PARENTS)
            .with_key("siren", siren)
            .with_validity(Validity::new(
                text(row, "dateDebut").as_deref().map(parse_date).transpose()?,
                text(row, "dateFin").as_deref().map(parse_date).transpose()?,
            ));
        zone.id = epci_id(required(row, "id")?);
        zone.population = text(row, "population").and_then(|v| v.parse().ok());
        zone.successors = list(row, "successeurs").into_iter().map(epci_id).collect();
        zone.ancestors = list(row, "predecesseurs").into_iter().map(epci_id).collect();
        zone.extra.insert("towns".to_string(), json!(list(row, "membres")));
        Ok(Some(zone))
    });
    let count = ctx.store.safe_bulk_insert(zones)?;
    info!("✓ Loaded {} EPCI(s)", count);
    Ok(count)
}

// ============================================================================
// EXTRACTORS
// ============================================================================

/// Reference date of the 2019 contours datasets
fn contours_date() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(2019, 1, 1)
}

/// Attach a contour to the commune incarnation still valid in 2019
pub fn extract_french_communes(store: &ZoneStore, record: &GeoRecord) -> anyhow::Result<Option<Zone>> {
    let code = record.text("code").context("missing commune code")?;
    match store.fetch_zone(COMMUNE, Some(&code), None, contours_date())? {
        Some(zone) => Ok(Some(zone.with_parents(FR_PARENTS))),
        None => {
            warn!("Commune {} not found in history, skipping", code);
            Ok(None)
        }
    }
}

pub fn extract_french_departements(store: &ZoneStore, record: &GeoRecord) -> anyhow::Result<Option<Zone>> {
    let mut code = record.text("code").context("missing departement code")?;
    // Lyon metropolis is not a departement in the history
    if code == "69D" {
        code = "69".to_string();
    }
    match store.fetch_zone(DEPARTEMENT, Some(&code), None, NaiveDate::from_ymd_opt(2016, 1, 1))? {
        Some(zone) => Ok(Some(zone)),
        None => {
            warn!("Departement {} not found in history, skipping", code);
            Ok(None)
        }
    }
}

pub fn extract_french_regions(store: &ZoneStore, record: &GeoRecord) -> anyhow::Result<Option<Zone>> {
    let code = record.text("code").context("missing region code")?;
    match store.fetch_zone(REGION, Some(&code), None, NaiveDate::from_ymd_opt(2016, 1, 1))? {
        Some(zone) => Ok(Some(zone)),
        None => {
            warn!("Region {} not found in history, skipping", code);
            Ok(None)
        }
    }
}

// ============================================================================
// POSTPROCESSORS
// ============================================================================

/// Reference date of the current communes dataset
fn current_communes_date() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(2019, 1, 1)
}

/// Parent levels and the dataset field holding their code
const COMMUNE_PARENT_FIELDS: [(&str, &str); 4] = [
    (REGION, "region"),
    (DEPARTEMENT, "departement"),
    (ARRONDISSEMENT, "arrondissement"),
    (COLLECTIVITE, "collectiviteOutremer.code"),
];

/// Attach current communes to their region, departement, arrondissement and
/// overseas collectivity, and set their population.
pub fn attach_current_french_communes_parents(
    ctx: &StageContext<'_>,
    rows: Option<Vec<Row>>,
) -> anyhow::Result<usize> {
    info!("Attaching french communes to their parents");
    let at = current_communes_date();
    let mut processed = 0;

    for row in rows.unwrap_or_default() {
        let Some(code) = text(&row, "code") else {
            continue;
        };
        let mut update = ZoneUpdate::new();
        for (level, field) in COMMUNE_PARENT_FIELDS {
            let Some(parent_code) = nested_text(&row, field) else {
                continue;
            };
            match ctx.store.zone(level, &parent_code.to_lowercase(), at)? {
                Some(parent) => update = update.add_parents([parent.id]),
                None => warn!("Unable to find {} with code {} for commune {}", level, parent_code, code),
            }
        }
        if let Some(population) = row.get("population").and_then(Value::as_u64) {
            update = update.set_population(population);
        }
        if update.is_empty() {
            continue;
        }
        if ctx.store.update_zone(COMMUNE, &code.to_lowercase(), at, &update)?.is_some() {
            processed += 1;
        }
    }

    info!("✓ Attached {} french communes to their parents", processed);
    Ok(processed)
}

/// Ids of the municipal districts of a city, in the communes history
fn district_ids(prefix: &str, numbers: std::ops::RangeInclusive<u32>) -> Vec<String> {
    let width = 5 - prefix.len();
    numbers
        .map(|n| format!("{}:{}{:0>width$}@{}", COMMUNE, prefix, n, DEBUT, width = width))
        .collect()
}

/// Paris, Marseille and Lyon districts inherit their city and its parents.
pub fn commune_with_districts(ctx: &StageContext<'_>, _rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    let mut processed = 0;
    for (code, prefix, numbers) in CITIES_WITH_DISTRICTS {
        let city_id = format!("{}:{}@{}", COMMUNE, code, DEBUT);
        let Some(city) = ctx.store.find(&city_id)? else {
            warn!("City {} not found, districts left detached", city_id);
            continue;
        };
        let mut parents = city.parents.clone();
        parents.push(city.id.clone());

        let attached = ctx
            .store
            .update_by_ids(&district_ids(prefix, numbers), &ZoneUpdate::new().add_parents(parents))?;
        info!("✓ Attached {} districts to {}", attached, city.name);
        processed += attached;
    }
    Ok(processed)
}

pub fn fr_postal_codes(ctx: &StageContext<'_>, rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    let mut processed = 0;
    for row in rows.unwrap_or_default() {
        let (Some(commune), Some(postal)) = (text(&row, "codeCommune"), text(&row, "codePostal")) else {
            continue;
        };
        let update = ZoneUpdate::new().add_key_value("postal", postal);
        if ctx.store.update_zone(COMMUNE, &commune, Some(ctx.today), &update)?.is_some() {
            processed += 1;
        }
    }
    info!("✓ Processed {} french postal codes", processed);
    Ok(processed)
}

pub fn compute_departement_area_and_population(
    ctx: &StageContext<'_>,
    _rows: Option<Vec<Row>>,
) -> anyhow::Result<usize> {
    info!("Computing french counties areas and population by aggregation");
    let rollup = ctx.store.aggregate_with_progress(&Aggregation::ParentRollup {
        level: COMMUNE.to_string(),
        parent_prefix: DEPARTEMENT.to_string(),
    })?;

    let mut processed = 0;
    for row in rollup {
        let update = ZoneUpdate::new()
            .set_area(row.area.unwrap_or(0.0))
            .set_population(row.population.unwrap_or(0));
        if ctx.store.update_by_id(&row.key, &update)?.is_some() {
            processed += 1;
        }
    }
    info!("✓ Computed area and population for {} french counties", processed);
    Ok(processed)
}

pub fn compute_region_population(ctx: &StageContext<'_>, _rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    info!("Computing french regions population by aggregation");
    let rollup = ctx.store.aggregate_with_progress(&Aggregation::ParentRollup {
        level: DEPARTEMENT.to_string(),
        parent_prefix: REGION.to_string(),
    })?;

    let mut processed = 0;
    for row in rollup {
        let Some(population) = row.population.filter(|p| *p > 0) else {
            continue;
        };
        let update = ZoneUpdate::new().set_population(population);
        if ctx.store.update_by_id(&row.key, &update)?.is_some() {
            processed += 1;
        }
    }
    info!("✓ Computed population for {} french regions", processed);
    Ok(processed)
}

pub fn compute_district_population(ctx: &StageContext<'_>, _rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    info!("Computing french districts population by aggregation");
    let rollup = ctx.store.aggregate_with_progress(&Aggregation::ParentRollup {
        level: COMMUNE.to_string(),
        parent_prefix: ARRONDISSEMENT.to_string(),
    })?;

    let mut processed = 0;
    for row in rollup {
        let Some(population) = row.population.filter(|p| *p > 0) else {
            continue;
        };
        if ctx
            .store
            .update_by_id(&row.key, &ZoneUpdate::new().set_population(population))?
            .is_some()
        {
            processed += 1;
        }
    }
    info!("✓ Computed population for {} french districts", processed);
    Ok(processed)
}

/// Attach member communes to their EPCI, then build the EPCI geometry and
/// area when every member has one.
pub fn attach_epci(ctx: &StageContext<'_>, _rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    info!("Processing EPCI town list");
    let (mut attached, mut geometries, mut areas) = (0, 0, 0);

    for mut epci in ctx.store.level(EPCI, None)? {
        let codes: Vec<String> = epci
            .extra
            .get("towns")
            .and_then(Value::as_array)
            .map(|towns| towns.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();

        let mut towns = Vec::with_capacity(codes.len());
        for code in &codes {
            let code = format!("{:0>5}", code.to_lowercase());
            match ctx.store.zone(COMMUNE, &code, epci.validity.start)? {
                Some(town) => towns.push(town),
                None => warn!("Commune {} of {} not found", code, epci.id),
            }
        }
        if towns.is_empty() {
            continue;
        }

        let ids: Vec<String> = towns.iter().map(|town| town.id.clone()).collect();
        attached += ctx
            .store
            .update_by_ids(&ids, &ZoneUpdate::new().add_parents([epci.id.clone()]))?;

        if towns.len() < codes.len() {
            continue;
        }
        let shapes: Option<Vec<_>> = towns.iter().map(|town| town.geometry.clone()).collect();
        if let Some(shapes) = shapes {
            epci.geometry = Some(geometry::union_all(&shapes));
            geometries += 1;
        }
        let surface: Option<Vec<f64>> = towns.iter().map(|town| town.area).collect();
        if let Some(surface) = surface {
            epci.area = Some(surface.iter().sum());
            areas += 1;
        }
        ctx.store.upsert(&epci)?;
    }

    info!("✓ Attached {} french towns to their EPCI", attached);
    info!("✓ Constructed {} french EPCI geometry, {} areas", geometries, areas);
    Ok(attached)
}

// ============================================================================
// WIKIDATA
// ============================================================================

fn wikidata_query(template: &str, subject: &str, specific: &[&str]) -> EntityQuery {
    EntityQuery {
        template: template.replace("{flag_of_france}", FLAG_OF_FRANCE),
        subject: subject.to_string(),
        attributes: WIKIDATA_COMMON
            .iter()
            .chain(specific)
            .map(|s| s.to_string())
            .collect(),
    }
}

/// Update for the attributes every French Wikidata entity may carry
fn entity_update(entity: &Entity, subject: &str) -> ZoneUpdate {
    let mut update = ZoneUpdate::new();

    if let Some(id) = entity.get(subject).and_then(wiki::data_uri_to_id) {
        update = update.set_text(TextField::Wikidata, id);
    }
    if let Some(wikipedia) = entity.get("wikipedia") {
        if let Some(id) = wiki::wikipedia_url_to_id(wikipedia) {
            update = update.set_text(TextField::Wikipedia, id);
        }
        if let Some(dbpedia) = wiki::wikipedia_to_dbpedia(wikipedia) {
            update = update.set_text(TextField::Dbpedia, dbpedia);
        }
    }
    if let Some(site) = entity.get("site") {
        update = update.set_text(TextField::Website, site);
    }
    for (attribute, field) in [
        ("flag", TextField::Flag),
        ("blazon", TextField::Blazon),
        ("logo", TextField::Logo),
    ] {
        if let Some(path) = entity.get(attribute).and_then(wiki::media_url_to_path) {
            update = update.set_text(field, path);
        }
    }
    if let Some(area) = entity.get("area").and_then(|v| v.parse::<f64>().ok()).filter(|a| *a > 0.0) {
        update = update.set_area(area);
    }
    if let Some(population) = entity
        .get("population")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|p| *p >= 1.0)
    {
        update = update.set_population(population.round() as u64);
    }
    if let Some(osm) = entity.get("osm") {
        update = update.set_key("osm", osm);
    }
    let geonames = entity.all("geonames");
    if !geonames.is_empty() {
        update = update.set_key("geonames", json!(geonames));
    }
    update
}

/// Lowercased codes, and the latest SIREN (they are sequential)
fn with_admin_keys(mut update: ZoneUpdate, entity: &Entity, codes: &[&str]) -> ZoneUpdate {
    for key in codes {
        if let Some(value) = entity.get(key) {
            update = update.set_key(*key, value.to_lowercase());
        }
    }
    if let Some(siren) = entity.all("siren").iter().max() {
        update = update.set_key("siren", siren.as_str());
    }
    update
}

/// Codes of a level, uppercased the way Wikidata stores them
fn wikidata_codes(ctx: &StageContext<'_>, level: &str, missing: &[&str]) -> anyhow::Result<Vec<String>> {
    Ok(ctx
        .store
        .aggregate_with_progress(&Aggregation::DistinctCodes {
            level: level.to_string(),
            missing: missing.iter().map(|s| s.to_string()).collect(),
        })?
        .map(|row| row.key.to_uppercase())
        .collect())
}

pub fn fetch_region_data_from_wikidata(ctx: &StageContext<'_>, _rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    info!("Fetching french regions wikidata metadata");
    let codes = wikidata_codes(ctx, REGION, &[])?;
    let query = wikidata_query(REGION_SPARQL, "region", &["insee", "iso2", "siren", "fips", "nuts2"]);

    let processed = lookup_chunked(ctx.knowledge_base, &query, &codes, ctx.chunk_size, |entity| {
        let Some(insee) = entity.get("insee") else {
            return Ok(false);
        };
        let update = with_admin_keys(entity_update(entity, "region"), entity, &["iso2", "nuts2", "fips"]);
        let updated = ctx.store.update_zone(REGION, &insee.to_lowercase(), Some(ctx.today), &update)?;
        Ok(updated.is_some())
    })?;

    info!("✓ Fetched {} french regions metadata from wikidata", processed);
    Ok(processed)
}

/// Only communes never enriched, or still lacking population or area
pub fn fetch_communes_data_from_wikidata(
    ctx: &StageContext<'_>,
    _rows: Option<Vec<Row>>,
) -> anyhow::Result<usize> {
    info!("Fetching french communes metadata from wikidata");
    let codes = wikidata_codes(ctx, COMMUNE, &["population", "area", "wikidata"])?;
    let query = wikidata_query(COMMUNE_SPARQL, "commune", &["insee", "siren"]);

    let processed = lookup_chunked(ctx.knowledge_base, &query, &codes, ctx.chunk_size, |entity| {
        let Some(insee) = entity.get("insee") else {
            return Ok(false);
        };
        let update = with_admin_keys(entity_update(entity, "commune"), entity, &[]);
        let updated = ctx.store.update_zone(COMMUNE, &insee.to_lowercase(), Some(ctx.today), &update)?;
        Ok(updated.is_some())
    })?;

    info!("✓ Fetched {} french communes metadata from wikidata", processed);
    Ok(processed)
}

/// EPCIs are looked up by SIREN, every current incarnation gets the answer
pub fn fetch_epci_data_from_wikidata(ctx: &StageContext<'_>, _rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    info!("Fetching french EPCIs wikidata metadata");
    let sirens = wikidata_codes(ctx, EPCI, &[])?;
    let query = wikidata_query(EPCI_SPARQL, "epci", &["siren"]);

    let mut updated = 0;
    let sirens_found = lookup_chunked(ctx.knowledge_base, &query, &sirens, ctx.chunk_size, |entity| {
        let Some(siren) = entity.get("siren") else {
            return Ok(false);
        };
        let zones = ctx
            .store
            .update_zones(EPCI, siren, Some(ctx.today), &entity_update(entity, "epci"))?;
        updated += zones.len();
        Ok(!zones.is_empty())
    })?;

    info!("✓ Updated {} EPCIs from wikidata using {} SIREN numbers", updated, sirens_found);
    Ok(updated)
}

/// French country subsets that already know their Wikidata entity
pub fn fetch_french_country_subset_wikidata_metadata(
    ctx: &StageContext<'_>,
    _rows: Option<Vec<Row>>,
) -> anyhow::Result<usize> {
    info!("Fetching french country subsets wikidata metadata");
    let subsets: BTreeMap<String, String> = ctx
        .store
        .level(COUNTRY_SUBSET, None)?
        .into_iter()
        .filter(|zone| zone.code.starts_with("fr:") && zone.code.len() > 3)
        .filter_map(|zone| zone.wikidata.map(|wdid| (wdid, zone.id)))
        .collect();
    let wdids: Vec<String> = subsets.keys().cloned().collect();
    let query = wikidata_query(COUNTRY_SUBSET_SPARQL, "subset", &["wdid"]);

    let processed = lookup_chunked(ctx.knowledge_base, &query, &wdids, ctx.chunk_size, |entity| {
        let Some(zone_id) = entity
            .get("subset")
            .and_then(wiki::data_uri_to_id)
            .and_then(|wdid| subsets.get(&wdid))
        else {
            return Ok(false);
        };
        // Subsets have no blazon nor logo
        let mut update = entity_update(entity, "subset");
        update.text.retain(|(field, _)| !matches!(field, TextField::Blazon | TextField::Logo));
        Ok(ctx.store.update_by_id(zone_id, &update)?.is_some())
    })?;

    info!("✓ Fetched {} french country subsets metadata from wikidata", processed);
    Ok(processed)
}

/// Update built from one Wikidata departement entity
fn departement_update(entity: &Entity) -> ZoneUpdate {
    with_admin_keys(entity_update(entity, "dpt"), entity, &["iso2", "nuts3", "fips"])
}

pub fn fetch_departement_data_from_wikidata(
    ctx: &StageContext<'_>,
    _rows: Option<Vec<Row>>,
) -> anyhow::Result<usize> {
    info!("Fetching french departement wikidata metadata");
    let codes = wikidata_codes(ctx, DEPARTEMENT, &[])?;
    let query = wikidata_query(DEPARTEMENT_SPARQL, "dpt", &["insee", "iso2", "siren", "fips", "nuts3"]);
    let processed = lookup_chunked(ctx.knowledge_base, &query, &codes, ctx.chunk_size, |entity| {
        let Some(insee) = entity.get("insee") else {
            return Ok(false);
        };
        let updated = ctx.store.update_zone(
            DEPARTEMENT,
            &insee.to_lowercase(),
            Some(ctx.today),
            &departement_update(entity),
        )?;
        Ok(updated.is_some())
    })?;

    info!("✓ Fetched {} french departements metadata from wikidata", processed);
    Ok(processed)
}
