// ⛏️ Extraction - turn geospatial records into stored zones
//
// Per-record failures are logged with the raw properties and do not abort the
// scan; contract violations and store failures do. Unsupported geometries are
// skipped, invalid ones stored with a warning.

use crate::db::ZoneStore;
use crate::error::{GeozonesError, Result};
use crate::geometry;
use crate::identity;
use crate::level::Extractor;
use crate::sources::GeoRecord;
use anyhow::Context;
use serde::Serialize;
use tracing::{error, info, warn};

/// Outcome counts of one dataset scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub loaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ExtractReport {
    pub fn merge(&mut self, other: ExtractReport) {
        self.loaded += other.loaded;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

enum Outcome {
    Loaded,
    Skipped,
}

/// Run `extractor` over every record and upsert the resulting zones.
pub fn process_dataset(
    store: &ZoneStore,
    level_id: &str,
    extractor: &Extractor,
    records: &[GeoRecord],
) -> Result<ExtractReport> {
    let mut report = ExtractReport::default();

    for record in records {
        match extract_record(store, level_id, extractor, record) {
            Ok(Outcome::Loaded) => report.loaded += 1,
            Ok(Outcome::Skipped) => report.skipped += 1,
            Err(e) if must_abort(&e) => return Err(escalate(&extractor.name, e)),
            Err(e) => {
                let props = serde_json::to_string(&record.properties).unwrap_or_default();
                error!("Error extracting polygon {}:\n{:#}", props, e);
                report.failed += 1;
            }
        }
    }

    info!(
        "Loaded {} zones for level {} with {} ({} skipped, {} failed)",
        report.loaded, level_id, extractor.name, report.skipped, report.failed
    );
    Ok(report)
}

/// Contract violations and store failures stop the scan, bad records do not
fn must_abort(e: &anyhow::Error) -> bool {
    e.downcast_ref::<GeozonesError>()
        .map_or(false, |err| err.is_contract_violation() || matches!(err, GeozonesError::Store(_)))
}

fn escalate(extractor: &str, e: anyhow::Error) -> GeozonesError {
    match e.downcast::<GeozonesError>() {
        Ok(err) if err.is_contract_violation() => {
            GeozonesError::InvalidUsage(format!("{} failed: {}", extractor, err))
        }
        Ok(err) => err,
        Err(e) => GeozonesError::InvalidUsage(format!("{} failed: {:#}", extractor, e)),
    }
}

fn extract_record(
    store: &ZoneStore,
    level_id: &str,
    extractor: &Extractor,
    record: &GeoRecord,
) -> anyhow::Result<Outcome> {
    let Some(mut zone) = extractor.extract(store, record)? else {
        return Ok(Outcome::Skipped);
    };
    zone.prune_keys();

    if record.geometry.is_null() {
        warn!("No geometry for \"{}\", skipping", zone.name);
        return Ok(Outcome::Skipped);
    }
    let raw = geometry::from_geojson(&record.geometry).context("unreadable geometry")?;

    let geom = match geometry::normalize(raw, extractor.simplify) {
        Ok(geom) => geom,
        Err(GeozonesError::Geometry(reason)) => {
            warn!("{} for \"{}\"", reason, zone.name);
            return Ok(Outcome::Skipped);
        }
        Err(e) => return Err(e.into()),
    };

    let zone_id = identity::assign_id(level_id, &zone);
    if let Some(reason) = geometry::explain_invalidity(&geom) {
        warn!("Invalid geometry for \"{}\": {}", zone_id, reason);
    }

    zone.geometry = Some(geom);
    zone.id = zone_id;
    zone.level = level_id.to_string();
    store.upsert(&zone)?;

    Ok(Outcome::Loaded)
}
