// 🗄️ Zone Store - SQLite document collection with validity-aware queries
//
// Each zone is stored as a JSON document; level, code and validity bounds are
// mirrored into columns so interval predicates run in SQL.

use crate::error::{GeozonesError, Result};
use crate::zone::{Zone, ZoneUpdate};
use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Deterministic tie-break: latest validity start first, unbounded start last
const ORDER_BY_START: &str = "ORDER BY validity_start IS NULL, validity_start DESC, rowid";

// ============================================================================
// QUERY BUILDING
// ============================================================================

/// How `validity.end` is compared by `fetch_zone(s)`.
#[derive(Debug, Clone, Copy)]
enum EndBound {
    /// Ended on or before the date
    Before(NaiveDate),
    /// Ends on or after the date (current zones always do)
    After(NaiveDate),
}

/// WHERE clause accumulator with positional parameters.
#[derive(Default)]
struct Predicate {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl Predicate {
    fn eq(mut self, column: &str, value: &str) -> Self {
        self.clauses.push(format!("{} = ?", column));
        self.params.push(SqlValue::Text(value.to_string()));
        self
    }

    /// `start <= at AND (end IS NULL OR end > at)`, missing start is -infinity
    fn valid_at(mut self, at: Option<NaiveDate>) -> Self {
        if let Some(at) = at {
            let at = at.to_string();
            self.clauses.push(
                "(validity_start IS NULL OR validity_start <= ?) \
                 AND (validity_end IS NULL OR validity_end > ?)"
                    .to_string(),
            );
            self.params.push(SqlValue::Text(at.clone()));
            self.params.push(SqlValue::Text(at));
        }
        self
    }

    fn end_bound(mut self, bound: EndBound) -> Self {
        match bound {
            EndBound::Before(date) => {
                self.clauses
                    .push("(validity_end IS NOT NULL AND validity_end <= ?)".to_string());
                self.params.push(SqlValue::Text(date.to_string()));
            }
            EndBound::After(date) => {
                self.clauses
                    .push("(validity_end IS NULL OR validity_end >= ?)".to_string());
                self.params.push(SqlValue::Text(date.to_string()));
            }
        }
        self
    }

    fn in_list(mut self, column: &str, values: &[String]) -> Self {
        if values.is_empty() {
            self.clauses.push("0".to_string());
            return self;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.clauses.push(format!("{} IN ({})", column, placeholders));
        self.params
            .extend(values.iter().map(|v| SqlValue::Text(v.clone())));
        self
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn end_bound(before: Option<NaiveDate>, after: Option<NaiveDate>) -> Result<EndBound> {
    match (before, after) {
        (Some(before), None) => Ok(EndBound::Before(before)),
        (None, Some(after)) => Ok(EndBound::After(after)),
        (Some(_), Some(_)) => Err(GeozonesError::InvalidQuery(
            "\"before\" and \"after\" are mutually exclusive".to_string(),
        )),
        (None, None) => Err(GeozonesError::InvalidQuery(
            "You must set the \"before\" or \"after\" parameters".to_string(),
        )),
    }
}

// ============================================================================
// AGGREGATION QUERIES
// ============================================================================

/// Grouping queries run through `aggregate_with_progress`.
#[derive(Debug, Clone)]
pub enum Aggregation {
    /// Distinct codes of a level, optionally restricted to zones missing
    /// any of the listed attributes.
    DistinctCodes { level: String, missing: Vec<String> },

    /// Population/area of a level's zones summed per parent id, keeping only
    /// parents whose id starts with `parent_prefix`.
    ParentRollup { level: String, parent_prefix: String },
}

impl Aggregation {
    fn sql(&self) -> Result<(String, Vec<SqlValue>)> {
        match self {
            Aggregation::DistinctCodes { level, missing } => {
                let mut sql = "SELECT code, NULL, NULL FROM zones WHERE level = ?1".to_string();
                let mut params = vec![SqlValue::Text(level.clone())];
                if !missing.is_empty() {
                    let mut checks = Vec::with_capacity(missing.len());
                    for attr in missing {
                        params.push(SqlValue::Text(attribute_path(attr)?));
                        checks.push(format!("json_extract(doc, ?{}) IS NULL", params.len()));
                    }
                    sql.push_str(&format!(" AND ({})", checks.join(" OR ")));
                }
                sql.push_str(" GROUP BY code ORDER BY code");
                Ok((sql, params))
            }
            Aggregation::ParentRollup { level, parent_prefix } => Ok((
                "SELECT p.value,
                        SUM(json_extract(z.doc, '$.population')),
                        SUM(json_extract(z.doc, '$.area'))
                 FROM zones z, json_each(z.doc, '$.parents') p
                 WHERE z.level = ?1 AND substr(p.value, 1, length(?2)) = ?2
                 GROUP BY p.value
                 ORDER BY p.value"
                    .to_string(),
                vec![
                    SqlValue::Text(level.clone()),
                    SqlValue::Text(parent_prefix.clone()),
                ],
            )),
        }
    }
}

/// JSON path of a (possibly dotted) document attribute, e.g. `keys.insee`.
fn attribute_path(attr: &str) -> Result<String> {
    let valid = !attr.is_empty()
        && attr.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if !valid {
        return Err(GeozonesError::InvalidQuery(format!(
            "Invalid attribute name: {:?}",
            attr
        )));
    }
    Ok(format!("$.{}", attr))
}

/// One group produced by an aggregation query
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub key: String,
    pub population: Option<u64>,
    pub area: Option<f64>,
}

/// Aggregation results with their count known up front (for progress).
#[derive(Debug)]
pub struct AggregationCursor {
    total: usize,
    rows: std::vec::IntoIter<AggregateRow>,
}

impl AggregationCursor {
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for AggregationCursor {
    type Item = AggregateRow;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

// ============================================================================
// STORE
// ============================================================================

/// The zones collection. Single writer: the pipeline owns it for a whole run.
pub struct ZoneStore {
    conn: Connection,
}

impl ZoneStore {
    /// Open (or create) a store on disk, in WAL mode for crash recovery
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = ZoneStore { conn };
        store.initialize()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = ZoneStore {
            conn: Connection::open_in_memory()?,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Create the collection and its indexes (no-op when they exist)
    pub fn initialize(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS zones (
                id TEXT PRIMARY KEY NOT NULL,
                level TEXT NOT NULL,
                code TEXT NOT NULL,
                validity_start TEXT,
                validity_end TEXT,
                doc TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_zones_level_code ON zones(level, code)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_zones_validity ON zones(validity_start, validity_end)",
            [],
        )?;

        Ok(())
    }

    /// Drop every zone
    pub fn drop_all(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM zones", [])?)
    }

    // ========================================================================
    // READS
    // ========================================================================

    fn query(&self, predicate: &Predicate, suffix: &str) -> Result<Vec<Zone>> {
        let sql = format!("SELECT doc FROM zones {} {}", predicate.sql(), suffix);
        let mut stmt = self.conn.prepare(&sql)?;
        let docs = stmt
            .query_map(params_from_iter(predicate.params.iter()), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        docs.iter()
            .map(|doc| serde_json::from_str(doc).map_err(GeozonesError::from))
            .collect()
    }

    fn query_one(&self, predicate: &Predicate) -> Result<Option<Zone>> {
        let suffix = format!("{} LIMIT 1", ORDER_BY_START);
        Ok(self.query(predicate, &suffix)?.into_iter().next())
    }

    /// Zone by id
    pub fn find(&self, id: &str) -> Result<Option<Zone>> {
        let doc: Option<String> = self
            .conn
            .query_row("SELECT doc FROM zones WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// The zone of `(level, code)` valid at `at` (any validity when `at` is None)
    pub fn zone(&self, level: &str, code: &str, at: Option<NaiveDate>) -> Result<Option<Zone>> {
        let predicate = Predicate::default()
            .eq("level", level)
            .eq("code", code)
            .valid_at(at);
        self.query_one(&predicate)
    }

    /// Every zone of `(level, code)` valid at `at`, latest start first
    pub fn zones(&self, level: &str, code: &str, at: Option<NaiveDate>) -> Result<Vec<Zone>> {
        let predicate = Predicate::default()
            .eq("level", level)
            .eq("code", code)
            .valid_at(at);
        self.query(&predicate, ORDER_BY_START)
    }

    /// Every zone of a level valid at `at`
    pub fn level(&self, level: &str, at: Option<NaiveDate>) -> Result<Vec<Zone>> {
        let predicate = Predicate::default().eq("level", level).valid_at(at);
        self.query(&predicate, "ORDER BY code, validity_start IS NULL, validity_start DESC")
    }

    /// Latest-starting zone whose validity ends before/after a date.
    ///
    /// `before` and `after` are mutually exclusive; passing both or neither is
    /// an `InvalidQuery` error.
    pub fn fetch_zone(
        &self,
        level: &str,
        code: Option<&str>,
        before: Option<NaiveDate>,
        after: Option<NaiveDate>,
    ) -> Result<Option<Zone>> {
        let mut predicate = Predicate::default()
            .eq("level", level)
            .end_bound(end_bound(before, after)?);
        if let Some(code) = code {
            predicate = predicate.eq("code", code);
        }
        self.query_one(&predicate)
    }

    /// Same predicate as `fetch_zone`, every match by descending start
    pub fn fetch_zones(
        &self,
        level: &str,
        code: Option<&str>,
        before: Option<NaiveDate>,
        after: Option<NaiveDate>,
    ) -> Result<Vec<Zone>> {
        let mut predicate = Predicate::default()
            .eq("level", level)
            .end_bound(end_bound(before, after)?);
        if let Some(code) = code {
            predicate = predicate.eq("code", code);
        }
        self.query(&predicate, ORDER_BY_START)
    }

    /// Every zone id stored at a level, whatever its validity
    pub fn distinct_ids(&self, level: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT id FROM zones WHERE level = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map([level], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Zones of the given levels, in level order then id order
    pub fn zones_for_levels(&self, levels: &[String]) -> Result<Vec<Zone>> {
        let mut zones = Vec::new();
        for level in levels {
            let predicate = Predicate::default().eq("level", level);
            zones.extend(self.query(&predicate, "ORDER BY id")?);
        }
        Ok(zones)
    }

    /// `(level, code)` pairs stored more than once
    pub fn shared_codes(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT level, code FROM zones
             GROUP BY level, code
             HAVING COUNT(*) > 1
             ORDER BY level, code",
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM zones", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_level(&self, level: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM zones WHERE level = ?1",
            [level],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Run a grouping query, counting its groups first.
    pub fn aggregate_with_progress(&self, aggregation: &Aggregation) -> Result<AggregationCursor> {
        let (sql, params) = aggregation.sql()?;

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM ({})", sql),
            params_from_iter(params.iter()),
            |row| row.get(0),
        )?;
        debug!("Aggregation {:?}: {} groups", aggregation, total);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                let population: Option<f64> = row.get(1)?;
                Ok(AggregateRow {
                    key: row.get(0)?,
                    population: population.map(|p| p.max(0.0).round() as u64),
                    area: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(AggregationCursor {
            total: total as usize,
            rows: rows.into_iter(),
        })
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    fn check_writable(zone: &Zone) -> Result<()> {
        if zone.id.is_empty() {
            return Err(GeozonesError::InvalidUsage(format!(
                "zone {:?} has no id",
                zone.code
            )));
        }
        if zone.level.is_empty() || zone.code.is_empty() {
            return Err(GeozonesError::InvalidUsage(format!(
                "zone {} has no level or code",
                zone.id
            )));
        }
        Ok(())
    }

    fn write(&self, zone: &Zone, replace: bool) -> Result<()> {
        let mut zone = zone.clone();
        zone.prune_keys();
        Self::check_writable(&zone)?;

        let doc = serde_json::to_string(&zone)?;
        let start = zone.validity.start.map(|d| d.to_string());
        let end = zone.validity.end.map(|d| d.to_string());

        let sql = if replace {
            "INSERT INTO zones (id, level, code, validity_start, validity_end, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                level = excluded.level,
                code = excluded.code,
                validity_start = excluded.validity_start,
                validity_end = excluded.validity_end,
                doc = excluded.doc,
                updated_at = CURRENT_TIMESTAMP"
        } else {
            "INSERT INTO zones (id, level, code, validity_start, validity_end, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        };

        self.conn
            .execute(sql, params![zone.id, zone.level, zone.code, start, end, doc])?;
        Ok(())
    }

    /// Replace-if-exists, insert-if-not, keyed by id
    pub fn upsert(&self, zone: &Zone) -> Result<()> {
        self.write(zone, true)
    }

    /// Plain insert, fails on duplicate id
    pub fn insert(&self, zone: &Zone) -> Result<()> {
        self.write(zone, false)
    }

    /// Insert many zones, continuing past individual failures.
    ///
    /// Every failing record is logged with its reason; the returned count only
    /// includes records that were actually inserted.
    pub fn safe_bulk_insert<I>(&self, zones: I) -> Result<usize>
    where
        I: IntoIterator<Item = Zone>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        let mut failures: Vec<String> = Vec::new();

        for zone in zones {
            match self.insert(&zone) {
                Ok(()) => inserted += 1,
                Err(GeozonesError::Store(rusqlite::Error::SqliteFailure(err, msg)))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    failures.push(format!(
                        "{}: duplicate key ({})",
                        zone.id,
                        msg.unwrap_or_default()
                    ));
                }
                Err(e) => failures.push(format!("{}: {}", zone.id, e)),
            }
        }

        tx.commit()?;

        if !failures.is_empty() {
            error!(
                "Bulk insert: {} record(s) failed:\n\t{}",
                failures.len(),
                failures.join("\n\t")
            );
        }
        info!("✓ Bulk inserted {} zone(s)", inserted);

        Ok(inserted)
    }

    fn apply_and_save(&self, mut zone: Zone, update: &ZoneUpdate) -> Result<(Zone, bool)> {
        let changed = update.apply(&mut zone);
        if changed {
            self.upsert(&zone)?;
        }
        Ok((zone, changed))
    }

    /// Update the zone of `(level, code)` valid at `at`; `None` when nothing matched
    pub fn update_zone(
        &self,
        level: &str,
        code: &str,
        at: Option<NaiveDate>,
        update: &ZoneUpdate,
    ) -> Result<Option<Zone>> {
        match self.zone(level, code, at)? {
            Some(zone) => Ok(Some(self.apply_and_save(zone, update)?.0)),
            None => Ok(None),
        }
    }

    /// Update every zone of `(level, code)` valid at `at`
    pub fn update_zones(
        &self,
        level: &str,
        code: &str,
        at: Option<NaiveDate>,
        update: &ZoneUpdate,
    ) -> Result<Vec<Zone>> {
        self.zones(level, code, at)?
            .into_iter()
            .map(|zone| self.apply_and_save(zone, update).map(|(zone, _)| zone))
            .collect()
    }

    pub fn update_by_id(&self, id: &str, update: &ZoneUpdate) -> Result<Option<Zone>> {
        match self.find(id)? {
            Some(zone) => Ok(Some(self.apply_and_save(zone, update)?.0)),
            None => {
                warn!("Zone {} not found", id);
                Ok(None)
            }
        }
    }

    /// Update the listed ids, returns how many documents changed
    pub fn update_by_ids(&self, ids: &[String], update: &ZoneUpdate) -> Result<usize> {
        let predicate = Predicate::default().in_list("id", ids);
        self.update_matching(&predicate, update)
    }

    /// Update every zone of `level` whose code is listed, returns how many changed
    pub fn update_codes(&self, level: &str, codes: &[String], update: &ZoneUpdate) -> Result<usize> {
        let predicate = Predicate::default().eq("level", level).in_list("code", codes);
        self.update_matching(&predicate, update)
    }

    fn update_matching(&self, predicate: &Predicate, update: &ZoneUpdate) -> Result<usize> {
        let mut modified = 0;
        for zone in self.query(predicate, "ORDER BY id")? {
            if self.apply_and_save(zone, update)?.1 {
                modified += 1;
            }
        }
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::Validity;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn commune(code: &str, name: &str, validity: Validity) -> Zone {
        let mut zone = Zone::draft(code, name).with_validity(validity);
        zone.level = "fr:commune".to_string();
        zone.id = match validity.start {
            Some(start) => format!("fr:commune:{}@{}", code, start),
            None => format!("fr:commune:{}", code),
        };
        zone
    }

    fn paris_store() -> ZoneStore {
        let store = ZoneStore::open_in_memory().unwrap();
        store
            .upsert(&commune(
                "75056",
                "Paris-Old",
                Validity::between(date("1942-01-01"), date("2018-12-31")),
            ))
            .unwrap();
        store
            .upsert(&commune("75056", "Paris", Validity::since(date("2019-01-01"))))
            .unwrap();
        store
    }

    #[test]
    fn test_zone_resolves_historical_incarnations() {
        let store = paris_store();

        let current = store.zone("fr:commune", "75056", Some(date("2020-06-01"))).unwrap();
        assert_eq!(current.unwrap().name, "Paris");

        let old = store.zone("fr:commune", "75056", Some(date("1950-01-01"))).unwrap();
        assert_eq!(old.unwrap().name, "Paris-Old");

        // Gap day between the two incarnations
        let gap = store.zone("fr:commune", "75056", Some(date("2018-12-31"))).unwrap();
        assert!(gap.is_none());

        let before_all = store.zone("fr:commune", "75056", Some(date("1900-01-01"))).unwrap();
        assert!(before_all.is_none());

        println!("✅ Paris end-to-end resolution test PASSED");
    }

    #[test]
    fn test_zone_containment_boundaries() {
        let store = ZoneStore::open_in_memory().unwrap();
        let s = date("2000-01-01");
        let e = date("2010-01-01");
        let cases = [
            ("both", Validity::between(s, e)),
            ("start", Validity::since(s)),
            ("end", Validity::new(None, Some(e))),
            ("none", Validity::default()),
        ];
        for (code, validity) in cases {
            store.upsert(&commune(code, code, validity)).unwrap();
        }

        let checked_dates = [
            date("1999-12-31"),
            s,
            date("2000-01-02"),
            date("2009-12-31"),
            e,
            date("2010-01-02"),
        ];
        for (code, validity) in cases {
            for at in checked_dates {
                let found = store.zone("fr:commune", code, Some(at)).unwrap();
                let expected = (validity.start.map_or(true, |s| s <= at))
                    && (validity.end.map_or(true, |e| at < e));
                assert_eq!(found.is_some(), expected, "{} at {}", code, at);
            }
        }
    }

    #[test]
    fn test_overlapping_intervals_pick_latest_start() {
        let store = ZoneStore::open_in_memory().unwrap();
        store
            .upsert(&commune("01001", "Old", Validity::since(date("1942-01-01"))))
            .unwrap();
        store
            .upsert(&commune("01001", "New", Validity::since(date("2000-01-01"))))
            .unwrap();

        let zone = store.zone("fr:commune", "01001", Some(date("2020-01-01"))).unwrap();
        assert_eq!(zone.unwrap().name, "New");
        assert_eq!(store.shared_codes().unwrap().len(), 1);
    }

    #[test]
    fn test_fetch_zone_requires_exactly_one_bound() {
        let store = paris_store();
        let d = Some(date("2016-01-01"));

        for (before, after) in [(d, d), (None, None)] {
            match store.fetch_zone("fr:commune", Some("75056"), before, after) {
                Err(GeozonesError::InvalidQuery(_)) => {}
                other => panic!("expected InvalidQuery, got {:?}", other),
            }
            assert!(matches!(
                store.fetch_zones("fr:commune", None, before, after),
                Err(GeozonesError::InvalidQuery(_))
            ));
        }
    }

    #[test]
    fn test_fetch_zone_before_and_after() {
        let store = paris_store();

        let ended = store
            .fetch_zone("fr:commune", Some("75056"), Some(date("2018-12-31")), None)
            .unwrap();
        assert_eq!(ended.unwrap().name, "Paris-Old");

        let current = store
            .fetch_zone("fr:commune", Some("75056"), None, Some(date("2019-01-01")))
            .unwrap();
        assert_eq!(current.unwrap().name, "Paris");

        let all = store
            .fetch_zones("fr:commune", None, None, Some(date("1900-01-01")))
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "Paris");
    }

    #[test]
    fn test_safe_bulk_insert_tolerates_duplicates() {
        let store = ZoneStore::open_in_memory().unwrap();
        let mut batch: Vec<Zone> = (1..=5)
            .map(|i| commune(&format!("0100{}", i), "Town", Validity::default()))
            .collect();
        // Record 3 reuses record 1's id
        batch[2].id = batch[0].id.clone();

        let inserted = store.safe_bulk_insert(batch).unwrap();

        assert_eq!(inserted, 4);
        assert_eq!(store.count().unwrap(), 4);
        assert!(store.find("fr:commune:01003").unwrap().is_none());
    }

    #[test]
    fn test_safe_bulk_insert_reports_invalid_records() {
        let store = ZoneStore::open_in_memory().unwrap();
        let good = commune("01001", "Town", Validity::default());
        let no_id = Zone::draft("01002", "Nameless");

        assert_eq!(store.safe_bulk_insert(vec![good, no_id]).unwrap(), 1);
    }

    #[test]
    fn test_upsert_replaces_document() {
        let store = ZoneStore::open_in_memory().unwrap();
        let mut zone = commune("01001", "Before", Validity::default());
        store.upsert(&zone).unwrap();
        zone.name = "After".to_string();
        store.upsert(&zone).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.find(&zone.id).unwrap().unwrap().name, "After");
    }

    #[test]
    fn test_update_zone_miss_is_not_an_error() {
        let store = paris_store();
        let update = ZoneUpdate::new().add_key_value("postal", "75001");

        let missing = store
            .update_zone("fr:commune", "99999", Some(date("2020-01-01")), &update)
            .unwrap();
        assert!(missing.is_none());

        let updated = store
            .update_zone("fr:commune", "75056", Some(date("2020-01-01")), &update)
            .unwrap()
            .unwrap();
        assert_eq!(updated.keys["postal"], serde_json::json!(["75001"]));

        // Historical incarnation untouched
        let old = store.zone("fr:commune", "75056", Some(date("1950-01-01"))).unwrap().unwrap();
        assert!(!old.keys.contains_key("postal"));
    }

    #[test]
    fn test_update_zones_touches_every_match() {
        let store = paris_store();
        let update = ZoneUpdate::new().add_parents(["country:fr"]);

        let updated = store.update_zones("fr:commune", "75056", None, &update).unwrap();
        assert_eq!(updated.len(), 2);

        let ids = vec!["fr:commune:75056@2019-01-01".to_string()];
        assert_eq!(store.update_by_ids(&ids, &update).unwrap(), 0);
    }

    #[test]
    fn test_parent_rollup_aggregation() {
        let store = ZoneStore::open_in_memory().unwrap();
        for (code, population, area, parent) in [
            ("01001", Some(10), Some(5.0), "fr:departement:01"),
            ("01002", Some(20), None, "fr:departement:01"),
            ("02001", None, Some(7.0), "fr:departement:02"),
        ] {
            let mut zone = commune(code, code, Validity::default())
                .with_parents(["country:fr", parent]);
            zone.population = population;
            zone.area = area;
            store.upsert(&zone).unwrap();
        }

        let cursor = store
            .aggregate_with_progress(&Aggregation::ParentRollup {
                level: "fr:commune".to_string(),
                parent_prefix: "fr:departement".to_string(),
            })
            .unwrap();
        assert_eq!(cursor.total(), 2);

        let rows: Vec<AggregateRow> = cursor.collect();
        assert_eq!(rows[0].key, "fr:departement:01");
        assert_eq!(rows[0].population, Some(30));
        assert_eq!(rows[0].area, Some(5.0));
        assert_eq!(rows[1].population, None);
        assert_eq!(rows[1].area, Some(7.0));
    }

    #[test]
    fn test_distinct_codes_aggregation() {
        let store = paris_store();
        let mut flagged = commune("13055", "Marseille", Validity::default());
        flagged.flag = Some("Flag.svg".to_string());
        store.upsert(&flagged).unwrap();

        let all: Vec<String> = store
            .aggregate_with_progress(&Aggregation::DistinctCodes {
                level: "fr:commune".to_string(),
                missing: vec![],
            })
            .unwrap()
            .map(|row| row.key)
            .collect();
        assert_eq!(all, vec!["13055", "75056"]);

        let cursor = store
            .aggregate_with_progress(&Aggregation::DistinctCodes {
                level: "fr:commune".to_string(),
                missing: vec!["flag".to_string()],
            })
            .unwrap();
        assert_eq!(cursor.total(), 1);
    }

    #[test]
    fn test_distinct_codes_rejects_malformed_attributes() {
        let store = paris_store();

        for attr in ["population') OR 1=1 --", "", "keys..insee", "$.area"] {
            let result = store.aggregate_with_progress(&Aggregation::DistinctCodes {
                level: "fr:commune".to_string(),
                missing: vec![attr.to_string()],
            });
            assert!(matches!(result, Err(GeozonesError::InvalidQuery(_))), "{:?}", attr);
        }

        let nested = store
            .aggregate_with_progress(&Aggregation::DistinctCodes {
                level: "fr:commune".to_string(),
                missing: vec!["keys.insee".to_string()],
            })
            .unwrap();
        assert_eq!(nested.total(), 1);
    }
}
