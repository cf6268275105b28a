// 🧭 Zone - identity, validity and values of one administrative entity
//
// A zone is identified by (level, code, validity). The same code can be reused
// by several historical incarnations, each one a distinct document whose
// validity interval tells when it was authoritative.

use crate::geometry;
use chrono::NaiveDate;
use geo_types::MultiPolygon;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================================================
// VALIDITY
// ============================================================================

/// Half-open validity interval `[start, end)`.
///
/// A missing `start` means "since the beginning of time", a missing `end`
/// means "still valid".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<NaiveDate>,
}

impl Validity {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Validity { start, end }
    }

    /// Valid since `start`, still current.
    pub fn since(start: NaiveDate) -> Self {
        Validity { start: Some(start), end: None }
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Validity { start: Some(start), end: Some(end) }
    }

    /// Check if this interval is current (no end)
    pub fn is_current(&self) -> bool {
        self.end.is_none()
    }

    /// Neither bound set: always valid.
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// `start <= at` and (`end` absent or `at < end`)
    pub fn contains(&self, at: NaiveDate) -> bool {
        if let Some(start) = self.start {
            if start > at {
                return false;
            }
        }

        if let Some(end) = self.end {
            if end <= at {
                return false;
            }
        }

        true
    }

    /// Two intervals share at least one day.
    pub fn overlaps(&self, other: &Validity) -> bool {
        let starts_before_other_ends = match (self.start, other.end) {
            (Some(start), Some(end)) => start < end,
            _ => true,
        };
        let ends_after_other_starts = match (self.end, other.start) {
            (Some(end), Some(start)) => end > start,
            _ => true,
        };
        starts_before_other_ends && ends_after_other_starts
    }
}

// ============================================================================
// ZONE
// ============================================================================

/// Zone document as stored in the collection.
///
/// `id` is empty on drafts returned by extractors that do not fix their
/// identity; the extraction engine fills it (see `identity::assign_id`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(rename = "_id", default)]
    pub id: String,

    #[serde(default)]
    pub level: String,

    pub code: String,

    #[serde(default)]
    pub name: String,

    #[serde(
        rename = "geom",
        default,
        with = "geometry::serde_geojson",
        skip_serializing_if = "Option::is_none"
    )]
    pub geometry: Option<MultiPolygon<f64>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<u64>,

    /// Area in km²
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,

    /// External identifiers by namespace (insee, iso2, nuts3, postal...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys: BTreeMap<String, Value>,

    // ========================================================================
    // RELATIONS
    // ========================================================================
    /// Spatial nesting, append-only set of zone ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,

    /// Zones this one evolved from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestors: Vec<String>,

    /// Zones this one evolved into
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub successors: Vec<String>,

    #[serde(default, skip_serializing_if = "Validity::is_unbounded")]
    pub validity: Validity,

    // ========================================================================
    // ENRICHMENT (knowledge bases)
    // ========================================================================
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wikipedia: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbpedia: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wikidata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blazon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,

    /// Level-specific attributes that have no dedicated field
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Zone {
    /// Draft zone with a code and a name; identity assigned at upsert time.
    pub fn draft(code: impl Into<String>, name: impl Into<String>) -> Self {
        Zone {
            code: code.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for parent in parents {
            self.add_parent(parent);
        }
        self
    }

    pub fn with_key(mut self, namespace: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keys.insert(namespace.into(), value.into());
        self
    }

    pub fn with_population(mut self, population: u64) -> Self {
        self.population = Some(population);
        self
    }

    pub fn with_area(mut self, area: f64) -> Self {
        self.area = Some(area);
        self
    }

    pub fn with_geometry(mut self, geometry: MultiPolygon<f64>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Add a parent, keeping set semantics
    pub fn add_parent(&mut self, parent: impl Into<String>) {
        add_to_set(&mut self.parents, parent.into());
    }

    /// Remove null-valued keys (never stored)
    pub fn prune_keys(&mut self) {
        self.keys.retain(|_, value| !value.is_null());
    }

    /// Check if this zone was valid at a given date
    pub fn was_valid_at(&self, at: NaiveDate) -> bool {
        self.validity.contains(at)
    }

    pub fn is_current(&self) -> bool {
        self.validity.is_current()
    }

    /// Read an attribute by name, dedicated fields first then `extra`.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "population" => self.population.map(Value::from),
            "area" => self.area.map(Value::from),
            "wikipedia" => self.wikipedia.clone().map(Value::from),
            "dbpedia" => self.dbpedia.clone().map(Value::from),
            "wikidata" => self.wikidata.clone().map(Value::from),
            "website" => self.website.clone().map(Value::from),
            "flag" => self.flag.clone().map(Value::from),
            "blazon" => self.blazon.clone().map(Value::from),
            "logo" => self.logo.clone().map(Value::from),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// Append `value` unless already present.
pub(crate) fn add_to_set(set: &mut Vec<String>, value: String) -> bool {
    if set.contains(&value) {
        return false;
    }
    set.push(value);
    true
}

// ============================================================================
// PARTIAL UPDATES
// ============================================================================

/// Enrichment or descriptive field targeted by `ZoneUpdate::set_text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Name,
    Wikipedia,
    Dbpedia,
    Wikidata,
    Website,
    Flag,
    Blazon,
    Logo,
}

/// Typed partial update (`$set` / `$addToSet`).
///
/// Set operations replace values, so re-running a rollup converges. Set-union
/// operations never duplicate an entry already present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneUpdate {
    pub population: Option<u64>,
    pub area: Option<f64>,
    pub text: Vec<(TextField, String)>,
    pub keys: BTreeMap<String, Value>,
    pub extra: BTreeMap<String, Value>,
    pub add_parents: Vec<String>,
    pub add_ancestors: Vec<String>,
    pub add_successors: Vec<String>,
    /// `$addToSet` on list-valued keys (e.g. `keys.postal`)
    pub add_key_values: BTreeMap<String, Vec<Value>>,
}

impl ZoneUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_population(mut self, population: u64) -> Self {
        self.population = Some(population);
        self
    }

    pub fn set_area(mut self, area: f64) -> Self {
        self.area = Some(area);
        self
    }

    pub fn set_text(mut self, field: TextField, value: impl Into<String>) -> Self {
        self.text.push((field, value.into()));
        self
    }

    /// Null values are ignored, keys never hold nulls.
    pub fn set_key(mut self, namespace: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.keys.insert(namespace.into(), value);
        }
        self
    }

    pub fn set_extra(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    pub fn add_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_parents.extend(parents.into_iter().map(Into::into));
        self
    }

    pub fn add_ancestors<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_ancestors.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn add_successors<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_successors.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn add_key_value(mut self, namespace: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add_key_values
            .entry(namespace.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == ZoneUpdate::default()
    }

    /// Apply the update in place. Returns true when the document changed.
    pub fn apply(&self, zone: &mut Zone) -> bool {
        let before = zone.clone();

        if let Some(population) = self.population {
            zone.population = Some(population);
        }
        if let Some(area) = self.area {
            zone.area = Some(area);
        }
        for (field, value) in &self.text {
            let value = Some(value.clone());
            match field {
                TextField::Name => zone.name = value.unwrap_or_default(),
                TextField::Wikipedia => zone.wikipedia = value,
                TextField::Dbpedia => zone.dbpedia = value,
                TextField::Wikidata => zone.wikidata = value,
                TextField::Website => zone.website = value,
                TextField::Flag => zone.flag = value,
                TextField::Blazon => zone.blazon = value,
                TextField::Logo => zone.logo = value,
            }
        }
        for (namespace, value) in &self.keys {
            zone.keys.insert(namespace.clone(), value.clone());
        }
        for (name, value) in &self.extra {
            zone.extra.insert(name.clone(), value.clone());
        }
        for parent in &self.add_parents {
            add_to_set(&mut zone.parents, parent.clone());
        }
        for ancestor in &self.add_ancestors {
            add_to_set(&mut zone.ancestors, ancestor.clone());
        }
        for successor in &self.add_successors {
            add_to_set(&mut zone.successors, successor.clone());
        }
        for (namespace, values) in &self.add_key_values {
            let entry = zone
                .keys
                .entry(namespace.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !entry.is_array() {
                // Scalar key promoted to a list holding the previous value
                let previous = entry.take();
                *entry = Value::Array(vec![previous]);
            }
            if let Value::Array(items) = entry {
                for value in values {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
            }
        }
        zone.prune_keys();

        *zone != before
    }
}
