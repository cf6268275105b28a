// 🔎 Enrichment - knowledge-base lookups (Wikidata SPARQL)
//
// Callers chunk their id sets and tolerate empty or partial answers: an
// exhausted retry or a malformed payload loses one chunk, not the stage.

use crate::error::{GeozonesError, Result};
use crate::http::{HttpClient, RetryPolicy};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub const WIKIDATA_SPARQL: &str = "https://query.wikidata.org/sparql";

/// Number of ids per knowledge-base request
pub const DEFAULT_CHUNK_SIZE: usize = 150;

// ============================================================================
// QUERY / RESULT TYPES
// ============================================================================

/// A bulk lookup: a SPARQL template with an `{ids}` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityQuery {
    pub template: String,
    /// Binding that identifies an entity (results are grouped on it)
    pub subject: String,
    /// Attribute names expected in the answer
    pub attributes: Vec<String>,
}

impl EntityQuery {
    /// Template with the ids inlined as quoted literals
    pub fn render(&self, ids: &[String]) -> String {
        let values: Vec<String> = ids.iter().map(|id| format!("\"{}\"", id)).collect();
        self.template.replace("{ids}", &values.join(" "))
    }
}

/// One entity: attribute name → distinct values, in answer order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Entity {
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.push(name, value);
        self
    }

    fn push(&mut self, name: &str, value: &str) {
        let values = self.attributes.entry(name.to_string()).or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
    }

    /// First value of an attribute
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Every value of a multi-valued attribute
    pub fn all(&self, name: &str) -> &[String] {
        self.attributes.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Group SPARQL JSON bindings into entities keyed by `subject`.
pub fn reduce_bindings(bindings: &[Value], subject: &str) -> Vec<Entity> {
    let mut order: Vec<String> = Vec::new();
    let mut entities: BTreeMap<String, Entity> = BTreeMap::new();

    for binding in bindings {
        let Some(row) = binding.as_object() else {
            continue;
        };
        let Some(id) = row.get(subject).and_then(|v| v["value"].as_str()) else {
            continue;
        };
        if !entities.contains_key(id) {
            order.push(id.to_string());
        }
        let entity = entities.entry(id.to_string()).or_default();
        for (name, cell) in row {
            if let Some(value) = cell["value"].as_str() {
                entity.push(name, value);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| entities.remove(&id))
        .collect()
}

// ============================================================================
// KNOWLEDGE BASES
// ============================================================================

/// Bulk entity lookup
pub trait KnowledgeBase {
    fn lookup(&self, query: &EntityQuery, ids: &[String]) -> Result<Vec<Entity>>;
}

/// Wikidata SPARQL endpoint
pub struct WikidataClient {
    endpoint: String,
    http: HttpClient,
}

impl WikidataClient {
    pub fn new(endpoint: &str, policy: RetryPolicy) -> Result<Self> {
        Ok(WikidataClient {
            endpoint: endpoint.to_string(),
            http: HttpClient::new(policy, Duration::from_secs(60))?,
        })
    }
}

impl KnowledgeBase for WikidataClient {
    fn lookup(&self, query: &EntityQuery, ids: &[String]) -> Result<Vec<Entity>> {
        let sparql = query.render(ids);
        debug!("SPARQL lookup of {} ids on {}", ids.len(), self.endpoint);

        let payload = self.http.post_form(
            &self.endpoint,
            &[("query", sparql.as_str()), ("format", "json")],
            "application/sparql-results+json",
        )?;

        let bindings = payload["results"]["bindings"]
            .as_array()
            .ok_or_else(|| GeozonesError::Http {
                message: format!("{}: no results.bindings in answer", self.endpoint),
                transient: false,
            })?;

        Ok(reduce_bindings(bindings, &query.subject))
    }
}

/// Knowledge base that never knows anything (offline runs)
#[derive(Debug, Default)]
pub struct OfflineKnowledgeBase;

impl KnowledgeBase for OfflineKnowledgeBase {
    fn lookup(&self, _query: &EntityQuery, _ids: &[String]) -> Result<Vec<Entity>> {
        Ok(Vec::new())
    }
}

/// Chunk `ids` and run one lookup per chunk, calling `handle` per entity.
///
/// A failing chunk is logged and skipped. Returns how many entities were handled.
pub fn lookup_chunked<F>(
    kb: &dyn KnowledgeBase,
    query: &EntityQuery,
    ids: &[String],
    chunk_size: usize,
    mut handle: F,
) -> Result<usize>
where
    F: FnMut(&Entity) -> Result<bool>,
{
    let mut processed = 0;
    for chunk in ids.chunks(chunk_size.max(1)) {
        let entities = match kb.lookup(query, chunk) {
            Ok(entities) => entities,
            Err(e) if e.is_contract_violation() => return Err(e),
            Err(e) => {
                tracing::error!("Knowledge-base lookup failed for {} ids: {}", chunk.len(), e);
                continue;
            }
        };
        for entity in &entities {
            if handle(entity)? {
                processed += 1;
            }
        }
    }
    Ok(processed)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Answers lookups from a fixed entity list, matching ids on `key`
    pub(crate) struct FakeKnowledgeBase {
        pub key: String,
        pub entities: Vec<Entity>,
        pub calls: RefCell<Vec<usize>>,
        pub fail_first: bool,
    }

    impl FakeKnowledgeBase {
        pub(crate) fn new(key: &str, entities: Vec<Entity>) -> Self {
            FakeKnowledgeBase {
                key: key.to_string(),
                entities,
                calls: RefCell::new(Vec::new()),
                fail_first: false,
            }
        }
    }

    impl KnowledgeBase for FakeKnowledgeBase {
        fn lookup(&self, _query: &EntityQuery, ids: &[String]) -> Result<Vec<Entity>> {
            self.calls.borrow_mut().push(ids.len());
            if self.fail_first && self.calls.borrow().len() == 1 {
                return Err(GeozonesError::Http {
                    message: "HTTP 503".to_string(),
                    transient: true,
                });
            }
            Ok(self
                .entities
                .iter()
                .filter(|e| e.get(&self.key).map_or(false, |k| ids.iter().any(|id| id == k)))
                .cloned()
                .collect())
        }
    }
}
