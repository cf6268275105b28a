// 🌳 Level Registry - the hierarchy of zone kinds and their pipeline callbacks
//
// Levels form a directed forest (a level may have several parents). Each level
// owns ordered callback lists; registration order is execution order.

use crate::aggregate::{AggregateDecl, Members};
use crate::db::ZoneStore;
use crate::enrichment::KnowledgeBase;
use crate::error::{GeozonesError, Result};
use crate::sources::{GeoRecord, Row, Source};
use crate::zone::Zone;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

// ============================================================================
// CALLBACKS
// ============================================================================

/// Everything a stage callback may touch
pub struct StageContext<'a> {
    pub store: &'a ZoneStore,
    pub level: &'a Level,
    /// Reference date for "current" lookups
    pub today: NaiveDate,
    pub knowledge_base: &'a dyn KnowledgeBase,
    /// Batch size for knowledge-base lookups
    pub chunk_size: usize,
}

/// Pre/postprocessor: receives the dataset rows when a source is registered.
/// Returns the number of zones it processed.
pub type ProcessorFn = Box<dyn Fn(&StageContext<'_>, Option<Vec<Row>>) -> anyhow::Result<usize>>;

/// Extractor: converts one record into a draft zone, `None` to skip it.
pub type ExtractorFn = Box<dyn Fn(&ZoneStore, &GeoRecord) -> anyhow::Result<Option<Zone>>>;

pub struct Processor {
    pub name: String,
    pub source: Option<Source>,
    callback: ProcessorFn,
}

impl Processor {
    pub fn run(&self, ctx: &StageContext<'_>, rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
        (self.callback)(ctx, rows)
    }
}

pub struct Extractor {
    pub name: String,
    pub source: Source,
    /// Simplification tolerance applied before storage
    pub simplify: Option<f64>,
    callback: ExtractorFn,
}

impl Extractor {
    pub fn extract(&self, store: &ZoneStore, record: &GeoRecord) -> anyhow::Result<Option<Zone>> {
        (self.callback)(store, record)
    }
}

// ============================================================================
// LEVEL
// ============================================================================

pub struct Level {
    pub id: String,
    pub label: String,
    pub admin_level: u32,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    pub preprocessors: Vec<Processor>,
    pub extractors: Vec<Extractor>,
    pub postprocessors: Vec<Processor>,
    pub aggregates: Vec<AggregateDecl>,
}

impl Level {
    fn new(id: &str, label: &str, admin_level: u32, parents: &[&str]) -> Self {
        Level {
            id: id.to_string(),
            label: label.to_string(),
            admin_level,
            parents: parents.iter().map(|p| p.to_string()).collect(),
            children: Vec::new(),
            preprocessors: Vec::new(),
            extractors: Vec::new(),
            postprocessors: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    /// Local download target of a source: `{level}/{filename}`
    pub fn filename_for(&self, source: &Source) -> String {
        source.target_filename(&self.id)
    }

    /// Every `(url, target filename)` pair needed by this level's callbacks
    pub fn downloads(&self) -> Vec<(String, String)> {
        let processor_sources = self
            .preprocessors
            .iter()
            .filter_map(|p| p.source.as_ref());
        let extractor_sources = self.extractors.iter().map(|e| &e.source);
        let postprocessor_sources = self
            .postprocessors
            .iter()
            .filter_map(|p| p.source.as_ref());

        processor_sources
            .chain(extractor_sources)
            .chain(postprocessor_sources)
            .map(|source| (source.url.clone(), self.filename_for(source)))
            .collect()
    }

    pub fn describe(&self) -> LevelDescription {
        LevelDescription {
            id: self.id.clone(),
            label: self.label.clone(),
            admin_level: self.admin_level,
            parents: self.parents.clone(),
        }
    }
}

/// Serializable summary of a level
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelDescription {
    pub id: String,
    pub label: String,
    pub admin_level: u32,
    pub parents: Vec<String>,
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Registry of all known levels, built once at startup.
#[derive(Default)]
pub struct LevelRegistry {
    levels: Vec<Level>,
    index: HashMap<String, usize>,
}

impl LevelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a level under already-registered parents.
    pub fn register(&mut self, id: &str, label: &str, admin_level: u32, parents: &[&str]) -> Result<()> {
        if self.index.contains_key(id) {
            return Err(GeozonesError::InvalidUsage(format!(
                "level {} is already registered",
                id
            )));
        }
        for parent in parents {
            if !self.index.contains_key(*parent) {
                return Err(GeozonesError::InvalidUsage(format!(
                    "unknown parent level {} for {}",
                    parent, id
                )));
            }
        }

        for parent in parents {
            let idx = self.index[*parent];
            self.levels[idx].children.push(id.to_string());
        }
        self.index.insert(id.to_string(), self.levels.len());
        self.levels.push(Level::new(id, label, admin_level, parents));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Level> {
        self.index.get(id).map(|&idx| &self.levels[idx])
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Level> {
        match self.index.get(id) {
            Some(&idx) => Ok(&mut self.levels[idx]),
            None => Err(GeozonesError::InvalidUsage(format!("unknown level {}", id))),
        }
    }

    pub fn count(&self) -> usize {
        self.levels.len()
    }

    // ========================================================================
    // CALLBACK REGISTRATION
    // ========================================================================

    pub fn preprocessor<F>(&mut self, level: &str, name: &str, source: Option<Source>, callback: F) -> Result<()>
    where
        F: Fn(&StageContext<'_>, Option<Vec<Row>>) -> anyhow::Result<usize> + 'static,
    {
        self.get_mut(level)?.preprocessors.push(Processor {
            name: name.to_string(),
            source,
            callback: Box::new(callback),
        });
        Ok(())
    }

    pub fn extractor<F>(
        &mut self,
        level: &str,
        name: &str,
        source: Source,
        simplify: Option<f64>,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&ZoneStore, &GeoRecord) -> anyhow::Result<Option<Zone>> + 'static,
    {
        self.get_mut(level)?.extractors.push(Extractor {
            name: name.to_string(),
            source,
            simplify,
            callback: Box::new(callback),
        });
        Ok(())
    }

    pub fn postprocessor<F>(&mut self, level: &str, name: &str, source: Option<Source>, callback: F) -> Result<()>
    where
        F: Fn(&StageContext<'_>, Option<Vec<Row>>) -> anyhow::Result<usize> + 'static,
    {
        self.get_mut(level)?.postprocessors.push(Processor {
            name: name.to_string(),
            source,
            callback: Box::new(callback),
        });
        Ok(())
    }

    /// Declare a composite zone built from members at aggregation time.
    pub fn aggregate(
        &mut self,
        level: &str,
        code: &str,
        name: &str,
        members: Members,
        properties: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.get_mut(level)?.aggregates.push(AggregateDecl {
            code: code.to_string(),
            name: name.to_string(),
            members,
            properties,
        });
        Ok(())
    }

    // ========================================================================
    // TRAVERSAL
    // ========================================================================

    /// Levels without parents, in registration order
    pub fn roots(&self) -> impl Iterator<Item = &Level> {
        self.levels.iter().filter(|level| level.parents.is_empty())
    }

    /// Depth-first traversal from the roots, each level exactly once even when
    /// reachable through several parents.
    pub fn traverse(&self) -> Vec<&Level> {
        let mut done: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(self.levels.len());

        for root in self.roots() {
            self.visit(root, &mut done, &mut order);
        }
        order
    }

    fn visit<'a>(&'a self, level: &'a Level, done: &mut HashSet<&'a str>, order: &mut Vec<&'a Level>) {
        if !done.insert(level.id.as_str()) {
            return;
        }
        order.push(level);
        for child in &level.children {
            if let Some(child) = self.get(child) {
                self.visit(child, done, order);
            }
        }
    }

    /// Every dataset needed by the registered callbacks, in traversal order
    pub fn downloads(&self) -> Vec<(String, String)> {
        self.traverse()
            .into_iter()
            .flat_map(|level| level.downloads())
            .collect()
    }

    pub fn describe(&self) -> Vec<LevelDescription> {
        self.traverse().into_iter().map(Level::describe).collect()
    }
}
