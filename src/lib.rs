// Geozones - Core Library
// Exposes all modules for use in the CLI and tests

pub mod aggregate;   // Geometry aggregation engine
pub mod config;
pub mod db;          // Temporal store adapter (SQLite)
pub mod enrichment;  // Knowledge-base lookups (Wikidata)
pub mod error;
pub mod extract;     // Extraction engine
pub mod feature;
pub mod geometry;
pub mod http;
pub mod identity;
pub mod level;       // Level registry
pub mod levels;      // Built-in levels (world, France)
pub mod pipeline;
pub mod quality;
pub mod selection;
pub mod sources;
pub mod wiki;
pub mod zone;

// Re-export commonly used types
pub use aggregate::{build_aggregate, build_aggregates, AggregateDecl, MemberRef, Members};
pub use config::Config;
pub use db::{AggregateRow, Aggregation, AggregationCursor, ZoneStore};
pub use enrichment::{Entity, EntityQuery, KnowledgeBase, OfflineKnowledgeBase, WikidataClient};
pub use error::{GeozonesError, Result};
pub use extract::{process_dataset, ExtractReport};
pub use feature::{feature_collection, to_feature};
pub use identity::{assign_id, zone_id};
pub use level::{Level, LevelDescription, LevelRegistry, StageContext};
pub use pipeline::{Pipeline, RunSettings, Stage, StageReport};
pub use quality::{audit, AuditReport, QualityIssue, Severity};
pub use selection::{LevelSelection, StageFilter};
pub use sources::{Dataset, GeoRecord, Loaders, Row, Source};
pub use zone::{TextField, Validity, Zone, ZoneUpdate};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
