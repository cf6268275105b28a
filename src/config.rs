// ⚙️ Configuration - defaults, optional TOML file, CLI/env overrides

use crate::enrichment::{DEFAULT_CHUNK_SIZE, WIKIDATA_SPARQL};
use crate::http::RetryPolicy;
use crate::selection::{LevelSelection, StageFilter};
use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file
    pub database: PathBuf,

    /// Where downloaded datasets live (`{workdir}/{level}/{filename}`)
    pub workdir: PathBuf,

    /// Limit the run to these levels (empty = all)
    pub levels: Vec<String>,

    /// Level patterns to leave out of the run
    pub exclude: Vec<String>,

    /// Callback (or aggregate code) patterns to skip in every stage
    pub skip: Vec<String>,

    /// Reference date for "current" lookups, defaults to the local date
    pub today: Option<NaiveDate>,

    pub sparql_endpoint: String,

    /// Ids per knowledge-base request
    pub chunk_size: usize,

    pub http_retries: u32,

    /// Initial retry delay in milliseconds, doubled on each retry
    pub http_backoff_ms: u64,

    /// Skip knowledge-base lookups
    pub offline: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: PathBuf::from("geozones.db"),
            workdir: PathBuf::from("downloads"),
            levels: Vec::new(),
            exclude: Vec::new(),
            skip: Vec::new(),
            today: None,
            sparql_endpoint: WIKIDATA_SPARQL.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            http_retries: 3,
            http_backoff_ms: 200,
            offline: false,
        }
    }
}

impl Config {
    /// Load from a TOML file; missing keys take their default
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// `load` when a path is given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn level_selection(&self) -> LevelSelection {
        LevelSelection {
            include: self.levels.clone(),
            exclude: self.exclude.clone(),
        }
    }

    /// Stage filter for a run: `only` plus the configured skips.
    ///
    /// Level exclusions stay in `level_selection`.
    pub fn stage_filter(&self, only: Option<&str>) -> StageFilter {
        let filter = match only {
            Some(name) => StageFilter::only(name),
            None => StageFilter::all(),
        };
        filter.with_exclusions(&self.skip)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.http_retries,
            backoff: Duration::from_millis(self.http_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 150);
        assert_eq!(config.http_retries, 3);
        assert_eq!(config.sparql_endpoint, "https://query.wikidata.org/sparql");
        assert!(config.level_selection().allows("fr:commune"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "database = \"/tmp/zones.db\"\ntoday = \"2020-06-01\"\nexclude = [\"fr:epci\"]"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.database, PathBuf::from("/tmp/zones.db"));
        assert_eq!(config.reference_date(), NaiveDate::from_ymd_opt(2020, 6, 1).unwrap());
        assert!(!config.level_selection().allows("fr:epci"));
        assert_eq!(config.workdir, PathBuf::from("downloads"));
    }

    #[test]
    fn test_level_exclusions_and_skips_stay_apart() {
        let config = Config {
            exclude: vec!["fr:epci".to_string()],
            skip: vec!["fetch_*".to_string()],
            ..Config::default()
        };

        let filter = config.stage_filter(None);
        assert!(filter.allows_level("fr:epci"));
        assert!(!filter.allows("fetch_departement_data_from_wikidata"));
        assert!(filter.allows("load_regions"));

        let selection = config.level_selection();
        assert!(!selection.allows("fr:epci"));
        assert!(selection.allows("fetch_departement_data_from_wikidata"));

        let only = config.stage_filter(Some("load_regions"));
        assert!(only.allows("load_regions"));
        assert!(!only.allows("load_departements"));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chunk_size = \"many\"").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
