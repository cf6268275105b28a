// 📂 Sources - dataset descriptors and file loaders
//
// A loader is picked by the longest file extension that matches the dataset
// filename (`.geojson` wins over `.json`). Tabular files yield rows, GeoJSON
// files yield geometry+properties records.

use crate::error::{GeozonesError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One tabular record: column name → value (strings for CSV, native JSON otherwise)
pub type Row = BTreeMap<String, Value>;

/// One geospatial record, as handed to extractors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    /// GeoJSON geometry object, `Null` when the feature has none
    pub geometry: Value,

    pub properties: Row,
}

impl GeoRecord {
    /// Property as a non-empty string (numbers are formatted)
    pub fn text(&self, name: &str) -> Option<String> {
        text(&self.properties, name)
    }
}

/// Read a column as a trimmed, non-empty string
pub fn text(row: &Row, name: &str) -> Option<String> {
    match row.get(name)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// DESCRIPTORS
// ============================================================================

/// Loader options carried by a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderOptions {
    /// CSV field delimiter
    pub delimiter: u8,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions { delimiter: b',' }
    }
}

/// A remote dataset and where it lands once downloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,

    /// Overrides the URL basename as local filename
    pub filename: Option<String>,

    #[serde(default)]
    pub options: LoaderOptions,
}

impl Source {
    pub fn new(url: impl Into<String>) -> Self {
        Source {
            url: url.into(),
            filename: None,
            options: LoaderOptions::default(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.options.delimiter = delimiter;
        self
    }

    /// Local filename: the explicit one or the URL basename (query string dropped)
    pub fn local_name(&self) -> String {
        if let Some(filename) = &self.filename {
            return filename.clone();
        }
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/').next().unwrap_or(path).to_string()
    }

    /// Download target relative to the working directory: `{level}/{filename}`
    pub fn target_filename(&self, level_id: &str) -> String {
        format!("{}/{}", level_id, self.local_name())
    }
}

// ============================================================================
// LOADED DATA
// ============================================================================

/// Content of a loaded dataset file
#[derive(Debug, Clone, PartialEq)]
pub enum Dataset {
    Rows(Vec<Row>),
    Records(Vec<GeoRecord>),
}

impl Dataset {
    pub fn len(&self) -> usize {
        match self {
            Dataset::Rows(rows) => rows.len(),
            Dataset::Records(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tabular view; geospatial records keep their geometry under `geometry`
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Dataset::Rows(rows) => rows,
            Dataset::Records(records) => records
                .into_iter()
                .map(|record| {
                    let mut row = record.properties;
                    if !record.geometry.is_null() {
                        row.insert("geometry".to_string(), record.geometry);
                    }
                    row
                })
                .collect(),
        }
    }

    /// Geospatial view; rows expose their `geometry` column if any
    pub fn into_records(self) -> Vec<GeoRecord> {
        match self {
            Dataset::Records(records) => records,
            Dataset::Rows(rows) => rows
                .into_iter()
                .map(|mut row| GeoRecord {
                    geometry: row.remove("geometry").unwrap_or(Value::Null),
                    properties: row,
                })
                .collect(),
        }
    }
}

// ============================================================================
// LOADERS
// ============================================================================

type LoaderFn = fn(&Path, &LoaderOptions) -> Result<Dataset>;

/// Extension-keyed loader table.
pub struct Loaders {
    entries: Vec<(&'static str, LoaderFn)>,
}

impl Default for Loaders {
    fn default() -> Self {
        Loaders {
            entries: vec![
                (".csv", load_csv as LoaderFn),
                (".json", load_json as LoaderFn),
                (".geojson", load_geojson as LoaderFn),
            ],
        }
    }
}

impl Loaders {
    /// Extension of the loader that handles `filename`, longest match first
    pub fn extension_for(&self, filename: &str) -> Option<&'static str> {
        self.entries
            .iter()
            .filter(|(ext, _)| filename.ends_with(ext))
            .max_by_key(|(ext, _)| ext.len())
            .map(|(ext, _)| *ext)
    }

    pub fn load(&self, path: &Path, options: &LoaderOptions) -> Result<Dataset> {
        let filename = path.to_string_lossy();
        let loader = self
            .entries
            .iter()
            .filter(|(ext, _)| filename.ends_with(ext))
            .max_by_key(|(ext, _)| ext.len())
            .map(|(_, loader)| *loader)
            .ok_or_else(|| GeozonesError::NoLoader(filename.to_string()))?;
        loader(path, options)
    }
}

fn load_csv(path: &Path, options: &LoaderOptions) -> Result<Dataset> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .from_path(path)?;

    let mut rows = Vec::new();
    for result in rdr.deserialize::<BTreeMap<String, String>>() {
        let record = result?;
        rows.push(
            record
                .into_iter()
                .map(|(column, value)| (column, Value::String(value)))
                .collect(),
        );
    }

    Ok(Dataset::Rows(rows))
}

fn load_json(path: &Path, _options: &LoaderOptions) -> Result<Dataset> {
    let content = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;

    let rows = match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map.into_iter().collect()),
                _ => None,
            })
            .collect(),
        Value::Object(map) => vec![map.into_iter().collect()],
        _ => Vec::new(),
    };

    Ok(Dataset::Rows(rows))
}

fn load_geojson(path: &Path, _options: &LoaderOptions) -> Result<Dataset> {
    let content = fs::read_to_string(path)?;
    let geojson: geojson::GeoJson = content
        .parse()
        .map_err(|e: geojson::Error| GeozonesError::Geometry(e.to_string()))?;

    let features = match geojson {
        geojson::GeoJson::FeatureCollection(collection) => collection.features,
        geojson::GeoJson::Feature(feature) => vec![feature],
        geojson::GeoJson::Geometry(geometry) => vec![geojson::Feature {
            geometry: Some(geometry),
            ..Default::default()
        }],
    };

    let mut records = Vec::with_capacity(features.len());
    for feature in features {
        let geometry = match feature.geometry {
            Some(geometry) => serde_json::to_value(geometry)?,
            None => Value::Null,
        };
        records.push(GeoRecord {
            geometry,
            properties: feature.properties.unwrap_or_default().into_iter().collect(),
        });
    }

    Ok(Dataset::Records(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_loader_selection_by_longest_extension() {
        let loaders = Loaders::default();
        assert_eq!(loaders.extension_for("communes.geojson"), Some(".geojson"));
        assert_eq!(loaders.extension_for("history.json"), Some(".json"));
        assert_eq!(loaders.extension_for("regions.csv"), Some(".csv"));
        assert_eq!(loaders.extension_for("countries.zip"), None);
    }

    #[test]
    fn test_missing_loader_is_reported() {
        let loaders = Loaders::default();
        let result = loaders.load(Path::new("countries-shp.zip"), &LoaderOptions::default());
        assert!(matches!(result, Err(GeozonesError::NoLoader(_))));
    }

    #[test]
    fn test_local_name_and_target() {
        let source = Source::new("http://example.org/data/communes.json?version=2");
        assert_eq!(source.local_name(), "communes.json");
        assert_eq!(source.target_filename("fr:commune"), "fr:commune/communes.json");

        let named = Source::new("http://example.org/download").with_filename("regions.csv");
        assert_eq!(named.target_filename("fr:region"), "fr:region/regions.csv");
    }

    #[test]
    fn test_load_csv_with_delimiter() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "postal.csv", "insee;postal\n01001;01400\n01002;01640\n");

        let options = LoaderOptions { delimiter: b';' };
        let rows = Loaders::default().load(&path, &options).unwrap().into_rows();

        assert_eq!(rows.len(), 2);
        assert_eq!(text(&rows[0], "insee").as_deref(), Some("01001"));
        assert_eq!(text(&rows[1], "postal").as_deref(), Some("01640"));
    }

    #[test]
    fn test_load_json_array() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "history.json", r#"[{"code": "01001", "pop": 12}, 3]"#);

        let rows = Loaders::default()
            .load(&path, &LoaderOptions::default())
            .unwrap()
            .into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(text(&rows[0], "pop").as_deref(), Some("12"));
    }

    #[test]
    fn test_load_geojson_features() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "countries.geojson",
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature",
                 "properties": {"ISO_A2": "FR", "NAME": "France"},
                 "geometry": {"type": "Polygon",
                              "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
                {"type": "Feature", "properties": {"NAME": "Nowhere"}, "geometry": null}
            ]}"#,
        );

        let records = Loaders::default()
            .load(&path, &LoaderOptions::default())
            .unwrap()
            .into_records();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text("ISO_A2").as_deref(), Some("FR"));
        assert_eq!(records[0].geometry["type"], "Polygon");
        assert!(records[1].geometry.is_null());
    }

    #[test]
    fn test_empty_text_is_none() {
        let mut row = Row::new();
        row.insert("code".to_string(), Value::String("  ".to_string()));
        row.insert("nothing".to_string(), Value::Null);
        assert_eq!(text(&row, "code"), None);
        assert_eq!(text(&row, "nothing"), None);
        assert_eq!(text(&row, "missing"), None);
    }
}
