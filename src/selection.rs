// 🎯 Selection - only/exclude filters for partial pipeline re-runs
// Patterns match callback names or level ids; `*` is a wildcard.

use serde::{Deserialize, Serialize};

// ============================================================================
// PATTERN MATCHING
// ============================================================================

/// Match `text` against `pattern`.
///
/// Without `*` the match is exact. With wildcards the first part must be a
/// prefix, the last part a suffix, and the middle parts must appear in order.
pub fn matches_pattern(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    if !text.starts_with(first) {
        return false;
    }

    // Middle parts appear in order after the prefix
    let mut current_pos = first.len();
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match text[current_pos..].find(part) {
            Some(pos) => current_pos += pos + part.len(),
            None => return false,
        }
    }

    text.len() - current_pos >= last.len() && text.ends_with(last)
}

/// True when any of the patterns matches
pub fn matches_any(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|pattern| matches_pattern(pattern, text))
}

// ============================================================================
// FILTERS
// ============================================================================

/// Per-stage callback filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageFilter {
    /// Only run the callback with this exact name
    pub only: Option<String>,

    /// Skip callbacks (or whole levels) matching any of these patterns
    pub exclude: Vec<String>,
}

impl StageFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(name: impl Into<String>) -> Self {
        StageFilter {
            only: Some(name.into()),
            exclude: Vec::new(),
        }
    }

    pub fn excluding<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StageFilter {
            only: None,
            exclude: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Merge run-level exclusions into this stage filter
    pub fn with_exclusions(mut self, patterns: &[String]) -> Self {
        for pattern in patterns {
            if !self.exclude.contains(pattern) {
                self.exclude.push(pattern.clone());
            }
        }
        self
    }

    /// Should the callback named `name` run?
    pub fn allows(&self, name: &str) -> bool {
        if let Some(only) = &self.only {
            if only != name {
                return false;
            }
        }
        !matches_any(&self.exclude, name)
    }

    /// Should the stage visit this level at all?
    pub fn allows_level(&self, level_id: &str) -> bool {
        !matches_any(&self.exclude, level_id)
    }
}

/// Run-level selection of levels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelSelection {
    /// Limit to these levels (empty = every level)
    pub include: Vec<String>,

    pub exclude: Vec<String>,
}

impl LevelSelection {
    pub fn allows(&self, level_id: &str) -> bool {
        let included = self.include.is_empty() || matches_any(&self.include, level_id);
        included && !matches_any(&self.exclude, level_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern_match() {
        assert!(matches_pattern("extract_iris", "extract_iris"));
        assert!(!matches_pattern("extract_iris", "extract_iris_2019"));
        assert!(!matches_pattern("iris", "extract_iris"));
    }

    #[test]
    fn test_wildcard_pattern() {
        assert!(matches_pattern("fetch_*", "fetch_region_data_from_wikidata"));
        assert!(matches_pattern("*wikidata", "fetch_region_data_from_wikidata"));
        assert!(matches_pattern("fetch_*_from_*", "fetch_region_data_from_wikidata"));
        assert!(matches_pattern("fr:*", "fr:commune"));
        assert!(matches_pattern("*", "anything"));
        assert!(!matches_pattern("fr:*", "country"));
        assert!(!matches_pattern("ab*ba", "aba"));
    }

    #[test]
    fn test_stage_filter_only_and_exclude() {
        let filter = StageFilter::only("compute_region_population");
        assert!(filter.allows("compute_region_population"));
        assert!(!filter.allows("fr_postal_codes"));

        let filter = StageFilter::excluding(["*wikidata"]);
        assert!(filter.allows("fr_postal_codes"));
        assert!(!filter.allows("fetch_departement_data_from_wikidata"));
    }

    #[test]
    fn test_stage_filter_merges_exclusions() {
        let filter = StageFilter::excluding(["a"]).with_exclusions(&["a".to_string(), "fr:*".to_string()]);
        assert_eq!(filter.exclude, vec!["a", "fr:*"]);
        assert!(!filter.allows_level("fr:commune"));
        assert!(filter.allows_level("country"));
    }

    #[test]
    fn test_level_selection() {
        let selection = LevelSelection {
            include: vec!["country*".to_string()],
            exclude: vec!["country-subset".to_string()],
        };
        assert!(selection.allows("country"));
        assert!(selection.allows("country-group"));
        assert!(!selection.allows("country-subset"));
        assert!(!selection.allows("fr:commune"));

        assert!(LevelSelection::default().allows("fr:commune"));
    }
}
