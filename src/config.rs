//! Pipeline Configuration
//!
//! Thresholds and policy values for the normalization pipeline, loadable
//! from a JSON file. Every value has a documented default so a config file
//! is only needed when a count circle wants different behavior.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration for the name-normalization pipeline
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum fraction of a line's tokens that must appear in the taxonomy
    /// vocabulary for the line to be kept as a possible species line.
    /// Comparison is strict (`>`), so a line exactly at the threshold is
    /// excluded.
    pub possible_line_threshold: f64,

    /// Fuzzy phrase similarity threshold on a 0-100 scale. Comparison is
    /// strict (`>`).
    pub fuzzy_similarity_threshold: f64,

    /// Value substituted for eBird's "X" (present but uncounted) marker.
    /// This is a placeholder requiring manual correction; affected rows are
    /// flagged so operators can find them.
    pub uncounted_marker_value: i64,

    /// Whether rows whose total came from an "X" marker are flagged in the
    /// assembled checklist.
    pub flag_uncounted: bool,

    /// Additional stop words beyond the built-in English + domain set.
    pub extra_stop_words: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            possible_line_threshold: 0.14,
            fuzzy_similarity_threshold: 85.0,
            uncounted_marker_value: 3,
            flag_uncounted: true,
            extra_stop_words: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_json::from_str(&contents).with_context(|| "Failed to parse config JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.possible_line_threshold, 0.14);
        assert_eq!(config.fuzzy_similarity_threshold, 85.0);
        assert_eq!(config.uncounted_marker_value, 3);
        assert!(config.flag_uncounted);
        assert!(config.extra_stop_words.is_empty());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"uncounted_marker_value": 99}"#).unwrap();
        assert_eq!(config.uncounted_marker_value, 99);
        assert_eq!(config.possible_line_threshold, 0.14);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"{"fuzzy_similarity_threshold": 90.0}"#).unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.fuzzy_similarity_threshold, 90.0);
        assert_eq!(config.uncounted_marker_value, 3);

        assert!(PipelineConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
