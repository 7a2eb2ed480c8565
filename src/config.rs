use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What to do when an extraction is requested for a paper that is already
/// being extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Wait for the running extraction to finish, then run.
    #[default]
    Queue,
    /// Fail fast with `ExtractError::Busy`.
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Fixed confidence for spans read from link annotations.
    pub annotation_confidence: f64,
    /// Ranges like `[1-500]` wider than this are treated as non-citations.
    pub max_range_span: u32,
    /// Annotation/pattern overlap above which the pattern span is dropped.
    pub dedup_overlap: f32,
    pub superscript_markers: bool,
    /// Ignore the reference list itself during the pattern pass.
    pub skip_bibliography_body: bool,
    pub bibliography_start_page: Option<u32>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            annotation_confidence: 0.98,
            max_range_span: 50,
            dedup_overlap: 0.5,
            superscript_markers: true,
            skip_bibliography_body: true,
            bibliography_start_page: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkerConfig {
    pub annotation_min_confidence: f64,
    pub numeric_confidence: f64,
    pub corroborated_min: f64,
    pub corroborated_max: f64,
    /// Minimum normalized title similarity when reconciling a third-party
    /// reference with a local one.
    pub corroborated_title_min: f64,
    pub author_year_min_score: f64,
    pub author_weight: f64,
    pub year_weight: f64,
    pub surname_similarity_min: f64,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            annotation_min_confidence: 0.95,
            numeric_confidence: 0.9,
            corroborated_min: 0.75,
            corroborated_max: 0.85,
            corroborated_title_min: 0.85,
            author_year_min_score: 0.6,
            author_weight: 0.6,
            year_weight: 0.4,
            surname_similarity_min: 0.85,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub detector: DetectorConfig,
    pub linker: LinkerConfig,
    pub concurrency: ConcurrencyPolicy,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = [
            ("detector.annotation_confidence", self.detector.annotation_confidence),
            ("detector.dedup_overlap", f64::from(self.detector.dedup_overlap)),
            ("linker.annotation_min_confidence", self.linker.annotation_min_confidence),
            ("linker.numeric_confidence", self.linker.numeric_confidence),
            ("linker.corroborated_min", self.linker.corroborated_min),
            ("linker.corroborated_max", self.linker.corroborated_max),
            ("linker.corroborated_title_min", self.linker.corroborated_title_min),
            ("linker.author_year_min_score", self.linker.author_year_min_score),
            ("linker.author_weight", self.linker.author_weight),
            ("linker.year_weight", self.linker.year_weight),
            ("linker.surname_similarity_min", self.linker.surname_similarity_min),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.linker.corroborated_min > self.linker.corroborated_max {
            return Err(ConfigError::Invalid(
                "linker.corroborated_min exceeds linker.corroborated_max".into(),
            ));
        }
        if self.linker.author_weight + self.linker.year_weight <= 0.0 {
            return Err(ConfigError::Invalid(
                "linker.author_weight + linker.year_weight must be positive".into(),
            ));
        }
        if self.detector.max_range_span == 0 {
            return Err(ConfigError::Invalid("detector.max_range_span must be at least 1".into()));
        }
        Ok(())
    }

    /// Overlay every value present in `file` onto this config.
    pub fn apply(&mut self, file: &ConfigFile) {
        if let Some(d) = &file.detector {
            set(&mut self.detector.annotation_confidence, d.annotation_confidence);
            set(&mut self.detector.max_range_span, d.max_range_span);
            set(&mut self.detector.dedup_overlap, d.dedup_overlap);
            set(&mut self.detector.superscript_markers, d.superscript_markers);
            set(&mut self.detector.skip_bibliography_body, d.skip_bibliography_body);
            if d.bibliography_start_page.is_some() {
                self.detector.bibliography_start_page = d.bibliography_start_page;
            }
        }
        if let Some(l) = &file.linker {
            set(&mut self.linker.annotation_min_confidence, l.annotation_min_confidence);
            set(&mut self.linker.numeric_confidence, l.numeric_confidence);
            set(&mut self.linker.corroborated_min, l.corroborated_min);
            set(&mut self.linker.corroborated_max, l.corroborated_max);
            set(&mut self.linker.corroborated_title_min, l.corroborated_title_min);
            set(&mut self.linker.author_year_min_score, l.author_year_min_score);
            set(&mut self.linker.author_weight, l.author_weight);
            set(&mut self.linker.year_weight, l.year_weight);
            set(&mut self.linker.surname_similarity_min, l.surname_similarity_min);
        }
        if let Some(policy) = file.concurrency {
            self.concurrency = policy;
        }
    }
}

fn set<T: Copy>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// On-disk TOML configuration. All fields are optional so partial files work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub detector: Option<DetectorSection>,
    pub linker: Option<LinkerSection>,
    pub concurrency: Option<ConcurrencyPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorSection {
    pub annotation_confidence: Option<f64>,
    pub max_range_span: Option<u32>,
    pub dedup_overlap: Option<f32>,
    pub superscript_markers: Option<bool>,
    pub skip_bibliography_body: Option<bool>,
    pub bibliography_start_page: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkerSection {
    pub annotation_min_confidence: Option<f64>,
    pub numeric_confidence: Option<f64>,
    pub corroborated_min: Option<f64>,
    pub corroborated_max: Option<f64>,
    pub corroborated_title_min: Option<f64>,
    pub author_year_min_score: Option<f64>,
    pub author_weight: Option<f64>,
    pub year_weight: Option<f64>,
    pub surname_similarity_min: Option<f64>,
}

/// Platform config path: `<config_dir>/citelink/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("citelink").join("config.toml"))
}

/// Parse a config file. A missing file is an error here; use
/// [`load_config`] for the lenient cascade.
pub fn load_from_path(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Build the engine config: defaults, then the platform file, then
/// `./.citelink.toml`, then `explicit` if given. Missing cascade files are
/// skipped; an explicit path must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::default();
    let cascade = [config_path(), Some(PathBuf::from(".citelink.toml"))];
    for path in cascade.into_iter().flatten() {
        if path.is_file() {
            let file = load_from_path(&path)?;
            tracing::debug!(path = %path.display(), "applying config file");
            config.apply(&file);
        }
    }
    if let Some(path) = explicit {
        config.apply(&load_from_path(path)?);
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_overrides_only_given_values() {
        let file: ConfigFile = toml::from_str(
            r#"
            concurrency = "reject"

            [linker]
            author_year_min_score = 0.7
            "#,
        )
        .unwrap();
        let mut config = EngineConfig::default();
        config.apply(&file);
        assert_eq!(config.concurrency, ConcurrencyPolicy::Reject);
        assert_eq!(config.linker.author_year_min_score, 0.7);
        assert_eq!(config.linker.numeric_confidence, 0.9);
        assert_eq!(config.detector, DetectorConfig::default());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = EngineConfig::default();
        config.linker.author_year_min_score = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn inverted_corroborated_band_is_rejected() {
        let mut config = EngineConfig::default();
        config.linker.corroborated_min = 0.9;
        config.linker.corroborated_max = 0.8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_file_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[detector]\nmax_range_span = 10\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.detector.max_range_span, 10);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
