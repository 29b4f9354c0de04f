//! Sieve configuration.
//!
//! Loaded once at startup from JSON. The filter catalog it carries is
//! resolved against the registry when the sieve is built, so a definition
//! naming an unregistered handler fails the load instead of failing later
//! during evaluation.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, SieveResult};
use crate::events::DEFAULT_EVENT_QUEUE_CAPACITY;
use crate::filter::{CrossrefSpan, FilterDefinition, RebuildMode, TimelineBasis};
use crate::similarity::SimilarityDefaults;

/// Default number of per-post write lock stripes.
pub const DEFAULT_LOCK_STRIPES: usize = 64;

/// Default crossref span of catalog entries, in days.
pub const DEFAULT_CROSSREF_SPAN_DAYS: u32 = 7;

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidField {
        field: field.into(),
        reason: reason.into(),
    }
}

/// One filter definition declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    /// Registry key of the predicate; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default)]
    pub crossref: bool,
    /// Days re-referenced on invalidation, `0` = unbounded.
    #[serde(default = "default_span_days")]
    pub crossref_span_days: u32,
    #[serde(default)]
    pub rebuild_mode: RebuildMode,
    #[serde(default)]
    pub timeline_basis: TimelineBasis,
}

fn default_span_days() -> u32 {
    DEFAULT_CROSSREF_SPAN_DAYS
}

impl CatalogEntry {
    /// Builds the definition this entry declares.
    #[must_use]
    pub fn to_definition(&self) -> FilterDefinition {
        let span = match self.crossref_span_days {
            0 => CrossrefSpan::Unbounded,
            days => CrossrefSpan::days(i64::from(days)),
        };
        let mut def = FilterDefinition::new(self.name.trim())
            .with_rebuild_mode(self.rebuild_mode)
            .with_timeline_basis(self.timeline_basis);
        def.crossref = self.crossref;
        def.crossref_span = span;
        if let Some(handler) = &self.handler {
            def = def.with_handler(handler.trim());
        }
        def
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SieveConfig {
    /// Defaults for the built-in duplicate predicates.
    pub similarity: SimilarityDefaults,
    /// Stripes of the per-post write lock.
    pub lock_stripes: usize,
    /// Capacity of the change event queue.
    pub event_queue_capacity: usize,
    /// Filter definitions registered at startup.
    pub catalog: Vec<CatalogEntry>,
}

impl Default for SieveConfig {
    fn default() -> Self {
        Self {
            similarity: SimilarityDefaults::default(),
            lock_stripes: DEFAULT_LOCK_STRIPES,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            catalog: Vec::new(),
        }
    }
}

impl SieveConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// `InvalidField` if the document does not parse or does not validate.
    pub fn from_json_str(json: &str) -> SieveResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| invalid("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// `InvalidField` naming the path if it cannot be read, otherwise as
    /// [`SieveConfig::from_json_str`].
    pub fn from_json_file(path: impl AsRef<Path>) -> SieveResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| invalid(path.display().to_string(), e.to_string()))?;
        Self::from_json_str(&raw)
    }

    /// Checks value ranges and catalog names.
    ///
    /// # Errors
    ///
    /// `InvalidField` for the first offending field.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let threshold = self.similarity.threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(invalid(
                "similarity.threshold",
                format!("{threshold} is outside (0, 1)"),
            ));
        }
        if self.lock_stripes == 0 {
            return Err(invalid("lock_stripes", "must be at least 1"));
        }
        if self.event_queue_capacity == 0 {
            return Err(invalid("event_queue_capacity", "must be at least 1"));
        }

        let mut seen = HashSet::new();
        for (i, entry) in self.catalog.iter().enumerate() {
            let name = entry.name.trim();
            if name.is_empty() {
                return Err(invalid(format!("catalog[{i}].name"), "cannot be empty"));
            }
            if !seen.insert(name) {
                return Err(invalid(format!("catalog[{i}].name"), format!("duplicate name '{name}'")));
            }
            if entry.handler.as_deref().is_some_and(|h| h.trim().is_empty()) {
                return Err(invalid(format!("catalog[{i}].handler"), "cannot be empty"));
            }
        }
        Ok(())
    }
}
