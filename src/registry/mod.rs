//! Filter registry: resolves handler names to executable predicates.
//!
//! The registry is populated once at startup (built-ins plus whatever the
//! hosting application registers) and is immutable afterwards. Definitions
//! are resolved against it when they are created or loaded, so an unknown
//! handler surfaces as a `ResolutionError` at that point rather than during
//! evaluation.

mod builtin;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ConfigurationError, PredicateError, ResolutionError};
use crate::filter::FilterDefinition;
use crate::post::Post;
use crate::similarity::{SimilarityDefaults, SimilarityMatcher};

pub use builtin::{
    parse_similar_title_parameter, parse_timespan_parameter, REGEX_IN_CONTENT, REGEX_IN_TITLE,
    SAME_GUID, SIMILAR_TITLE,
};

/// What a predicate can see besides the post itself.
pub struct FilterContext<'a> {
    /// Name of the definition being evaluated, for error messages.
    pub filter_name: &'a str,
    /// Capability for crossref predicates.
    pub matcher: &'a dyn SimilarityMatcher,
}

/// A filter predicate: `true` means the post passes (may be displayed).
pub trait FilterHandler: Send + Sync {
    /// Evaluates the post. `parameter` is `None` when the instance passes none.
    fn check(
        &self,
        post: &Post,
        parameter: Option<&str>,
        ctx: &FilterContext<'_>,
    ) -> Result<bool, PredicateError>;
}

/// Adapter for plain `(post, parameter?) -> bool` functions.
struct PlainPredicate<F>(F);

impl<F> FilterHandler for PlainPredicate<F>
where
    F: Fn(&Post, Option<&str>) -> bool + Send + Sync,
{
    fn check(
        &self,
        post: &Post,
        parameter: Option<&str>,
        _ctx: &FilterContext<'_>,
    ) -> Result<bool, PredicateError> {
        Ok((self.0)(post, parameter))
    }
}

/// Name-to-predicate table shared by built-in and external filters.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    handlers: HashMap<String, Arc<dyn FilterHandler>>,
    /// Defaults the built-ins were created with, `None` without built-ins.
    similarity: Option<SimilarityDefaults>,
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("handlers", &self.names())
            .field("similarity", &self.similarity)
            .finish()
    }
}

impl FilterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in predicates.
    #[must_use]
    pub fn with_builtins(defaults: SimilarityDefaults) -> Self {
        let mut registry = Self::new();
        registry.install_builtins(defaults);
        registry
    }

    /// Rebuilds the built-in predicates around new similarity defaults.
    ///
    /// A registry created without built-ins is left unchanged.
    pub fn set_similarity_defaults(&mut self, defaults: SimilarityDefaults) {
        if self.similarity.is_some() {
            self.install_builtins(defaults);
        }
    }

    /// Defaults used by the built-in duplicate predicates, if installed.
    #[must_use]
    pub const fn similarity_defaults(&self) -> Option<SimilarityDefaults> {
        self.similarity
    }

    fn install_builtins(&mut self, defaults: SimilarityDefaults) {
        for (name, handler) in builtin::handlers(defaults) {
            self.handlers.insert(name.to_string(), handler);
        }
        self.similarity = Some(defaults);
    }

    /// Registers a handler under a stable name.
    ///
    /// External predicates conventionally use a qualified, dotted name such as
    /// `myapp.filters.spam`.
    ///
    /// # Errors
    ///
    /// `InvalidField` for an empty name, `DuplicateHandler` if the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn FilterHandler>,
    ) -> Result<(), ConfigurationError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ConfigurationError::InvalidField {
                field: "handler_name".to_string(),
                reason: "handler name cannot be empty".to_string(),
            });
        }
        if self.handlers.contains_key(&name) {
            return Err(ConfigurationError::DuplicateHandler { name });
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Registers a plain `(post, parameter?) -> bool` function.
    ///
    /// # Errors
    ///
    /// Same as [`FilterRegistry::register`].
    pub fn register_fn<F>(&mut self, name: impl Into<String>, predicate: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&Post, Option<&str>) -> bool + Send + Sync + 'static,
    {
        self.register(name, Arc::new(PlainPredicate(predicate)))
    }

    /// Looks up a handler by name.
    ///
    /// # Errors
    ///
    /// `ResolutionError` if nothing is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn FilterHandler>, ResolutionError> {
        self.handlers
            .get(name.trim())
            .cloned()
            .ok_or_else(|| ResolutionError::new(name.trim()))
    }

    /// Resolves the predicate behind a definition.
    ///
    /// # Errors
    ///
    /// `ResolutionError` if the definition's handler key is unregistered.
    pub fn resolve_definition(
        &self,
        definition: &FilterDefinition,
    ) -> Result<Arc<dyn FilterHandler>, ResolutionError> {
        self.resolve(definition.handler_key())
    }

    /// Returns true if a handler is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name.trim())
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
