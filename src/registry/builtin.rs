//! Built-in predicates.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;

use crate::error::PredicateError;
use crate::post::Post;
use crate::similarity::SimilarityDefaults;

use super::{FilterContext, FilterHandler};

/// Pass posts whose trimmed title matches the regex parameter.
pub const REGEX_IN_TITLE: &str = "regex_in_title";
/// Pass posts whose trimmed content matches the regex parameter.
pub const REGEX_IN_CONTENT: &str = "regex_in_content";
/// Skip posts whose GUID duplicates a displayable post in scope.
pub const SAME_GUID: &str = "same_guid";
/// Skip posts whose title fuzzily matches a displayable post in scope.
pub const SIMILAR_TITLE: &str = "similar_title";

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();

fn cached_regex(filter: &str, pattern: &str) -> Result<Regex, PredicateError> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache
            .read()
            .map_err(|_| PredicateError::failed(filter, "regex cache lock poisoned"))?;
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = Regex::new(pattern).map_err(|e| PredicateError::InvalidParameter {
        filter: filter.to_string(),
        parameter: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut guard = cache
        .write()
        .map_err(|_| PredicateError::failed(filter, "regex cache lock poisoned"))?;
    if guard.len() >= REGEX_CACHE_MAX {
        guard.clear();
    }
    guard
        .entry(pattern.to_string())
        .or_insert_with(|| compiled.clone());
    Ok(compiled)
}

struct RegexInField {
    field: fn(&Post) -> &str,
}

impl FilterHandler for RegexInField {
    fn check(
        &self,
        post: &Post,
        parameter: Option<&str>,
        ctx: &FilterContext<'_>,
    ) -> Result<bool, PredicateError> {
        let pattern = parameter.ok_or_else(|| PredicateError::MissingParameter {
            filter: ctx.filter_name.to_string(),
        })?;
        let re = cached_regex(ctx.filter_name, pattern)?;
        Ok(re.is_match((self.field)(post).trim()))
    }
}

/// Parses a timespan in seconds (`0` = unbounded), falling back to `default`.
///
/// # Errors
///
/// `InvalidParameter` if the parameter is not a non-negative integer.
pub fn parse_timespan_parameter(
    filter: &str,
    parameter: Option<&str>,
    default: u64,
) -> Result<u64, PredicateError> {
    match parameter.map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse::<u64>().map_err(|e| PredicateError::InvalidParameter {
            filter: filter.to_string(),
            parameter: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Parses `threshold` or `threshold, timespan` for the title matcher.
///
/// # Errors
///
/// `InvalidParameter` if a value does not parse or the threshold is outside `(0, 1)`.
pub fn parse_similar_title_parameter(
    filter: &str,
    parameter: Option<&str>,
    defaults: SimilarityDefaults,
) -> Result<(f64, u64), PredicateError> {
    let invalid = |raw: &str, reason: String| PredicateError::InvalidParameter {
        filter: filter.to_string(),
        parameter: raw.to_string(),
        reason,
    };

    let raw = match parameter.map(str::trim) {
        None | Some("") => return Ok((defaults.threshold, defaults.window_seconds)),
        Some(raw) => raw,
    };

    let (threshold_raw, timespan_raw) = match raw.split_once(',') {
        Some((t, s)) => (t.trim(), Some(s.trim())),
        None => (raw, None),
    };
    let threshold = threshold_raw
        .parse::<f64>()
        .map_err(|e| invalid(raw, e.to_string()))?;
    if !(threshold > 0.0 && threshold < 1.0) {
        return Err(invalid(raw, "threshold must be within (0, 1)".to_string()));
    }
    let window = match timespan_raw {
        Some(s) => s.parse::<u64>().map_err(|e| invalid(raw, e.to_string()))?,
        None => defaults.window_seconds,
    };
    Ok((threshold, window))
}

struct SameGuid {
    defaults: SimilarityDefaults,
}

impl FilterHandler for SameGuid {
    fn check(
        &self,
        post: &Post,
        parameter: Option<&str>,
        ctx: &FilterContext<'_>,
    ) -> Result<bool, PredicateError> {
        let window = parse_timespan_parameter(ctx.filter_name, parameter, self.defaults.window_seconds)?;
        let duplicate = ctx
            .matcher
            .same_identifier(post, window)
            .map_err(|e| PredicateError::failed(ctx.filter_name, e.to_string()))?;
        Ok(!duplicate)
    }
}

struct SimilarTitle {
    defaults: SimilarityDefaults,
}

impl FilterHandler for SimilarTitle {
    fn check(
        &self,
        post: &Post,
        parameter: Option<&str>,
        ctx: &FilterContext<'_>,
    ) -> Result<bool, PredicateError> {
        let (threshold, window) = parse_similar_title_parameter(ctx.filter_name, parameter, self.defaults)?;
        let similar = ctx
            .matcher
            .similar_title(post, threshold, window)
            .map_err(|e| PredicateError::failed(ctx.filter_name, e.to_string()))?;
        Ok(!similar)
    }
}

fn title_of(post: &Post) -> &str {
    &post.title
}

fn content_of(post: &Post) -> &str {
    &post.content
}

pub(super) fn handlers(defaults: SimilarityDefaults) -> Vec<(&'static str, Arc<dyn FilterHandler>)> {
    let title: Arc<dyn FilterHandler> = Arc::new(RegexInField { field: title_of });
    let content: Arc<dyn FilterHandler> = Arc::new(RegexInField { field: content_of });
    let same_guid: Arc<dyn FilterHandler> = Arc::new(SameGuid { defaults });
    let similar_title: Arc<dyn FilterHandler> = Arc::new(SimilarTitle { defaults });
    vec![
        (REGEX_IN_TITLE, title),
        (REGEX_IN_CONTENT, content),
        (SAME_GUID, same_guid),
        (SIMILAR_TITLE, similar_title),
    ]
}
