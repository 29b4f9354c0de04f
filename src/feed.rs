//! Feeds, their filter bindings, and scope membership.
//!
//! A scope groups the feeds that share one site subscription. Crossref
//! predicates only compare posts whose feeds share a scope.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::filter::FilterInstanceId;

/// Unique identifier for a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedId(Uuid);

impl FeedId {
    /// Creates a new random feed ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FeedId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a scope (site).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(Uuid);

impl ScopeId {
    /// Creates a new random scope ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a feed combines the outcomes of its bound filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationLogic {
    /// Post must pass every filter (AND).
    All,
    /// Post must pass at least one filter (OR).
    Any,
}

impl Default for CombinationLogic {
    fn default() -> Self {
        Self::All
    }
}

impl CombinationLogic {
    /// The predicate outcome that settles the aggregate on sight.
    #[must_use]
    pub const fn short_circuit_value(self) -> bool {
        match self {
            Self::All => false,
            Self::Any => true,
        }
    }

    /// The outcome when no filter produced the short-circuit value.
    ///
    /// This is also the vacuous outcome for an empty binding set.
    #[must_use]
    pub const fn exhausted_value(self) -> bool {
        !self.short_circuit_value()
    }
}

/// The filters a feed applies to its posts.
///
/// `filters` keeps the declared order without duplicates; evaluation runs
/// independent filters in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedFilterBinding {
    pub filters: Vec<FilterInstanceId>,
    pub logic: CombinationLogic,
}

impl FeedFilterBinding {
    /// Creates a binding from instances in declaration order. Repeats are dropped.
    #[must_use]
    pub fn new(filters: impl IntoIterator<Item = FilterInstanceId>, logic: CombinationLogic) -> Self {
        let mut binding = Self {
            filters: Vec::new(),
            logic,
        };
        binding.bind(filters);
        binding
    }

    fn bind(&mut self, filters: impl IntoIterator<Item = FilterInstanceId>) {
        for id in filters {
            if !self.filters.contains(&id) {
                self.filters.push(id);
            }
        }
    }

    /// Returns a copy with `added` bound, `removed` unbound and the logic optionally replaced.
    #[must_use]
    pub fn changed(
        &self,
        added: &[FilterInstanceId],
        removed: &[FilterInstanceId],
        logic: Option<CombinationLogic>,
    ) -> Self {
        let mut next = Self {
            filters: self.filters.clone(),
            logic: logic.unwrap_or(self.logic),
        };
        next.filters.retain(|id| !removed.contains(id));
        next.bind(added.iter().copied());
        next
    }
}

/// A source of posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: FeedId,
    pub name: String,
    #[serde(default)]
    pub binding: FeedFilterBinding,
}

impl Feed {
    /// Creates a feed with no filters bound (every post passes).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: FeedId::new(),
            name: name.into(),
            binding: FeedFilterBinding::default(),
        }
    }

    /// Sets the initial binding.
    #[must_use]
    pub fn with_binding(mut self, binding: FeedFilterBinding) -> Self {
        self.binding = binding;
        self
    }
}

/// Membership of a feed in a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    pub scope: ScopeId,
    pub feed: FeedId,
}

impl Subscription {
    /// Creates a subscription record.
    #[must_use]
    pub const fn new(scope: ScopeId, feed: FeedId) -> Self {
        Self { scope, feed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_circuit_values_mirror_each_other() {
        assert!(!CombinationLogic::All.short_circuit_value());
        assert!(CombinationLogic::All.exhausted_value());
        assert!(CombinationLogic::Any.short_circuit_value());
        assert!(!CombinationLogic::Any.exhausted_value());
    }

    #[test]
    fn binding_change_applies_removals_then_additions() {
        let a = FilterInstanceId::new();
        let b = FilterInstanceId::new();
        let c = FilterInstanceId::new();
        let binding = FeedFilterBinding::new([a, b], CombinationLogic::All);

        let next = binding.changed(&[c], &[a], Some(CombinationLogic::Any));
        assert!(!next.filters.contains(&a));
        assert!(next.filters.contains(&b));
        assert!(next.filters.contains(&c));
        assert_eq!(next.logic, CombinationLogic::Any);

        let same_logic = binding.changed(&[], &[], None);
        assert_eq!(same_logic, binding);
    }

    #[test]
    fn binding_keeps_declared_order_without_repeats() {
        let a = FilterInstanceId::new();
        let b = FilterInstanceId::new();
        let c = FilterInstanceId::new();
        let binding = FeedFilterBinding::new([c, a, c, b], CombinationLogic::All);
        assert_eq!(binding.filters, vec![c, a, b]);

        let next = binding.changed(&[a, c], &[a], None);
        assert_eq!(next.filters, vec![c, b, a]);
    }
}
