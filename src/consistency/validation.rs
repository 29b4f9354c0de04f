//! Pre-change validation of crossref settings within a scope.
//!
//! Crossref filters sharing a scope must agree on `timeline_basis` and
//! `rebuild_mode`, or a rebuild pass could not order and window the scope
//! consistently. Changes are checked against the state they would produce,
//! before anything is written.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ConfigurationError, SieveResult};
use crate::feed::{FeedFilterBinding, FeedId, ScopeId};
use crate::filter::{FilterDefinition, FilterDefinitionId};
use crate::storage::{SieveStore, StorageError};

/// A change that has not been applied yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prospect<'a> {
    /// A feed's binding after the change.
    pub binding: Option<(FeedId, &'a FeedFilterBinding)>,
    /// A definition after the change.
    pub definition: Option<&'a FilterDefinition>,
    /// A feed joining a scope.
    pub joining: Option<(ScopeId, FeedId)>,
}

/// Checks every given scope as it would look after `prospect` is applied.
///
/// # Errors
///
/// `CrossrefMismatch` for the first disagreeing scope, or a storage error.
pub fn validate_scopes(
    store: &dyn SieveStore,
    scopes: impl IntoIterator<Item = ScopeId>,
    prospect: &Prospect<'_>,
) -> SieveResult<()> {
    let scopes: BTreeSet<ScopeId> = scopes.into_iter().collect();
    for scope in scopes {
        let definitions = crossref_definitions(store, scope, prospect)?;
        check_uniform(scope, definitions.values())?;
    }
    Ok(())
}

fn crossref_definitions(
    store: &dyn SieveStore,
    scope: ScopeId,
    prospect: &Prospect<'_>,
) -> SieveResult<BTreeMap<FilterDefinitionId, FilterDefinition>> {
    let mut feeds: BTreeSet<FeedId> = store.feeds_in(scope)?.into_iter().collect();
    if let Some((joining_scope, feed)) = prospect.joining {
        if joining_scope == scope {
            feeds.insert(feed);
        }
    }

    let mut out = BTreeMap::new();
    for feed in feeds {
        let binding = match prospect.binding {
            Some((id, binding)) if id == feed => binding.clone(),
            _ => {
                store
                    .get_feed(feed)?
                    .ok_or(StorageError::FeedNotFound(feed))?
                    .binding
            }
        };
        for instance_id in binding.filters {
            let instance = store
                .get_instance(instance_id)?
                .ok_or(StorageError::InstanceNotFound(instance_id))?;
            let definition = match prospect.definition {
                Some(def) if def.id == instance.definition => def.clone(),
                _ => store
                    .get_definition(instance.definition)?
                    .ok_or(StorageError::DefinitionNotFound(instance.definition))?,
            };
            if definition.crossref {
                out.insert(definition.id, definition);
            }
        }
    }
    Ok(out)
}

fn check_uniform<'a>(
    scope: ScopeId,
    definitions: impl IntoIterator<Item = &'a FilterDefinition>,
) -> Result<(), ConfigurationError> {
    let mut iter = definitions.into_iter();
    let Some(first) = iter.next() else {
        return Ok(());
    };
    for other in iter {
        if other.timeline_basis != first.timeline_basis {
            return Err(ConfigurationError::CrossrefMismatch {
                scope,
                setting: "timeline_basis",
                detail: format!(
                    "'{}' uses {:?}, '{}' uses {:?}",
                    first.name, first.timeline_basis, other.name, other.timeline_basis
                ),
            });
        }
        if other.rebuild_mode != first.rebuild_mode {
            return Err(ConfigurationError::CrossrefMismatch {
                scope,
                setting: "rebuild_mode",
                detail: format!(
                    "'{}' uses {:?}, '{}' uses {:?}",
                    first.name, first.rebuild_mode, other.name, other.rebuild_mode
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::SieveError;
    use crate::feed::{CombinationLogic, Feed, Subscription};
    use crate::filter::{CrossrefSpan, FilterInstance, RebuildMode, TimelineBasis};
    use crate::storage::{FeedStore, FilterStore, InMemoryStore};

    fn crossref_instance(store: &InMemoryStore, name: &str, basis: TimelineBasis) -> FilterInstance {
        let def = FilterDefinition::crossref(name, CrossrefSpan::days(7)).with_timeline_basis(basis);
        let inst = FilterInstance::new(def.id);
        store.insert_definition(def).unwrap();
        store.insert_instance(inst.clone()).unwrap();
        inst
    }

    fn is_mismatch(err: &SieveError, expected: &str) -> bool {
        matches!(
            err,
            SieveError::Configuration(ConfigurationError::CrossrefMismatch { setting, .. }) if *setting == expected
        )
    }

    #[test]
    fn mismatched_basis_in_shared_scope_is_rejected() {
        let store = InMemoryStore::new();
        let created = crossref_instance(&store, "guid", TimelineBasis::Created);
        let modified = crossref_instance(&store, "title", TimelineBasis::Modified);

        let a = Feed::new("a").with_binding(FeedFilterBinding::new([created.id], CombinationLogic::All));
        let b = Feed::new("b");
        let scope = ScopeId::new();
        store.insert_feed(a.clone()).unwrap();
        store.insert_feed(b.clone()).unwrap();
        store.subscribe(Subscription::new(scope, a.id)).unwrap();
        store.subscribe(Subscription::new(scope, b.id)).unwrap();

        let next = FeedFilterBinding::new([modified.id], CombinationLogic::All);
        let prospect = Prospect {
            binding: Some((b.id, &next)),
            ..Prospect::default()
        };
        let err = validate_scopes(&store, [scope], &prospect).unwrap_err();
        assert!(is_mismatch(&err, "timeline_basis"));

        // Same change outside the shared scope is fine.
        assert!(validate_scopes(&store, [], &prospect).is_ok());
    }

    #[test]
    fn definition_edit_and_joining_feed_are_checked() {
        let store = InMemoryStore::new();
        let first = crossref_instance(&store, "guid", TimelineBasis::Created);
        let second = crossref_instance(&store, "title", TimelineBasis::Created);

        let a = Feed::new("a").with_binding(FeedFilterBinding::new([first.id], CombinationLogic::All));
        let b = Feed::new("b").with_binding(FeedFilterBinding::new([second.id], CombinationLogic::All));
        let scope = ScopeId::new();
        store.insert_feed(a.clone()).unwrap();
        store.insert_feed(b.clone()).unwrap();
        store.subscribe(Subscription::new(scope, a.id)).unwrap();

        let joining = Prospect {
            joining: Some((scope, b.id)),
            ..Prospect::default()
        };
        assert!(validate_scopes(&store, [scope], &joining).is_ok());
        store.subscribe(Subscription::new(scope, b.id)).unwrap();

        let mut edited = store.get_definition(second.definition).unwrap().unwrap();
        edited.rebuild_mode = RebuildMode::NewOnly;
        let prospect = Prospect {
            definition: Some(&edited),
            ..Prospect::default()
        };
        let err = validate_scopes(&store, [scope], &prospect).unwrap_err();
        assert!(is_mismatch(&err, "rebuild_mode"));
    }
}
