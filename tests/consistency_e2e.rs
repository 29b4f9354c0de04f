use std::sync::{Arc, Mutex, OnceLock, Weak};

use chrono::{DateTime, Duration, Utc};
use feedsieve::registry::{REGEX_IN_CONTENT, REGEX_IN_TITLE, SAME_GUID};
use feedsieve::{
    AggregateResult, CombinationLogic, ConfigurationError, CrossrefSpan, Feed, FeedFilterBinding,
    FeedId, FeedSieve, FilterDefinition, FilterInstanceId, FilterRegistry, InMemoryStore, Post,
    FilterDefinitionId, PostId, RebuildMode, RebuildReport, ScopeId, SieveConfig, SieveError, SieveStore, SimilarityDefaults,
    Subscription, TimelineBasis,
};

fn sieve_with(registry: FilterRegistry) -> FeedSieve {
    let store: Arc<dyn SieveStore> = Arc::new(InMemoryStore::new());
    FeedSieve::new(store, registry, SieveConfig::default()).unwrap()
}

fn sieve() -> FeedSieve {
    sieve_with(FilterRegistry::with_builtins(SimilarityDefaults::default()))
}

fn instance_of(sieve: &FeedSieve, definition: FilterDefinition, parameter: Option<&str>) -> FilterInstanceId {
    let def = sieve.define_filter(definition).unwrap();
    sieve
        .create_instance(def, parameter.map(str::to_string))
        .unwrap()
        .id
}

fn feed_binding(sieve: &FeedSieve, name: &str, filters: &[FilterInstanceId]) -> FeedId {
    sieve
        .add_feed(Feed::new(name).with_binding(FeedFilterBinding::new(filters.iter().copied(), CombinationLogic::All)))
        .unwrap()
}

fn save_aged(sieve: &FeedSieve, feed: FeedId, guid: &str, days: i64) -> PostId {
    let post = Post::created_at(feed, guid, guid, Utc::now() - Duration::days(days));
    let id = post.id;
    sieve.save_post(post).unwrap();
    id
}

fn evaluated_at(sieve: &FeedSieve, post: PostId, filter: FilterInstanceId) -> Option<DateTime<Utc>> {
    sieve
        .store()
        .results_for_post(post)
        .unwrap()
        .into_iter()
        .find(|r| r.filter == filter)
        .map(|r| r.evaluated_at)
}

fn aggregate(sieve: &FeedSieve, post: PostId) -> AggregateResult {
    sieve.store().get_post(post).unwrap().unwrap().aggregate
}

fn pause() {
    std::thread::sleep(std::time::Duration::from_millis(5));
}

#[test]
fn binding_change_revisits_only_posts_inside_the_span() {
    let sieve = sieve();
    let dedup = instance_of(&sieve, FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(2)), None);
    let feed = feed_binding(&sieve, "a", &[dedup]);

    let old = save_aged(&sieve, feed, "old", 3);
    let recent = save_aged(&sieve, feed, "recent", 1);
    let old_at = evaluated_at(&sieve, old, dedup).unwrap();
    let recent_at = evaluated_at(&sieve, recent, dedup).unwrap();
    pause();

    let anything = instance_of(&sieve, FilterDefinition::new(REGEX_IN_TITLE), Some("."));
    let report = sieve.change_binding(feed, &[anything], &[], None).unwrap();

    assert_eq!(report.revisited, 1);
    assert_eq!(report.evaluated, 2);
    assert_eq!(evaluated_at(&sieve, old, dedup), Some(old_at));
    assert!(evaluated_at(&sieve, recent, dedup).unwrap() > recent_at);
    assert_eq!(aggregate(&sieve, old), AggregateResult::Pass);
    assert_eq!(aggregate(&sieve, recent), AggregateResult::Pass);
}

#[test]
fn new_only_window_reaches_back_to_the_earliest_trigger() {
    let sieve = sieve();
    let def = FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(2)).with_rebuild_mode(RebuildMode::NewOnly);
    let dedup = instance_of(&sieve, def, None);
    let feed = feed_binding(&sieve, "a", &[dedup]);

    let six = save_aged(&sieve, feed, "six", 6);
    let four = save_aged(&sieve, feed, "four", 4);
    let one = save_aged(&sieve, feed, "one", 1);
    let six_at = evaluated_at(&sieve, six, dedup).unwrap();
    let four_at = evaluated_at(&sieve, four, dedup).unwrap();
    let one_at = evaluated_at(&sieve, one, dedup).unwrap();
    pause();

    let report = sieve
        .save_post(Post::created_at(feed, "five", "five", Utc::now() - Duration::days(5)))
        .unwrap()
        .unwrap();

    assert_eq!(report.revisited, 3);
    assert_eq!(evaluated_at(&sieve, six, dedup), Some(six_at));
    assert!(evaluated_at(&sieve, four, dedup).unwrap() > four_at);
    assert!(evaluated_at(&sieve, one, dedup).unwrap() > one_at);
}

#[test]
fn propagation_reaches_crossref_feeds_sharing_a_scope() {
    let sieve = sieve();
    let dedup = instance_of(&sieve, FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(7)), None);
    let a = feed_binding(&sieve, "a", &[dedup]);
    let b = feed_binding(&sieve, "b", &[dedup]);
    let c = feed_binding(&sieve, "c", &[dedup]);

    let shared = ScopeId::new();
    sieve.subscribe(Subscription::new(shared, a)).unwrap();
    sieve.subscribe(Subscription::new(shared, b)).unwrap();
    sieve.subscribe(Subscription::new(ScopeId::new(), c)).unwrap();

    let in_b = save_aged(&sieve, b, "abc123", 2);
    let in_c = save_aged(&sieve, c, "abc123", 2);
    let in_b_at = evaluated_at(&sieve, in_b, dedup).unwrap();
    let in_c_at = evaluated_at(&sieve, in_c, dedup).unwrap();
    pause();

    let in_a = save_aged(&sieve, a, "abc123", 1);

    assert!(evaluated_at(&sieve, in_b, dedup).unwrap() > in_b_at);
    assert_eq!(evaluated_at(&sieve, in_c, dedup), Some(in_c_at));
    assert_eq!(aggregate(&sieve, in_b), AggregateResult::Pass);
    assert_eq!(aggregate(&sieve, in_c), AggregateResult::Pass);
    assert_eq!(aggregate(&sieve, in_a), AggregateResult::Fail);
}

#[test]
fn neighbours_without_crossref_filters_are_left_alone() {
    let sieve = sieve();
    let dedup = instance_of(&sieve, FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(7)), None);
    let plain = instance_of(&sieve, FilterDefinition::new(REGEX_IN_TITLE), Some("."));
    let a = feed_binding(&sieve, "a", &[dedup]);
    let b = feed_binding(&sieve, "b", &[plain]);

    let shared = ScopeId::new();
    sieve.subscribe(Subscription::new(shared, a)).unwrap();
    sieve.subscribe(Subscription::new(shared, b)).unwrap();

    let in_b = save_aged(&sieve, b, "abc123", 2);
    let in_b_at = evaluated_at(&sieve, in_b, plain).unwrap();
    pause();

    let in_a = save_aged(&sieve, a, "abc123", 1);

    assert_eq!(evaluated_at(&sieve, in_b, plain), Some(in_b_at));
    assert_eq!(aggregate(&sieve, in_b), AggregateResult::Pass);
    // B's post is still displayable in the shared scope, so A's copy is a duplicate.
    assert_eq!(aggregate(&sieve, in_a), AggregateResult::Fail);
}

#[test]
fn moving_a_feed_reevaluates_both_scopes() {
    let sieve = sieve();
    let dedup = instance_of(&sieve, FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(7)), None);
    let a = feed_binding(&sieve, "a", &[dedup]);
    let b = feed_binding(&sieve, "b", &[dedup]);
    let c = feed_binding(&sieve, "c", &[dedup]);

    let left = ScopeId::new();
    let right = ScopeId::new();
    sieve.subscribe(Subscription::new(left, a)).unwrap();
    sieve.subscribe(Subscription::new(left, b)).unwrap();
    sieve.subscribe(Subscription::new(right, c)).unwrap();

    let in_a = save_aged(&sieve, a, "abc123", 3);
    let in_b = save_aged(&sieve, b, "abc123", 2);
    let in_c = save_aged(&sieve, c, "abc123", 1);
    assert_eq!(aggregate(&sieve, in_b), AggregateResult::Fail);
    assert_eq!(aggregate(&sieve, in_c), AggregateResult::Pass);

    let report = sieve.move_subscription(a, left, right).unwrap();
    assert_eq!(report.related_feeds, 3);
    assert_eq!(aggregate(&sieve, in_a), AggregateResult::Pass);
    assert_eq!(aggregate(&sieve, in_b), AggregateResult::Pass);
    assert_eq!(aggregate(&sieve, in_c), AggregateResult::Fail);
}

#[test]
fn mismatched_crossref_settings_are_rejected_before_applying() {
    let sieve = sieve();
    let by_created = instance_of(&sieve, FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(7)), None);
    let by_modified = instance_of(
        &sieve,
        FilterDefinition::crossref("similar_title", CrossrefSpan::days(7)).with_timeline_basis(TimelineBasis::Modified),
        None,
    );
    let a = feed_binding(&sieve, "a", &[by_created]);
    let b = feed_binding(&sieve, "b", &[]);
    let scope = ScopeId::new();
    sieve.subscribe(Subscription::new(scope, a)).unwrap();
    sieve.subscribe(Subscription::new(scope, b)).unwrap();
    let passes = sieve.completed_passes();

    let err = sieve.change_binding(b, &[by_modified], &[], None).unwrap_err();
    assert!(matches!(
        err,
        SieveError::Configuration(ConfigurationError::CrossrefMismatch { setting: "timeline_basis", .. })
    ));
    assert!(sieve.store().get_feed(b).unwrap().unwrap().binding.filters.is_empty());
    assert_eq!(sieve.completed_passes(), passes);

    // Outside the shared scope the same binding is fine.
    let lone = feed_binding(&sieve, "lone", &[]);
    sieve.change_binding(lone, &[by_modified], &[], None).unwrap();
    let err = sieve.subscribe(Subscription::new(scope, lone)).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn predicate_failures_are_isolated_per_post() {
    let sieve = sieve();
    let dedup = instance_of(&sieve, FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(7)), None);
    let missing_param = instance_of(&sieve, FilterDefinition::new(REGEX_IN_TITLE), None);
    let feed = feed_binding(&sieve, "a", &[dedup]);
    let broken = feed_binding(&sieve, "b", &[missing_param]);

    let unit = sieve.begin().unwrap();
    let good = save_aged(&sieve, feed, "g-1", 2);
    let bad = save_aged(&sieve, broken, "g-2", 1);
    let report = unit.commit().unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].post, bad);
    assert_eq!(aggregate(&sieve, good), AggregateResult::Pass);
    assert_eq!(aggregate(&sieve, bad), AggregateResult::Unknown);
    assert!(!sieve.is_displayable(bad).unwrap());
}

#[test]
fn controller_writes_do_not_start_nested_passes() {
    let slot: Arc<OnceLock<Weak<FeedSieve>>> = Arc::new(OnceLock::new());
    let nested: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));

    let mut registry = FilterRegistry::with_builtins(SimilarityDefaults::default());
    {
        let slot = Arc::clone(&slot);
        let nested = Arc::clone(&nested);
        // Mimics a store that fires its save hook from inside evaluation.
        registry
            .register_fn("myapp.filters.echo", move |post, _| {
                if let Some(sieve) = slot.get().and_then(Weak::upgrade) {
                    let report = sieve.on_post_saved(post).unwrap().unwrap();
                    nested.lock().unwrap().push(report.suppressed);
                }
                true
            })
            .unwrap();
    }
    let sieve = Arc::new(sieve_with(registry));
    slot.set(Arc::downgrade(&sieve)).unwrap();

    let echo = instance_of(&sieve, FilterDefinition::new("echo").with_handler("myapp.filters.echo"), None);
    let feed = feed_binding(&sieve, "a", &[echo]);
    let before = sieve.completed_passes();

    save_aged(&sieve, feed, "first", 0);
    assert_eq!(sieve.completed_passes(), before + 1);
    assert_eq!(*nested.lock().unwrap(), vec![true]);

    save_aged(&sieve, feed, "second", 0);
    assert_eq!(sieve.completed_passes(), before + 2);
    assert_eq!(*nested.lock().unwrap(), vec![true, true]);
}

fn definition(sieve: &FeedSieve, id: FilterDefinitionId) -> FilterDefinition {
    sieve.store().get_definition(id).unwrap().unwrap()
}

#[test]
fn widening_a_span_reaches_older_posts() {
    let sieve = sieve();
    let def_id = sieve
        .define_filter(FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(2)))
        .unwrap();
    let dedup = sieve.create_instance(def_id, None).unwrap().id;
    let feed = feed_binding(&sieve, "a", &[dedup]);

    let ancient = save_aged(&sieve, feed, "ancient", 30);
    let old = save_aged(&sieve, feed, "old", 5);
    let recent = save_aged(&sieve, feed, "recent", 1);
    let ancient_at = evaluated_at(&sieve, ancient, dedup).unwrap();
    let old_at = evaluated_at(&sieve, old, dedup).unwrap();
    let recent_at = evaluated_at(&sieve, recent, dedup).unwrap();
    pause();

    let mut wider = definition(&sieve, def_id);
    wider.crossref_span = CrossrefSpan::days(10);
    let report = sieve.update_definition(wider).unwrap();

    assert_eq!(report.revisited, 2);
    assert_eq!(report.evaluated, 3);
    assert_eq!(evaluated_at(&sieve, ancient, dedup), Some(ancient_at));
    assert!(evaluated_at(&sieve, old, dedup).unwrap() > old_at);
    assert!(evaluated_at(&sieve, recent, dedup).unwrap() > recent_at);
    assert_eq!(definition(&sieve, def_id).crossref_span, CrossrefSpan::days(10));
}

#[test]
fn dropping_crossref_stops_propagation_to_neighbours() {
    let sieve = sieve();
    let def_id = sieve
        .define_filter(FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(7)))
        .unwrap();
    let dedup = sieve.create_instance(def_id, None).unwrap().id;
    let a = feed_binding(&sieve, "a", &[dedup]);
    let b = feed_binding(&sieve, "b", &[dedup]);
    let scope = ScopeId::new();
    sieve.subscribe(Subscription::new(scope, a)).unwrap();
    sieve.subscribe(Subscription::new(scope, b)).unwrap();

    let in_b = save_aged(&sieve, b, "abc123", 2);
    let in_a = save_aged(&sieve, a, "abc123", 1);
    assert_eq!(aggregate(&sieve, in_a), AggregateResult::Fail);

    let mut plain = definition(&sieve, def_id);
    plain.crossref = false;
    let report = sieve.update_definition(plain).unwrap();
    assert!(!report.suppressed);
    assert_eq!(report.related_feeds, 0);
    assert_eq!(report.evaluated, 2);

    // B is no longer a crossref neighbour of A.
    let in_b_at = evaluated_at(&sieve, in_b, dedup).unwrap();
    pause();
    save_aged(&sieve, a, "fresh", 0);
    assert_eq!(evaluated_at(&sieve, in_b, dedup), Some(in_b_at));
}

#[test]
fn swapping_the_handler_drops_cached_rows() {
    let sieve = sieve();
    let def_id = sieve
        .define_filter(FilterDefinition::new("rusty").with_handler(REGEX_IN_TITLE))
        .unwrap();
    let rusty = sieve.create_instance(def_id, Some("(?i)rust".to_string())).unwrap().id;
    let feed = feed_binding(&sieve, "a", &[rusty]);
    let post = Post::new(feed, "g", "Rust news").with_content("nothing to see");
    let id = post.id;
    sieve.save_post(post).unwrap();
    assert_eq!(aggregate(&sieve, id), AggregateResult::Pass);

    let swapped = definition(&sieve, def_id).with_handler(REGEX_IN_CONTENT);
    let report = sieve.update_definition(swapped).unwrap();

    assert_eq!(report.dropped, 1);
    assert_eq!(report.invoked, 1);
    assert_eq!(aggregate(&sieve, id), AggregateResult::Fail);
}

#[test]
fn renaming_a_definition_runs_no_pass() {
    let sieve = sieve();
    let def_id = sieve
        .define_filter(FilterDefinition::new("rusty").with_handler(REGEX_IN_TITLE))
        .unwrap();
    let rusty = sieve.create_instance(def_id, Some("rust".to_string())).unwrap().id;
    let feed = feed_binding(&sieve, "a", &[rusty]);
    let post = save_aged(&sieve, feed, "rust", 0);
    let at = evaluated_at(&sieve, post, rusty).unwrap();
    let passes = sieve.completed_passes();

    let mut renamed = definition(&sieve, def_id);
    renamed.name = "rust-only".to_string();
    let report = sieve.update_definition(renamed).unwrap();

    assert_eq!(report, RebuildReport::default());
    assert_eq!(sieve.completed_passes(), passes);
    assert_eq!(evaluated_at(&sieve, post, rusty), Some(at));
    assert_eq!(definition(&sieve, def_id).name, "rust-only");
}

#[test]
fn definition_edit_creating_a_mismatch_is_rejected() {
    let sieve = sieve();
    let guid_id = sieve
        .define_filter(FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(7)))
        .unwrap();
    let by_guid = sieve.create_instance(guid_id, None).unwrap().id;
    let title_id = sieve
        .define_filter(FilterDefinition::crossref("similar_title", CrossrefSpan::days(7)))
        .unwrap();
    let by_title = sieve.create_instance(title_id, None).unwrap().id;
    let a = feed_binding(&sieve, "a", &[by_guid]);
    let b = feed_binding(&sieve, "b", &[by_title]);
    let scope = ScopeId::new();
    sieve.subscribe(Subscription::new(scope, a)).unwrap();
    sieve.subscribe(Subscription::new(scope, b)).unwrap();
    let passes = sieve.completed_passes();

    let edited = definition(&sieve, title_id).with_rebuild_mode(RebuildMode::NewOnly);
    let err = sieve.update_definition(edited).unwrap_err();

    assert!(matches!(
        err,
        SieveError::Configuration(ConfigurationError::CrossrefMismatch { setting: "rebuild_mode", .. })
    ));
    assert_eq!(definition(&sieve, title_id).rebuild_mode, RebuildMode::All);
    assert_eq!(sieve.completed_passes(), passes);
}

#[test]
fn failed_scope_move_keeps_the_previous_scope() {
    let sieve = sieve();
    let by_created = instance_of(&sieve, FilterDefinition::crossref(SAME_GUID, CrossrefSpan::days(7)), None);
    let by_modified = instance_of(
        &sieve,
        FilterDefinition::crossref("similar_title", CrossrefSpan::days(7)).with_timeline_basis(TimelineBasis::Modified),
        None,
    );
    let a = feed_binding(&sieve, "a", &[by_created]);
    let b = feed_binding(&sieve, "b", &[by_modified]);
    let left = ScopeId::new();
    let right = ScopeId::new();
    sieve.subscribe(Subscription::new(left, a)).unwrap();
    sieve.subscribe(Subscription::new(right, b)).unwrap();
    let passes = sieve.completed_passes();

    assert!(sieve.move_subscription(a, left, right).unwrap_err().is_configuration());
    assert_eq!(sieve.store().scopes_of(a).unwrap(), vec![left]);

    let ghost = FeedId::new();
    assert!(sieve.move_subscription(ghost, left, right).unwrap_err().is_storage());
    assert!(sieve.store().scopes_of(ghost).unwrap().is_empty());
    assert_eq!(sieve.store().feeds_in(right).unwrap(), vec![b]);
    assert_eq!(sieve.completed_passes(), passes);
}
