use crate::model::{
    CanonicalLocation, GeoPoint, LanguageMap, LocationId, LocationType, Provider, RawLocation
};
use crate::normalizer::Normalizer;
use crate::reconciler::Reconciler;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};

const LANGUAGES: [&str; 4] = ["fr", "de", "es", "it"];

fn languages() -> impl Strategy<Value = BTreeSet<&'static str>> {
    proptest::collection::btree_set(proptest::sample::select(LANGUAGES.to_vec()), 0..=LANGUAGES.len())
}

/// Shared keys always carry the same value, as two providers describing the
/// same place would.
fn language_map(default: Option<&str>, extra: &BTreeSet<&'static str>, prefix: &str) -> LanguageMap {
    let mut map: LanguageMap = extra
        .iter()
        .map(|language| (*language, format!("{prefix}-{language}")))
        .collect();
    if let Some(value) = default {
        map.insert("en", value);
    }
    map
}

fn raw(name: &BTreeSet<&'static str>, locality: &BTreeSet<&'static str>) -> RawLocation {
    RawLocation {
        name: language_map(Some("Le Marais"), name, "name"),
        locality: language_map(None, locality, "locality"),
        country: language_map(Some("France"), &BTreeSet::new(), "country"),
        coordinates: GeoPoint::new(48.8566, 2.3522),
        location_type: LocationType::AdminArea
    }
}

fn apply(
    store: &mut HashMap<LocationId, CanonicalLocation>,
    record: CanonicalLocation,
    provider: &Provider
) -> usize {
    let existing = store
        .get(&record.id)
        .cloned()
        .map(|r| (r.id, r))
        .into_iter()
        .collect();
    let changes = Reconciler::new(provider.clone())
        .reconcile(vec![record], existing)
        .unwrap();
    let written = changes.to_insert.len() + changes.to_update.len();
    for location in changes.to_insert.into_iter().chain(changes.to_update) {
        store.insert(location.id, location);
    }
    written
}

proptest! {
    #[test]
    fn test_identity_ignores_case_and_extra_languages(
        name in "[a-zA-Z ]{1,16}",
        extra in languages(),
        latitude in -90.0f64..90.0,
        longitude in -180.0f64..180.0
    ) {
        let normalizer = Normalizer::default();
        let base = RawLocation {
            name: [("en", name.clone())].into_iter().collect(),
            locality: LanguageMap::new(),
            country: [("en", "France")].into_iter().collect(),
            coordinates: GeoPoint::new(latitude, longitude),
            location_type: LocationType::Landmark
        };
        let mut variant = base.clone();
        variant.name = language_map(Some(name.to_lowercase().as_str()), &extra, "other");

        let a = normalizer.normalize(base, &Provider::new("a")).unwrap();
        let b = normalizer.normalize(variant, &Provider::new("b")).unwrap();
        prop_assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_merge_is_idempotent(
        stored_name in languages(),
        incoming_name in languages(),
        incoming_locality in languages()
    ) {
        let normalizer = Normalizer::default();
        let provider = Provider::new("netstorming");
        let mut store = HashMap::new();

        let stored = normalizer.normalize(raw(&stored_name, &BTreeSet::new()), &provider).unwrap();
        apply(&mut store, stored, &provider);

        let incoming = normalizer
            .normalize(raw(&incoming_name, &incoming_locality), &provider)
            .unwrap();
        apply(&mut store, incoming.clone(), &provider);
        let once = store.clone();

        let written = apply(&mut store, incoming, &provider);
        prop_assert_eq!(written, 0);
        prop_assert_eq!(store, once);
    }

    #[test]
    fn test_merge_is_commutative(
        first_name in languages(),
        first_locality in languages(),
        second_name in languages(),
        second_locality in languages()
    ) {
        let normalizer = Normalizer::default();
        let a = Provider::new("netstorming");
        let b = Provider::new("illusions");
        let r1 = normalizer.normalize(raw(&first_name, &first_locality), &a).unwrap();
        let r2 = normalizer.normalize(raw(&second_name, &second_locality), &b).unwrap();

        let mut forward = HashMap::new();
        apply(&mut forward, r1.clone(), &a);
        apply(&mut forward, r2.clone(), &b);

        let mut backward = HashMap::new();
        apply(&mut backward, r2, &b);
        apply(&mut backward, r1, &a);

        prop_assert_eq!(forward, backward);
    }
}
