use starlight_resolver::{IntentHint, ResolutionSource, SelectorHistory, SemanticResolver};
use tempfile::tempdir;

const PAGE: &str = "https://shop.test/login?next=/cart";

#[test]
fn repeated_resolution_is_identical_and_computed_once() {
    let mut resolver = SemanticResolver::new(SelectorHistory::in_memory());

    let first = resolver.resolve("Login", PAGE, IntentHint::Click).unwrap();
    let second = resolver.resolve("Login", PAGE, IntentHint::Click).unwrap();

    assert_eq!(first.source, ResolutionSource::Heuristic);
    assert_eq!(second.source, ResolutionSource::Cache);
    assert_eq!(first.tiers, second.tiers);
    assert_eq!(resolver.heuristic_computations(), 1);
    assert_eq!(resolver.stats().cache_hits, 1);
}

#[test]
fn hints_are_cached_separately() {
    let mut resolver = SemanticResolver::new(SelectorHistory::in_memory());
    let click = resolver.resolve("Search", PAGE, IntentHint::Click).unwrap();
    let fill = resolver.resolve("Search", PAGE, IntentHint::Fill).unwrap();
    assert_ne!(click.tiers, fill.tiers);
    assert_eq!(resolver.heuristic_computations(), 2);
}

#[test]
fn exact_attribute_candidates_precede_fuzzy_ones() {
    let mut resolver = SemanticResolver::new(SelectorHistory::in_memory());
    let res = resolver.resolve("Login", PAGE, IntentHint::Click).unwrap();
    let ordered: Vec<&str> = res.candidates().collect();

    let exact = ordered.iter().position(|s| *s == "#login").unwrap();
    let fuzzy = ordered
        .iter()
        .position(|s| *s == "[class*=\"login\" i]")
        .unwrap();
    assert!(exact < fuzzy);
    assert!(res.tiers[0].iter().any(|s| s == "#login"));
}

#[test]
fn learned_selector_survives_a_fresh_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("selector-history.json");

    {
        let mut resolver = SemanticResolver::new(SelectorHistory::load(&path));
        resolver.resolve("Checkout", PAGE, IntentHint::Click).unwrap();
        resolver
            .learn("Checkout", "button.checkout-primary", PAGE)
            .unwrap();
        let cached = resolver.resolve("Checkout", PAGE, IntentHint::Click).unwrap();
        assert_eq!(cached.primary(), Some("button.checkout-primary"));
    }

    let reloaded = SelectorHistory::load(&path);
    assert_eq!(
        reloaded.lookup("checkout", "https://shop.test/login"),
        Some("button.checkout-primary")
    );
    assert_eq!(
        reloaded.lookup("Checkout", "https://elsewhere.test/"),
        Some("button.checkout-primary")
    );

    let mut resolver = SemanticResolver::new(reloaded);
    let res = resolver.resolve("Checkout", PAGE, IntentHint::Click).unwrap();
    assert_eq!(res.source, ResolutionSource::History);
    assert_eq!(res.primary(), Some("button.checkout-primary"));
    assert_eq!(resolver.stats().history_hits, 1);
}
