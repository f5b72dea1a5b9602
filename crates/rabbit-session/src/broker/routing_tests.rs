//! Truth table for binding pattern matching.

use super::*;

#[test]
fn test_topic_truth_table() {
    let cases = [
        ("trips.*", "trips.create", true),
        ("trips.*", "trips.delete", true),
        ("trips.*", "trips", false),
        ("trips.*", "trips.create.now", false),
        ("*.delete", "trips.delete", true),
        ("*.delete", "users.delete", true),
        ("*.delete", "trips.create", false),
        ("#", "trips.create", true),
        ("#", "a", true),
        ("trips.#", "trips", true),
        ("trips.#", "trips.a.b.c", true),
        ("#.delete", "a.b.delete", true),
        ("#.delete", "delete", true),
        ("a.#.z", "a.z", true),
        ("a.#.z", "a.b.c.z", true),
        ("a.#.z", "a.b.c", false),
        ("trips.create", "trips.create", true),
        ("trips.create", "trips.delete", false),
        ("*", "single", true),
        ("*", "two.words", false),
    ];

    for (pattern, key, expected) in cases {
        assert_eq!(
            topic_matches(pattern, key),
            expected,
            "pattern '{}' against '{}'",
            pattern,
            key
        );
    }
}

#[test]
fn test_direct_requires_exact_key() {
    assert!(binding_matches(&ExchangeKind::Direct, "info", "info"));
    assert!(!binding_matches(&ExchangeKind::Direct, "info", "error"));
    assert!(binding_matches(&ExchangeKind::Direct, "", ""));
    assert!(!binding_matches(&ExchangeKind::Direct, "", "info"));
}

#[test]
fn test_fanout_ignores_keys() {
    assert!(binding_matches(&ExchangeKind::Fanout, "", "anything"));
    assert!(binding_matches(&ExchangeKind::Fanout, "info", "error"));
}
