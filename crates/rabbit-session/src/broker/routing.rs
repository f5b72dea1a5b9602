//! Routing key matching for exchange bindings.

use crate::options::ExchangeKind;

/// Check whether a binding pattern on an exchange of the given kind routes a key.
///
/// Headers exchanges route on message headers rather than keys; bindings here
/// carry no header arguments, which under `x-match=all` matches every message.
pub fn binding_matches(kind: &ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Direct => direct_matches(pattern, routing_key),
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
        ExchangeKind::Custom(_) => false,
    }
}

/// Direct bindings route only the exact key, including the empty key.
pub fn direct_matches(binding_key: &str, routing_key: &str) -> bool {
    binding_key == routing_key
}

/// Match a routing key against a topic pattern.
///
/// Both are split into dot-separated words. `*` matches exactly one word and
/// `#` matches zero or more words.
///
/// ```rust
/// use rabbit_session::broker::routing::topic_matches;
///
/// assert!(topic_matches("trips.*", "trips.create"));
/// assert!(!topic_matches("trips.*", "trips.create.now"));
/// assert!(topic_matches("#", "anything.at.all"));
/// ```
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first() == Some(literal) && match_words(rest, &words[1..])
        }
    }
}

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;
