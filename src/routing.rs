// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Binding key matching for topic exchanges.
//!
//! Routing keys and binding keys are dot-delimited words. In a binding key `*`
//! stands for exactly one word and `#` for zero or more words.

pub const SINGLE_WORD_WILDCARD: &str = "*";
pub const MULTI_WORD_WILDCARD: &str = "#";

/// Returns true when `routing_key` matches the topic `binding_key`.
pub fn topic_matches(binding_key: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = binding_key.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();

    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    let Some((&head, rest)) = pattern.split_first() else {
        return words.is_empty();
    };

    if head == MULTI_WORD_WILDCARD {
        // consecutive `#` behave as one
        if rest.first() == Some(&MULTI_WORD_WILDCARD) {
            return match_words(rest, words);
        }
        return (0..=words.len()).any(|skip| match_words(rest, &words[skip..]));
    }

    match words.split_first() {
        Some((&word, remaining)) => {
            (head == SINGLE_WORD_WILDCARD || head == word) && match_words(rest, remaining)
        }
        None => false,
    }
}

/// Returns true when the binding key uses topic wildcards.
pub fn has_wildcards(binding_key: &str) -> bool {
    binding_key
        .split('.')
        .any(|word| word == SINGLE_WORD_WILDCARD || word == MULTI_WORD_WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_keys_match_only_themselves() {
        assert!(topic_matches("user.error", "user.error"));
        assert!(!topic_matches("user.error", "user.info"));
        assert!(!topic_matches("user.error", "user.error.extra"));
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(topic_matches("user.*", "user.info"));
        assert!(topic_matches("user.*", "user.error"));
        assert!(!topic_matches("order.*", "order.info.extra"));
        assert!(!topic_matches("order.*", "order"));
        assert!(!topic_matches("order.*", "user.info"));
        assert!(topic_matches("*.error", "order.error"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("order.#", "order.info"));
        assert!(topic_matches("order.#", "order.info.extra"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.error", "user.error"));
        assert!(topic_matches("#.error", "error"));
        assert!(!topic_matches("#.error", "user.info"));
        assert!(topic_matches("user.#.error", "user.error"));
        assert!(topic_matches("user.#.#.error", "user.a.b.error"));
    }

    #[test]
    fn detects_wildcards() {
        assert!(has_wildcards("user.*"));
        assert!(has_wildcards("#"));
        assert!(!has_wildcards("user.error"));
        assert!(!has_wildcards("user.*x"));
    }
}
