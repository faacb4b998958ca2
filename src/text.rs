//! Text normalization and tolerant timestamp parsing.

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

static TOPIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#[^#]*#").expect("static regex is valid"));
static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\S+").expect("static regex is valid"));
static WHITESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("static regex is valid"));

/// Produces the curated message text of a post.
///
/// Removes `#topic#` spans (markers included), then `@mention` tokens, then
/// collapses whitespace runs to a single space and trims both ends. The result
/// is a fixed point: normalizing it again returns it unchanged.
pub fn normalize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let without_topics = TOPIC_RE.replace_all(text, "");
    let without_mentions = MENTION_RE.replace_all(&without_topics, "");
    WHITESPACE_RE
        .replace_all(&without_mentions, " ")
        .trim()
        .to_string()
}

/// Parses a `created_at` value as `YYYY-MM-DD HH:MM`, falling back to `YYYY-MM-DD`.
pub fn try_parse_created_at(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M") {
        return Some(dt);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// The sentinel used for timestamps that cannot be parsed (1970-01-01 00:00).
pub fn epoch_sentinel() -> NaiveDateTime {
    NaiveDateTime::default()
}

/// Like [`try_parse_created_at`], degrading to [`epoch_sentinel`] with a warning.
pub fn parse_created_at(s: &str) -> NaiveDateTime {
    try_parse_created_at(s).unwrap_or_else(|| {
        warn!("Unparsable created_at {:?}, treating it as the epoch.", s);
        epoch_sentinel()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_topics_mentions_and_whitespace() {
        assert_eq!(normalize("#生日快乐# @某人 祝福内容"), "祝福内容");
        assert_eq!(
            normalize("  云云\n\n生日快乐 #黄霄云1222生日快乐#  一直在 "),
            "云云 生日快乐 一直在"
        );
        assert_eq!(normalize("@a @b"), "");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn unpaired_marker_is_kept() {
        assert_eq!(normalize("#a# b #c"), "b #c");
    }

    #[test]
    fn parses_both_formats() {
        let minute = try_parse_created_at("2025-12-17 22:55").unwrap();
        assert_eq!(minute.to_string(), "2025-12-17 22:55:00");
        let day = try_parse_created_at("2025-12-17").unwrap();
        assert_eq!(day.to_string(), "2025-12-17 00:00:00");
        assert!(minute > day);
    }

    #[test]
    fn unparsable_degrades_to_epoch() {
        assert_eq!(try_parse_created_at("昨天 10:00"), None);
        assert_eq!(parse_created_at("昨天 10:00"), epoch_sentinel());
        assert_eq!(epoch_sentinel().to_string(), "1970-01-01 00:00:00");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(text in "[#@ a-z\\n\\t云日]{0,40}") {
            let once = normalize(&text);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn normalize_is_idempotent_on_any_string(text in ".{0,60}") {
            let once = normalize(&text);
            prop_assert_eq!(normalize(&once), once);
        }
    }
}
