//! Policy: the single source of truth for "should this be blocked?".
//!
//! Combines direct domain blocks, whitelists, URL regex patterns, built-in
//! categories, time-based schedules, and keyword matchers. Reads are the hot
//! path (one `check` per DNS query and per HTTP request); updates are
//! serialized behind the engine's lock and persisted to JSON documents.

pub mod categories;
pub mod engine;
pub mod keywords;
pub mod schedules;

pub use categories::{
    check_domain_category, check_url_keywords, get_category, BlockCategory, CategoryDefinition,
};
pub use engine::{BlockDecision, BlockRule, PolicyEngine, PolicyError, SharedPolicy};
pub use keywords::{Keyword, KeywordMatch, KeywordSet, MatchKind, PREDEFINED_KEYWORD_CATEGORIES};
pub use schedules::{Schedule, ScheduleKind, ScheduleSet, TimeRange};

/// Domain blocklist matching: equal (case-insensitive), a strict subdomain
/// of the entry, or a wildcard entry `*.suffix` whose suffix matches.
pub fn domain_matches(domain: &str, entry: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let entry = entry.trim_end_matches('.').to_ascii_lowercase();
    if let Some(suffix) = entry.strip_prefix("*.") {
        return domain == suffix || domain.ends_with(&format!(".{suffix}"));
    }
    domain == entry || domain.ends_with(&format!(".{entry}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_matches_exact_and_subdomain() {
        assert!(domain_matches("ads.example", "ads.example"));
        assert!(domain_matches("ADS.EXAMPLE", "ads.example"));
        assert!(domain_matches("cdn.ads.example", "ads.example"));
        assert!(!domain_matches("badads.example", "ads.example"));
        assert!(!domain_matches("example", "ads.example"));
    }

    #[test]
    fn test_domain_matches_wildcard() {
        assert!(domain_matches("x.tracker.net", "*.tracker.net"));
        assert!(domain_matches("tracker.net", "*.tracker.net"));
        assert!(!domain_matches("nottracker.net", "*.tracker.net"));
    }

    #[test]
    fn test_trailing_dot_is_ignored() {
        assert!(domain_matches("ads.example.", "ads.example"));
    }
}
