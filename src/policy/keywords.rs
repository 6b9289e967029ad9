//! Keyword detection for content alerts.
//!
//! Four match kinds: exact (word boundary), contains (substring), regex
//! (user pattern), and fuzzy (leetspeak substitution classes, no word
//! boundaries). Exclusion terms suppress a match outright; context terms
//! found near the match raise its severity one level.

use crate::types::Severity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Characters of surrounding context captured around a match.
pub const CONTEXT_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum KeywordError {
    #[error("invalid pattern for keyword {id}: {source}")]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },
}

/// How a keyword is matched against text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Contains,
    Regex,
    Fuzzy,
}

/// A keyword to monitor for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyword {
    pub id: String,
    pub word: String,
    #[serde(default = "default_kind")]
    pub match_kind: MatchKind,
    /// Alert category id ("self_harm", "bullying", …).
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Terms that elevate severity when found near the match.
    #[serde(default)]
    pub context_words: Vec<String>,
    /// Terms whose presence anywhere in the text suppresses the match.
    #[serde(default)]
    pub exclude_words: Vec<String>,
    #[serde(default)]
    pub description: String,

    #[serde(skip)]
    compiled: Option<Regex>,
}

fn default_kind() -> MatchKind {
    MatchKind::Contains
}

fn default_category() -> String {
    "custom".to_string()
}

fn default_severity() -> Severity {
    Severity::Medium
}

fn default_true() -> bool {
    true
}

/// Leetspeak substitution classes used by the fuzzy matcher.
fn fuzzy_class(c: char) -> Option<&'static str> {
    match c {
        'a' => Some("[a@4]"),
        'e' => Some("[e3]"),
        'i' => Some("[i1!]"),
        'o' => Some("[o0]"),
        's' => Some("[s$5]"),
        't' => Some("[t7+]"),
        'l' => Some("[l1]"),
        'b' => Some("[b8]"),
        _ => None,
    }
}

/// Build the fuzzy pattern for a word: each letter becomes its substitution
/// class, everything else is escaped literally. No word boundaries.
pub fn fuzzy_pattern(word: &str) -> String {
    let mut pattern = String::new();
    for c in word.to_ascii_lowercase().chars() {
        match fuzzy_class(c) {
            Some(class) => pattern.push_str(class),
            None => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern
}

impl Keyword {
    pub fn new(id: &str, word: &str, match_kind: MatchKind) -> Self {
        Self {
            id: id.to_string(),
            word: word.to_string(),
            match_kind,
            category: default_category(),
            severity: default_severity(),
            enabled: true,
            case_sensitive: false,
            context_words: Vec::new(),
            exclude_words: Vec::new(),
            description: String::new(),
            compiled: None,
        }
    }

    /// Compile the match pattern. A keyword whose pattern fails to compile
    /// is disabled by the caller and reported.
    pub fn compile(&mut self) -> Result<(), KeywordError> {
        let flag = if self.case_sensitive { "" } else { "(?i)" };
        let pattern = match self.match_kind {
            MatchKind::Exact => format!(r"{flag}\b{}\b", regex::escape(&self.word)),
            MatchKind::Regex => format!("{flag}{}", self.word),
            MatchKind::Fuzzy => format!("{flag}{}", fuzzy_pattern(&self.word)),
            // Contains is a plain substring check, nothing to compile.
            MatchKind::Contains => return Ok(()),
        };
        self.compiled = Some(Regex::new(&pattern).map_err(|source| {
            KeywordError::InvalidPattern {
                id: self.id.clone(),
                source,
            }
        })?);
        Ok(())
    }

    /// Match this keyword in `text`, honoring exclusions. Returns the
    /// matched text.
    pub fn matches(&self, text: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let text_lower = text.to_ascii_lowercase();
        if self
            .exclude_words
            .iter()
            .any(|e| text_lower.contains(&e.to_ascii_lowercase()))
        {
            return None;
        }

        match self.match_kind {
            MatchKind::Contains => {
                let (hay, needle) = if self.case_sensitive {
                    (text.to_string(), self.word.clone())
                } else {
                    (text_lower, self.word.to_ascii_lowercase())
                };
                hay.contains(&needle).then(|| self.word.clone())
            }
            _ => self
                .compiled
                .as_ref()
                .and_then(|re| re.find(text))
                .map(|m| m.as_str().to_string()),
        }
    }

    /// Base severity, elevated one level if a context word appears in the
    /// surrounding context.
    pub fn severity_with_context(&self, context: &str) -> Severity {
        if self.context_words.is_empty() {
            return self.severity;
        }
        let lower = context.to_ascii_lowercase();
        if self
            .context_words
            .iter()
            .any(|w| lower.contains(&w.to_ascii_lowercase()))
        {
            self.severity.elevated()
        } else {
            self.severity
        }
    }
}

/// A keyword match with its surrounding context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordMatch {
    pub keyword_id: String,
    pub word: String,
    pub category: String,
    pub matched_text: String,
    /// At most ±[`CONTEXT_CHARS`] characters around the match.
    pub context: String,
    /// Where the text came from: "url" or "body".
    pub location: String,
    pub severity: Severity,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeywordFile {
    keywords: Vec<Keyword>,
}

/// The set of monitored keywords.
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    keywords: BTreeMap<String, Keyword>,
}

/// Alert categories with predefined keyword sets.
pub const PREDEFINED_KEYWORD_CATEGORIES: &[&str] =
    &["self_harm", "bullying", "predator", "drugs", "personal_info"];

impl KeywordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Self {
        let mut set = Self::new();
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(_) => return set,
        };
        match serde_json::from_str::<KeywordFile>(&data) {
            Ok(file) => {
                for kw in file.keywords {
                    set.add(kw);
                }
            }
            Err(e) => warn!("failed to load keywords from {:?}: {}", path, e),
        }
        set
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = KeywordFile {
            keywords: self.keywords.values().cloned().collect(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)
    }

    /// Insert a keyword, compiling its pattern. An uncompilable keyword is
    /// stored disabled so it round-trips but never matches.
    pub fn add(&mut self, mut keyword: Keyword) {
        if let Err(e) = keyword.compile() {
            warn!("{e}; keyword disabled");
            keyword.enabled = false;
        }
        self.keywords.insert(keyword.id.clone(), keyword);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.keywords.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Keyword> {
        self.keywords.get(id)
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keyword> {
        self.keywords.values()
    }

    /// Load one predefined category; returns how many keywords were added.
    pub fn load_predefined(&mut self, category: &str) -> usize {
        let mut count = 0;
        for kw in predefined(category) {
            if !self.keywords.contains_key(&kw.id) {
                self.add(kw);
                count += 1;
            }
        }
        count
    }

    pub fn load_all_predefined(&mut self) -> usize {
        PREDEFINED_KEYWORD_CATEGORIES
            .iter()
            .map(|c| self.load_predefined(c))
            .sum()
    }

    /// Match all keywords against `text`.
    pub fn match_text(&self, text: &str, location: &str) -> Vec<KeywordMatch> {
        let mut matches = Vec::new();
        for kw in self.keywords.values() {
            if let Some(matched) = kw.matches(text) {
                let context = extract_context(text, &matched, CONTEXT_CHARS);
                let severity = kw.severity_with_context(&context);
                matches.push(KeywordMatch {
                    keyword_id: kw.id.clone(),
                    word: kw.word.clone(),
                    category: kw.category.clone(),
                    matched_text: matched,
                    context,
                    location: location.to_string(),
                    severity,
                });
            }
        }
        matches
    }
}

/// Extract up to ±`chars` characters of context around the first
/// (case-insensitive) occurrence of `matched`.
fn extract_context(text: &str, matched: &str, chars: usize) -> String {
    let hay = text.to_ascii_lowercase();
    let needle = matched.to_ascii_lowercase();
    let Some(idx) = hay.find(&needle) else {
        return String::new();
    };

    let mut start = idx.saturating_sub(chars);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (idx + matched.len() + chars).min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }

    let mut context = text[start..end].to_string();
    if start > 0 {
        context = format!("...{context}");
    }
    if end < text.len() {
        context = format!("{context}...");
    }
    context
}

/// Predefined keywords for one alert category.
pub fn predefined(category: &str) -> Vec<Keyword> {
    let kw = |id: &str, word: &str, kind: MatchKind, severity: Severity| {
        let mut k = Keyword::new(id, word, kind);
        k.category = category.to_string();
        k.severity = severity;
        k
    };

    match category {
        "self_harm" => vec![
            {
                let mut k = kw("sh_suicide", "suicide", MatchKind::Contains, Severity::Critical);
                k.context_words = vec![
                    "method".to_string(),
                    "how to".to_string(),
                    "want to".to_string(),
                    "thinking about".to_string(),
                ];
                k.exclude_words = vec![
                    "prevention".to_string(),
                    "hotline".to_string(),
                    "awareness".to_string(),
                ];
                k
            },
            kw("sh_cutting", "cutting myself", MatchKind::Fuzzy, Severity::Critical),
            kw("sh_end_life", "end my life", MatchKind::Fuzzy, Severity::Critical),
            kw("sh_kill_myself", "kill myself", MatchKind::Fuzzy, Severity::Critical),
            kw("sh_self_harm", "self harm", MatchKind::Fuzzy, Severity::High),
        ],
        "bullying" => vec![
            {
                let mut k = kw("bully_kys", "kys", MatchKind::Exact, Severity::High);
                k.description = "Kill yourself (acronym)".to_string();
                k
            },
            kw("bully_kill_yourself", "kill yourself", MatchKind::Fuzzy, Severity::Critical),
            kw(
                "bully_hate_you",
                "everyone hates you",
                MatchKind::Contains,
                Severity::High,
            ),
            kw("bully_die", "go die", MatchKind::Fuzzy, Severity::High),
        ],
        "predator" => vec![
            {
                let mut k = kw(
                    "pred_age",
                    "how old are you",
                    MatchKind::Contains,
                    Severity::Medium,
                );
                k.context_words = vec![
                    "pic".to_string(),
                    "photo".to_string(),
                    "meet".to_string(),
                    "address".to_string(),
                    "alone".to_string(),
                ];
                k
            },
            {
                let mut k = kw("pred_meet", "let's meet", MatchKind::Contains, Severity::High);
                k.context_words = vec![
                    "alone".to_string(),
                    "secret".to_string(),
                    "don't tell".to_string(),
                ];
                k
            },
            {
                let mut k = kw("pred_secret", "our secret", MatchKind::Contains, Severity::High);
                k.context_words = vec![
                    "parents".to_string(),
                    "mom".to_string(),
                    "dad".to_string(),
                    "don't tell".to_string(),
                ];
                k
            },
            {
                let mut k = kw(
                    "pred_send_pic",
                    r"send (me )?(a )?pic(ture)?",
                    MatchKind::Regex,
                    Severity::High,
                );
                k.context_words = vec![
                    "body".to_string(),
                    "private".to_string(),
                    "naked".to_string(),
                ];
                k
            },
        ],
        "drugs" => vec![
            kw("drug_buy", "buy weed", MatchKind::Contains, Severity::High),
            kw("drug_dealer", "drug dealer", MatchKind::Fuzzy, Severity::High),
            {
                let mut k = kw("drug_molly", "molly", MatchKind::Exact, Severity::High);
                k.context_words = vec![
                    "roll".to_string(),
                    "party".to_string(),
                    "pills".to_string(),
                    "high".to_string(),
                ];
                k
            },
            {
                let mut k = kw("drug_xanax", "xanax", MatchKind::Fuzzy, Severity::High);
                k.context_words = vec![
                    "bars".to_string(),
                    "buy".to_string(),
                    "get some".to_string(),
                ];
                k
            },
        ],
        "personal_info" => vec![
            {
                let mut k = kw(
                    "pii_address",
                    r"\d+\s+\w+\s+(street|st|avenue|ave|road|rd|drive|dr|lane|ln)",
                    MatchKind::Regex,
                    Severity::High,
                );
                k.description = "Street address pattern".to_string();
                k
            },
            {
                let mut k = kw(
                    "pii_phone",
                    r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b",
                    MatchKind::Regex,
                    Severity::Medium,
                );
                k.description = "Phone number".to_string();
                k
            },
            {
                let mut k = kw(
                    "pii_ssn",
                    r"\b\d{3}-\d{2}-\d{4}\b",
                    MatchKind::Regex,
                    Severity::Critical,
                );
                k.description = "Social Security Number".to_string();
                k
            },
        ],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(mut kw: Keyword) -> Keyword {
        kw.compile().unwrap();
        kw
    }

    #[test]
    fn test_exact_word_boundary() {
        let kw = compiled(Keyword::new("k", "kys", MatchKind::Exact));
        assert!(kw.matches("just kys already").is_some());
        assert!(kw.matches("tokyswap").is_none());
    }

    #[test]
    fn test_contains_case_insensitive() {
        let kw = Keyword::new("k", "Casino", MatchKind::Contains);
        assert_eq!(kw.matches("best CASINO deals").as_deref(), Some("Casino"));
    }

    #[test]
    fn test_fuzzy_leetspeak() {
        let kw = compiled(Keyword::new("k", "kill yourself", MatchKind::Fuzzy));
        assert!(kw.matches("k1ll y0ur$elf").is_some());
        assert!(kw.matches("kill yourself").is_some());
        assert!(kw.matches("completely unrelated").is_none());
    }

    #[test]
    fn test_fuzzy_exclusion_guard() {
        let mut kw = Keyword::new("k", "kill yourself", MatchKind::Fuzzy);
        kw.exclude_words = vec!["skillful".to_string()];
        kw.compile().unwrap();
        assert!(kw.matches("skillful yourselfness").is_none());
        assert!(kw.matches("k1ll y0ur$elf").is_some());
    }

    #[test]
    fn test_exclusion_suppresses_match() {
        let set = {
            let mut s = KeywordSet::new();
            s.load_predefined("self_harm");
            s
        };
        let hits = set.match_text("searching suicide hotline", "body");
        assert!(hits.iter().all(|m| m.keyword_id != "sh_suicide"));

        let hits = set.match_text("how to commit suicide", "body");
        let hit = hits.iter().find(|m| m.keyword_id == "sh_suicide").unwrap();
        // Already critical; context cannot elevate past the maximum.
        assert_eq!(hit.severity, Severity::Critical);
    }

    #[test]
    fn test_context_elevates_severity() {
        let mut kw = Keyword::new("k", "molly", MatchKind::Exact);
        kw.severity = Severity::High;
        kw.context_words = vec!["party".to_string()];
        kw.compile().unwrap();

        assert_eq!(kw.severity_with_context("my friend molly called"), Severity::High);
        assert_eq!(
            kw.severity_with_context("bring molly to the party"),
            Severity::Critical
        );
    }

    #[test]
    fn test_invalid_regex_is_disabled() {
        let mut set = KeywordSet::new();
        set.add(Keyword::new("bad", r"([unclosed", MatchKind::Regex));
        let kw = set.get("bad").unwrap();
        assert!(!kw.enabled);
        assert!(set.match_text("([unclosed", "url").is_empty());
    }

    #[test]
    fn test_context_window_is_bounded() {
        let set = {
            let mut s = KeywordSet::new();
            s.add(Keyword::new("k", "needle", MatchKind::Contains));
            s
        };
        let text = format!("{}needle{}", "a".repeat(500), "b".repeat(500));
        let hits = set.match_text(&text, "body");
        assert_eq!(hits.len(), 1);
        // ±50 chars plus the match and ellipses.
        assert!(hits[0].context.len() <= 2 * CONTEXT_CHARS + "needle".len() + 6);
        assert!(hits[0].context.starts_with("..."));
        assert!(hits[0].context.ends_with("..."));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut kw = Keyword::new("id1", "suicide", MatchKind::Fuzzy);
        kw.context_words = vec!["how to".to_string()];
        kw.exclude_words = vec!["prevention".to_string()];
        let json = serde_json::to_string(&kw).unwrap();
        let back: Keyword = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, kw.id);
        assert_eq!(back.word, kw.word);
        assert_eq!(back.match_kind, kw.match_kind);
        assert_eq!(back.context_words, kw.context_words);
        assert_eq!(back.exclude_words, kw.exclude_words);
    }

    #[test]
    fn test_predefined_sets_load_once() {
        let mut set = KeywordSet::new();
        let n = set.load_all_predefined();
        assert!(n >= 15);
        // Loading again adds nothing.
        assert_eq!(set.load_all_predefined(), 0);
    }
}
