//! Unified blocking engine.
//!
//! Evaluation order for `check` (first match wins, whitelist short-circuits):
//! whitelist, blocklist domains, URL regex patterns, enabled categories,
//! time schedules, category URL keywords, generic blocked keywords, custom
//! rules, default allow. Disabling any rule never turns an allow into a
//! block.

use super::categories::{self, BlockCategory};
use super::keywords::KeywordSet;
use super::schedules::ScheduleSet;
use crate::types::{now_local, now_rfc3339};
use chrono::{DateTime, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown category: {0}")]
    UnknownCategory(String),
    #[error("invalid url pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A custom user rule. Only domain-equality rules are evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRule {
    pub id: String,
    pub rule_type: String,
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Result of one blocking decision, attached to the DNS/HTTP record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDecision {
    pub should_block: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    pub timestamp: String,
}

impl BlockDecision {
    fn allow(reason: &str) -> Self {
        Self {
            should_block: false,
            reason: reason.to_string(),
            rule_id: None,
            rule_type: None,
            category: None,
            schedule_id: None,
            timestamp: now_rfc3339(),
        }
    }

    fn block(reason: String, rule_type: &str) -> Self {
        Self {
            should_block: true,
            reason,
            rule_id: None,
            rule_type: Some(rule_type.to_string()),
            category: None,
            schedule_id: None,
            timestamp: now_rfc3339(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BlocklistFile {
    #[serde(default)]
    blocked_domains: BTreeSet<String>,
    #[serde(default)]
    whitelisted_domains: BTreeSet<String>,
    #[serde(default)]
    blocked_categories: BTreeSet<BlockCategory>,
    #[serde(default)]
    blocked_keywords: Vec<String>,
    #[serde(default)]
    url_patterns: Vec<String>,
    #[serde(default)]
    custom_rules: Vec<BlockRule>,
}

/// The policy engine. Wrap in [`SharedPolicy`] for concurrent access.
#[derive(Debug)]
pub struct PolicyEngine {
    blocked_domains: BTreeSet<String>,
    whitelisted_domains: BTreeSet<String>,
    blocked_categories: BTreeSet<BlockCategory>,
    blocked_keywords: Vec<String>,
    url_patterns: Vec<(String, Regex)>,
    custom_rules: BTreeMap<String, BlockRule>,
    pub schedules: ScheduleSet,
    pub keywords: KeywordSet,
    policy_dir: Option<PathBuf>,
}

/// Readers-writer handle; `check` is the hot path.
pub type SharedPolicy = Arc<RwLock<PolicyEngine>>;

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            blocked_domains: BTreeSet::new(),
            whitelisted_domains: BTreeSet::new(),
            blocked_categories: BTreeSet::new(),
            blocked_keywords: Vec::new(),
            url_patterns: Vec::new(),
            custom_rules: BTreeMap::new(),
            schedules: ScheduleSet::new(),
            keywords: KeywordSet::new(),
            policy_dir: None,
        }
    }

    /// Load policy from `<dir>/blocklist.json`, `<dir>/schedules.json`, and
    /// `<dir>/keywords.json`. Missing files start empty; malformed entries
    /// are skipped and reported.
    pub fn load(dir: &Path) -> Self {
        let mut engine = Self::new();
        engine.policy_dir = Some(dir.to_path_buf());
        engine.schedules = ScheduleSet::load(&dir.join("schedules.json"));
        engine.keywords = KeywordSet::load(&dir.join("keywords.json"));

        let path = dir.join("blocklist.json");
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(_) => return engine,
        };
        let file: BlocklistFile = match serde_json::from_str(&data) {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to load blocklist from {:?}: {}", path, e);
                return engine;
            }
        };

        engine.blocked_domains = file.blocked_domains;
        engine.whitelisted_domains = file.whitelisted_domains;
        engine.blocked_categories = file.blocked_categories;
        engine.blocked_keywords = file.blocked_keywords;
        for pattern in file.url_patterns {
            match Regex::new(&format!("(?i){pattern}")) {
                Ok(re) => engine.url_patterns.push((pattern, re)),
                Err(e) => warn!("skipping invalid url pattern {:?}: {}", pattern, e),
            }
        }
        for rule in file.custom_rules {
            engine.custom_rules.insert(rule.id.clone(), rule);
        }
        info!(
            "policy loaded: {} domains, {} categories, {} keywords, {} patterns, {} schedules",
            engine.blocked_domains.len(),
            engine.blocked_categories.len(),
            engine.blocked_keywords.len(),
            engine.url_patterns.len(),
            engine.schedules.len(),
        );
        engine
    }

    /// Persist policy to the directory it was loaded from. A no-op for
    /// in-memory engines (tests).
    pub fn save(&self) -> Result<(), PolicyError> {
        let Some(dir) = &self.policy_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let file = BlocklistFile {
            blocked_domains: self.blocked_domains.clone(),
            whitelisted_domains: self.whitelisted_domains.clone(),
            blocked_categories: self.blocked_categories.clone(),
            blocked_keywords: self.blocked_keywords.clone(),
            url_patterns: self.url_patterns.iter().map(|(p, _)| p.clone()).collect(),
            custom_rules: self.custom_rules.values().cloned().collect(),
        };
        std::fs::write(
            dir.join("blocklist.json"),
            serde_json::to_string_pretty(&file).map_err(std::io::Error::other)?,
        )?;
        self.schedules.save(&dir.join("schedules.json"))?;
        self.keywords.save(&dir.join("keywords.json"))?;
        Ok(())
    }

    /// The blocking decision for a domain/url/content triple, evaluated at
    /// the current local time.
    pub fn check(&self, domain: &str, url: &str, content: &str) -> BlockDecision {
        self.check_at(domain, url, content, now_local())
    }

    /// Same as [`check`](Self::check) with an explicit evaluation time.
    pub fn check_at(
        &self,
        domain: &str,
        url: &str,
        content: &str,
        dt: DateTime<Local>,
    ) -> BlockDecision {
        let domain = domain.trim().to_ascii_lowercase();
        let url = url.trim().to_ascii_lowercase();

        // 1. Whitelist short-circuits everything.
        if self
            .whitelisted_domains
            .iter()
            .any(|w| super::domain_matches(&domain, w))
        {
            return BlockDecision::allow("Domain is whitelisted");
        }

        // 2. Direct domain blocks.
        if self
            .blocked_domains
            .iter()
            .any(|b| super::domain_matches(&domain, b))
        {
            return BlockDecision::block(format!("Domain blocked: {domain}"), "domain");
        }

        // 3. URL regex patterns.
        if let Some((pattern, _)) = self.url_patterns.iter().find(|(_, re)| re.is_match(&url)) {
            return BlockDecision::block(format!("URL pattern matched: {pattern}"), "url_pattern");
        }

        // 4. Built-in category membership.
        let domain_categories = categories::check_domain_category(&domain);
        for category in &domain_categories {
            if self.blocked_categories.contains(category) {
                let mut d = BlockDecision::block(
                    format!("Category blocked: {}", category.as_str()),
                    "category",
                );
                d.category = Some(category.as_str().to_string());
                return d;
            }
        }

        // 5. Time-based schedules: first on the domain's categories, then on
        // the bare domain.
        for category in &domain_categories {
            if let Some(sched) = self.schedules.matching(&domain, Some(category.as_str()), dt) {
                let mut d = BlockDecision::block(
                    format!("Blocked by schedule: {}", sched.id),
                    "schedule",
                );
                d.schedule_id = Some(sched.id.clone());
                d.category = Some(category.as_str().to_string());
                return d;
            }
        }
        if !domain.is_empty() {
            if let Some(sched) = self.schedules.matching(&domain, None, dt) {
                let mut d = BlockDecision::block(
                    format!("Blocked by schedule: {}", sched.id),
                    "schedule",
                );
                d.schedule_id = Some(sched.id.clone());
                return d;
            }
        }

        // 6. Category content keywords in the URL, where that category is
        // blocked.
        for category in categories::check_url_keywords(&url, content) {
            if self.blocked_categories.contains(&category) {
                let mut d = BlockDecision::block(
                    format!("Keyword matched in {}", category.as_str()),
                    "keyword",
                );
                d.category = Some(category.as_str().to_string());
                return d;
            }
        }

        // 7. Generic blocked keywords over URL + content.
        let combined = format!("{url} {}", content.to_ascii_lowercase());
        if let Some(kw) = self
            .blocked_keywords
            .iter()
            .find(|k| combined.contains(&k.to_ascii_lowercase()))
        {
            return BlockDecision::block(format!("Keyword blocked: {kw}"), "keyword");
        }

        // 8. Custom rules (domain equality only).
        for rule in self.custom_rules.values() {
            if rule.enabled && rule.rule_type == "domain" && domain == rule.value.to_ascii_lowercase()
            {
                let reason = if rule.reason.is_empty() {
                    format!("Custom rule: {}", rule.value)
                } else {
                    rule.reason.clone()
                };
                let mut d = BlockDecision::block(reason, "custom");
                d.rule_id = Some(rule.id.clone());
                return d;
            }
        }

        BlockDecision::allow("Allowed")
    }

    // ---- domain management ----

    pub fn block_domain(&mut self, domain: &str) {
        self.blocked_domains
            .insert(domain.trim().to_ascii_lowercase());
    }

    pub fn unblock_domain(&mut self, domain: &str) {
        self.blocked_domains
            .remove(&domain.trim().to_ascii_lowercase());
    }

    pub fn whitelist_domain(&mut self, domain: &str) {
        self.whitelisted_domains
            .insert(domain.trim().to_ascii_lowercase());
    }

    pub fn remove_whitelist(&mut self, domain: &str) {
        self.whitelisted_domains
            .remove(&domain.trim().to_ascii_lowercase());
    }

    pub fn blocked_domain_count(&self) -> usize {
        self.blocked_domains.len()
    }

    pub fn blocked_domains(&self) -> impl Iterator<Item = &String> {
        self.blocked_domains.iter()
    }

    // ---- category management ----

    pub fn block_category(&mut self, category: &str) -> Result<(), PolicyError> {
        let cat = categories::get_category(category)
            .ok_or_else(|| PolicyError::UnknownCategory(category.to_string()))?;
        self.blocked_categories.insert(cat);
        Ok(())
    }

    pub fn unblock_category(&mut self, category: &str) -> Result<(), PolicyError> {
        let cat = categories::get_category(category)
            .ok_or_else(|| PolicyError::UnknownCategory(category.to_string()))?;
        self.blocked_categories.remove(&cat);
        Ok(())
    }

    pub fn blocked_categories(&self) -> impl Iterator<Item = &BlockCategory> {
        self.blocked_categories.iter()
    }

    // ---- keyword management ----

    pub fn add_blocked_keyword(&mut self, keyword: &str) -> bool {
        let lower = keyword.to_ascii_lowercase();
        if self
            .blocked_keywords
            .iter()
            .any(|k| k.eq_ignore_ascii_case(&lower))
        {
            return false;
        }
        self.blocked_keywords.push(lower);
        true
    }

    pub fn remove_blocked_keyword(&mut self, keyword: &str) -> bool {
        let before = self.blocked_keywords.len();
        self.blocked_keywords
            .retain(|k| !k.eq_ignore_ascii_case(keyword));
        self.blocked_keywords.len() != before
    }

    // ---- url patterns ----

    pub fn add_url_pattern(&mut self, pattern: &str) -> Result<(), PolicyError> {
        let re = Regex::new(&format!("(?i){pattern}"))?;
        self.url_patterns.push((pattern.to_string(), re));
        Ok(())
    }

    pub fn remove_url_pattern(&mut self, pattern: &str) -> bool {
        let before = self.url_patterns.len();
        self.url_patterns.retain(|(p, _)| p != pattern);
        self.url_patterns.len() != before
    }

    // ---- custom rules ----

    pub fn add_rule(&mut self, mut rule: BlockRule) {
        rule.created_at.get_or_insert_with(now_rfc3339);
        self.custom_rules.insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        self.custom_rules.remove(id).is_some()
    }

    pub fn set_rule_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.custom_rules.get_mut(id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Summary counts for `status` events.
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "blocked_domains": self.blocked_domains.len(),
            "whitelisted_domains": self.whitelisted_domains.len(),
            "blocked_categories": self.blocked_categories.iter()
                .map(|c| c.as_str()).collect::<Vec<_>>(),
            "blocked_keywords": self.blocked_keywords.len(),
            "url_patterns": self.url_patterns.len(),
            "custom_rules": self.custom_rules.len(),
            "schedules": self.schedules.len(),
            "alert_keywords": self.keywords.len(),
        })
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Construct the shared handle used across subsystems.
pub fn shared(engine: PolicyEngine) -> SharedPolicy {
    Arc::new(RwLock::new(engine))
}
