//! Flow analysis: traffic categorization, sensitive-data detection, and
//! keyword alerting over decoded request/response content.

use crate::events::AlertPayload;
use crate::policy::keywords::KeywordSet;
use crate::types::Sensitivity;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use uuid::Uuid;

/// Host/path patterns for traffic categorization.
const CATEGORY_PATTERNS: &[(&str, &[&str])] = &[
    (
        "social_media",
        &[
            r"facebook\.com",
            r"instagram\.com",
            r"twitter\.com",
            r"x\.com",
            r"tiktok\.com",
            r"snapchat\.com",
            r"linkedin\.com",
            r"reddit\.com",
            r"pinterest\.com",
            r"discord\.(com|gg)",
        ],
    ),
    (
        "streaming",
        &[
            r"youtube\.com",
            r"netflix\.com",
            r"hulu\.com",
            r"disneyplus\.com",
            r"twitch\.tv",
            r"spotify\.com",
            r"soundcloud\.com",
            r"vimeo\.com",
            r"crunchyroll\.com",
        ],
    ),
    (
        "gaming",
        &[
            r"steampowered\.com",
            r"epicgames\.com",
            r"roblox\.com",
            r"minecraft\.net",
            r"ea\.com",
            r"blizzard\.com",
            r"xbox\.com",
            r"playstation\.com",
            r"nintendo\.com",
        ],
    ),
    (
        "shopping",
        &[
            r"amazon\.com",
            r"ebay\.com",
            r"walmart\.com",
            r"target\.com",
            r"etsy\.com",
            r"aliexpress\.com",
        ],
    ),
    (
        "search",
        &[
            r"google\.[a-z.]+/search",
            r"bing\.com/search",
            r"duckduckgo\.com",
        ],
    ),
    (
        "email",
        &[
            r"mail\.google\.com",
            r"outlook\.com",
            r"mail\.yahoo\.com",
            r"protonmail\.com",
        ],
    ),
    (
        "messaging",
        &[
            r"whatsapp\.com",
            r"telegram\.org",
            r"signal\.org",
            r"messenger\.com",
            r"slack\.com",
            r"teams\.microsoft\.com",
            r"zoom\.us",
        ],
    ),
    (
        "news",
        &[
            r"cnn\.com",
            r"bbc\.(com|co\.uk)",
            r"nytimes\.com",
            r"reuters\.com",
            r"apnews\.com",
        ],
    ),
    (
        "education",
        &[
            r"khanacademy\.org",
            r"coursera\.org",
            r"udemy\.com",
            r"duolingo\.com",
            r"quizlet\.com",
        ],
    ),
    (
        "finance",
        &[
            r"paypal\.com",
            r"venmo\.com",
            r"chase\.com",
            r"bankofamerica\.com",
            r"coinbase\.com",
        ],
    ),
    (
        "advertising",
        &[
            r"doubleclick\.net",
            r"googlesyndication\.com",
            r"googleadservices\.com",
            r"^ads\.",
            r"adservice\.",
        ],
    ),
    (
        "analytics",
        &[
            r"google-analytics\.com",
            r"googletagmanager\.com",
            r"segment\.com",
            r"mixpanel\.com",
            r"hotjar\.com",
        ],
    ),
    (
        "adult",
        &[
            r"pornhub\.com",
            r"xvideos\.com",
            r"xnxx\.com",
            r"xhamster\.com",
            r"onlyfans\.com",
        ],
    ),
];

/// Sensitive-data pattern classes, scanned over URL, query, and bodies.
const SENSITIVE_PATTERNS: &[(&str, &[&str])] = &[
    (
        "password",
        &[r"\bpassword\b", r"\bpasswd\b", r"\bpwd\b", r"\bcredential\b"],
    ),
    (
        "token",
        &[
            r"\btoken\b",
            r"\bapi[_-]?key\b",
            r"\baccess[_-]?token\b",
            r"\bbearer\b",
        ],
    ),
    (
        "credit_card",
        &[r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b", r"\bcvv\b", r"\bcard[_-]?number\b"],
    ),
    ("ssn", &[r"\b\d{3}-\d{2}-\d{4}\b", r"\bsocial[_-]?security\b"]),
    (
        "email",
        &[r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"],
    ),
    ("phone", &[r"\b\d{3}[-.]\d{3}[-.]\d{4}\b"]),
];

/// Header fields whose values are credentials.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
];

fn compiled_categories() -> &'static Vec<(&'static str, Vec<Regex>)> {
    static TABLE: OnceLock<Vec<(&'static str, Vec<Regex>)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        CATEGORY_PATTERNS
            .iter()
            .map(|(cat, patterns)| {
                let compiled = patterns
                    .iter()
                    .map(|p| Regex::new(&format!("(?i){p}")).expect("builtin category pattern"))
                    .collect();
                (*cat, compiled)
            })
            .collect()
    })
}

fn compiled_sensitive() -> &'static Vec<(&'static str, Vec<Regex>)> {
    static TABLE: OnceLock<Vec<(&'static str, Vec<Regex>)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        SENSITIVE_PATTERNS
            .iter()
            .map(|(name, patterns)| {
                let compiled = patterns
                    .iter()
                    .map(|p| Regex::new(&format!("(?i){p}")).expect("builtin sensitive pattern"))
                    .collect();
                (*name, compiled)
            })
            .collect()
    })
}

/// Traffic category for a host/path pair, or None for uncategorized.
pub fn categorize(host: &str, path: &str) -> Option<&'static str> {
    let subject = format!("{host}{path}");
    compiled_categories()
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(&subject)))
        .map(|(cat, _)| *cat)
}

pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Sensitivity of a flow from its URL, headers, and body text.
/// Returns the level and the pattern classes that fired.
pub fn analyze_sensitivity(
    url: &str,
    headers: &BTreeMap<String, String>,
    request_body: &str,
    response_body: &str,
) -> (Sensitivity, Vec<String>) {
    let subject = format!("{url}\n{request_body}\n{response_body}");
    let mut fields: Vec<String> = Vec::new();
    for (name, patterns) in compiled_sensitive() {
        if patterns.iter().any(|re| re.is_match(&subject)) {
            fields.push(name.to_string());
        }
    }
    let has_auth_header = headers.keys().any(|k| is_sensitive_header(k));

    let level = if fields.iter().any(|f| f == "credit_card" || f == "ssn") {
        Sensitivity::Critical
    } else if fields.iter().any(|f| f == "password" || f == "token") {
        Sensitivity::Sensitive
    } else if !fields.is_empty() || has_auth_header {
        Sensitivity::Private
    } else {
        Sensitivity::Public
    };
    (level, fields)
}

/// Where in a flow a keyword matched, for alert tags.
#[derive(Debug, Clone, Copy)]
pub enum FlowLocation {
    Url,
    RequestBody,
    ResponseBody,
}

impl FlowLocation {
    fn tag_prefix(self) -> &'static str {
        match self {
            FlowLocation::Url => "KEYWORD_URL",
            FlowLocation::RequestBody => "KEYWORD_REQUEST",
            FlowLocation::ResponseBody => "KEYWORD_RESPONSE",
        }
    }

    fn location_label(self) -> &'static str {
        match self {
            FlowLocation::Url => "url",
            _ => "body",
        }
    }
}

/// Run the keyword matchers over one flow location, producing alert tags
/// for the flow record and alert payloads for the event plane.
pub fn keyword_alerts(
    keywords: &KeywordSet,
    text: &str,
    location: FlowLocation,
    host: &str,
    flow_id: Uuid,
) -> (Vec<String>, Vec<AlertPayload>) {
    let mut tags = Vec::new();
    let mut alerts = Vec::new();
    for hit in keywords.match_text(text, location.location_label()) {
        tags.push(format!("{}:{}", location.tag_prefix(), hit.word));
        alerts.push(AlertPayload {
            severity: hit.severity,
            category: hit.category,
            keyword_id: hit.keyword_id,
            matched_text: hit.matched_text,
            context: hit.context,
            location: location.location_label().to_string(),
            host: Some(host.to_string()),
            flow_id: Some(flow_id),
        });
    }
    (tags, alerts)
}
