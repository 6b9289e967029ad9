//! Built-in blocking categories.
//!
//! Each category carries a domain set, content keywords, and a severity.
//! Definitions are compiled in; policy decides which categories are enabled.

use crate::types::Severity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Category identifiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    Adult,
    Gambling,
    SocialMedia,
    Gaming,
    Streaming,
    Dating,
    Violence,
    Drugs,
    Weapons,
    Malware,
    Phishing,
    Advertising,
    Cryptocurrency,
    VpnProxy,
    FileSharing,
    Messaging,
    Custom,
}

impl BlockCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockCategory::Adult => "adult",
            BlockCategory::Gambling => "gambling",
            BlockCategory::SocialMedia => "social_media",
            BlockCategory::Gaming => "gaming",
            BlockCategory::Streaming => "streaming",
            BlockCategory::Dating => "dating",
            BlockCategory::Violence => "violence",
            BlockCategory::Drugs => "drugs",
            BlockCategory::Weapons => "weapons",
            BlockCategory::Malware => "malware",
            BlockCategory::Phishing => "phishing",
            BlockCategory::Advertising => "advertising",
            BlockCategory::Cryptocurrency => "cryptocurrency",
            BlockCategory::VpnProxy => "vpn_proxy",
            BlockCategory::FileSharing => "file_sharing",
            BlockCategory::Messaging => "messaging",
            BlockCategory::Custom => "custom",
        }
    }

    pub fn all() -> &'static [BlockCategory] {
        &[
            BlockCategory::Adult,
            BlockCategory::Gambling,
            BlockCategory::SocialMedia,
            BlockCategory::Gaming,
            BlockCategory::Streaming,
            BlockCategory::Dating,
            BlockCategory::Violence,
            BlockCategory::Drugs,
            BlockCategory::Weapons,
            BlockCategory::Malware,
            BlockCategory::Phishing,
            BlockCategory::Advertising,
            BlockCategory::Cryptocurrency,
            BlockCategory::VpnProxy,
            BlockCategory::FileSharing,
            BlockCategory::Messaging,
            BlockCategory::Custom,
        ]
    }
}

/// Parse a category id. Accepts the snake_case id used on the wire.
pub fn get_category(s: &str) -> Option<BlockCategory> {
    let s = s.trim().to_ascii_lowercase();
    BlockCategory::all()
        .iter()
        .copied()
        .find(|c| c.as_str() == s)
}

/// Definition of one category: human name, member domains, content keywords.
#[derive(Debug, Clone)]
pub struct CategoryDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub domains: &'static [&'static str],
    pub keywords: &'static [&'static str],
}

fn build_definitions() -> BTreeMap<BlockCategory, CategoryDefinition> {
    use BlockCategory::*;
    let mut map = BTreeMap::new();
    map.insert(
        Adult,
        CategoryDefinition {
            name: "Adult Content",
            description: "Pornographic and adult-only websites",
            severity: Severity::Critical,
            domains: &[
                "pornhub.com",
                "xvideos.com",
                "xnxx.com",
                "xhamster.com",
                "redtube.com",
                "youporn.com",
                "tube8.com",
                "spankbang.com",
                "onlyfans.com",
                "chaturbate.com",
                "stripchat.com",
                "livejasmin.com",
            ],
            keywords: &[
                "porn", "xxx", "nsfw", "nude", "naked", "sex video", "hardcore", "escort",
            ],
        },
    );
    map.insert(
        Gambling,
        CategoryDefinition {
            name: "Gambling",
            description: "Online gambling and betting websites",
            severity: Severity::High,
            domains: &[
                "bet365.com",
                "draftkings.com",
                "fanduel.com",
                "betmgm.com",
                "pokerstars.com",
                "888poker.com",
                "bovada.lv",
                "stake.com",
                "betway.com",
                "unibet.com",
                "williamhill.com",
                "1xbet.com",
            ],
            keywords: &[
                "gambling",
                "casino",
                "poker",
                "betting",
                "sportsbook",
                "slot machine",
                "blackjack",
                "roulette",
            ],
        },
    );
    map.insert(
        SocialMedia,
        CategoryDefinition {
            name: "Social Media",
            description: "Social networking platforms",
            severity: Severity::Low,
            domains: &[
                "facebook.com",
                "instagram.com",
                "twitter.com",
                "x.com",
                "tiktok.com",
                "snapchat.com",
                "linkedin.com",
                "pinterest.com",
                "tumblr.com",
                "reddit.com",
                "threads.net",
                "bsky.app",
            ],
            keywords: &[],
        },
    );
    map.insert(
        Gaming,
        CategoryDefinition {
            name: "Gaming",
            description: "Online games and gaming platforms",
            severity: Severity::Low,
            domains: &[
                "steampowered.com",
                "epicgames.com",
                "roblox.com",
                "minecraft.net",
                "fortnite.com",
                "ea.com",
                "blizzard.com",
                "ubisoft.com",
                "xbox.com",
                "playstation.com",
                "nintendo.com",
                "gog.com",
                "twitch.tv",
                "itch.io",
            ],
            keywords: &[],
        },
    );
    map.insert(
        Streaming,
        CategoryDefinition {
            name: "Streaming",
            description: "Video and music streaming services",
            severity: Severity::Low,
            domains: &[
                "youtube.com",
                "netflix.com",
                "hulu.com",
                "disneyplus.com",
                "max.com",
                "peacocktv.com",
                "paramountplus.com",
                "primevideo.com",
                "twitch.tv",
                "crunchyroll.com",
                "spotify.com",
                "soundcloud.com",
                "vimeo.com",
                "dailymotion.com",
            ],
            keywords: &[],
        },
    );
    map.insert(
        Dating,
        CategoryDefinition {
            name: "Dating",
            description: "Dating and relationship websites",
            severity: Severity::Medium,
            domains: &[
                "tinder.com",
                "bumble.com",
                "hinge.co",
                "match.com",
                "okcupid.com",
                "plentyoffish.com",
                "eharmony.com",
                "grindr.com",
            ],
            keywords: &["dating", "hookup", "meet singles"],
        },
    );
    map.insert(
        Violence,
        CategoryDefinition {
            name: "Violence",
            description: "Violent or disturbing content",
            severity: Severity::Critical,
            domains: &["liveleak.com", "bestgore.com", "theync.com"],
            keywords: &["gore", "death video", "execution"],
        },
    );
    map.insert(
        Drugs,
        CategoryDefinition {
            name: "Drugs",
            description: "Drug-related content",
            severity: Severity::Critical,
            domains: &["erowid.org", "drugs-forum.com", "grasscity.com", "shroomery.org"],
            keywords: &["buy drugs", "drug dealer", "cannabis seeds"],
        },
    );
    map.insert(
        Weapons,
        CategoryDefinition {
            name: "Weapons",
            description: "Weapons sales and related content",
            severity: Severity::High,
            domains: &[
                "gunbroker.com",
                "budsgunshop.com",
                "palmettostatearmory.com",
                "cheaperthandirt.com",
            ],
            keywords: &["buy guns", "firearms sale", "ammunition sale"],
        },
    );
    map.insert(
        Malware,
        CategoryDefinition {
            name: "Malware",
            description: "Known malware domains",
            severity: Severity::Critical,
            domains: &[],
            keywords: &[],
        },
    );
    map.insert(
        Phishing,
        CategoryDefinition {
            name: "Phishing",
            description: "Phishing and scam websites",
            severity: Severity::Critical,
            domains: &[],
            keywords: &[],
        },
    );
    map.insert(
        Advertising,
        CategoryDefinition {
            name: "Advertising",
            description: "Ad networks and tracking",
            severity: Severity::Low,
            domains: &[
                "doubleclick.net",
                "googlesyndication.com",
                "googleadservices.com",
                "adnxs.com",
                "criteo.com",
                "taboola.com",
                "outbrain.com",
                "amazon-adsystem.com",
            ],
            keywords: &[],
        },
    );
    map.insert(
        Cryptocurrency,
        CategoryDefinition {
            name: "Cryptocurrency",
            description: "Cryptocurrency trading and mining",
            severity: Severity::Medium,
            domains: &[
                "coinbase.com",
                "binance.com",
                "kraken.com",
                "crypto.com",
                "kucoin.com",
                "blockchain.com",
                "nicehash.com",
            ],
            keywords: &["buy bitcoin", "crypto trading", "mining pool"],
        },
    );
    map.insert(
        VpnProxy,
        CategoryDefinition {
            name: "VPN/Proxy Services",
            description: "VPN and proxy services that could bypass monitoring",
            severity: Severity::High,
            domains: &[
                "nordvpn.com",
                "expressvpn.com",
                "surfshark.com",
                "protonvpn.com",
                "mullvad.net",
                "torproject.org",
                "hidemyass.com",
                "tunnelbear.com",
                "windscribe.com",
                "proxysite.com",
            ],
            keywords: &["vpn download", "anonymous proxy", "hide ip", "unblock sites"],
        },
    );
    map.insert(
        FileSharing,
        CategoryDefinition {
            name: "File Sharing",
            description: "Torrents and file sharing platforms",
            severity: Severity::Medium,
            domains: &[
                "thepiratebay.org",
                "1337x.to",
                "yts.mx",
                "nyaa.si",
                "rutracker.org",
                "mega.nz",
                "rapidgator.net",
                "mediafire.com",
            ],
            keywords: &["torrent download", "pirated"],
        },
    );
    map.insert(
        Messaging,
        CategoryDefinition {
            name: "Messaging Apps",
            description: "Instant messaging and chat platforms",
            severity: Severity::Low,
            domains: &[
                "whatsapp.com",
                "telegram.org",
                "signal.org",
                "discord.com",
                "slack.com",
                "messenger.com",
                "zoom.us",
                "skype.com",
                "viber.com",
            ],
            keywords: &[],
        },
    );
    map.insert(
        Custom,
        CategoryDefinition {
            name: "Custom",
            description: "User-defined blocked sites",
            severity: Severity::Medium,
            domains: &[],
            keywords: &[],
        },
    );
    map
}

/// The built-in category table.
pub fn definitions() -> &'static BTreeMap<BlockCategory, CategoryDefinition> {
    static DEFS: OnceLock<BTreeMap<BlockCategory, CategoryDefinition>> = OnceLock::new();
    DEFS.get_or_init(build_definitions)
}

/// Which categories a domain belongs to (same matching rules as blocklists).
pub fn check_domain_category(domain: &str) -> Vec<BlockCategory> {
    let mut matches = Vec::new();
    for (category, def) in definitions() {
        if def.domains.iter().any(|d| super::domain_matches(domain, d)) {
            matches.push(*category);
        }
    }
    matches
}

/// Which categories have a content keyword present in URL + content.
pub fn check_url_keywords(url: &str, content: &str) -> Vec<BlockCategory> {
    let combined = format!("{} {}", url, content).to_ascii_lowercase();
    let mut matches = Vec::new();
    for (category, def) in definitions() {
        if def.keywords.iter().any(|k| combined.contains(k)) {
            matches.push(*category);
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_roundtrip() {
        for cat in BlockCategory::all() {
            assert_eq!(get_category(cat.as_str()), Some(*cat));
        }
        assert_eq!(get_category("nope"), None);
    }

    #[test]
    fn test_domain_category_lookup() {
        assert_eq!(
            check_domain_category("steampowered.com"),
            vec![BlockCategory::Gaming]
        );
        assert_eq!(
            check_domain_category("store.steampowered.com"),
            vec![BlockCategory::Gaming]
        );
        assert!(check_domain_category("example.org").is_empty());
    }

    #[test]
    fn test_twitch_is_both_gaming_and_streaming() {
        let cats = check_domain_category("twitch.tv");
        assert!(cats.contains(&BlockCategory::Gaming));
        assert!(cats.contains(&BlockCategory::Streaming));
    }

    #[test]
    fn test_url_keyword_category() {
        let cats = check_url_keywords("https://site.test/casino-games", "");
        assert!(cats.contains(&BlockCategory::Gambling));
    }

    #[test]
    fn test_definitions_have_severities() {
        let defs = definitions();
        assert_eq!(defs[&BlockCategory::Adult].severity, Severity::Critical);
        assert_eq!(defs[&BlockCategory::Gaming].severity, Severity::Low);
    }
}
