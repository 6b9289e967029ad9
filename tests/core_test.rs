//! Cross-module behavior through the public API: policy persistence and
//! idempotence, the DNS reply codecs, and the store pipeline from decoded
//! flows to full-text search.

use chrono::TimeZone;
use netwarden::dns::packet::{self, rtype};
use netwarden::policy::engine::PolicyEngine;
use netwarden::policy::schedules::{preset, Schedule};
use netwarden::store::{QueryFilter, Store};
use netwarden::types::{DnsQueryRecord, FlowBody, HttpFlow};
use std::net::Ipv4Addr;

#[test]
fn block_unblock_leaves_persisted_policy_unchanged() {
    let dir = tempfile::tempdir().unwrap();

    let baseline = {
        let mut engine = PolicyEngine::load(dir.path());
        engine.block_domain("keep.example");
        engine.save().unwrap();
        std::fs::read_to_string(dir.path().join("blocklist.json")).unwrap()
    };

    {
        let mut engine = PolicyEngine::load(dir.path());
        engine.block_domain("transient.example");
        engine.unblock_domain("transient.example");
        engine.save().unwrap();
    }

    let after = std::fs::read_to_string(dir.path().join("blocklist.json")).unwrap();
    assert_eq!(baseline, after);
}

#[test]
fn schedule_preset_roundtrips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = PolicyEngine::load(dir.path());
    let mut sched = preset("homework_time").unwrap();
    sched.id = "homework".to_string();
    sched.categories = ["gaming".to_string()].into_iter().collect();
    engine.schedules.add(sched.clone());
    engine.save().unwrap();

    let engine = PolicyEngine::load(dir.path());
    let loaded = engine.schedules.get("homework").unwrap();
    assert_eq!(loaded.kind, sched.kind);
    assert_eq!(loaded.categories, sched.categories);
    assert_eq!(loaded.time_ranges, sched.time_ranges);

    // Monday 17:00 inside the window blocks, 18:01 does not.
    let monday_5pm = chrono::Local.with_ymd_and_hms(2026, 8, 3, 17, 0, 0).unwrap();
    let monday_601pm = chrono::Local.with_ymd_and_hms(2026, 8, 3, 18, 1, 0).unwrap();
    assert!(engine
        .check_at("steampowered.com", "", "", monday_5pm)
        .should_block);
    assert!(!engine
        .check_at("steampowered.com", "", "", monday_601pm)
        .should_block);
}

#[test]
fn forged_replies_roundtrip_through_the_parser() {
    let query = packet::parse(&packet::build_query(0x1234, "ads.example", rtype::A)).unwrap();

    let nx = packet::parse(&packet::build_nxdomain(&query)).unwrap();
    assert_eq!(nx.id, query.id);
    assert_eq!(nx.rcode, packet::RCODE_NXDOMAIN);
    assert_eq!(nx.questions, query.questions);
    assert!(nx.answers.is_empty());

    let redirect = packet::parse(&packet::build_redirect(&query, Ipv4Addr::new(10, 9, 8, 7))).unwrap();
    assert_eq!(redirect.rcode, packet::RCODE_NOERROR);
    assert_eq!(redirect.resolved_ips(), vec!["10.9.8.7"]);
    assert_eq!(redirect.answers[0].ttl, packet::REDIRECT_TTL);
}

#[test]
fn store_pipeline_from_flows_to_search() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("test.db")).unwrap();

    let mut dns = DnsQueryRecord::new("192.168.1.23", "ads.example", "A");
    dns.blocked = true;
    dns.block_reason = Some("Domain blocked: ads.example".to_string());
    store.insert_dns(&dns).unwrap();

    for (host, body) in [
        ("a.com", "password=hunter2"),
        ("b.com", "token=abc123"),
        ("c.com", "lol"),
    ] {
        let mut flow = HttpFlow::new("192.168.1.23", "https", host);
        flow.method = "POST".to_string();
        flow.url = format!("https://{host}/submit");
        flow.request_body = FlowBody {
            text: Some(body.to_string()),
            body_type: Some("application/x-www-form-urlencoded".to_string()),
            raw_size: body.len() as u64,
            decoded_size: body.len() as u64,
        };
        flow.status_code = Some(200);
        store.insert_flow(&flow).unwrap();
    }

    // search("hunter2") returns exactly the a.com flow with highlight
    // markers around the term.
    let hits = store.search("hunter2", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].flow.host, "a.com");
    assert!(hits[0]
        .highlights
        .get("request_body")
        .unwrap()
        .contains("<<hunter2>>"));

    let blocked = store
        .query_dns(&QueryFilter {
            blocked_only: true,
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].query_name, "ads.example");

    // Reopening the database sees the same state.
    drop(store);
    let store = Store::open(&dir.path().join("test.db")).unwrap();
    assert_eq!(store.search("hunter2", 10).unwrap().len(), 1);
}

#[test]
fn schedule_midnight_crossing_is_active_on_both_sides() {
    let mut sched: Schedule = preset("bedtime").unwrap();
    sched.id = "night".to_string();
    // bedtime preset runs 21:00-07:00 every day; probe both sides of
    // midnight per the 22:00-07:00 boundary property.
    let before_midnight = chrono::Local.with_ymd_and_hms(2026, 8, 3, 23, 30, 0).unwrap();
    let after_midnight = chrono::Local.with_ymd_and_hms(2026, 8, 4, 0, 30, 0).unwrap();
    let midday = chrono::Local.with_ymd_and_hms(2026, 8, 3, 12, 0, 0).unwrap();
    assert!(sched.is_active_at(before_midnight));
    assert!(sched.is_active_at(after_midnight));
    assert!(!sched.is_active_at(midday));
}
