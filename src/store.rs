//! Embedded event store.
//!
//! SQLite database holding devices, DNS queries, and HTTP flows, with an
//! FTS5 index over (url, host, request_body, response_body) kept in sync by
//! triggers so index updates are atomic with the primary row. Transactions
//! are short; busy errors are retried once with jitter. One connection
//! behind a mutex gives single-writer semantics.

use crate::types::{canonical_mac, now_rfc3339, Device, DnsQueryRecord, FlowBody, HttpFlow, Sensitivity, UNKNOWN_DEVICE};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad record: {0}")]
    BadRecord(String),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    mac_address TEXT UNIQUE NOT NULL,
    ip_address TEXT NOT NULL,
    hostname TEXT,
    vendor TEXT,
    is_gateway INTEGER DEFAULT 0,
    is_self INTEGER DEFAULT 0,
    is_monitored INTEGER DEFAULT 1,
    has_ca_installed INTEGER DEFAULT 0,
    first_seen TEXT,
    last_seen TEXT,
    total_requests INTEGER DEFAULT 0,
    total_bytes INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS dns_queries (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    device_id TEXT,
    device_ip TEXT NOT NULL,
    query_name TEXT NOT NULL,
    query_type TEXT DEFAULT 'A',
    response_ip TEXT,
    response_ttl INTEGER,
    blocked INTEGER DEFAULT 0,
    block_reason TEXT,
    category TEXT,
    FOREIGN KEY (device_id) REFERENCES devices(id)
);

CREATE INDEX IF NOT EXISTS idx_dns_timestamp ON dns_queries(timestamp);
CREATE INDEX IF NOT EXISTS idx_dns_device ON dns_queries(device_id);
CREATE INDEX IF NOT EXISTS idx_dns_domain ON dns_queries(query_name);

CREATE TABLE IF NOT EXISTS traffic (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    device_id TEXT,
    device_ip TEXT NOT NULL,
    method TEXT NOT NULL,
    scheme TEXT DEFAULT 'https',
    url TEXT NOT NULL,
    host TEXT NOT NULL,
    path TEXT,
    request_headers TEXT DEFAULT '{}',
    request_body TEXT,
    request_body_type TEXT,
    request_raw_size INTEGER DEFAULT 0,
    request_decoded_size INTEGER DEFAULT 0,
    status_code INTEGER,
    status_message TEXT,
    response_headers TEXT DEFAULT '{}',
    response_body TEXT,
    response_body_type TEXT,
    response_raw_size INTEGER DEFAULT 0,
    response_decoded_size INTEGER DEFAULT 0,
    duration_ms INTEGER DEFAULT 0,
    category TEXT,
    sensitivity TEXT DEFAULT 'public',
    blocked INTEGER DEFAULT 0,
    block_reason TEXT,
    upstream_insecure INTEGER DEFAULT 0,
    alerts TEXT DEFAULT '[]',
    FOREIGN KEY (device_id) REFERENCES devices(id)
);

CREATE INDEX IF NOT EXISTS idx_traffic_timestamp ON traffic(timestamp);
CREATE INDEX IF NOT EXISTS idx_traffic_device ON traffic(device_id);
CREATE INDEX IF NOT EXISTS idx_traffic_host ON traffic(host);
CREATE INDEX IF NOT EXISTS idx_traffic_category ON traffic(category);

CREATE VIRTUAL TABLE IF NOT EXISTS traffic_fts USING fts5(
    url,
    host,
    request_body,
    response_body,
    content='traffic',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS traffic_ai AFTER INSERT ON traffic BEGIN
    INSERT INTO traffic_fts(rowid, url, host, request_body, response_body)
    VALUES (new.rowid, new.url, new.host, new.request_body, new.response_body);
END;

CREATE TRIGGER IF NOT EXISTS traffic_ad AFTER DELETE ON traffic BEGIN
    INSERT INTO traffic_fts(traffic_fts, rowid, url, host, request_body, response_body)
    VALUES ('delete', old.rowid, old.url, old.host, old.request_body, old.response_body);
END;
"#;

/// Filters for DNS/traffic history queries.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub device_id: Option<Uuid>,
    pub domain: Option<String>,
    pub host: Option<String>,
    pub category: Option<String>,
    pub since: Option<String>,
    pub blocked_only: bool,
    pub limit: usize,
}

/// A full-text search hit with `<<`/`>>` highlight markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub flow: HttpFlow,
    /// FTS5 bm25 rank; lower is more relevant.
    pub rank: f64,
    /// Highlighted copies of matched columns, keyed by column name.
    pub highlights: BTreeMap<String, String>,
}

/// Parsed search query: phrases, bare terms, exclusions, field filters.
#[derive(Debug, Default, PartialEq)]
struct ParsedQuery {
    terms: Vec<String>,
    phrases: Vec<String>,
    excluded: Vec<String>,
    filters: HashMap<String, String>,
}

fn parse_query(query: &str) -> ParsedQuery {
    let mut parsed = ParsedQuery::default();
    let mut rest = String::new();

    // Pull out quoted phrases first.
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            let mut phrase = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                phrase.push(c);
            }
            if !phrase.is_empty() {
                parsed.phrases.push(phrase);
            }
        } else {
            rest.push(c);
        }
    }

    for token in rest.split_whitespace() {
        if let Some(term) = token.strip_prefix('-') {
            if !term.is_empty() {
                parsed.excluded.push(term.to_string());
            }
        } else if let Some((field, value)) = token.split_once(':') {
            if !field.is_empty() && !value.is_empty() {
                parsed
                    .filters
                    .insert(field.to_ascii_lowercase(), value.to_string());
            }
        } else if let Some(term) = token.strip_prefix('+') {
            if !term.is_empty() {
                parsed.terms.push(term.to_string());
            }
        } else {
            parsed.terms.push(token.to_string());
        }
    }
    parsed
}

fn fts_match_expr(parsed: &ParsedQuery) -> String {
    let mut parts: Vec<String> = Vec::new();
    for phrase in &parsed.phrases {
        parts.push(format!("\"{}\"", phrase.replace('"', "")));
    }
    for term in &parsed.terms {
        // Quote bare terms so FTS5 operators in user input stay literal.
        parts.push(format!("\"{}\"", term.replace('"', "")));
    }
    parts.join(" AND ")
}

/// The event store. All subsystems share one instance.
pub struct Store {
    conn: Mutex<Connection>,
    /// Source-address to device-id index for fast packet enrichment.
    ip_index: RwLock<HashMap<String, Uuid>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            conn: Mutex::new(conn),
            ip_index: RwLock::new(HashMap::new()),
        };
        store.rebuild_ip_index()?;
        Ok(store)
    }

    fn rebuild_ip_index(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT ip_address, id FROM devices")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut index = self.ip_index.write().unwrap();
        index.clear();
        for row in rows {
            let (ip, id) = row?;
            if let Ok(id) = Uuid::parse_str(&id) {
                index.insert(ip, id);
            }
        }
        Ok(())
    }

    /// Retry once with jitter when the database is busy; the second
    /// failure propagates.
    fn with_retry<T>(
        &self,
        mut op: impl FnMut(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().unwrap();
        match op(&conn) {
            Ok(v) => Ok(v),
            Err(e) if is_busy(&e) => {
                let jitter = 10 + (rand::random::<u64>() % 40);
                debug!("database busy, retrying in {}ms", jitter);
                std::thread::sleep(std::time::Duration::from_millis(jitter));
                op(&conn).map_err(StoreError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---- devices ----

    /// Insert or update a device keyed by its canonical link-layer address.
    /// Returns the stored record; an existing device keeps its id and
    /// first_seen.
    pub fn upsert_device(&self, device: &Device) -> Result<Device, StoreError> {
        let mac = canonical_mac(&device.mac);
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO devices (
                    id, mac_address, ip_address, hostname, vendor,
                    is_gateway, is_self, is_monitored, has_ca_installed,
                    first_seen, last_seen, total_requests, total_bytes
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(mac_address) DO UPDATE SET
                    ip_address = excluded.ip_address,
                    hostname = COALESCE(excluded.hostname, devices.hostname),
                    vendor = COALESCE(excluded.vendor, devices.vendor),
                    is_gateway = excluded.is_gateway,
                    is_self = excluded.is_self,
                    last_seen = excluded.last_seen",
                params![
                    device.id.to_string(),
                    mac,
                    device.ip,
                    device.hostname,
                    device.vendor,
                    device.is_gateway as i64,
                    device.is_self as i64,
                    device.is_monitored as i64,
                    device.has_ca_installed as i64,
                    device.first_seen,
                    device.last_seen,
                    device.total_requests as i64,
                    device.total_bytes as i64,
                ],
            )?;
            Ok(())
        })?;
        let stored = self
            .device_by_mac(&mac)?
            .ok_or_else(|| StoreError::BadRecord(format!("device vanished after upsert: {mac}")))?;
        self.ip_index
            .write()
            .unwrap()
            .insert(stored.ip.clone(), stored.id);
        Ok(stored)
    }

    pub fn device_by_mac(&self, mac: &str) -> Result<Option<Device>, StoreError> {
        let mac = canonical_mac(mac);
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT * FROM devices WHERE mac_address = ?1",
                params![mac],
                row_to_device,
            )
            .optional()
        })
    }

    pub fn device_by_ip(&self, ip: &str) -> Result<Option<Device>, StoreError> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT * FROM devices WHERE ip_address = ?1 ORDER BY last_seen DESC LIMIT 1",
                params![ip],
                row_to_device,
            )
            .optional()
        })
    }

    pub fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM devices ORDER BY last_seen DESC")?;
            let rows = stmt.query_map([], row_to_device)?;
            rows.collect()
        })
    }

    /// Fast in-memory lookup from a source address to a device id; falls
    /// back to the unknown-device sentinel.
    pub fn device_id_for_ip(&self, ip: &str) -> Uuid {
        self.ip_index
            .read()
            .unwrap()
            .get(ip)
            .copied()
            .unwrap_or(UNKNOWN_DEVICE)
    }

    /// Accumulate per-device counters and refresh last_seen.
    pub fn bump_device_stats(
        &self,
        device_id: Uuid,
        requests: u64,
        bytes: u64,
    ) -> Result<(), StoreError> {
        if device_id == UNKNOWN_DEVICE {
            return Ok(());
        }
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE devices SET
                    total_requests = total_requests + ?1,
                    total_bytes = total_bytes + ?2,
                    last_seen = ?3
                WHERE id = ?4",
                params![
                    requests as i64,
                    bytes as i64,
                    now_rfc3339(),
                    device_id.to_string()
                ],
            )?;
            Ok(())
        })
    }

    pub fn set_ca_installed(&self, device_id: Uuid, installed: bool) -> Result<(), StoreError> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE devices SET has_ca_installed = ?1 WHERE id = ?2",
                params![installed as i64, device_id.to_string()],
            )?;
            Ok(())
        })
    }

    // ---- dns ----

    pub fn insert_dns(&self, record: &DnsQueryRecord) -> Result<(), StoreError> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO dns_queries (
                    id, timestamp, device_id, device_ip, query_name, query_type,
                    response_ip, response_ttl, blocked, block_reason, category
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id.to_string(),
                    record.timestamp,
                    record.device_id.to_string(),
                    record.device_ip,
                    record.query_name,
                    record.query_type,
                    record.response_ip,
                    record.response_ttl,
                    record.blocked as i64,
                    record.block_reason,
                    record.category,
                ],
            )?;
            Ok(())
        })
    }

    pub fn query_dns(&self, filter: &QueryFilter) -> Result<Vec<DnsQueryRecord>, StoreError> {
        let mut sql = "SELECT * FROM dns_queries WHERE 1=1".to_string();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(id) = filter.device_id {
            sql.push_str(" AND device_id = ?");
            args.push(Box::new(id.to_string()));
        }
        if let Some(domain) = &filter.domain {
            sql.push_str(" AND query_name LIKE ?");
            args.push(Box::new(format!("%{domain}%")));
        }
        if let Some(since) = &filter.since {
            sql.push_str(" AND timestamp > ?");
            args.push(Box::new(since.clone()));
        }
        if filter.blocked_only {
            sql.push_str(" AND blocked = 1");
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        args.push(Box::new(filter.limit.max(1) as i64));

        self.with_retry(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                row_to_dns,
            )?;
            rows.collect()
        })
    }

    // ---- traffic ----

    /// Persist a finalized flow. The FTS row is written by trigger in the
    /// same statement, keeping index and row atomic.
    pub fn insert_flow(&self, flow: &HttpFlow) -> Result<(), StoreError> {
        let request_headers = serde_json::to_string(&flow.request_headers)
            .map_err(|e| StoreError::BadRecord(e.to_string()))?;
        let response_headers = serde_json::to_string(&flow.response_headers)
            .map_err(|e| StoreError::BadRecord(e.to_string()))?;
        let alerts = serde_json::to_string(&flow.alerts)
            .map_err(|e| StoreError::BadRecord(e.to_string()))?;
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO traffic (
                    id, timestamp, device_id, device_ip, method, scheme, url, host, path,
                    request_headers, request_body, request_body_type,
                    request_raw_size, request_decoded_size,
                    status_code, status_message,
                    response_headers, response_body, response_body_type,
                    response_raw_size, response_decoded_size,
                    duration_ms, category, sensitivity, blocked, block_reason,
                    upstream_insecure, alerts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                          ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
                params![
                    flow.id.to_string(),
                    flow.timestamp,
                    flow.device_id.to_string(),
                    flow.device_ip,
                    flow.method,
                    flow.scheme,
                    flow.url,
                    flow.host,
                    flow.path,
                    request_headers,
                    flow.request_body.text,
                    flow.request_body.body_type,
                    flow.request_body.raw_size as i64,
                    flow.request_body.decoded_size as i64,
                    flow.status_code,
                    flow.status_message,
                    response_headers,
                    flow.response_body.text,
                    flow.response_body.body_type,
                    flow.response_body.raw_size as i64,
                    flow.response_body.decoded_size as i64,
                    flow.duration_ms as i64,
                    flow.category,
                    flow.sensitivity.as_str(),
                    flow.blocked as i64,
                    flow.block_reason,
                    flow.upstream_insecure as i64,
                    alerts,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_flow(&self, id: Uuid) -> Result<Option<HttpFlow>, StoreError> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT * FROM traffic WHERE id = ?1",
                params![id.to_string()],
                row_to_flow,
            )
            .optional()
        })
    }

    pub fn query_traffic(&self, filter: &QueryFilter) -> Result<Vec<HttpFlow>, StoreError> {
        let mut sql = "SELECT * FROM traffic WHERE 1=1".to_string();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(id) = filter.device_id {
            sql.push_str(" AND device_id = ?");
            args.push(Box::new(id.to_string()));
        }
        if let Some(host) = &filter.host {
            sql.push_str(" AND host LIKE ?");
            args.push(Box::new(format!("%{host}%")));
        }
        if let Some(category) = &filter.category {
            sql.push_str(" AND category = ?");
            args.push(Box::new(category.clone()));
        }
        if let Some(since) = &filter.since {
            sql.push_str(" AND timestamp > ?");
            args.push(Box::new(since.clone()));
        }
        if filter.blocked_only {
            sql.push_str(" AND blocked = 1");
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        args.push(Box::new(filter.limit.max(1) as i64));

        self.with_retry(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                row_to_flow,
            )?;
            rows.collect()
        })
    }

    // ---- search ----

    /// Full-text search over url/host/bodies with the query syntax from the
    /// UI: `"quoted phrase"`, `-excluded`, `field:value` filters (host,
    /// method, status, category, device), bare terms ANDed.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        let parsed = parse_query(query);
        let match_expr = fts_match_expr(&parsed);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.*, bm25(traffic_fts) AS rank,
                        highlight(traffic_fts, 0, '<<', '>>') AS h_url,
                        highlight(traffic_fts, 1, '<<', '>>') AS h_host,
                        highlight(traffic_fts, 2, '<<', '>>') AS h_request_body,
                        highlight(traffic_fts, 3, '<<', '>>') AS h_response_body
                 FROM traffic_fts
                 JOIN traffic t ON t.rowid = traffic_fts.rowid
                 WHERE traffic_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![match_expr, (limit.max(1) * 2) as i64], |row| {
                let flow = row_to_flow(row)?;
                let rank: f64 = row.get("rank")?;
                let mut highlights = BTreeMap::new();
                for (key, col) in [
                    ("url", "h_url"),
                    ("host", "h_host"),
                    ("request_body", "h_request_body"),
                    ("response_body", "h_response_body"),
                ] {
                    if let Ok(Some(text)) = row.get::<_, Option<String>>(col) {
                        if text.contains("<<") {
                            highlights.insert(key.to_string(), text);
                        }
                    }
                }
                Ok(SearchHit {
                    flow,
                    rank,
                    highlights,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;

        // Post-filter: exclusions and field filters, like the source UI.
        hits.retain(|hit| {
            let haystack = format!(
                "{} {} {} {}",
                hit.flow.url,
                hit.flow.host,
                hit.flow.request_body.text.as_deref().unwrap_or(""),
                hit.flow.response_body.text.as_deref().unwrap_or(""),
            )
            .to_ascii_lowercase();
            if parsed
                .excluded
                .iter()
                .any(|t| haystack.contains(&t.to_ascii_lowercase()))
            {
                return false;
            }
            for (field, value) in &parsed.filters {
                let ok = match field.as_str() {
                    "host" => hit
                        .flow
                        .host
                        .to_ascii_lowercase()
                        .contains(&value.to_ascii_lowercase()),
                    "method" => hit.flow.method.eq_ignore_ascii_case(value),
                    "status" => hit
                        .flow
                        .status_code
                        .map(|s| s.to_string() == *value)
                        .unwrap_or(false),
                    "category" => hit.flow.category.as_deref() == Some(value.as_str()),
                    "device" => hit.flow.device_id.to_string() == *value,
                    _ => true,
                };
                if !ok {
                    return false;
                }
            }
            true
        });
        hits.truncate(limit);
        Ok(hits)
    }

    // ---- retention ----

    /// Delete rows older than `days` and compact the file.
    pub fn cleanup(&self, days: i64) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let removed = self.with_retry(|conn| {
            let traffic = conn.execute("DELETE FROM traffic WHERE timestamp < ?1", params![cutoff])?;
            let dns = conn.execute(
                "DELETE FROM dns_queries WHERE timestamp < ?1",
                params![cutoff],
            )?;
            Ok(traffic + dns)
        })?;
        if removed > 0 {
            info!("retention cleanup removed {} rows", removed);
            if let Err(e) = self.with_retry(|conn| conn.execute_batch("VACUUM")) {
                warn!("vacuum after cleanup failed: {}", e);
            }
        }
        Ok(removed)
    }

    /// Row counts for status events.
    pub fn counts(&self) -> Result<(u64, u64, u64), StoreError> {
        self.with_retry(|conn| {
            let devices: u64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |r| r.get(0))?;
            let dns: u64 = conn.query_row("SELECT COUNT(*) FROM dns_queries", [], |r| r.get(0))?;
            let traffic: u64 = conn.query_row("SELECT COUNT(*) FROM traffic", [], |r| r.get(0))?;
            Ok((devices, dns, traffic))
        })
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn parse_uuid(s: Option<String>) -> Uuid {
    s.and_then(|s| Uuid::parse_str(&s).ok()).unwrap_or(UNKNOWN_DEVICE)
}

fn row_to_device(row: &Row<'_>) -> Result<Device, rusqlite::Error> {
    Ok(Device {
        id: parse_uuid(row.get("id")?),
        mac: row.get("mac_address")?,
        ip: row.get("ip_address")?,
        hostname: row.get("hostname")?,
        vendor: row.get("vendor")?,
        is_gateway: row.get::<_, i64>("is_gateway")? != 0,
        is_self: row.get::<_, i64>("is_self")? != 0,
        is_monitored: row.get::<_, i64>("is_monitored")? != 0,
        has_ca_installed: row.get::<_, i64>("has_ca_installed")? != 0,
        first_seen: row.get::<_, Option<String>>("first_seen")?.unwrap_or_default(),
        last_seen: row.get::<_, Option<String>>("last_seen")?.unwrap_or_default(),
        total_requests: row.get::<_, i64>("total_requests")? as u64,
        total_bytes: row.get::<_, i64>("total_bytes")? as u64,
    })
}

fn row_to_dns(row: &Row<'_>) -> Result<DnsQueryRecord, rusqlite::Error> {
    Ok(DnsQueryRecord {
        id: parse_uuid(row.get("id")?),
        timestamp: row.get("timestamp")?,
        device_id: parse_uuid(row.get("device_id")?),
        device_ip: row.get("device_ip")?,
        query_name: row.get("query_name")?,
        query_type: row.get("query_type")?,
        response_ip: row.get("response_ip")?,
        response_ttl: row.get("response_ttl")?,
        blocked: row.get::<_, i64>("blocked")? != 0,
        block_reason: row.get("block_reason")?,
        category: row.get("category")?,
    })
}

fn row_to_flow(row: &Row<'_>) -> Result<HttpFlow, rusqlite::Error> {
    let request_headers: BTreeMap<String, String> =
        serde_json::from_str(&row.get::<_, String>("request_headers")?).unwrap_or_default();
    let response_headers: BTreeMap<String, String> =
        serde_json::from_str(&row.get::<_, String>("response_headers")?).unwrap_or_default();
    let alerts: Vec<String> =
        serde_json::from_str(&row.get::<_, String>("alerts")?).unwrap_or_default();
    let sensitivity = match row.get::<_, String>("sensitivity")?.as_str() {
        "private" => Sensitivity::Private,
        "sensitive" => Sensitivity::Sensitive,
        "critical" => Sensitivity::Critical,
        _ => Sensitivity::Public,
    };
    Ok(HttpFlow {
        id: parse_uuid(row.get("id")?),
        timestamp: row.get("timestamp")?,
        device_id: parse_uuid(row.get("device_id")?),
        device_ip: row.get("device_ip")?,
        method: row.get("method")?,
        scheme: row.get("scheme")?,
        host: row.get("host")?,
        path: row.get::<_, Option<String>>("path")?.unwrap_or_default(),
        url: row.get("url")?,
        request_headers,
        request_body: FlowBody {
            text: row.get("request_body")?,
            body_type: row.get("request_body_type")?,
            raw_size: row.get::<_, i64>("request_raw_size")? as u64,
            decoded_size: row.get::<_, i64>("request_decoded_size")? as u64,
        },
        status_code: row.get("status_code")?,
        status_message: row.get("status_message")?,
        response_headers,
        response_body: FlowBody {
            text: row.get("response_body")?,
            body_type: row.get("response_body_type")?,
            raw_size: row.get::<_, i64>("response_raw_size")? as u64,
            decoded_size: row.get::<_, i64>("response_decoded_size")? as u64,
        },
        duration_ms: row.get::<_, i64>("duration_ms")? as u64,
        category: row.get("category")?,
        sensitivity,
        blocked: row.get::<_, i64>("blocked")? != 0,
        block_reason: row.get("block_reason")?,
        alerts,
        upstream_insecure: row.get::<_, i64>("upstream_insecure")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow_with_body(host: &str, body: &str) -> HttpFlow {
        let mut flow = HttpFlow::new("192.168.1.23", "https", host);
        flow.method = "POST".to_string();
        flow.url = format!("https://{host}/login");
        flow.path = "/login".to_string();
        flow.request_body = FlowBody {
            text: Some(body.to_string()),
            body_type: Some("application/x-www-form-urlencoded".to_string()),
            raw_size: body.len() as u64,
            decoded_size: body.len() as u64,
        };
        flow.status_code = Some(200);
        flow
    }

    #[test]
    fn test_device_uniqueness_by_mac() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .upsert_device(&Device::new("AA:BB:CC:DD:EE:FF", "192.168.1.50"))
            .unwrap();
        let second = store
            .upsert_device(&Device::new("aa:bb:cc:dd:ee:ff", "192.168.1.99"))
            .unwrap();
        // Same link-layer address: exactly one record, same id, new ip.
        assert_eq!(first.id, second.id);
        assert_eq!(second.ip, "192.168.1.99");
        assert_eq!(store.list_devices().unwrap().len(), 1);
        assert_eq!(second.first_seen, first.first_seen);
    }

    #[test]
    fn test_device_ip_index() {
        let store = Store::open_in_memory().unwrap();
        let dev = store
            .upsert_device(&Device::new("aa:bb:cc:00:00:01", "192.168.1.23"))
            .unwrap();
        assert_eq!(store.device_id_for_ip("192.168.1.23"), dev.id);
        assert_eq!(store.device_id_for_ip("192.168.1.99"), UNKNOWN_DEVICE);
    }

    #[test]
    fn test_dns_insert_and_query() {
        let store = Store::open_in_memory().unwrap();
        let mut rec = DnsQueryRecord::new("192.168.1.23", "ads.example", "A");
        rec.blocked = true;
        rec.block_reason = Some("Domain blocked: ads.example".to_string());
        store.insert_dns(&rec).unwrap();
        store
            .insert_dns(&DnsQueryRecord::new("192.168.1.23", "ok.example", "AAAA"))
            .unwrap();

        let blocked = store
            .query_dns(&QueryFilter {
                blocked_only: true,
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].query_name, "ads.example");

        let by_domain = store
            .query_dns(&QueryFilter {
                domain: Some("ok".to_string()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_domain.len(), 1);
    }

    #[test]
    fn test_flow_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut flow = flow_with_body("a.com", "user=kid&password=hunter2");
        flow.alerts = vec!["KEYWORD_REQUEST:password".to_string()];
        flow.sensitivity = Sensitivity::Sensitive;
        store.insert_flow(&flow).unwrap();

        let back = store.get_flow(flow.id).unwrap().unwrap();
        assert_eq!(back.host, "a.com");
        assert_eq!(back.sensitivity, Sensitivity::Sensitive);
        assert_eq!(back.alerts, flow.alerts);
        assert_eq!(
            back.request_body.text.as_deref(),
            Some("user=kid&password=hunter2")
        );
    }

    #[test]
    fn test_fts_search_finds_one_flow_with_highlight() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_flow(&flow_with_body("a.com", "password=hunter2"))
            .unwrap();
        store
            .insert_flow(&flow_with_body("b.com", "token=abcdef"))
            .unwrap();
        store.insert_flow(&flow_with_body("c.com", "lol")).unwrap();

        let hits = store.search("hunter2", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].flow.host, "a.com");
        let hl = hits[0].highlights.get("request_body").unwrap();
        assert!(hl.contains("<<hunter2>>"), "got: {hl}");
    }

    #[test]
    fn test_search_exclusion_and_filters() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_flow(&flow_with_body("a.com", "shared secret alpha"))
            .unwrap();
        store
            .insert_flow(&flow_with_body("b.com", "shared secret beta"))
            .unwrap();

        let hits = store.search("secret -beta", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].flow.host, "a.com");

        let hits = store.search("secret host:b.com", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].flow.host, "b.com");
    }

    #[test]
    fn test_search_phrase() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_flow(&flow_with_body("a.com", "the quick brown fox"))
            .unwrap();
        store
            .insert_flow(&flow_with_body("b.com", "quick and brown but not adjacent fox"))
            .unwrap();
        let hits = store.search("\"quick brown\"", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].flow.host, "a.com");
    }

    #[test]
    fn test_cleanup_removes_old_rows_and_fts() {
        let store = Store::open_in_memory().unwrap();
        let mut old = flow_with_body("old.com", "ancient payload");
        old.timestamp = "2000-01-01T00:00:00+00:00".to_string();
        store.insert_flow(&old).unwrap();
        store.insert_flow(&flow_with_body("new.com", "fresh payload")).unwrap();

        let removed = store.cleanup(30).unwrap();
        assert_eq!(removed, 1);
        // FTS stays consistent: the deleted row is no longer findable.
        assert!(store.search("ancient", 10).unwrap().is_empty());
        assert_eq!(store.search("fresh", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_query_parser() {
        let parsed = parse_query("\"exact phrase\" hello -bad host:a.com +need");
        assert_eq!(parsed.phrases, vec!["exact phrase"]);
        assert!(parsed.terms.contains(&"hello".to_string()));
        assert!(parsed.terms.contains(&"need".to_string()));
        assert_eq!(parsed.excluded, vec!["bad"]);
        assert_eq!(parsed.filters.get("host").map(String::as_str), Some("a.com"));
    }
}
