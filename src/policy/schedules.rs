//! Time-based blocking schedules.
//!
//! A schedule decides *when* a set of categories/domains is blocked: always,
//! never, inside listed time ranges, or outside them (allow ranges). Ranges
//! crossing midnight are treated as two modular spans. Higher priority wins;
//! ties break by lexicographic schedule id.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::warn;

use crate::types::now_rfc3339;

/// Schedule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Active whenever enabled and inside the optional date window.
    AlwaysBlock,
    /// Never active.
    NeverBlock,
    /// Active while the local time is inside any listed range.
    TimeRange,
    /// Active while the local time is outside every listed range.
    AllowRange,
}

/// An inclusive wall-clock range, possibly crossing midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
}

impl TimeRange {
    pub fn new(start_hour: u8, start_minute: u8, end_hour: u8, end_minute: u8) -> Self {
        Self {
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        let cur = (t.hour() as u16) * 60 + t.minute() as u16;
        let start = (self.start_hour as u16) * 60 + self.start_minute as u16;
        let end = (self.end_hour as u16) * 60 + self.end_minute as u16;
        if start <= end {
            start <= cur && cur <= end
        } else {
            // Overnight: 22:00-07:00 is [22:00, 24:00) plus [00:00, 07:00].
            cur >= start || cur <= end
        }
    }
}

/// Serialization key for a weekday, matching the persisted JSON format.
pub fn weekday_key(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MONDAY",
        Weekday::Tue => "TUESDAY",
        Weekday::Wed => "WEDNESDAY",
        Weekday::Thu => "THURSDAY",
        Weekday::Fri => "FRIDAY",
        Weekday::Sat => "SATURDAY",
        Weekday::Sun => "SUNDAY",
    }
}

/// A blocking schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub kind: ScheduleKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Category ids this schedule applies to; empty + empty domains = all.
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub domains: BTreeSet<String>,
    /// Per-weekday time ranges, keyed by `weekday_key`.
    #[serde(default)]
    pub time_ranges: BTreeMap<String, Vec<TimeRange>>,
    /// Optional date window (inclusive), e.g. an exam period.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Schedule {
    /// Is this schedule active at the given local time?
    pub fn is_active_at(&self, dt: DateTime<Local>) -> bool {
        if !self.enabled {
            return false;
        }
        let date = dt.date_naive();
        if let Some(start) = self.start_date {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if date > end {
                return false;
            }
        }

        match self.kind {
            ScheduleKind::AlwaysBlock => true,
            ScheduleKind::NeverBlock => false,
            ScheduleKind::TimeRange | ScheduleKind::AllowRange => {
                let ranges = self
                    .time_ranges
                    .get(weekday_key(dt.weekday()))
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                let inside = ranges.iter().any(|r| r.contains(dt.time()));
                match self.kind {
                    ScheduleKind::TimeRange => inside,
                    _ => !inside,
                }
            }
        }
    }

    /// Does this schedule target the given domain/category? A schedule with
    /// no targets applies to everything.
    pub fn applies_to(&self, domain: &str, category: Option<&str>) -> bool {
        if !domain.is_empty()
            && self
                .domains
                .iter()
                .any(|d| super::domain_matches(domain, d))
        {
            return true;
        }
        if let Some(cat) = category {
            if self
                .categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(cat))
            {
                return true;
            }
        }
        self.domains.is_empty() && self.categories.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleFile {
    schedules: Vec<Schedule>,
}

/// The set of user schedules, evaluated highest priority first.
#[derive(Debug, Clone, Default)]
pub struct ScheduleSet {
    schedules: BTreeMap<String, Schedule>,
}

impl ScheduleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Self {
        let mut set = Self::new();
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(_) => return set,
        };
        match serde_json::from_str::<ScheduleFile>(&data) {
            Ok(file) => {
                for s in file.schedules {
                    set.schedules.insert(s.id.clone(), s);
                }
            }
            Err(e) => warn!("failed to load schedules from {:?}: {}", path, e),
        }
        set
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = ScheduleFile {
            schedules: self.schedules.values().cloned().collect(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)
    }

    pub fn add(&mut self, mut schedule: Schedule) {
        let ts = now_rfc3339();
        schedule.created_at.get_or_insert_with(|| ts.clone());
        schedule.updated_at = Some(ts);
        self.schedules.insert(schedule.id.clone(), schedule);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.schedules.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Schedule> {
        self.schedules.get(id)
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Schedule> {
        self.schedules.values()
    }

    /// First active schedule targeting the domain/category, highest priority
    /// first, ties by lexicographic id.
    pub fn matching(
        &self,
        domain: &str,
        category: Option<&str>,
        dt: DateTime<Local>,
    ) -> Option<&Schedule> {
        let mut sorted: Vec<&Schedule> = self.schedules.values().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        sorted
            .into_iter()
            .find(|s| s.applies_to(domain, category) && s.is_active_at(dt))
    }
}

/// Built-in preset schedules mirroring common household policies.
pub fn preset(name: &str) -> Option<Schedule> {
    let weekdays = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ];
    let leisure: BTreeSet<String> = ["gaming", "streaming", "social_media"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let weekday_ranges = |range: TimeRange| -> BTreeMap<String, Vec<TimeRange>> {
        weekdays
            .iter()
            .map(|d| (weekday_key(*d).to_string(), vec![range]))
            .collect()
    };

    match name {
        "school_hours" => Some(Schedule {
            id: "preset_school_hours".to_string(),
            name: "School Hours".to_string(),
            kind: ScheduleKind::TimeRange,
            enabled: true,
            categories: leisure,
            domains: BTreeSet::new(),
            time_ranges: weekday_ranges(TimeRange::new(8, 0, 15, 0)),
            start_date: None,
            end_date: None,
            priority: 0,
            created_at: None,
            updated_at: None,
        }),
        "homework_time" => Some(Schedule {
            id: "preset_homework".to_string(),
            name: "Homework Time".to_string(),
            kind: ScheduleKind::TimeRange,
            enabled: true,
            categories: leisure,
            domains: BTreeSet::new(),
            time_ranges: weekday_ranges(TimeRange::new(16, 0, 18, 0)),
            start_date: None,
            end_date: None,
            priority: 0,
            created_at: None,
            updated_at: None,
        }),
        "bedtime" => Some(Schedule {
            id: "preset_bedtime".to_string(),
            name: "Bedtime".to_string(),
            kind: ScheduleKind::TimeRange,
            enabled: true,
            categories: leisure,
            domains: BTreeSet::new(),
            time_ranges: [
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ]
            .iter()
            .map(|d| (weekday_key(*d).to_string(), vec![TimeRange::new(21, 0, 7, 0)]))
            .collect(),
            start_date: None,
            end_date: None,
            priority: 0,
            created_at: None,
            updated_at: None,
        }),
        "weekday_strict" => Some(Schedule {
            id: "preset_weekday_strict".to_string(),
            name: "Weekday Strict Mode".to_string(),
            kind: ScheduleKind::AllowRange,
            enabled: true,
            categories: ["gaming", "streaming"].iter().map(|s| s.to_string()).collect(),
            domains: BTreeSet::new(),
            time_ranges: weekday_ranges(TimeRange::new(18, 0, 20, 0)),
            start_date: None,
            end_date: None,
            priority: 0,
            created_at: None,
            updated_at: None,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn homework() -> Schedule {
        let mut s = preset("homework_time").unwrap();
        s.id = "homework".to_string();
        s
    }

    #[test]
    fn test_time_range_normal() {
        let r = TimeRange::new(9, 0, 17, 0);
        assert!(r.contains(NaiveTime::from_hms_opt(9, 0, 0).unwrap()));
        assert!(r.contains(NaiveTime::from_hms_opt(12, 30, 0).unwrap()));
        assert!(!r.contains(NaiveTime::from_hms_opt(17, 1, 0).unwrap()));
        assert!(!r.contains(NaiveTime::from_hms_opt(8, 59, 0).unwrap()));
    }

    #[test]
    fn test_time_range_crossing_midnight() {
        // 22:00-07:00 is active at both 23:30 and 00:30.
        let r = TimeRange::new(22, 0, 7, 0);
        assert!(r.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(r.contains(NaiveTime::from_hms_opt(0, 30, 0).unwrap()));
        assert!(!r.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn test_homework_schedule_window() {
        // 2026-08-03 is a Monday.
        let s = homework();
        assert!(s.is_active_at(local(2026, 8, 3, 17, 0)));
        assert!(!s.is_active_at(local(2026, 8, 3, 18, 1)));
        // Saturday: no ranges listed, inactive.
        assert!(!s.is_active_at(local(2026, 8, 8, 17, 0)));
    }

    #[test]
    fn test_schedule_set_matching_category() {
        let mut set = ScheduleSet::new();
        set.add(homework());
        let hit = set.matching("steampowered.com", Some("gaming"), local(2026, 8, 3, 17, 0));
        assert_eq!(hit.map(|s| s.id.as_str()), Some("homework"));
        let miss = set.matching("steampowered.com", Some("gaming"), local(2026, 8, 3, 18, 1));
        assert!(miss.is_none());
    }

    #[test]
    fn test_allow_range_blocks_outside_window() {
        let mut s = preset("weekday_strict").unwrap();
        s.id = "strict".to_string();
        // Monday 19:00 is inside the allow window: not active.
        assert!(!s.is_active_at(local(2026, 8, 3, 19, 0)));
        // Monday 21:00 is outside: active.
        assert!(s.is_active_at(local(2026, 8, 3, 21, 0)));
    }

    #[test]
    fn test_priority_and_id_tiebreak() {
        let mut low = homework();
        low.id = "b_low".to_string();
        low.priority = 1;
        let mut high = homework();
        high.id = "a_high".to_string();
        high.priority = 5;
        let mut tie = homework();
        tie.id = "a_tie".to_string();
        tie.priority = 5;

        let mut set = ScheduleSet::new();
        set.add(low);
        set.add(high);
        set.add(tie);
        let hit = set.matching("", Some("gaming"), local(2026, 8, 3, 17, 0));
        assert_eq!(hit.map(|s| s.id.as_str()), Some("a_high"));
    }

    #[test]
    fn test_date_window() {
        let mut s = homework();
        s.start_date = NaiveDate::from_ymd_opt(2026, 9, 1);
        s.end_date = NaiveDate::from_ymd_opt(2026, 9, 30);
        assert!(!s.is_active_at(local(2026, 8, 3, 17, 0)));
        // 2026-09-07 is a Monday.
        assert!(s.is_active_at(local(2026, 9, 7, 17, 0)));
    }

    #[test]
    fn test_serde_roundtrip_preserves_schedule() {
        let s = homework();
        let json = serde_json::to_string(&s).unwrap();
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn test_load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        let mut set = ScheduleSet::new();
        set.add(homework());
        set.save(&path).unwrap();
        let loaded = ScheduleSet::load(&path);
        assert_eq!(loaded.len(), 1);
        assert!(loaded.get("homework").is_some());
    }
}
