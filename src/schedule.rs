//! Schedule sources for the scheduled run mode.
//!
//! A source yields wall-clock trigger times (flight arrivals) and an optional
//! per-trigger session size. Entries already in the past at planning time are
//! dropped; the rest become [`ScheduledTrigger`]s owned by the orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{PanelError, PanelResult};

/// One entry as it appears in a feed or in the panel config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    /// RFC 3339 timestamp, or "HH:MM" / "HH:MM:SS" meaning today, local time.
    pub arrival: String,
    #[serde(default)]
    pub session_size: Option<u32>,
    #[serde(default, alias = "flightNumber")]
    pub flight: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedDocument {
    List(Vec<FeedEntry>),
    Wrapped { flights: Vec<FeedEntry> },
}

/// A resolved schedule entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub clock_time: DateTime<Utc>,
    #[serde(default)]
    pub session_size: Option<u32>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTrigger {
    pub trigger_time: DateTime<Utc>,
    pub session_size: u32,
    pub has_fired: bool,
    pub label: Option<String>,
}

impl ScheduledTrigger {
    /// Delay from `now` until this trigger should fire; zero if overdue.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        (self.trigger_time - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Parse an arrival field relative to `today` (local time).
pub fn parse_clock_time(raw: &str, today: DateTime<Local>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    let time = NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()?;
    let local = today.date_naive().and_time(time);
    Local
        .from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Resolve raw feed entries, skipping ones whose arrival cannot be parsed.
pub fn resolve_entries(raw: &[FeedEntry], today: DateTime<Local>) -> Vec<ScheduleEntry> {
    raw.iter()
        .filter_map(|entry| match parse_clock_time(&entry.arrival, today) {
            Some(clock_time) => Some(ScheduleEntry {
                clock_time,
                session_size: entry.session_size,
                label: entry.flight.clone(),
            }),
            None => {
                debug!(arrival = %entry.arrival, "skipping unparseable arrival time");
                None
            }
        })
        .collect()
}

/// Result of turning fetched entries into triggers.
#[derive(Debug, Clone, Default)]
pub struct TriggerPlan {
    pub triggers: Vec<ScheduledTrigger>,
    pub discarded: Vec<ScheduleEntry>,
}

/// Sort entries, drop the ones at or before `now`, keep at most `limit`.
pub fn plan_triggers(
    mut entries: Vec<ScheduleEntry>,
    now: DateTime<Utc>,
    default_size: u32,
    limit: usize,
) -> TriggerPlan {
    entries.sort_by_key(|e| e.clock_time);
    let mut plan = TriggerPlan::default();

    for entry in entries {
        if entry.clock_time <= now {
            plan.discarded.push(entry);
            continue;
        }
        if plan.triggers.len() == limit {
            break;
        }
        plan.triggers.push(ScheduledTrigger {
            trigger_time: entry.clock_time,
            session_size: entry.session_size.unwrap_or(default_size).max(1),
            has_fired: false,
            label: entry.label,
        });
    }
    plan
}

#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn fetch(&self) -> PanelResult<Vec<ScheduleEntry>>;

    /// Human-readable origin for log lines.
    fn describe(&self) -> String;
}

/// Entries listed in the panel config.
#[derive(Debug, Clone, Default)]
pub struct StaticScheduleSource {
    entries: Vec<FeedEntry>,
}

impl StaticScheduleSource {
    pub fn new(entries: Vec<FeedEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl ScheduleSource for StaticScheduleSource {
    async fn fetch(&self) -> PanelResult<Vec<ScheduleEntry>> {
        Ok(resolve_entries(&self.entries, Local::now()))
    }

    fn describe(&self) -> String {
        format!("static schedule ({} entries)", self.entries.len())
    }
}

/// Flight arrivals fetched from a JSON endpoint.
pub struct HttpScheduleSource {
    url: String,
    client: reqwest::Client,
}

impl HttpScheduleSource {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> PanelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PanelError::Schedule(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl ScheduleSource for HttpScheduleSource {
    async fn fetch(&self) -> PanelResult<Vec<ScheduleEntry>> {
        info!(url = %self.url, "fetching flight schedule");

        let doc: FeedDocument = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| PanelError::Schedule(format!("request to {} failed: {}", self.url, e)))?
            .json()
            .await
            .map_err(|e| PanelError::Schedule(format!("invalid schedule feed: {e}")))?;

        let raw = match doc {
            FeedDocument::List(entries) => entries,
            FeedDocument::Wrapped { flights } => flights,
        };
        Ok(resolve_entries(&raw, Local::now()))
    }

    fn describe(&self) -> String {
        format!("flight feed {}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry(offset_secs: i64, size: Option<u32>) -> ScheduleEntry {
        ScheduleEntry {
            clock_time: Utc::now() + ChronoDuration::seconds(offset_secs),
            session_size: size,
            label: None,
        }
    }

    #[test]
    fn parses_rfc3339_and_clock_forms() {
        let today = Local::now();
        let ts = parse_clock_time("2026-03-01T10:15:00Z", today).unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T10:15:00+00:00");

        let clock = parse_clock_time("07:30", today).unwrap();
        assert_eq!(
            clock.with_timezone(&Local).format("%H:%M").to_string(),
            "07:30"
        );
        assert!(parse_clock_time("7 thirty", today).is_none());
    }

    #[test]
    fn plan_discards_past_entries() {
        let now = Utc::now();
        let plan = plan_triggers(
            vec![entry(60, Some(3)), entry(-60, None), entry(30, None)],
            now,
            2,
            10,
        );
        assert_eq!(plan.discarded.len(), 1);
        assert_eq!(plan.triggers.len(), 2);
        // Sorted by time, default size applied.
        assert_eq!(plan.triggers[0].session_size, 2);
        assert_eq!(plan.triggers[1].session_size, 3);
        assert!(plan.triggers.iter().all(|t| !t.has_fired));
    }

    #[test]
    fn plan_respects_limit() {
        let plan = plan_triggers(
            vec![entry(10, None), entry(20, None), entry(30, None)],
            Utc::now(),
            1,
            2,
        );
        assert_eq!(plan.triggers.len(), 2);
    }

    #[test]
    fn delay_is_zero_when_overdue() {
        let trigger = ScheduledTrigger {
            trigger_time: Utc::now() - ChronoDuration::seconds(5),
            session_size: 1,
            has_fired: false,
            label: None,
        };
        assert_eq!(trigger.delay_from(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn feed_accepts_list_and_wrapped_forms() {
        let list: FeedDocument =
            serde_json::from_str(r#"[{"arrival":"10:00","sessionSize":2,"flight":"LH400"}]"#)
                .unwrap();
        assert!(matches!(list, FeedDocument::List(ref v) if v.len() == 1));

        let wrapped: FeedDocument =
            serde_json::from_str(r#"{"flights":[{"arrival":"10:00","flightNumber":"BA1"}]}"#)
                .unwrap();
        match wrapped {
            FeedDocument::Wrapped { flights } => {
                assert_eq!(flights[0].flight.as_deref(), Some("BA1"))
            }
            _ => panic!("expected wrapped feed"),
        }
    }

    #[tokio::test]
    async fn static_source_resolves_entries() {
        let source = StaticScheduleSource::new(vec![
            FeedEntry {
                arrival: "2030-01-01T00:00:00Z".into(),
                session_size: Some(4),
                flight: Some("AF1".into()),
            },
            FeedEntry {
                arrival: "garbage".into(),
                session_size: None,
                flight: None,
            },
        ]);
        let entries = source.fetch().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label.as_deref(), Some("AF1"));
    }
}
