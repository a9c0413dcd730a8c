//! Task family records committed by `ConfigSource` and owned by `TaskRegistry`.
//!
//! These mirror §3 DATA MODEL exactly: four families (`ModuleTask`,
//! `ScriptTask`, `ScrapeTask`, `ProbeTask`), each carrying an `outputs[]`
//! list of `(sinkName, sinkConfig)` pairs that `ChannelManager` resolves at
//! send time. Validation here enforces invariants R1-R3; it never touches
//! execution.

use crate::error::MonitoringError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;

/// One `(sinkName, sinkConfig)` pair. `sinkConfig` is opaque here — per §1,
/// concrete sink payload serialization is out of scope for this crate; only
/// `ChannelManager` and the sink implementation interpret it.
pub type Output = (String, JsonValue);

/// A time-of-day window, inclusive of `start_seconds`, exclusive of
/// `end_seconds`, measured from local midnight. Wraps past midnight when
/// `end_seconds < start_seconds` (e.g. a window covering 22:00-06:00).
/// `None` in a task record means "always".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_seconds: u32,
    pub end_seconds: u32,
}

impl TimeWindow {
    pub fn contains(&self, seconds_of_day: u32) -> bool {
        if self.start_seconds == self.end_seconds {
            return true; // degenerate window means "always"
        }
        if self.start_seconds < self.end_seconds {
            seconds_of_day >= self.start_seconds && seconds_of_day < self.end_seconds
        } else {
            seconds_of_day >= self.start_seconds || seconds_of_day < self.end_seconds
        }
    }
}

/// R3 — cron compatibility without calendar math in the hot path. `"*"`
/// parses to `Always`; otherwise a comma-separated list of inclusive hour
/// ranges such as `"8-18,20-22"` (UTC hour-of-day).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExpr {
    Always,
    HourRanges(Vec<(u8, u8)>),
}

impl ScheduleExpr {
    pub fn matches_hour(&self, hour: u8) -> bool {
        match self {
            ScheduleExpr::Always => true,
            ScheduleExpr::HourRanges(ranges) => ranges.iter().any(|(a, b)| {
                if a <= b {
                    hour >= *a && hour <= *b
                } else {
                    hour >= *a || hour <= *b
                }
            }),
        }
    }
}

impl std::str::FromStr for ScheduleExpr {
    type Err = MonitoringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(ScheduleExpr::Always);
        }
        let mut ranges = Vec::new();
        for part in s.split(',') {
            let (lo, hi) = part
                .split_once('-')
                .ok_or_else(|| MonitoringError::EConfig(format!("bad scheduleExpr range: {part}")))?;
            let lo: u8 = lo
                .trim()
                .parse()
                .map_err(|_| MonitoringError::EConfig(format!("bad scheduleExpr hour: {lo}")))?;
            let hi: u8 = hi
                .trim()
                .parse()
                .map_err(|_| MonitoringError::EConfig(format!("bad scheduleExpr hour: {hi}")))?;
            if lo > 23 || hi > 23 {
                return Err(MonitoringError::EConfig(format!(
                    "scheduleExpr hour out of range: {part}"
                )));
            }
            ranges.push((lo, hi));
        }
        Ok(ScheduleExpr::HourRanges(ranges))
    }
}

impl Serialize for ScheduleExpr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = match self {
            ScheduleExpr::Always => "*".to_string(),
            ScheduleExpr::HourRanges(ranges) => ranges
                .iter()
                .map(|(a, b)| format!("{a}-{b}"))
                .collect::<Vec<_>>()
                .join(","),
        };
        serializer.serialize_str(&s)
    }
}

impl<'de> Deserialize<'de> for ScheduleExpr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Optional request/response keyword match used by TCP-connect and HTTP
/// probes (§4.9): after connect, send `request_body` and read; if the
/// response contains `keyword` emit OK, negated if `negative`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRule {
    #[serde(default)]
    pub request_body: Option<String>,
    pub keyword: String,
    #[serde(default)]
    pub negative: bool,
}

/// `moduleTask.json` / `baseMetric.json` / `cmsProcess.json` / `cmsTopN.json`
/// records (§3, §6). The latter three are accepted under the same record
/// shape — the original system split them into separate files purely for
/// operational convenience, not a type distinction (SPEC_FULL.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleTask {
    pub id: String,
    pub name: String,
    /// Seconds between collections.
    pub interval: u32,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    #[serde(default = "crate::defaults::default_schedule_expr")]
    pub schedule_expr: ScheduleExpr,
    /// Opaque arguments passed to the `Collector` implementation named by
    /// `name` (platform sensor acquisition is an external `SystemProbe`
    /// capability per §1 — this crate only carries the args through).
    #[serde(default)]
    pub args: JsonValue,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

impl ModuleTask {
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() {
            return Err(MonitoringError::EConfig("ModuleTask id is empty".into()).into());
        }
        if self.interval < 1 {
            return Err(MonitoringError::EConfig(format!(
                "ModuleTask '{}': interval must be >= 1",
                self.id
            ))
            .into());
        }
        Ok(())
    }
}

/// Format a script's captured output is parsed into (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultFormat {
    Raw,
    Prometheus,
    Json,
    Text,
    RawJson,
}

/// `scriptTask.json` records (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptTask {
    pub id: String,
    pub name: String,
    /// Full command line, split into argv by the scheduler at spawn time.
    pub command: String,
    #[serde(default)]
    pub user: Option<String>,
    pub interval: u32,
    /// Seconds until the scheduler sends SIGKILL to a still-running child.
    pub timeout: u32,
    #[serde(default)]
    pub first_schedule: Option<u64>,
    pub result_format: ResultFormat,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub labels: Vec<(String, String)>,
    /// 0 = never attach status, 1 = attach on parse success, 2 = always
    /// attach raw output alongside the status (§4.7 PROMETHEUS branch).
    #[serde(default)]
    pub report_status: u8,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

impl ScriptTask {
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() {
            return Err(MonitoringError::EConfig("ScriptTask id is empty".into()).into());
        }
        if self.interval < 1 {
            return Err(MonitoringError::EConfig(format!(
                "ScriptTask '{}': interval must be >= 1",
                self.id
            ))
            .into());
        }
        if self.command.trim().is_empty() {
            return Err(MonitoringError::EConfig(format!(
                "ScriptTask '{}': command must not be empty",
                self.id
            ))
            .into());
        }
        if self.report_status > 2 {
            return Err(MonitoringError::EConfig(format!(
                "ScriptTask '{}': reportStatus must be 0, 1 or 2",
                self.id
            ))
            .into());
        }
        Ok(())
    }
}

/// The two decoders `ScrapeScheduler` supports (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScrapeType {
    Prom,
    JsonMetric,
}

/// `exporterTask.json` records (§3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub id: String,
    /// Scrape targets are tried in order on failure (failover); the first
    /// is the initial `activeIndex`.
    pub target: Vec<String>,
    pub path: String,
    #[serde(default = "crate::defaults::default_scrape_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub interval: u32,
    pub timeout: u32,
    #[serde(rename = "type")]
    pub scrape_type: ScrapeType,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub labels: Vec<(String, String)>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub emit_status: bool,
}

impl ScrapeTask {
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() {
            return Err(MonitoringError::EConfig("ScrapeTask id is empty".into()).into());
        }
        if self.target.is_empty() {
            return Err(MonitoringError::EConfig(format!(
                "ScrapeTask '{}': at least one target is required",
                self.id
            ))
            .into());
        }
        if self.interval < 1 {
            return Err(MonitoringError::EConfig(format!(
                "ScrapeTask '{}': interval must be >= 1",
                self.id
            ))
            .into());
        }
        for t in &self.target {
            crate::utils::validate_url(&format!("{}{}", t, self.path), false).map_err(|e| {
                MonitoringError::EConfig(format!("ScrapeTask '{}': {}", self.id, e))
            })?;
        }
        Ok(())
    }
}

/// The three probe kinds from §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    Ping,
    TcpConnect,
    Http,
}

/// `cmsDetect.json` records (§3, §4.9). All three kinds share this record
/// shape; `kind` only changes how `ProbeScheduler` executes the tick, never
/// the record fields — there's no per-kind parameter payload to disambiguate
/// up front the way the teacher's `TaskParams` needed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTask {
    pub id: String,
    pub kind: ProbeKind,
    /// Ping/TCP: `host` or `host:port`. HTTP: a full URL.
    pub destination: String,
    pub interval: u32,
    pub timeout: u32,
    #[serde(default)]
    pub match_rules: Option<MatchRule>,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
}

impl ProbeTask {
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() {
            return Err(MonitoringError::EConfig("ProbeTask id is empty".into()).into());
        }
        if self.destination.trim().is_empty() {
            return Err(MonitoringError::EConfig(format!(
                "ProbeTask '{}': destination must not be empty",
                self.id
            ))
            .into());
        }
        if self.interval < 1 {
            return Err(MonitoringError::EConfig(format!(
                "ProbeTask '{}': interval must be >= 1",
                self.id
            ))
            .into());
        }
        if self.kind == ProbeKind::Http {
            crate::utils::validate_url(&self.destination, false).map_err(|e| {
                MonitoringError::EConfig(format!("ProbeTask '{}': {}", self.id, e))
            })?;
        }
        Ok(())
    }
}

/// One family's worth of task records plus the fingerprint `ConfigWatcher`
/// hashed it from. `TaskRegistry` holds one of these per family behind an
/// `ArcSwap`-style snapshot handoff (see `agent::registry`).
#[derive(Debug, Clone)]
pub struct TasksSnapshot<T> {
    pub tasks: Vec<T>,
    pub fingerprint: String,
}

impl<T> TasksSnapshot<T> {
    pub fn new(tasks: Vec<T>, fingerprint: String) -> Self {
        Self { tasks, fingerprint }
    }
}

/// R1 — id uniqueness within one family. Generic over any record with an
/// `id` accessor so every family's `ConfigWatcher` reload path can share it.
pub fn validate_unique_ids<'a, T>(
    family: &str,
    tasks: &'a [T],
    id_of: impl Fn(&'a T) -> &'a str,
) -> crate::Result<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        let id = id_of(task);
        if !seen.insert(id) {
            return Err(MonitoringError::EConfig(format!(
                "{family}: duplicate task id '{id}'"
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_expr_always() {
        assert_eq!("*".parse::<ScheduleExpr>().unwrap(), ScheduleExpr::Always);
        assert!(ScheduleExpr::Always.matches_hour(3));
    }

    #[test]
    fn schedule_expr_ranges() {
        let expr: ScheduleExpr = "8-18,20-22".parse().unwrap();
        assert!(expr.matches_hour(9));
        assert!(expr.matches_hour(21));
        assert!(!expr.matches_hour(23));
    }

    #[test]
    fn schedule_expr_wrap_around() {
        let expr: ScheduleExpr = "22-4".parse().unwrap();
        assert!(expr.matches_hour(23));
        assert!(expr.matches_hour(1));
        assert!(!expr.matches_hour(12));
    }

    #[test]
    fn time_window_wrap_around() {
        let w = TimeWindow {
            start_seconds: 22 * 3600,
            end_seconds: 6 * 3600,
        };
        assert!(w.contains(23 * 3600));
        assert!(w.contains(1));
        assert!(!w.contains(12 * 3600));
    }

    #[test]
    fn module_task_rejects_zero_interval() {
        let task = ModuleTask {
            id: "m1".into(),
            name: "cpu".into(),
            interval: 0,
            time_window: None,
            schedule_expr: ScheduleExpr::Always,
            args: JsonValue::Null,
            outputs: vec![],
        };
        assert!(task.validate().is_err());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let tasks = vec![
            ModuleTask {
                id: "dup".into(),
                name: "a".into(),
                interval: 10,
                time_window: None,
                schedule_expr: ScheduleExpr::Always,
                args: JsonValue::Null,
                outputs: vec![],
            },
            ModuleTask {
                id: "dup".into(),
                name: "b".into(),
                interval: 10,
                time_window: None,
                schedule_expr: ScheduleExpr::Always,
                args: JsonValue::Null,
                outputs: vec![],
            },
        ];
        let err = validate_unique_ids("module", &tasks, |t| t.id.as_str());
        assert!(err.is_err());
    }
}
