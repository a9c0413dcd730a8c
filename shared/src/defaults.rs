//! Default values for task-family records and the agent's tunables.
//!
//! Centralized the same way the teacher centralizes `#[serde(default =
//! "...")]` targets, so every default lives in one place instead of being
//! repeated at each call site.

use crate::config::ScheduleExpr;

pub fn default_schedule_expr() -> ScheduleExpr {
    ScheduleExpr::Always
}

pub fn default_scrape_method() -> String {
    "GET".to_string()
}

/// §4.1 EventLoop poll timeout, `agent.poll.timeout` default (microseconds
/// in the CLI-adjacent key, milliseconds here for `mio`'s poll API).
pub const EVENT_LOOP_POLL_TIMEOUT_MS: u64 = 10;

/// §4.1 threshold above which a handler's `OnReadable` is logged as a long
/// handler warning.
pub const LONG_HANDLER_WARNING_MS: u64 = 50;

/// §4.2 NetEndpoint default per-endpoint timeout.
pub const NET_ENDPOINT_TIMEOUT_SECS: u64 = 3;

/// §4.3 maximum TLV body length (64 MiB).
pub const TLV_MAX_BODY_LEN: u32 = 64 * 1024 * 1024;

/// §4.3 TLV header length (type u16 + length u32).
pub const TLV_HEADER_LEN: usize = 6;

/// §4.5 default per-sink bounded queue capacity.
pub const SINK_QUEUE_CAPACITY: usize = 1000;

/// §4.5 default window during which an identical sink error is suppressed.
pub const SINK_ERROR_SUPPRESS_SECS: u64 = 3600;

/// §4.6 ModuleScheduler shared base tick factor.
pub const MODULE_SCHEDULE_FACTOR_MS: u64 = 100;

/// §4.6 overrun multiplier: `execDuration > N * interval` counts as an
/// overrun.
pub const OVERRUN_MULTIPLIER: u32 = 3;

/// §4.6 consecutive overruns before a task is skipped for that many ticks.
pub const EXCEED_SKIP_THRESHOLD: u32 = 3;

/// §4.7 default max captured-output length before `E_OutputTooLong`.
pub const SCRIPT_MAX_OUTPUT_LEN: usize = 64 * 1024;

/// §4.7 default max concurrently running script children.
pub const SCRIPT_MAX_PROCS: usize = 10;

/// §4.9 shared probe scheduling tick.
pub const PROBE_SCHEDULE_UNIT_MS: u64 = 100;

/// §4.9 probe worker pool sizing (thread_num, max_thread_num).
pub const PROBE_THREAD_NUM: usize = 5;
pub const PROBE_MAX_THREAD_NUM: usize = 10;

/// §4.10 IngressHTTP default bind address.
pub const HTTP_INGRESS_DEFAULT_IP: &str = "127.0.0.1";
pub const HTTP_INGRESS_DEFAULT_PORT: u16 = 15777;
pub const HTTP_INGRESS_MAX_CONNECTIONS: usize = 100;

/// §4.12 ResourceMonitor leaderboard size.
pub const RESOURCE_MONITOR_TOP_N: usize = 20;

/// §4.13 default ConfigWatcher poll interval.
pub const CONFIG_WATCH_INTERVAL_SECS: u64 = 10;

/// §5 default worker pool size per scheduler family.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;

/// §5 default graceful shutdown grace period.
pub const GRACEFUL_SHUTDOWN_SECS: u64 = 10;
