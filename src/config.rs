use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{MINUTE_MS, Ms};

/// Scheduling knobs. The defaults are the marketplace's published rules; every
/// one of them can be overridden per deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Shortest free slot worth offering.
    pub min_slot_ms: Ms,
    /// How far in the past an immediate booking may start.
    pub immediate_grace_ms: Ms,
    /// Confirmed bookings starting within this horizon make the station busy now.
    pub imminent_window_ms: Ms,
    /// Assumed length of each queued walk-up session.
    pub queue_slot_minutes: i64,
    /// Earliest offered start for today, relative to now.
    pub today_lead_ms: Ms,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_slot_ms: 30 * MINUTE_MS,
            immediate_grace_ms: 10 * MINUTE_MS,
            imminent_window_ms: 30 * MINUTE_MS,
            queue_slot_minutes: 60,
            today_lead_ms: 30 * MINUTE_MS,
        }
    }
}

/// Per-tenant engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    /// Background reconciliation period. `None` leaves reconciliation to reads.
    pub sweep_interval: Option<Duration>,
    pub policy: Policy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sweep_interval: Some(Duration::from_secs(60)),
            policy: Policy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// How long shutdown waits for open connections to finish.
    pub drain_timeout: Duration,
    pub engine: EngineSettings,
}

impl Config {
    /// Read `CHARGESLOT_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let defaults = Policy::default();
        // Durations and horizons need at least a minute; offsets may be zero.
        let minutes = |key: &str, floor: i64, default: Ms| {
            parse_opt::<i64>(get(key))
                .map(|m| m.max(floor) * MINUTE_MS)
                .unwrap_or(default)
        };
        let policy = Policy {
            min_slot_ms: minutes("CHARGESLOT_MIN_SLOT_MINUTES", 1, defaults.min_slot_ms),
            immediate_grace_ms: minutes(
                "CHARGESLOT_IMMEDIATE_GRACE_MINUTES",
                0,
                defaults.immediate_grace_ms,
            ),
            imminent_window_ms: minutes(
                "CHARGESLOT_IMMINENT_WINDOW_MINUTES",
                1,
                defaults.imminent_window_ms,
            ),
            queue_slot_minutes: parse_opt::<i64>(get("CHARGESLOT_QUEUE_SLOT_MINUTES"))
                .map(|m| m.max(1))
                .unwrap_or(defaults.queue_slot_minutes),
            today_lead_ms: minutes("CHARGESLOT_TODAY_LEAD_MINUTES", 0, defaults.today_lead_ms),
        };

        let sweep_secs: u64 = parse_opt(get("CHARGESLOT_SWEEP_INTERVAL_SECS")).unwrap_or(60);
        let engine = EngineSettings {
            compact_threshold: parse_opt(get("CHARGESLOT_COMPACT_THRESHOLD")).unwrap_or(1000),
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            policy,
        };

        Self {
            bind: get("CHARGESLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_opt(get("CHARGESLOT_PORT")).unwrap_or(5433),
            data_dir: PathBuf::from(get("CHARGESLOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("CHARGESLOT_PASSWORD").unwrap_or_else(|| "chargeslot".into()),
            max_connections: parse_opt(get("CHARGESLOT_MAX_CONNECTIONS")).unwrap_or(256),
            metrics_port: parse_opt(get("CHARGESLOT_METRICS_PORT")),
            tls_cert: get("CHARGESLOT_TLS_CERT"),
            tls_key: get("CHARGESLOT_TLS_KEY"),
            drain_timeout: Duration::from_secs(
                parse_opt(get("CHARGESLOT_DRAIN_TIMEOUT_SECS")).unwrap_or(10),
            ),
            engine,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}
