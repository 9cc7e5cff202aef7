//! Structured JSONL logging on stderr.
//!
//! Records carry a level, a domain for filtering, an event name, and
//! arbitrary fields. `LOG_LEVEL` sets the minimum level, `LOG_DOMAINS`
//! a comma-separated allowlist (or "all").

use std::sync::OnceLock;

use chrono::Utc;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Scheduler,
    Claim,
    Recovery,
    Store,
    Announce,
    System,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Scheduler => "scheduler",
            Domain::Claim => "claim",
            Domain::Recovery => "recovery",
            Domain::Store => "store",
            Domain::Announce => "announce",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

static MIN_LEVEL: OnceLock<Level> = OnceLock::new();

fn min_level() -> Level {
    *MIN_LEVEL.get_or_init(Level::from_env)
}

pub fn log_at(level: Level, domain: Domain, event: &str, mut fields: Map<String, Value>) {
    if level < min_level() || !domain.is_enabled() {
        return;
    }
    fields.insert("ts".to_string(), Value::String(Utc::now().to_rfc3339()));
    fields.insert("level".to_string(), Value::String(level.as_str().to_string()));
    fields.insert("domain".to_string(), Value::String(domain.as_str().to_string()));
    fields.insert("event".to_string(), Value::String(event.to_string()));
    eprintln!("{}", Value::Object(fields));
}

pub fn debug(domain: Domain, event: &str, fields: Map<String, Value>) {
    log_at(Level::Debug, domain, event, fields);
}

pub fn info(domain: Domain, event: &str, fields: Map<String, Value>) {
    log_at(Level::Info, domain, event, fields);
}

pub fn warn(domain: Domain, event: &str, fields: Map<String, Value>) {
    log_at(Level::Warn, domain, event, fields);
}

pub fn error(domain: Domain, event: &str, fields: Map<String, Value>) {
    log_at(Level::Error, domain, event, fields);
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_int(n: i64) -> Value {
    Value::Number(n.into())
}

pub fn v_bool(b: bool) -> Value {
    Value::Bool(b)
}
