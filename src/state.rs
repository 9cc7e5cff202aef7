/// Process-wide configuration. Every knob is an env var with a default so a
/// bare `hauntkeeper` invocation comes up with sane settings.
#[derive(Clone, Debug)]
pub struct Config {
    /// Seconds after a reveal during which a fetch can still succeed.
    pub claim_window_secs: i64,
    /// Fixed delay used for the first haunting after setup or resume.
    pub bootstrap_delay_secs: i64,
    pub sqlite_path: String,
    /// Root directory holding per-community `<id>/souls.json` catalogs.
    pub souls_dir: String,
    pub liveness_check_secs: u64,
    /// Slack added on top of a community's next appearance time before the
    /// liveness scan reports it as stalled.
    pub liveness_grace_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            claim_window_secs: 15,
            bootstrap_delay_secs: 60,
            sqlite_path: "./hauntkeeper.sqlite".to_string(),
            souls_dir: "./souls".to_string(),
            liveness_check_secs: 300,
            liveness_grace_secs: 120,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            claim_window_secs: env_parse("CLAIM_WINDOW_SECS", d.claim_window_secs),
            bootstrap_delay_secs: env_parse("BOOTSTRAP_DELAY_SECS", d.bootstrap_delay_secs),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            souls_dir: std::env::var("SOULS_DIR").unwrap_or(d.souls_dir),
            liveness_check_secs: env_parse("LIVENESS_CHECK_SECS", d.liveness_check_secs),
            liveness_grace_secs: env_parse("LIVENESS_GRACE_SECS", d.liveness_grace_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
