use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the live pipeline and the server around it.
///
/// Every field can be overridden with a `LARKLINE_*` environment variable;
/// durations are given in (fractional) seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub host: String,
    pub port: u16,
    /// Bytes
    pub max_grammar_size: usize,
    /// Bytes
    pub max_text_length: usize,
    pub max_parse_time: Duration,
    pub debounce_delay: Duration,
    pub session_timeout: Duration,
    pub max_sessions: usize,
    pub parse_cache_size: usize,
    pub compiled_parser_limit: usize,
    pub compiled_parser_retain: usize,
    pub reaper_interval: Duration,
    pub reaper_retry_interval: Duration,
    pub reaper_lock_timeout: Duration,
    pub worker_threads: usize,
    /// Per-connection outbound message buffer
    pub outbound_buffer: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_grammar_size: 10 * 1024 * 1024,
            max_text_length: 1024 * 1024,
            max_parse_time: Duration::from_secs(30),
            debounce_delay: Duration::from_secs(1),
            session_timeout: Duration::from_secs(3600),
            max_sessions: 1000,
            parse_cache_size: 100,
            compiled_parser_limit: 50,
            compiled_parser_retain: 25,
            reaper_interval: Duration::from_secs(300),
            reaper_retry_interval: Duration::from_secs(60),
            reaper_lock_timeout: Duration::from_secs(5),
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            outbound_buffer: 64,
        }
    }
}

impl LiveConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Unparseable values are logged and
    /// ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("LARKLINE_HOST") {
            self.host = host;
        }
        override_parsed(&get, "LARKLINE_PORT", &mut self.port);
        override_parsed(&get, "LARKLINE_MAX_GRAMMAR_SIZE", &mut self.max_grammar_size);
        override_parsed(&get, "LARKLINE_MAX_TEXT_LENGTH", &mut self.max_text_length);
        override_secs(&get, "LARKLINE_MAX_PARSE_TIME", &mut self.max_parse_time);
        override_secs(&get, "LARKLINE_DEBOUNCE_DELAY", &mut self.debounce_delay);
        override_secs(&get, "LARKLINE_SESSION_TIMEOUT", &mut self.session_timeout);
        override_parsed(&get, "LARKLINE_MAX_SESSIONS", &mut self.max_sessions);
        override_parsed(&get, "LARKLINE_PARSE_CACHE_SIZE", &mut self.parse_cache_size);
        override_parsed(&get, "LARKLINE_COMPILED_PARSER_LIMIT", &mut self.compiled_parser_limit);
        override_parsed(&get, "LARKLINE_COMPILED_PARSER_RETAIN", &mut self.compiled_parser_retain);
        override_secs(&get, "LARKLINE_REAPER_INTERVAL", &mut self.reaper_interval);
        override_secs(&get, "LARKLINE_REAPER_RETRY_INTERVAL", &mut self.reaper_retry_interval);
        override_parsed(&get, "LARKLINE_WORKER_THREADS", &mut self.worker_threads);
        override_parsed(&get, "LARKLINE_OUTBOUND_BUFFER", &mut self.outbound_buffer);

        self.worker_threads = self.worker_threads.max(1);
        self.outbound_buffer = self.outbound_buffer.max(1);
        self.compiled_parser_retain = self.compiled_parser_retain.min(self.compiled_parser_limit);
        self
    }
}

fn override_parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = get(key) else { return };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring invalid configuration value"),
    }
}

fn override_secs(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let Some(raw) = get(key) else { return };
    match raw.trim().parse::<f64>().ok().and_then(|s| Duration::try_from_secs_f64(s).ok()) {
        Some(value) => *slot = value,
        None => tracing::warn!(key, value = %raw, "ignoring invalid duration"),
    }
}
