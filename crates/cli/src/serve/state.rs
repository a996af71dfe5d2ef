//! Application state shared across request handlers.

use std::sync::Arc;
use std::time::Instant;

use larkline_live::{Coordinator, LiveConfig, ParserCache, SessionStore};

pub(crate) struct AppState {
    pub(crate) config: LiveConfig,
    pub(crate) cache: Arc<ParserCache>,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) coordinator: Arc<Coordinator>,
    /// Process start, for uptime reporting.
    pub(crate) started: Instant,
}
