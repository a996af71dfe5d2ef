//! Session store and reaper.
//!
//! Sessions live in a map guarded by a [`RwLock`]; each session has its own
//! [`Mutex`]. Callers hold the map read lock while they lock a session, so
//! the reaper (which takes the write lock) never removes a session between
//! lookup and mutation. No lock is ever held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LiveConfig;
use crate::error::{LiveError, LiveResult};
use crate::model::{ParseResult, ParseSettings, SessionInfo, SettingsPatch};
use crate::protocol::ServerMessage;

// ──────────────────────────────────────────────
// Connections
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Consecutive dropped messages after which a connection counts as stalled.
pub const STALL_LIMIT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Outbound buffer full; this message was dropped.
    Full,
    /// Buffer full [`STALL_LIMIT`] times in a row; the client is not reading.
    Stalled,
    /// Receiver gone; the connection is dead.
    Closed,
}

/// Sending half of one client connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<ServerMessage>>,
    dropped: Arc<AtomicU32>,
}

impl ConnectionHandle {
    /// A new handle and the receiver its writer task drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Arc<ServerMessage>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            ConnectionHandle {
                id: ConnectionId::next(),
                tx,
                dropped: Arc::new(AtomicU32::new(0)),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, message: Arc<ServerMessage>) -> Delivery {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.dropped.store(0, Ordering::Relaxed);
                Delivery::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) + 1 >= STALL_LIMIT {
                    Delivery::Stalled
                } else {
                    Delivery::Full
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

// ──────────────────────────────────────────────
// Sessions
// ──────────────────────────────────────────────

/// Editable content of a session at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContent {
    pub grammar: String,
    pub text: String,
    pub settings: ParseSettings,
}

impl SessionContent {
    /// Both grammar and text are present.
    pub fn is_ready(&self) -> bool {
        !self.grammar.is_empty() && !self.text.is_empty()
    }
}

#[derive(Debug)]
struct Session {
    id: String,
    created_at: OffsetDateTime,
    last_activity: Instant,
    grammar: String,
    text: String,
    settings: ParseSettings,
    last_result: Option<Arc<ParseResult>>,
    subscribers: Vec<ConnectionHandle>,
}

impl Session {
    fn new(id: &str) -> Self {
        Session {
            id: id.to_string(),
            created_at: OffsetDateTime::now_utc(),
            last_activity: Instant::now(),
            grammar: String::new(),
            text: String::new(),
            settings: ParseSettings::default(),
            last_result: None,
            subscribers: Vec::new(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = self.last_activity.max(Instant::now());
    }

    fn content(&self) -> SessionContent {
        SessionContent {
            grammar: self.grammar.clone(),
            text: self.text.clone(),
            settings: self.settings.clone(),
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            connection_count: self.subscribers.len(),
            has_grammar: !self.grammar.is_empty(),
            has_text: !self.text.is_empty(),
            settings: self.settings.clone(),
            created_at: self.created_at,
            has_result: self.last_result.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub total_connections: usize,
    /// Sessions with at least one connection
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: usize,
    pub evicted: usize,
    pub remaining: usize,
}

type SessionMap = HashMap<String, Arc<Mutex<Session>>>;

pub struct SessionStore {
    sessions: RwLock<SessionMap>,
    session_timeout: Duration,
    max_sessions: usize,
    reaper_interval: Duration,
    reaper_retry_interval: Duration,
    reaper_lock_timeout: Duration,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(config: &LiveConfig) -> Self {
        SessionStore {
            sessions: RwLock::new(HashMap::new()),
            session_timeout: config.session_timeout,
            max_sessions: config.max_sessions,
            reaper_interval: config.reaper_interval,
            reaper_retry_interval: config.reaper_retry_interval,
            reaper_lock_timeout: config.reaper_lock_timeout,
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        }
    }

    /// Run `f` on session `id`, creating it first if needed.
    fn with_session<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> R {
        {
            let sessions = self.sessions.read();
            if let Some(session) = sessions.get(id) {
                let mut session = session.lock();
                session.touch();
                return f(&mut session);
            }
        }

        let mut sessions = self.sessions.write();
        let session = sessions.entry(id.to_string()).or_insert_with(|| {
            tracing::info!(session = id, "session created");
            Arc::new(Mutex::new(Session::new(id)))
        });
        let mut session = session.lock();
        session.touch();
        f(&mut session)
    }

    /// Run `f` on session `id` if it exists.
    fn with_existing<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let sessions = self.sessions.read();
        let mut session = sessions.get(id)?.lock();
        session.touch();
        Some(f(&mut session))
    }

    pub fn get_or_create(&self, id: &str) -> SessionInfo {
        self.with_session(id, |s| s.info())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace whichever parts are given and return the resulting content.
    pub fn update_content(
        &self,
        id: &str,
        grammar: Option<String>,
        text: Option<String>,
        settings: Option<ParseSettings>,
    ) -> SessionContent {
        self.with_session(id, |s| {
            if let Some(grammar) = grammar {
                s.grammar = grammar;
            }
            if let Some(text) = text {
                s.text = text;
            }
            if let Some(settings) = settings {
                s.settings = settings;
            }
            s.content()
        })
    }

    pub fn patch_settings(&self, id: &str, patch: &SettingsPatch) -> SessionContent {
        self.with_session(id, |s| {
            patch.apply(&mut s.settings);
            s.content()
        })
    }

    pub fn content(&self, id: &str) -> Option<SessionContent> {
        self.with_existing(id, |s| s.content())
    }

    pub fn info(&self, id: &str) -> Option<SessionInfo> {
        self.with_existing(id, |s| s.info())
    }

    /// Store the latest result. Returns false when the session is gone.
    pub fn set_last_result(&self, id: &str, result: Arc<ParseResult>) -> bool {
        self.with_existing(id, |s| s.last_result = Some(result)).is_some()
    }

    pub fn last_result(&self, id: &str) -> Option<Arc<ParseResult>> {
        self.with_existing(id, |s| s.last_result.clone()).flatten()
    }

    // ──────────────────────────────────────────────
    // Subscribers
    // ──────────────────────────────────────────────

    pub fn subscribe(&self, id: &str, handle: ConnectionHandle) -> SessionInfo {
        let connection = handle.id();
        let info = self.with_session(id, |s| {
            if !s.subscribers.iter().any(|h| h.id() == connection) {
                s.subscribers.push(handle);
            }
            s.info()
        });
        tracing::debug!(session = id, %connection, connections = info.connection_count, "subscribed");
        info
    }

    /// Unknown sessions and connections are ignored.
    pub fn unsubscribe(&self, id: &str, connection: ConnectionId) {
        let removed = self.with_existing(id, |s| {
            let before = s.subscribers.len();
            s.subscribers.retain(|h| h.id() != connection);
            before != s.subscribers.len()
        });
        if removed == Some(true) {
            tracing::debug!(session = id, %connection, "unsubscribed");
        }
    }

    /// Send `message` to every subscriber. Returns how many accepted it.
    pub fn broadcast(&self, id: &str, message: ServerMessage) -> usize {
        self.deliver(id, Arc::new(message), None)
    }

    /// Send `message` to every subscriber except `skip`.
    pub fn broadcast_except(&self, id: &str, message: ServerMessage, skip: ConnectionId) -> usize {
        self.deliver(id, Arc::new(message), Some(skip))
    }

    fn deliver(&self, id: &str, message: Arc<ServerMessage>, skip: Option<ConnectionId>) -> usize {
        let Some(targets) = self.with_existing(id, |s| s.subscribers.clone()) else {
            return 0;
        };

        let mut sent = 0;
        let mut dead = Vec::new();
        for handle in targets.iter().filter(|h| Some(h.id()) != skip) {
            match handle.send(message.clone()) {
                Delivery::Sent => sent += 1,
                Delivery::Full => {
                    tracing::warn!(session = id, connection = %handle.id(), kind = message.kind(), "outbound buffer full, message dropped");
                }
                Delivery::Stalled => {
                    tracing::warn!(session = id, connection = %handle.id(), limit = STALL_LIMIT, "connection stalled, unsubscribing");
                    dead.push(handle.id());
                }
                Delivery::Closed => dead.push(handle.id()),
            }
        }

        if !dead.is_empty() {
            self.with_existing(id, |s| s.subscribers.retain(|h| !dead.contains(&h.id())));
            tracing::debug!(session = id, removed = dead.len(), "dropped dead connections");
        }
        sent
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read();
        let mut stats = SessionStats {
            total_sessions: sessions.len(),
            total_connections: 0,
            active_sessions: 0,
        };
        for session in sessions.values() {
            let count = session.lock().subscribers.len();
            stats.total_connections += count;
            if count > 0 {
                stats.active_sessions += 1;
            }
        }
        stats
    }

    // ──────────────────────────────────────────────
    // Reaping
    // ──────────────────────────────────────────────

    pub fn reap_once(&self) -> LiveResult<ReapReport> {
        self.reap_at(Instant::now())
    }

    /// Remove idle sessions as of `now`, then enforce the population cap.
    /// Sessions with subscribers are never removed.
    pub fn reap_at(&self, now: Instant) -> LiveResult<ReapReport> {
        let mut sessions = self
            .sessions
            .try_write_for(self.reaper_lock_timeout)
            .ok_or(LiveError::ReaperBusy {
                timeout_ms: self.reaper_lock_timeout.as_millis() as u64,
            })?;

        let mut idle: Vec<(Instant, String)> = Vec::new();
        let mut expired = Vec::new();
        for (id, session) in sessions.iter() {
            let session = session.lock();
            if !session.subscribers.is_empty() {
                continue;
            }
            if now.saturating_duration_since(session.last_activity) > self.session_timeout {
                expired.push(id.clone());
            } else {
                idle.push((session.last_activity, id.clone()));
            }
        }
        for id in &expired {
            sessions.remove(id);
        }

        let mut evicted = 0;
        if sessions.len() > self.max_sessions {
            idle.sort();
            let excess = sessions.len() - self.max_sessions;
            for (_, id) in idle.into_iter().take(excess) {
                sessions.remove(&id);
                evicted += 1;
            }
        }

        let report = ReapReport {
            expired: expired.len(),
            evicted,
            remaining: sessions.len(),
        };
        if report.expired > 0 || report.evicted > 0 {
            tracing::info!(expired = report.expired, evicted = report.evicted, remaining = report.remaining, "reaped sessions");
        }
        Ok(report)
    }

    /// Start the periodic reaper. Returns false when no Tokio runtime is
    /// available; the call can be retried later.
    pub fn start_reaper(self: &Arc<Self>) -> bool {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!(error = %e, "no async runtime, session reaper not started");
                return false;
            }
        };

        let mut slot = self.reaper.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return true;
        }

        let store = Arc::downgrade(self);
        let stop = self.shutdown.clone();
        let interval = self.reaper_interval;
        let retry = self.reaper_retry_interval;
        *slot = Some(runtime.spawn(reaper_loop(store, stop, interval, retry)));
        tracing::debug!(interval_s = interval.as_secs_f64(), "session reaper started");
        true
    }

    /// Stop the reaper. Safe to call repeatedly, or when it never started.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.reaper.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "session reaper ended abnormally");
            }
        }
    }
}

async fn reaper_loop(store: Weak<SessionStore>, stop: CancellationToken, interval: Duration, retry: Duration) {
    let mut delay = interval;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        let Some(strong) = store.upgrade() else { break };

        delay = match tokio::task::spawn_blocking(move || strong.reap_once()).await {
            Ok(Ok(_)) => interval,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, retry_s = retry.as_secs_f64(), "session reaper pass failed");
                retry
            }
            Err(e) => {
                tracing::error!(error = %e, retry_s = retry.as_secs_f64(), "session reaper pass panicked");
                retry
            }
        };
    }
    tracing::debug!("session reaper stopped");
}
