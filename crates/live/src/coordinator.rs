//! Live update coordinator.
//!
//! Each session has at most one slot: `Pending` while its debounce timer
//! sleeps, `Executing` while its parse runs. A content change replaces the
//! slot with a newer generation and cancels the old one, so a burst of edits
//! produces a single parse of the latest content. Cancelling an executing
//! slot also cancels its parse budget, so at most one debounced parse per
//! session holds a worker. Results of a superseded generation are neither
//! stored nor broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::ParserCache;
use crate::error::LiveError;
use crate::model::ParseResult;
use crate::protocol::ServerMessage;
use crate::session::{ConnectionHandle, Delivery, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Executing,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    token: CancellationToken,
    state: SlotState,
}

#[derive(Debug)]
pub enum ForceParseOutcome {
    Parsed(Arc<ParseResult>),
    /// Grammar or text is empty; nothing was parsed.
    MissingContent,
    Failed(LiveError),
}

#[derive(Debug)]
pub struct Coordinator {
    cache: Arc<ParserCache>,
    sessions: Arc<SessionStore>,
    debounce_delay: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(cache: Arc<ParserCache>, sessions: Arc<SessionStore>, debounce_delay: Duration) -> Self {
        Coordinator {
            cache,
            sessions,
            debounce_delay,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn cache(&self) -> &Arc<ParserCache> {
        &self.cache
    }

    /// Schedule a debounced parse of session `id`.
    ///
    /// Returns false when the session lacks grammar or text, or after
    /// shutdown. Must be called from within a Tokio runtime.
    pub fn content_changed(self: &Arc<Self>, id: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if !self.sessions.content(id).is_some_and(|c| c.is_ready()) {
            tracing::debug!(session = id, "content incomplete, parse not scheduled");
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.shutdown.child_token();
        {
            let mut slots = self.slots.lock();
            let previous = slots.insert(
                id.to_string(),
                Slot {
                    generation,
                    token: token.clone(),
                    state: SlotState::Pending,
                },
            );
            if let Some(previous) = previous {
                previous.token.cancel();
                tracing::debug!(session = id, superseded = previous.generation, state = ?previous.state, "cancelled earlier parse");
            }
        }

        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move { this.debounced_parse(id, generation, token).await });
        true
    }

    async fn debounced_parse(self: Arc<Self>, id: String, generation: u64, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.debounce_delay) => {}
        }

        {
            let mut slots = self.slots.lock();
            match slots.get_mut(&id) {
                Some(slot) if slot.generation == generation && !token.is_cancelled() => {
                    slot.state = SlotState::Executing;
                }
                _ => return,
            }
        }

        let content = match self.sessions.content(&id) {
            Some(content) if content.is_ready() => content,
            _ => {
                self.release(&id, generation);
                return;
            }
        };

        tracing::info!(session = %id, generation, parser = %content.settings.parser, "executing debounced parse");
        let outcome = self
            .cache
            .parse_with_cache_cancellable(&content.grammar, &content.text, &content.settings, true, &token)
            .await;

        if self.is_current(&id, generation, &token) {
            match outcome {
                Ok(result) => {
                    self.sessions.set_last_result(&id, result.clone());
                    let sent = self.sessions.broadcast(&id, ServerMessage::parse_result(&id, result.clone()));
                    tracing::info!(session = %id, status = result.status().as_str(), connections = sent, "broadcast parse result");
                }
                Err(e) => {
                    tracing::error!(session = %id, error = %e, "debounced parse failed");
                    self.sessions.broadcast(&id, ServerMessage::parse_error(&id, e.to_string()));
                }
            }
        } else {
            tracing::debug!(session = %id, generation, "parse superseded, result discarded");
        }
        self.release(&id, generation);
    }

    fn is_current(&self, id: &str, generation: u64, token: &CancellationToken) -> bool {
        !token.is_cancelled()
            && self
                .slots
                .lock()
                .get(id)
                .is_some_and(|slot| slot.generation == generation)
    }

    /// Remove the slot for `id` if it still belongs to `generation`.
    fn release(&self, id: &str, generation: u64) {
        let mut slots = self.slots.lock();
        if slots.get(id).is_some_and(|slot| slot.generation == generation) {
            slots.remove(id);
        }
    }

    /// Parse session `id` now, bypassing the debounce timer.
    ///
    /// A pending debounced parse is cancelled; one already executing is
    /// left alone. The result goes straight to `requester` and is broadcast
    /// to the session's other subscribers.
    pub async fn force_parse(&self, id: &str, requester: &ConnectionHandle) -> ForceParseOutcome {
        let content = match self.sessions.content(id) {
            Some(content) if content.is_ready() => content,
            _ => {
                tracing::warn!(session = id, "force parse requested without grammar or text");
                return ForceParseOutcome::MissingContent;
            }
        };

        {
            let mut slots = self.slots.lock();
            if slots.get(id).is_some_and(|slot| slot.state == SlotState::Pending) {
                if let Some(slot) = slots.remove(id) {
                    slot.token.cancel();
                    tracing::debug!(session = id, generation = slot.generation, "force parse cancelled pending parse");
                }
            }
        }

        let cancel = self.shutdown.child_token();
        match self
            .cache
            .parse_with_cache_cancellable(&content.grammar, &content.text, &content.settings, true, &cancel)
            .await
        {
            Ok(result) => {
                self.sessions.set_last_result(id, result.clone());
                let message = ServerMessage::parse_result(id, result.clone());
                if requester.send(Arc::new(message.clone())) != Delivery::Sent {
                    tracing::warn!(session = id, connection = %requester.id(), "could not deliver forced parse result");
                }
                self.sessions.broadcast_except(id, message, requester.id());
                tracing::info!(session = id, status = result.status().as_str(), "forced parse complete");
                ForceParseOutcome::Parsed(result)
            }
            Err(e) => {
                tracing::error!(session = id, error = %e, "forced parse failed");
                requester.send(Arc::new(ServerMessage::parse_error(id, e.to_string())));
                ForceParseOutcome::Failed(e)
            }
        }
    }

    pub fn slot_state(&self, id: &str) -> Option<SlotState> {
        self.slots.lock().get(id).map(|slot| slot.state)
    }

    /// Sessions waiting for their debounce timer.
    pub fn pending_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.state == SlotState::Pending)
            .count()
    }

    /// Cancel every slot and refuse new work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let dropped = std::mem::take(&mut *self.slots.lock());
        if !dropped.is_empty() {
            tracing::info!(slots = dropped.len(), "coordinator shut down with parses outstanding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveConfig;
    use crate::protocol::ServerBody;

    const GRAMMAR: &str = "start: WORD\n%import common.WORD";

    fn coordinator(delay: Duration) -> Arc<Coordinator> {
        let config = LiveConfig {
            worker_threads: 2,
            ..LiveConfig::default()
        };
        Arc::new(Coordinator::new(
            Arc::new(ParserCache::new(&config)),
            Arc::new(SessionStore::new(&config)),
            delay,
        ))
    }

    #[tokio::test]
    async fn incomplete_content_is_not_scheduled() {
        let coord = coordinator(Duration::from_millis(10));
        coord.sessions().update_content("s", Some(GRAMMAR.into()), None, None);
        assert!(!coord.content_changed("s"));
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test]
    async fn debounced_parse_broadcasts_and_clears_slot() {
        let coord = coordinator(Duration::from_millis(20));
        let (handle, mut rx) = ConnectionHandle::channel(8);
        coord.sessions().subscribe("s", handle);
        coord
            .sessions()
            .update_content("s", Some(GRAMMAR.into()), Some("hello".into()), None);

        assert!(coord.content_changed("s"));
        assert_eq!(coord.slot_state("s"), Some(SlotState::Pending));

        let message = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match &message.body {
            ServerBody::ParseResult(result) => assert!(result.is_success()),
            other => panic!("unexpected message {:?}", other),
        }
        assert!(coord.sessions().last_result("s").is_some());

        for _ in 0..50 {
            if coord.slot_state("s").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coord.slot_state("s"), None);
    }

    #[tokio::test]
    async fn force_parse_without_content() {
        let coord = coordinator(Duration::from_millis(10));
        let (handle, _rx) = ConnectionHandle::channel(8);
        assert!(matches!(
            coord.force_parse("empty", &handle).await,
            ForceParseOutcome::MissingContent
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_pending() {
        let coord = coordinator(Duration::from_secs(60));
        coord
            .sessions()
            .update_content("s", Some(GRAMMAR.into()), Some("x".into()), None);
        assert!(coord.content_changed("s"));
        assert_eq!(coord.pending_count(), 1);

        coord.shutdown();
        assert_eq!(coord.pending_count(), 0);
        assert!(!coord.content_changed("s"));
    }

    #[tokio::test]
    async fn closed_pool_becomes_parse_error_broadcast() {
        let coord = coordinator(Duration::from_millis(10));
        let (handle, mut rx) = ConnectionHandle::channel(8);
        coord.sessions().subscribe("s", handle);
        coord
            .sessions()
            .update_content("s", Some(GRAMMAR.into()), Some("word".into()), None);
        coord.cache().close();

        assert!(coord.content_changed("s"));
        let message = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match &message.body {
            ServerBody::ParseError { error_type, .. } => assert_eq!(error_type, "parsing_error"),
            other => panic!("unexpected message {:?}", other),
        }
    }
}
