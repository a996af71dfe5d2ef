//! Per-connection protocol state machine.
//!
//! A [`Connection`] turns inbound frames into session mutations and
//! coordinator calls. Replies go through the connection's own outbound
//! channel, so a transport only has to feed text frames in and drain the
//! receiver returned by [`ConnectionHandle::channel`].

use std::sync::Arc;

use crate::coordinator::{Coordinator, ForceParseOutcome};
use crate::protocol::{ClientEvent, ClientMessage, ServerMessage, UNKNOWN_SESSION};
use crate::session::{ConnectionHandle, ConnectionId, Delivery};

pub struct Connection {
    coordinator: Arc<Coordinator>,
    handle: ConnectionHandle,
    session: Option<String>,
    received: u64,
}

impl Connection {
    pub fn new(coordinator: Arc<Coordinator>, handle: ConnectionHandle) -> Self {
        tracing::debug!(connection = %handle.id(), "connection opened");
        Connection {
            coordinator,
            handle,
            session: None,
            received: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// The session this connection is subscribed to.
    pub fn current_session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Process one inbound text frame.
    ///
    /// Malformed frames get an `error` reply and change nothing; every
    /// processed message is answered with a `session_info` snapshot.
    pub async fn handle_text(&mut self, raw: &str) {
        self.received += 1;
        let message = match ClientMessage::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(connection = %self.id(), error = %e, "rejected message");
                let session = self.session.as_deref().unwrap_or(UNKNOWN_SESSION);
                self.reply(ServerMessage::error(session, &e));
                return;
            }
        };

        let id = message.session_id;
        self.follow(&id);

        let sessions = self.coordinator.sessions().clone();
        match message.event {
            ClientEvent::GrammarChange { content } => {
                tracing::debug!(session = %id, bytes = content.len(), "grammar change");
                sessions.update_content(&id, Some(content), None, None);
                self.coordinator.content_changed(&id);
            }
            ClientEvent::TextChange { content } => {
                tracing::debug!(session = %id, bytes = content.len(), "text change");
                sessions.update_content(&id, None, Some(content), None);
                self.coordinator.content_changed(&id);
            }
            ClientEvent::SettingsChange(patch) => {
                tracing::debug!(session = %id, ?patch, "settings change");
                sessions.patch_settings(&id, &patch);
                self.coordinator.content_changed(&id);
            }
            ClientEvent::ForceParse => {
                tracing::info!(session = %id, "force parse requested");
                if let ForceParseOutcome::Failed(e) = self.coordinator.force_parse(&id, &self.handle).await {
                    tracing::warn!(session = %id, error = %e, "force parse failed");
                }
            }
        }

        if let Some(info) = sessions.info(&id) {
            self.reply(ServerMessage::session_info(info));
        }
    }

    /// Move the subscription to `id` if it names a different session.
    fn follow(&mut self, id: &str) {
        if self.session.as_deref() == Some(id) {
            return;
        }
        let sessions = self.coordinator.sessions();
        if let Some(previous) = self.session.take() {
            sessions.unsubscribe(&previous, self.id());
        }
        sessions.subscribe(id, self.handle.clone());
        self.session = Some(id.to_string());
    }

    fn reply(&self, message: ServerMessage) {
        let kind = message.kind();
        if self.handle.send(Arc::new(message)) != Delivery::Sent {
            tracing::warn!(connection = %self.id(), kind, "reply not delivered");
        }
    }

    /// Leave the current session. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            self.coordinator.sessions().unsubscribe(&session, self.id());
            tracing::info!(session = %session, connection = %self.id(), messages = self.received, "connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
