//! User-facing notifications.
//!
//! The core never shows UI; it publishes [`Notice`]s on a broadcast channel
//! and whatever front end is attached decides how to present them.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    Connected {
        connection_id: String,
        alias: String,
        session_id: String,
    },
    SendingStartupCommands {
        connection_id: String,
        alias: String,
    },
    MissingSudoCredential {
        connection_id: String,
        alias: String,
    },
    AutomationFinished {
        connection_id: String,
        alias: String,
        outcome: String,
    },
    Disconnected {
        connection_id: String,
        sessions: usize,
    },
}

impl Notice {
    /// One-line text suitable for a status bar or stderr.
    pub fn message(&self) -> String {
        match self {
            Notice::Connected { alias, .. } => format!("Connecting to {alias}"),
            Notice::SendingStartupCommands { alias, .. } => {
                format!("Sending startup commands to {alias}")
            }
            Notice::MissingSudoCredential { alias, .. } => {
                format!("{alias}: no sudo password configured; remaining commands cancelled")
            }
            Notice::AutomationFinished { alias, outcome, .. } => format!("{alias}: {outcome}"),
            Notice::Disconnected {
                connection_id,
                sessions,
            } => format!("Disconnected {sessions} session(s) of {connection_id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Publishes to current subscribers; dropped silently when nobody listens.
    pub fn emit(&self, notice: Notice) {
        tracing::debug!(notice = ?notice, "Notice");
        let _ = self.tx.send(notice);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}
