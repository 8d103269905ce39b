use crate::notice::{Notice, Notifier};
use crate::registry::SessionRegistry;
use crate::terminal::{Terminal, Termination};
use serde::Serialize;
use std::sync::Arc;

/// What a disconnect request did. `sessions == 0` means there was nothing to end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisconnectReport {
    pub connection_id: Option<String>,
    pub sessions: usize,
    pub failed_writes: usize,
}

impl DisconnectReport {
    pub fn is_noop(&self) -> bool {
        self.sessions == 0
    }
}

/// Ends sessions by typing a termination sequence into them.
pub struct DisconnectController {
    registry: Arc<SessionRegistry>,
    termination: Termination,
    notifier: Notifier,
}

impl DisconnectController {
    pub fn new(registry: Arc<SessionRegistry>, termination: Termination, notifier: Notifier) -> Self {
        Self {
            registry,
            termination,
            notifier,
        }
    }

    /// Ends the first session of `connection_id`, or the most recently opened
    /// session of any connection when no id is given.
    pub async fn disconnect_one(&self, connection_id: Option<&str>) -> DisconnectReport {
        let target = match connection_id {
            Some(id) => self
                .registry
                .first_for(id)
                .map(|terminal| (id.to_string(), terminal)),
            None => self.registry.most_recent(),
        };
        let Some((connection_id, terminal)) = target else {
            tracing::debug!(connection_id = ?connection_id, "No session to disconnect");
            return DisconnectReport::default();
        };

        let failed_writes = usize::from(!self.terminate(&terminal).await);
        self.registry.remove_one(&connection_id, &terminal);
        self.finish(connection_id, 1, failed_writes)
    }

    /// Ends every session registered under `connection_id`. Sessions are
    /// unregistered before anything is typed into them; one registered later
    /// is left alone.
    pub async fn disconnect_all(&self, connection_id: &str) -> DisconnectReport {
        let sessions = self.registry.take_all(connection_id);
        if sessions.is_empty() {
            tracing::debug!(connection_id, "No sessions to disconnect");
            return DisconnectReport::default();
        }

        let mut failed_writes = 0;
        for terminal in &sessions {
            if !self.terminate(terminal).await {
                failed_writes += 1;
            }
        }
        self.finish(connection_id.to_string(), sessions.len(), failed_writes)
    }

    async fn terminate(&self, terminal: &Arc<Terminal>) -> bool {
        match terminal.terminate(self.termination).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    session_id = %terminal.id,
                    connection_id = %terminal.connection_id,
                    error = %err,
                    "Failed to send termination sequence"
                );
                false
            }
        }
    }

    fn finish(&self, connection_id: String, sessions: usize, failed_writes: usize) -> DisconnectReport {
        tracing::info!(connection_id = %connection_id, sessions, failed_writes, "Disconnected");
        self.notifier.emit(Notice::Disconnected {
            connection_id: connection_id.clone(),
            sessions,
        });
        DisconnectReport {
            connection_id: Some(connection_id),
            sessions,
            failed_writes,
        }
    }
}
