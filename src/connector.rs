//! The "connect profile X" flow.
//!
//! Decrypt the profile, build the ssh command line, open a terminal, type the
//! command, register the session and hand the rest to a background
//! [`AuthAutomation`] worker. `connect` returns as soon as the command has been
//! typed; it never waits for the remote login.

use crate::automation::{AuthAutomation, AutomationOutcome, PromptMatcher};
use crate::command::CommandBuilder;
use crate::config::{AutomationConfig, Strategy, Timings};
use crate::error::{ApiError, ErrorCode, PilotResult};
use crate::notice::{Notice, Notifier};
use crate::profile::PlainProfile;
use crate::registry::SessionRegistry;
use crate::repository::ConnectionRepository;
use crate::secret::SecretKind;
use crate::terminal::{Terminal, TerminalProvider, TerminalRequest};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A freshly opened session.
pub struct Connection {
    pub terminal: Arc<Terminal>,
    pub automation: Option<JoinHandle<AutomationOutcome>>,
    pub maximize: bool,
}

pub struct Connector {
    repository: Arc<ConnectionRepository>,
    registry: Arc<SessionRegistry>,
    provider: Arc<dyn TerminalProvider>,
    strategy: Strategy,
    timings: Timings,
    prompts: Arc<PromptMatcher>,
    working_dir: PathBuf,
    notifier: Notifier,
}

impl Connector {
    pub fn new(
        repository: Arc<ConnectionRepository>,
        registry: Arc<SessionRegistry>,
        provider: Arc<dyn TerminalProvider>,
        automation: &AutomationConfig,
        working_dir: PathBuf,
        notifier: Notifier,
    ) -> PilotResult<Self> {
        Ok(Self {
            repository,
            registry,
            provider,
            strategy: automation.strategy,
            timings: automation.timings(),
            prompts: Arc::new(PromptMatcher::new(&automation.prompts)?),
            working_dir,
            notifier,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn connect(&self, connection_id: &str) -> PilotResult<Connection> {
        let profile = self.repository.get_plaintext(connection_id)?.ok_or_else(|| {
            ApiError::new(ErrorCode::NotFound, "Connection not found").with_details(connection_id)
        })?;
        let command = CommandBuilder::new(&profile).render();
        log_connection_details(&profile, &command);

        let terminal = self
            .provider
            .create_session(TerminalRequest {
                working_dir: self.working_dir.clone(),
                title: profile.alias.clone(),
                connection_id: profile.id.clone(),
            })
            .await?;

        let start_cursor = terminal.output_cursor();
        if let Err(err) = terminal.send_line(&command).await {
            tracing::warn!(connection_id = %profile.id, error = %err, "Failed to send ssh command");
            if let Err(close_err) = terminal.close().await {
                tracing::debug!(session_id = %terminal.id, error = %close_err, "Close after failed send");
            }
            return Err(err);
        }

        self.registry.register(&profile.id, terminal.clone());
        self.watch_termination(&terminal);
        self.notifier.emit(Notice::Connected {
            connection_id: profile.id.clone(),
            alias: profile.alias.clone(),
            session_id: terminal.id.clone(),
        });

        let automation = AuthAutomation::new(
            terminal.clone(),
            &profile,
            self.strategy,
            self.timings,
            self.prompts.clone(),
            self.notifier.clone(),
        )
        .with_start_cursor(start_cursor)
        .spawn();

        Ok(Connection {
            terminal,
            automation,
            maximize: profile.maximize_on_connect,
        })
    }

    fn watch_termination(&self, terminal: &Arc<Terminal>) {
        let registry = self.registry.clone();
        let weak = Arc::downgrade(terminal);
        let connection_id = terminal.connection_id.clone();
        terminal.on_terminated(move || {
            if let Some(terminal) = weak.upgrade()
                && registry.remove_one(&connection_id, &terminal)
            {
                tracing::info!(connection_id = %connection_id, session_id = %terminal.id, "Session ended");
            }
        });
    }
}

fn log_connection_details(profile: &PlainProfile, command: &str) {
    tracing::info!(
        connection_id = %profile.id,
        alias = %profile.alias,
        host = %profile.host,
        port = profile.port,
        username = %profile.username,
        key_path = profile.key_path().unwrap_or("-"),
        has_password = has_secret(profile, SecretKind::Password),
        has_key_passphrase = has_secret(profile, SecretKind::KeyPassphrase),
        has_sudo_password = has_secret(profile, SecretKind::SudoPassword),
        os_family = ?profile.os_family,
        sudo_policy = ?profile.sudo_policy,
        startup_commands = profile.startup_commands().count(),
        command,
        "Connecting"
    );
}

fn has_secret(profile: &PlainProfile, kind: SecretKind) -> bool {
    profile.secret(kind).is_some_and(|secret| !secret.is_empty())
}
