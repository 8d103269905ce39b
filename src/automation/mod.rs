//! Login automation.
//!
//! After the ssh command has been typed into a terminal, an [`AuthAutomation`]
//! worker types the key passphrase, elevates with `sudo -s` and runs the
//! profile's startup commands. Pacing is either fixed delays or prompt
//! detection on the terminal's output; both are expressed as a [`Plan`].

mod plan;
mod prompt;

use crate::config::{Strategy, Timings};
use crate::notice::{Notice, Notifier};
use crate::profile::PlainProfile;
use crate::terminal::Terminal;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

pub use plan::{Input, MISSING_SUDO_CREDENTIAL, Plan, Prompt, SUDO_SHELL_COMMAND, Step, StepLabel, is_sudo_command};
pub use prompt::{PromptMatcher, strip_ansi};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationOutcome {
    Completed { sent: usize },
    Aborted { reason: &'static str, sent: usize },
    TimedOut { waiting_for: Prompt, sent: usize },
    SessionClosed { sent: usize },
    Failed { error: String, sent: usize },
}

impl AutomationOutcome {
    pub fn sent(&self) -> usize {
        match self {
            AutomationOutcome::Completed { sent }
            | AutomationOutcome::Aborted { sent, .. }
            | AutomationOutcome::TimedOut { sent, .. }
            | AutomationOutcome::SessionClosed { sent }
            | AutomationOutcome::Failed { sent, .. } => *sent,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, AutomationOutcome::Completed { .. })
    }
}

impl fmt::Display for AutomationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationOutcome::Completed { sent } => write!(f, "login automation finished ({sent} inputs)"),
            AutomationOutcome::Aborted { reason, .. } => write!(f, "login automation stopped: {reason}"),
            AutomationOutcome::TimedOut { waiting_for, .. } => {
                write!(f, "login automation abandoned waiting for {waiting_for:?} prompt")
            }
            AutomationOutcome::SessionClosed { .. } => write!(f, "terminal closed during login automation"),
            AutomationOutcome::Failed { error, .. } => write!(f, "login automation failed: {error}"),
        }
    }
}

enum Detection {
    Matched,
    ShellInstead,
    TimedOut,
    Closed,
}

/// One run of the login script against one terminal.
pub struct AuthAutomation {
    terminal: Arc<Terminal>,
    connection_id: String,
    alias: String,
    plan: Plan,
    timings: Timings,
    prompts: Arc<PromptMatcher>,
    notifier: Notifier,
    start_cursor: u64,
}

impl AuthAutomation {
    pub fn new(
        terminal: Arc<Terminal>,
        profile: &PlainProfile,
        strategy: Strategy,
        timings: Timings,
        prompts: Arc<PromptMatcher>,
        notifier: Notifier,
    ) -> Self {
        let start_cursor = terminal.output_cursor();
        Self {
            terminal,
            connection_id: profile.id.clone(),
            alias: profile.alias.clone(),
            plan: Plan::build(profile, strategy, &timings),
            timings,
            prompts,
            notifier,
            start_cursor,
        }
    }

    /// Output before `cursor` is never searched for prompts.
    pub fn with_start_cursor(mut self, cursor: u64) -> Self {
        self.start_cursor = cursor;
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Starts the worker in the background. Returns `None` when the plan has
    /// nothing to type.
    pub fn spawn(self) -> Option<JoinHandle<AutomationOutcome>> {
        if !self.plan.sends_anything() {
            tracing::debug!(alias = %self.alias, "Nothing to automate");
            return None;
        }
        let alias = self.alias.clone();
        let worker = tokio::spawn(self.run());
        Some(tokio::spawn(async move {
            match worker.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(alias = %alias, error = %err, "Automation task died");
                    AutomationOutcome::Failed {
                        error: err.to_string(),
                        sent: 0,
                    }
                }
            }
        }))
    }

    pub async fn run(self) -> AutomationOutcome {
        let outcome = self.execute().await;
        self.report(&outcome);
        outcome
    }

    async fn execute(&self) -> AutomationOutcome {
        let deadline = Instant::now() + self.timings.detection_timeout;
        let mut cursor = self.start_cursor;
        let mut sent = 0;
        let mut skip_next_send = false;
        let mut announced_commands = false;

        for (index, step) in self.plan.steps.iter().enumerate() {
            if !self.terminal.is_alive() {
                return AutomationOutcome::SessionClosed { sent };
            }
            match step {
                Step::Pause(duration) => sleep(*duration).await,
                Step::WaitFor(prompt) => match self.wait_for(*prompt, &mut cursor, deadline).await {
                    Detection::Matched => {
                        tracing::debug!(alias = %self.alias, step = index, prompt = ?prompt, "Prompt detected");
                    }
                    Detection::ShellInstead => {
                        tracing::debug!(alias = %self.alias, step = index, "Shell prompt instead of sudo prompt; skipping password");
                        skip_next_send = true;
                    }
                    Detection::TimedOut => {
                        return AutomationOutcome::TimedOut {
                            waiting_for: *prompt,
                            sent,
                        };
                    }
                    Detection::Closed => return AutomationOutcome::SessionClosed { sent },
                },
                Step::Send { label, input } => {
                    if std::mem::take(&mut skip_next_send) {
                        continue;
                    }
                    if *label == StepLabel::Command && !announced_commands {
                        announced_commands = true;
                        self.notifier.emit(Notice::SendingStartupCommands {
                            connection_id: self.connection_id.clone(),
                            alias: self.alias.clone(),
                        });
                    }
                    cursor = self.terminal.output_cursor();
                    let result = match input {
                        Input::Line(line) => self.terminal.send_line(line).await,
                        Input::Secret(secret) => self.terminal.send_secret_line(secret).await,
                    };
                    if let Err(err) = result {
                        tracing::warn!(alias = %self.alias, step = index, label = label.as_str(), error = %err, "Automation input failed");
                        if !self.terminal.is_alive() {
                            return AutomationOutcome::SessionClosed { sent };
                        }
                        return AutomationOutcome::Failed {
                            error: err.to_string(),
                            sent,
                        };
                    }
                    sent += 1;
                    tracing::debug!(alias = %self.alias, step = index, label = label.as_str(), "Automation input sent");
                }
                Step::Abort(reason) => {
                    self.notifier.emit(Notice::MissingSudoCredential {
                        connection_id: self.connection_id.clone(),
                        alias: self.alias.clone(),
                    });
                    return AutomationOutcome::Aborted { reason: *reason, sent };
                }
            }
        }
        AutomationOutcome::Completed { sent }
    }

    async fn wait_for(&self, prompt: Prompt, cursor: &mut u64, deadline: Instant) -> Detection {
        loop {
            let slice = self.terminal.output_since(*cursor);
            let text = slice.text();
            if self.prompts.matches(prompt, &text) {
                *cursor = slice.end_cursor;
                return Detection::Matched;
            }
            if prompt == Prompt::SudoPassword && self.prompts.matches(Prompt::Shell, &text) {
                *cursor = slice.end_cursor;
                return Detection::ShellInstead;
            }
            if !self.terminal.is_alive() {
                return Detection::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Detection::TimedOut;
            }
            let wait = self.timings.poll_interval.min(deadline - now);
            let _ = timeout(wait, self.terminal.output_changed()).await;
        }
    }

    fn report(&self, outcome: &AutomationOutcome) {
        match outcome {
            AutomationOutcome::Completed { sent } => {
                tracing::info!(alias = %self.alias, connection_id = %self.connection_id, sent, "Login automation finished");
            }
            AutomationOutcome::Aborted { reason, sent } => {
                tracing::warn!(alias = %self.alias, connection_id = %self.connection_id, sent, reason, "Login automation aborted");
            }
            AutomationOutcome::TimedOut { waiting_for, sent } => {
                tracing::warn!(alias = %self.alias, connection_id = %self.connection_id, sent, prompt = ?waiting_for, "Login automation timed out");
            }
            AutomationOutcome::SessionClosed { sent } => {
                tracing::info!(alias = %self.alias, connection_id = %self.connection_id, sent, "Terminal closed before automation finished");
            }
            AutomationOutcome::Failed { error, sent } => {
                tracing::warn!(alias = %self.alias, connection_id = %self.connection_id, sent, error = %error, "Login automation failed");
            }
        }
        self.notifier.emit(Notice::AutomationFinished {
            connection_id: self.connection_id.clone(),
            alias: self.alias.clone(),
            outcome: outcome.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PilotResult;
    use crate::profile::{SecretString, SudoPolicy};
    use crate::terminal::testing::{recording_terminal, written_text};
    use crate::terminal::{OutputHandle, TerminalBackend};
    use std::time::Duration;

    fn fast() -> Timings {
        Timings {
            initial_delay: Duration::from_millis(5),
            establish_delay: Duration::from_millis(5),
            sudo_prompt_delay: Duration::from_millis(5),
            command_delay: Duration::from_millis(5),
            poll_interval: Duration::from_millis(2),
            detection_timeout: Duration::from_millis(300),
        }
    }

    fn automation(terminal: Arc<Terminal>, profile: &PlainProfile, strategy: Strategy) -> AuthAutomation {
        AuthAutomation::new(
            terminal,
            profile,
            strategy,
            fast(),
            Arc::new(PromptMatcher::default()),
            Notifier::default(),
        )
    }

    async fn wait_for_writes(writes: &Arc<std::sync::Mutex<Vec<Vec<u8>>>>, count: usize) {
        for _ in 0..200 {
            if writes.lock().expect("writes").len() >= count {
                return;
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {count} writes");
    }

    #[tokio::test]
    async fn fixed_delay_sends_only_real_commands() {
        let (terminal, _output, writes) = recording_terminal("c1");
        let profile = PlainProfile::new("web", "h", "bob").with_commands(["# comment", "", "ls -la"]);
        let outcome = automation(terminal, &profile, Strategy::FixedDelay).run().await;
        assert_eq!(outcome, AutomationOutcome::Completed { sent: 1 });
        assert_eq!(written_text(&writes), vec!["ls -la\n".to_string()]);
    }

    #[tokio::test]
    async fn fixed_delay_full_sequence() {
        let (terminal, _output, writes) = recording_terminal("c1");
        let profile = PlainProfile::new("web", "h", "bob")
            .with_public_key("/k")
            .with_key_passphrase("pp")
            .with_sudo(SudoPolicy::OwnPassword, Some(SecretString::new("root-pw")))
            .with_commands(["sudo systemctl restart app", "uptime"]);
        let outcome = automation(terminal, &profile, Strategy::FixedDelay).run().await;
        assert!(outcome.is_completed());
        assert_eq!(
            written_text(&writes),
            vec![
                "pp\n".to_string(),
                "sudo -s\n".to_string(),
                "root-pw\n".to_string(),
                "sudo systemctl restart app\n".to_string(),
                "root-pw\n".to_string(),
                "uptime\n".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_sudo_credential_aborts_with_notice() {
        let (terminal, _output, writes) = recording_terminal("c1");
        let notifier = Notifier::default();
        let mut notices = notifier.subscribe();
        let profile = PlainProfile::new("web", "h", "bob").with_commands(["sudo reboot", "uptime"]);
        let outcome = AuthAutomation::new(
            terminal,
            &profile,
            Strategy::FixedDelay,
            fast(),
            Arc::new(PromptMatcher::default()),
            notifier,
        )
        .run()
        .await;
        assert_eq!(
            outcome,
            AutomationOutcome::Aborted {
                reason: MISSING_SUDO_CREDENTIAL,
                sent: 1
            }
        );
        assert_eq!(written_text(&writes), vec!["sudo reboot\n".to_string()]);

        let mut saw_missing = false;
        while let Ok(notice) = notices.try_recv() {
            saw_missing |= matches!(notice, Notice::MissingSudoCredential { .. });
        }
        assert!(saw_missing);
    }

    #[tokio::test]
    async fn detection_follows_prompts() {
        let (terminal, output, writes) = recording_terminal("c1");
        let profile = PlainProfile::new("web", "h", "bob")
            .with_public_key("/k")
            .with_key_passphrase("pp")
            .with_commands(["uptime"]);
        let worker = automation(terminal, &profile, Strategy::PromptDetection);
        let handle = tokio::spawn(worker.run());

        sleep(Duration::from_millis(10)).await;
        assert!(writes.lock().expect("writes").is_empty());
        output.append_output(b"Enter passphrase for key '/k': ");
        wait_for_writes(&writes, 1).await;
        output.append_output(b"\r\nLast login: today\r\nbob@web:~$ ");
        wait_for_writes(&writes, 2).await;

        let outcome = handle.await.expect("join");
        assert_eq!(outcome, AutomationOutcome::Completed { sent: 2 });
        assert_eq!(
            written_text(&writes),
            vec!["pp\n".to_string(), "uptime\n".to_string()]
        );
    }

    #[tokio::test]
    async fn cached_sudo_skips_password() {
        let (terminal, output, writes) = recording_terminal("c1");
        let profile = PlainProfile::new("web", "h", "bob")
            .with_sudo(SudoPolicy::Disabled, Some(SecretString::new("root-pw")))
            .with_commands(["sudo ls"]);
        output.append_output(b"bob@web:~$ ");
        let handle = tokio::spawn(
            automation(terminal, &profile, Strategy::PromptDetection)
                .with_start_cursor(0)
                .run(),
        );
        wait_for_writes(&writes, 1).await;
        output.append_output(b"sudo ls\r\nfile\r\nbob@web:~$ ");

        let outcome = handle.await.expect("join");
        assert_eq!(outcome, AutomationOutcome::Completed { sent: 1 });
        assert_eq!(written_text(&writes), vec!["sudo ls\n".to_string()]);
    }

    #[tokio::test]
    async fn detection_times_out_without_prompt() {
        let (terminal, _output, writes) = recording_terminal("c1");
        let profile = PlainProfile::new("web", "h", "bob").with_commands(["uptime"]);
        let outcome = automation(terminal, &profile, Strategy::PromptDetection).run().await;
        assert_eq!(
            outcome,
            AutomationOutcome::TimedOut {
                waiting_for: Prompt::Shell,
                sent: 0
            }
        );
        assert!(writes.lock().expect("writes").is_empty());
    }

    #[tokio::test]
    async fn closed_terminal_stops_worker() {
        let (terminal, output, writes) = recording_terminal("c1");
        output.finish();
        let profile = PlainProfile::new("web", "h", "bob").with_commands(["uptime"]);
        let outcome = automation(terminal, &profile, Strategy::FixedDelay).run().await;
        assert_eq!(outcome, AutomationOutcome::SessionClosed { sent: 0 });
        assert!(writes.lock().expect("writes").is_empty());
    }

    #[tokio::test]
    async fn spawn_skips_empty_plans() {
        let (terminal, _output, _writes) = recording_terminal("c1");
        let profile = PlainProfile::new("web", "h", "bob");
        assert!(automation(terminal, &profile, Strategy::FixedDelay).spawn().is_none());
    }

    struct PanickingBackend;

    #[async_trait::async_trait]
    impl TerminalBackend for PanickingBackend {
        async fn write(&self, _data: &[u8]) -> PilotResult<usize> {
            panic!("backend write blew up");
        }

        async fn close(&self) -> PilotResult<()> {
            Ok(())
        }

        fn is_eof(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn worker_panic_is_reported_as_failure() {
        let terminal = Terminal::new(
            "test",
            "c1",
            Box::new(PanickingBackend),
            OutputHandle::new(4096, 100),
        );
        let profile = PlainProfile::new("web", "h", "bob").with_commands(["uptime"]);
        let outcome = automation(terminal, &profile, Strategy::FixedDelay)
            .spawn()
            .expect("worker")
            .await
            .expect("outer task");
        match outcome {
            AutomationOutcome::Failed { error, sent } => {
                assert_eq!(sent, 0);
                assert!(error.contains("panic"), "{error}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
