use async_trait::async_trait;
use sshpilot::automation::AutomationOutcome;
use sshpilot::config::{AutomationConfig, Strategy};
use sshpilot::connector::Connector;
use sshpilot::disconnect::DisconnectController;
use sshpilot::error::PilotResult;
use sshpilot::notice::{Notice, Notifier};
use sshpilot::profile::{PlainProfile, SecretString, SudoPolicy};
use sshpilot::registry::SessionRegistry;
use sshpilot::repository::ConnectionRepository;
use sshpilot::secret::SecretStore;
use sshpilot::terminal::{
    OutputHandle, Terminal, TerminalBackend, TerminalProvider, TerminalRequest, Termination,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Transcript = Arc<Mutex<Vec<String>>>;

/// Pretends to be a remote host: every line typed in may produce a canned reply.
struct ScriptedBackend {
    output: OutputHandle,
    replies: Vec<(&'static str, &'static str)>,
    transcript: Transcript,
    eof: AtomicBool,
}

#[async_trait]
impl TerminalBackend for ScriptedBackend {
    async fn write(&self, data: &[u8]) -> PilotResult<usize> {
        let text = String::from_utf8_lossy(data).into_owned();
        self.transcript.lock().unwrap().push(text.clone());
        if text == "exit\n" {
            self.eof.store(true, Ordering::SeqCst);
            self.output.finish();
            return Ok(data.len());
        }
        if let Some((_, reply)) = self
            .replies
            .iter()
            .find(|(trigger, _)| text.starts_with(trigger))
        {
            self.output.append_output(reply.as_bytes());
        }
        Ok(data.len())
    }

    async fn close(&self) -> PilotResult<()> {
        self.eof.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }
}

struct ScriptedProvider {
    replies: Vec<(&'static str, &'static str)>,
    transcript: Transcript,
}

#[async_trait]
impl TerminalProvider for ScriptedProvider {
    async fn create_session(&self, request: TerminalRequest) -> PilotResult<Arc<Terminal>> {
        let output = OutputHandle::new(64 * 1024, 1000);
        let backend = ScriptedBackend {
            output: output.clone(),
            replies: self.replies.clone(),
            transcript: self.transcript.clone(),
            eof: AtomicBool::new(false),
        };
        Ok(Terminal::new(
            request.title,
            request.connection_id,
            Box::new(backend),
            output,
        ))
    }
}

fn automation(strategy: Strategy) -> AutomationConfig {
    AutomationConfig {
        strategy,
        initial_delay_ms: 1,
        establish_delay_ms: 1,
        sudo_prompt_delay_ms: 1,
        command_delay_ms: 1,
        poll_interval_ms: 5,
        detection_timeout_ms: 2_000,
        ..AutomationConfig::default()
    }
}

struct Harness {
    repository: Arc<ConnectionRepository>,
    registry: Arc<SessionRegistry>,
    connector: Connector,
    disconnect: DisconnectController,
    notifier: Notifier,
    transcript: Transcript,
}

fn harness(strategy: Strategy, replies: Vec<(&'static str, &'static str)>) -> Harness {
    let repository = Arc::new(ConnectionRepository::in_memory(SecretStore::in_memory(
        "sshpilot",
    )));
    let registry = Arc::new(SessionRegistry::new());
    let notifier = Notifier::default();
    let transcript = Transcript::default();
    let provider = Arc::new(ScriptedProvider {
        replies,
        transcript: transcript.clone(),
    });
    let connector = Connector::new(
        repository.clone(),
        registry.clone(),
        provider,
        &automation(strategy),
        PathBuf::from("."),
        notifier.clone(),
    )
    .unwrap();
    let disconnect = DisconnectController::new(registry.clone(), Termination::Exit, notifier.clone());
    Harness {
        repository,
        registry,
        connector,
        disconnect,
        notifier,
        transcript,
    }
}

#[tokio::test]
async fn prompt_detection_logs_in_and_disconnects() {
    let h = harness(
        Strategy::PromptDetection,
        vec![
            ("ssh ", "Enter passphrase for key '/k': "),
            ("pp\n", "\r\nLast login: Mon\r\nbob@web:~$ "),
            ("sudo -s", "sudo -s\r\n[sudo] password for bob: "),
            ("rootpw\n", "\r\nroot@web:~# "),
            ("uptime", "uptime\r\n 10:00 up 1 day\r\nroot@web:~# "),
        ],
    );
    let stored = h
        .repository
        .add(
            PlainProfile::new("web", "web.internal", "bob")
                .with_public_key("/k")
                .with_key_passphrase("pp")
                .with_sudo(SudoPolicy::OwnPassword, Some(SecretString::new("rootpw")))
                .with_commands(["# warm up", "uptime"]),
        )
        .unwrap();

    let connection = h.connector.connect(&stored.id).await.unwrap();
    assert_eq!(h.registry.count_for(&stored.id), 1);
    let outcome = connection.automation.unwrap().await.unwrap();
    assert_eq!(outcome, AutomationOutcome::Completed { sent: 4 });
    assert_eq!(
        *h.transcript.lock().unwrap(),
        vec![
            "ssh -i /k bob@web.internal -o StrictHostKeyChecking=no\n",
            "pp\n",
            "sudo -s\n",
            "rootpw\n",
            "uptime\n",
        ]
    );

    let report = h.disconnect.disconnect_all(&stored.id).await;
    assert_eq!(report.sessions, 1);
    assert!(h.registry.is_empty());
    assert!(!connection.terminal.is_alive());
    assert_eq!(h.transcript.lock().unwrap().last().unwrap(), "exit\n");
}

#[tokio::test]
async fn missing_sudo_credential_is_announced() {
    let h = harness(Strategy::FixedDelay, Vec::new());
    let mut notices = h.notifier.subscribe();
    let stored = h
        .repository
        .add(
            PlainProfile::new("web", "web.internal", "bob")
                .with_sudo(SudoPolicy::UserPasswordReused, None)
                .with_commands(["ls"]),
        )
        .unwrap();

    let connection = h.connector.connect(&stored.id).await.unwrap();
    let outcome = connection.automation.unwrap().await.unwrap();
    assert!(matches!(outcome, AutomationOutcome::Aborted { sent: 1, .. }));
    assert_eq!(
        *h.transcript.lock().unwrap(),
        vec!["ssh bob@web.internal -o StrictHostKeyChecking=no\n", "sudo -s\n"]
    );

    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        seen.push(notice);
    }
    assert!(matches!(seen.first(), Some(Notice::Connected { .. })));
    assert!(
        seen.iter()
            .any(|notice| matches!(notice, Notice::MissingSudoCredential { .. }))
    );
}

#[tokio::test]
async fn sessions_for_one_profile_are_tracked_separately() {
    let h = harness(Strategy::FixedDelay, Vec::new());
    let stored = h
        .repository
        .add(PlainProfile::new("web", "web.internal", "bob"))
        .unwrap();

    let first = h.connector.connect(&stored.id).await.unwrap();
    let second = h.connector.connect(&stored.id).await.unwrap();
    assert_eq!(h.registry.count_for(&stored.id), 2);

    let report = h.disconnect.disconnect_one(Some(&stored.id)).await;
    assert_eq!(report.sessions, 1);
    assert!(!first.terminal.is_alive());
    assert!(second.terminal.is_alive());
    assert_eq!(h.registry.all_for(&stored.id)[0].id, second.terminal.id);

    let report = h.disconnect.disconnect_one(None).await;
    assert_eq!(report.connection_id.as_deref(), Some(stored.id.as_str()));
    assert!(h.registry.is_empty());
    assert!(h.disconnect.disconnect_all(&stored.id).await.is_noop());
}
