//! Interactive terminal sessions.
//!
//! A [`Terminal`] is a local shell that text can be typed into and whose
//! output is retained in a bounded buffer. The process behind it is
//! a [`TerminalBackend`]; [`PtyProvider`] creates real ones.

mod buffer;
mod pty;

use crate::error::{ApiError, ErrorCode, PilotResult};
use crate::profile::SecretString;
use async_trait::async_trait;
use buffer::OutputBuffer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use uuid::Uuid;

pub use buffer::BufferSlice;
pub use pty::{PtyBackend, PtyProvider};

#[async_trait]
pub trait TerminalBackend: Send + Sync {
    async fn write(&self, data: &[u8]) -> PilotResult<usize>;
    async fn close(&self) -> PilotResult<()>;
    fn is_eof(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct TerminalRequest {
    pub working_dir: PathBuf,
    pub title: String,
    pub connection_id: String,
}

#[async_trait]
pub trait TerminalProvider: Send + Sync {
    async fn create_session(&self, request: TerminalRequest) -> PilotResult<Arc<Terminal>>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    Open,
    Closing,
    Closed,
}

/// What is sent to a shell to end it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    #[default]
    Exit,
    Eof,
}

impl Termination {
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Termination::Exit => b"exit\n",
            Termination::Eof => b"\x04",
        }
    }
}

type ExitHook = Box<dyn FnOnce() + Send>;

/// Write side of a terminal's output, handed to the backend's reader.
#[derive(Clone)]
pub struct OutputHandle {
    pub session_id: String,
    buffer: Arc<Mutex<OutputBuffer>>,
    notify: Arc<Notify>,
    bytes_in: Arc<AtomicU64>,
    last_activity: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    exit_hooks: Arc<Mutex<Vec<ExitHook>>>,
}

impl OutputHandle {
    pub fn new(max_bytes: usize, max_lines: usize) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            buffer: Arc::new(Mutex::new(OutputBuffer::new(max_bytes, max_lines))),
            notify: Arc::new(Notify::new()),
            bytes_in: Arc::new(AtomicU64::new(0)),
            last_activity: Arc::new(AtomicU64::new(now_ms())),
            finished: Arc::new(AtomicBool::new(false)),
            exit_hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn append_output(&self, bytes: &[u8]) {
        let dropped = self.lock_buffer().append(bytes);
        if dropped > 0 {
            tracing::trace!(
                session_id = %self.session_id,
                dropped_bytes = dropped,
                "Output buffer full; oldest data dropped"
            );
        }
        self.bytes_in.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        self.last_activity.store(now_ms(), Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Marks the process as gone and runs exit hooks. Only the first call has an effect.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let hooks = std::mem::take(&mut *self.lock_hooks());
        tracing::debug!(session_id = %self.session_id, hooks = hooks.len(), "Terminal output ended");
        for hook in hooks {
            hook();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, OutputBuffer> {
        self.buffer.lock().expect("output buffer mutex poisoned")
    }

    fn lock_hooks(&self) -> MutexGuard<'_, Vec<ExitHook>> {
        self.exit_hooks.lock().expect("exit hook mutex poisoned")
    }
}

pub struct Terminal {
    pub id: String,
    pub title: String,
    pub connection_id: String,
    output: OutputHandle,
    backend: Box<dyn TerminalBackend>,
    state: AtomicU8,
    created_at: u64,
    bytes_out: AtomicU64,
}

impl Terminal {
    pub fn new(
        title: impl Into<String>,
        connection_id: impl Into<String>,
        backend: Box<dyn TerminalBackend>,
        output: OutputHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: output.session_id.clone(),
            title: title.into(),
            connection_id: connection_id.into(),
            output,
            backend,
            state: AtomicU8::new(TerminalState::Open as u8),
            created_at: now_ms(),
            bytes_out: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> TerminalState {
        match self.state.load(Ordering::SeqCst) {
            x if x == TerminalState::Open as u8 => TerminalState::Open,
            x if x == TerminalState::Closing as u8 => TerminalState::Closing,
            _ => TerminalState::Closed,
        }
    }

    fn set_state(&self, state: TerminalState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.state() == TerminalState::Open
            && !self.output.is_finished()
            && !self.backend.is_eof()
    }

    /// (created_at, last_activity_at, bytes_in, bytes_out)
    pub fn metrics(&self) -> (u64, u64, u64, u64) {
        (
            self.created_at,
            self.output.last_activity.load(Ordering::SeqCst),
            self.output.bytes_in.load(Ordering::SeqCst),
            self.bytes_out.load(Ordering::SeqCst),
        )
    }

    pub async fn write(&self, data: &[u8], sensitive: bool) -> PilotResult<usize> {
        if !self.is_alive() {
            return Err(ApiError::new(ErrorCode::SessionClosed, "Terminal is not running")
                .with_details(self.id.clone())
                .into());
        }
        let written = self.backend.write(data).await?;
        self.bytes_out.fetch_add(written as u64, Ordering::SeqCst);
        if sensitive {
            tracing::debug!(session_id = %self.id, bytes = written, "Sensitive input written");
        } else {
            tracing::trace!(session_id = %self.id, bytes = written, "Input written");
        }
        Ok(written)
    }

    pub async fn send(&self, text: &str) -> PilotResult<usize> {
        self.write(text.as_bytes(), false).await
    }

    pub async fn send_line(&self, line: &str) -> PilotResult<usize> {
        self.send(&format!("{line}\n")).await
    }

    pub async fn send_secret_line(&self, secret: &SecretString) -> PilotResult<usize> {
        let mut payload = Vec::with_capacity(secret.expose().len() + 1);
        payload.extend_from_slice(secret.expose().as_bytes());
        payload.push(b'\n');
        self.write(&payload, true).await
    }

    pub fn output_cursor(&self) -> u64 {
        self.output.lock_buffer().buffer_end()
    }

    pub fn output_since(&self, cursor: u64) -> BufferSlice {
        self.output.lock_buffer().slice_from(cursor)
    }

    pub fn recent_output(&self, max_bytes: usize) -> String {
        self.output.lock_buffer().tail(max_bytes).text()
    }

    /// Resolves once new output arrives or the process ends.
    pub async fn output_changed(&self) {
        self.output.notify.notified().await;
    }

    /// Runs `callback` once the process behind the terminal ends; immediately
    /// if it already has.
    pub fn on_terminated(&self, callback: impl FnOnce() + Send + 'static) {
        let mut hooks = self.output.lock_hooks();
        if self.output.is_finished() {
            drop(hooks);
            callback();
            return;
        }
        hooks.push(Box::new(callback));
    }

    pub async fn terminate(&self, termination: Termination) -> PilotResult<usize> {
        self.write(termination.bytes(), false).await
    }

    pub async fn close(&self) -> PilotResult<()> {
        if self.state() == TerminalState::Closed {
            return Ok(());
        }
        self.set_state(TerminalState::Closing);
        let result = self.backend.close().await;
        self.set_state(TerminalState::Closed);
        self.output.finish();
        result
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
