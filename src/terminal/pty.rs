use crate::config::TerminalConfig;
use crate::error::{ApiError, ErrorCode, PilotResult};
use crate::terminal::{OutputHandle, Terminal, TerminalBackend, TerminalProvider, TerminalRequest};
use async_trait::async_trait;
use portable_pty::{CommandBuilder as PtyCommand, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Local shell running in a pseudo-terminal.
pub struct PtyBackend {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    _master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    eof: Arc<AtomicBool>,
}

impl PtyBackend {
    pub fn spawn(config: &TerminalConfig, working_dir: &Path, output: OutputHandle) -> PilotResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| {
                ApiError::new(ErrorCode::SpawnFailed, "Failed to allocate PTY")
                    .with_details(err.to_string())
            })?;

        let shell = config.resolved_shell();
        let mut cmd = PtyCommand::new(&shell);
        cmd.env("TERM", &config.term);
        if working_dir.is_dir() {
            cmd.cwd(working_dir);
        } else {
            tracing::warn!(path = %working_dir.display(), "Working directory missing; using inherited one");
        }

        let child = pair.slave.spawn_command(cmd).map_err(|err| {
            ApiError::new(ErrorCode::SpawnFailed, format!("Failed to spawn {shell}"))
                .with_details(err.to_string())
        })?;
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader().map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to clone PTY reader")
                .with_details(err.to_string())
        })?;
        let writer = pair.master.take_writer().map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to take PTY writer")
                .with_details(err.to_string())
        })?;

        let eof = Arc::new(AtomicBool::new(false));
        let eof_flag = eof.clone();
        thread::spawn(move || {
            let mut buffer = [0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => output.append_output(&buffer[..n]),
                    Err(err) => {
                        tracing::debug!(
                            session_id = %output.session_id,
                            error = %err,
                            "PTY read ended"
                        );
                        break;
                    }
                }
            }
            eof_flag.store(true, Ordering::SeqCst);
            output.finish();
        });

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            _master: Arc::new(Mutex::new(pair.master)),
            child: Arc::new(Mutex::new(child)),
            eof,
        })
    }
}

#[async_trait]
impl TerminalBackend for PtyBackend {
    async fn write(&self, data: &[u8]) -> PilotResult<usize> {
        let data = data.to_vec();
        let writer = self.writer.clone();

        tokio::task::spawn_blocking(move || -> PilotResult<usize> {
            let mut writer = writer.lock().expect("writer mutex poisoned");
            writer
                .write_all(&data)
                .and_then(|_| writer.flush())
                .map_err(|err| {
                    ApiError::new(ErrorCode::IoError, "Failed to write to terminal")
                        .with_details(err.to_string())
                })?;
            Ok(data.len())
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join write").with_details(err.to_string())
        })?
    }

    async fn close(&self) -> PilotResult<()> {
        let child = self.child.clone();

        tokio::task::spawn_blocking(move || -> PilotResult<()> {
            let mut child = child.lock().expect("child mutex poisoned");
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(());
            }
            child.kill().map_err(|err| {
                ApiError::new(ErrorCode::IoError, "Failed to kill shell")
                    .with_details(err.to_string())
                    .into()
            })
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join close").with_details(err.to_string())
        })?
    }

    fn is_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }
}

/// Creates terminals backed by a local shell in a PTY.
pub struct PtyProvider {
    config: TerminalConfig,
}

impl PtyProvider {
    pub fn new(config: TerminalConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TerminalProvider for PtyProvider {
    async fn create_session(&self, request: TerminalRequest) -> PilotResult<Arc<Terminal>> {
        let output = OutputHandle::new(
            self.config.output_buffer_max_bytes,
            self.config.output_buffer_max_lines,
        );
        let backend = PtyBackend::spawn(&self.config, &request.working_dir, output.clone())?;
        tracing::info!(
            session_id = %output.session_id,
            connection_id = %request.connection_id,
            title = %request.title,
            "Terminal created"
        );
        Ok(Terminal::new(
            request.title,
            request.connection_id,
            Box::new(backend),
            output,
        ))
    }
}
