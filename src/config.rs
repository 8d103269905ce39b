use crate::error::{ApiError, ErrorCode, PilotResult};
use crate::terminal::Termination;
use clap::{Args, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `Memory` only serves in-process repositories; a profile file needs `Keyring`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackendKind {
    Memory,
    #[default]
    Keyring,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    FixedDelay,
    PromptDetection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub terminal: TerminalConfig,
    pub automation: AutomationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub profiles_path: String,
    pub secret_backend: SecretBackendKind,
    pub service_namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            profiles_path: default_profiles_path(),
            secret_backend: SecretBackendKind::default(),
            service_namespace: "sshpilot".to_string(),
        }
    }
}

fn default_profiles_path() -> String {
    if let Ok(dir) = env::var("XDG_CONFIG_HOME")
        && !dir.is_empty()
    {
        return format!("{dir}/sshpilot/connections.json");
    }
    if let Ok(home) = env::var("HOME")
        && !home.is_empty()
    {
        return format!("{home}/.config/sshpilot/connections.json");
    }
    "sshpilot-connections.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Empty means `$SHELL`, falling back to `/bin/sh`.
    pub shell: String,
    pub working_dir: String,
    pub cols: u16,
    pub rows: u16,
    pub term: String,
    pub output_buffer_max_lines: usize,
    pub output_buffer_max_bytes: usize,
    pub termination: Termination,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: String::new(),
            working_dir: String::new(),
            cols: 120,
            rows: 40,
            term: "xterm-256color".to_string(),
            output_buffer_max_lines: 5000,
            output_buffer_max_bytes: 512 * 1024,
            termination: Termination::Exit,
        }
    }
}

impl TerminalConfig {
    pub fn resolved_shell(&self) -> String {
        if !self.shell.is_empty() {
            return self.shell.clone();
        }
        env::var("SHELL")
            .ok()
            .filter(|shell| !shell.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    pub fn resolved_working_dir(&self) -> PathBuf {
        if !self.working_dir.is_empty() {
            return PathBuf::from(&self.working_dir);
        }
        env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub strategy: Strategy,
    pub initial_delay_ms: u64,
    pub establish_delay_ms: u64,
    pub sudo_prompt_delay_ms: u64,
    pub command_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub detection_timeout_ms: u64,
    pub prompts: PromptConfig,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::FixedDelay,
            initial_delay_ms: 3_000,
            establish_delay_ms: 3_000,
            sudo_prompt_delay_ms: 1_500,
            command_delay_ms: 1_000,
            poll_interval_ms: 250,
            detection_timeout_ms: 15_000,
            prompts: PromptConfig::default(),
        }
    }
}

impl AutomationConfig {
    pub fn timings(&self) -> Timings {
        Timings {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            establish_delay: Duration::from_millis(self.establish_delay_ms),
            sudo_prompt_delay: Duration::from_millis(self.sudo_prompt_delay_ms),
            command_delay: Duration::from_millis(self.command_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            detection_timeout: Duration::from_millis(self.detection_timeout_ms),
        }
    }
}

/// Delays used by the automation worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub initial_delay: Duration,
    pub establish_delay: Duration,
    pub sudo_prompt_delay: Duration,
    pub command_delay: Duration,
    pub poll_interval: Duration,
    pub detection_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        AutomationConfig::default().timings()
    }
}

/// Regexes matched case-insensitively against fresh terminal output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub passphrase: Vec<String>,
    pub shell: Vec<String>,
    pub sudo_password: Vec<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            passphrase: vec![
                "enter passphrase".to_string(),
                "passphrase for".to_string(),
                "password:".to_string(),
            ],
            shell: vec![r"[$#>]\s*$".to_string()],
            sudo_password: vec![
                r"\[sudo\] password".to_string(),
                "password for".to_string(),
                "password:".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version = crate::version::VERSION, about = "SSH connection profiles with login automation")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args, Clone, Default)]
pub struct GlobalArgs {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub profiles: Option<String>,
    #[arg(long, global = true)]
    pub secret_backend: Option<SecretBackendKind>,
    #[arg(long, global = true)]
    pub strategy: Option<Strategy>,
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// List stored connections.
    List,
    /// Add a connection.
    Add(ProfileArgs),
    /// Replace the settings of an existing connection.
    Edit(EditArgs),
    /// Delete a connection and its stored secrets.
    Remove(IdArgs),
    /// Copy a connection under a new id.
    Duplicate(IdArgs),
    /// Show a connection with secrets masked.
    Show(IdArgs),
    /// Print the ssh command line for a connection.
    Command(IdArgs),
    /// Print the password to use at a sudo prompt.
    SudoPassword(IdArgs),
    /// Open a terminal, log in and attach to it.
    Connect(IdArgs),
}

#[derive(Debug, Args, Clone)]
pub struct IdArgs {
    #[arg(value_name = "CONNECTION_ID")]
    pub id: String,
}

#[derive(Debug, Args, Clone)]
pub struct EditArgs {
    #[arg(value_name = "CONNECTION_ID")]
    pub id: String,
    #[command(flatten)]
    pub profile: ProfileArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OsArg {
    Linux,
    Windows,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SudoArg {
    None,
    Own,
    Reuse,
}

#[derive(Debug, Args, Clone)]
pub struct ProfileArgs {
    #[arg(long)]
    pub alias: String,
    #[arg(long)]
    pub host: String,
    #[arg(long, default_value_t = 22, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,
    #[arg(long)]
    pub user: String,
    /// Read the login password from this environment variable.
    #[arg(long, value_name = "ENV")]
    pub password_env: Option<String>,
    #[arg(long)]
    pub key: Option<String>,
    /// Read the key passphrase from this environment variable.
    #[arg(long, value_name = "ENV")]
    pub passphrase_env: Option<String>,
    #[arg(long, value_enum, default_value = "linux")]
    pub os: OsArg,
    #[arg(long, value_enum, default_value = "none")]
    pub sudo: SudoArg,
    /// Read the sudo password from this environment variable.
    #[arg(long, value_name = "ENV")]
    pub sudo_password_env: Option<String>,
    /// Command to run after login; repeatable.
    #[arg(long = "run", value_name = "COMMAND")]
    pub commands: Vec<String>,
    #[arg(long)]
    pub maximize: bool,
}

impl Config {
    pub fn load(args: &GlobalArgs) -> PilotResult<Self> {
        let mut config = if let Some(path) = &args.config {
            Self::from_file(path)?
        } else if Path::new("sshpilot.toml").exists() {
            Self::from_file(Path::new("sshpilot.toml"))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.apply_cli(args);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> PilotResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> PilotResult<Self> {
        toml::from_str(content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
                .into()
        })
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("SSHPILOT_PROFILES_PATH") {
            self.storage.profiles_path = value;
        }
        if let Ok(value) = env::var("SSHPILOT_SECRET_BACKEND")
            && let Some(kind) = parse_secret_backend(&value)
        {
            self.storage.secret_backend = kind;
        }
        if let Ok(value) = env::var("SSHPILOT_STRATEGY")
            && let Some(strategy) = parse_strategy(&value)
        {
            self.automation.strategy = strategy;
        }
        if let Ok(value) = env::var("SSHPILOT_LOG_LEVEL") {
            self.logging.level = value;
        }
    }

    fn apply_cli(&mut self, args: &GlobalArgs) {
        if let Some(path) = &args.profiles {
            self.storage.profiles_path = path.clone();
        }
        if let Some(kind) = args.secret_backend {
            self.storage.secret_backend = kind;
        }
        if let Some(strategy) = args.strategy {
            self.automation.strategy = strategy;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }
}

fn parse_secret_backend(value: &str) -> Option<SecretBackendKind> {
    match value.to_ascii_lowercase().as_str() {
        "memory" => Some(SecretBackendKind::Memory),
        "keyring" | "keychain" => Some(SecretBackendKind::Keyring),
        _ => None,
    }
}

fn parse_strategy(value: &str) -> Option<Strategy> {
    match value.to_ascii_lowercase().replace('-', "_").as_str() {
        "fixed_delay" | "fixed" => Some(Strategy::FixedDelay),
        "prompt_detection" | "detect" => Some(Strategy::PromptDetection),
        _ => None,
    }
}
