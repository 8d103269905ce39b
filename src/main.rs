use clap::Parser;
use sshpilot::config::{self, Cli, Command, Config, EditArgs, IdArgs, OsArg, ProfileArgs, SudoArg};
use sshpilot::connector::Connector;
use sshpilot::disconnect::DisconnectController;
use sshpilot::error::{ApiError, ErrorCode, PilotError, PilotResult};
use sshpilot::notice::Notifier;
use sshpilot::profile::{OsFamily, PlainProfile, SecretString, SudoPolicy};
use sshpilot::registry::SessionRegistry;
use sshpilot::repository::{ConnectionRepository, SudoSecretSource};
use sshpilot::terminal::{PtyProvider, Terminal, Termination};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(&cli.global)?;
    init_logging(&config.logging);

    let repository = Arc::new(ConnectionRepository::open_configured(&config.storage)?);
    match cli.command {
        Command::List => run_list(&repository)?,
        Command::Add(args) => run_add(&repository, args)?,
        Command::Edit(args) => run_edit(&repository, args)?,
        Command::Remove(args) => run_remove(&repository, &args)?,
        Command::Duplicate(args) => run_duplicate(&repository, &args)?,
        Command::Show(args) => run_show(&repository, &args)?,
        Command::Command(args) => run_command(&repository, &args)?,
        Command::SudoPassword(args) => run_sudo_password(&repository, &args)?,
        Command::Connect(args) => run_connect(&config, repository, &args).await?,
    }
    Ok(())
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(logging.level.clone());
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn run_list(repository: &ConnectionRepository) -> PilotResult<()> {
    let connections = repository.list();
    if connections.is_empty() {
        eprintln!("No connections stored.");
        return Ok(());
    }
    for profile in connections {
        println!(
            "{}\t{}\t{}@{}:{}",
            profile.id, profile.alias, profile.username, profile.host, profile.port
        );
    }
    Ok(())
}

fn run_add(repository: &ConnectionRepository, args: ProfileArgs) -> PilotResult<()> {
    let stored = repository.add(profile_from_args(args, None)?)?;
    println!("{}", stored.id);
    Ok(())
}

fn run_edit(repository: &ConnectionRepository, args: EditArgs) -> PilotResult<()> {
    let EditArgs { id, profile } = args;
    if !repository.update(profile_from_args(profile, Some(id.clone()))?)? {
        exit_not_found(&id);
    }
    Ok(())
}

fn run_remove(repository: &ConnectionRepository, args: &IdArgs) -> PilotResult<()> {
    if !repository.remove(&args.id)? {
        exit_not_found(&args.id);
    }
    Ok(())
}

fn run_duplicate(repository: &ConnectionRepository, args: &IdArgs) -> PilotResult<()> {
    match repository.duplicate(&args.id)? {
        Some(copy) => println!("{}", copy.id),
        None => exit_not_found(&args.id),
    }
    Ok(())
}

fn run_show(repository: &ConnectionRepository, args: &IdArgs) -> PilotResult<()> {
    match repository.find(&args.id) {
        Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
        None => exit_not_found(&args.id),
    }
    Ok(())
}

fn run_command(repository: &ConnectionRepository, args: &IdArgs) -> PilotResult<()> {
    match repository.generate_connect_command(&args.id)? {
        Some(command) => println!("{command}"),
        None => exit_not_found(&args.id),
    }
    Ok(())
}

fn run_sudo_password(repository: &ConnectionRepository, args: &IdArgs) -> PilotResult<()> {
    match repository.sudo_secret(&args.id)? {
        Some(sudo) => {
            if sudo.source == SudoSecretSource::LoginPassword {
                eprintln!("No sudo password stored; using the login password.");
            }
            println!("{}", sudo.secret.expose());
        }
        None if repository.find(&args.id).is_some() => {
            eprintln!("No sudo or login password stored for {}.", args.id);
            std::process::exit(1);
        }
        None => exit_not_found(&args.id),
    }
    Ok(())
}

async fn run_connect(
    config: &Config,
    repository: Arc<ConnectionRepository>,
    args: &IdArgs,
) -> PilotResult<()> {
    let registry = Arc::new(SessionRegistry::new());
    let notifier = Notifier::default();
    let mut notices = notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            eprintln!("[sshpilot] {}", notice.message());
        }
    });

    let connector = Connector::new(
        repository,
        registry.clone(),
        Arc::new(PtyProvider::new(config.terminal.clone())),
        &config.automation,
        config.terminal.resolved_working_dir(),
        notifier.clone(),
    )?;
    let disconnect =
        DisconnectController::new(registry, config.terminal.termination, notifier);

    let connection = match connector.connect(&args.id).await {
        Ok(connection) => connection,
        Err(PilotError::Api(api)) if api.error_code == ErrorCode::NotFound => exit_not_found(&args.id),
        Err(err) => return Err(err),
    };
    let terminal = connection.terminal;

    let input = {
        let terminal = terminal.clone();
        let termination = config.terminal.termination;
        tokio::spawn(async move { forward_stdin(&terminal, termination).await })
    };

    tokio::select! {
        result = pump_output(&terminal) => result?,
        _ = tokio::signal::ctrl_c() => {
            let report = disconnect.disconnect_all(&args.id).await;
            tracing::debug!(sessions = report.sessions, "Interrupted");
        }
    }
    input.abort();
    terminal.close().await?;
    Ok(())
}

async fn pump_output(terminal: &Terminal) -> PilotResult<()> {
    let mut stdout = tokio::io::stdout();
    let mut cursor = 0;
    loop {
        let slice = terminal.output_since(cursor);
        if slice.truncated {
            tracing::debug!(from = cursor, to = slice.start_cursor, "Output dropped before display");
        }
        if !slice.bytes.is_empty() {
            stdout.write_all(&slice.bytes).await.map_err(io_error)?;
            stdout.flush().await.map_err(io_error)?;
        }
        cursor = slice.end_cursor;
        if !terminal.is_alive() && slice.bytes.is_empty() {
            return Ok(());
        }
        let _ = tokio::time::timeout(Duration::from_millis(200), terminal.output_changed()).await;
    }
}

/// Typed input goes to the session; end of input ends the remote shell.
async fn forward_stdin(terminal: &Terminal, termination: Termination) -> PilotResult<()> {
    let mut stdin = tokio::io::stdin();
    let mut buffer = [0u8; 1024];
    loop {
        let read = stdin.read(&mut buffer).await.map_err(io_error)?;
        if read == 0 {
            terminal.terminate(termination).await?;
            return Ok(());
        }
        terminal.write(&buffer[..read], false).await?;
    }
}

fn profile_from_args(args: ProfileArgs, id: Option<String>) -> PilotResult<PlainProfile> {
    let mut profile = PlainProfile::new(args.alias, args.host, args.user)
        .with_port(args.port)
        .with_os_family(match args.os {
            OsArg::Linux => OsFamily::Linux,
            OsArg::Windows => OsFamily::Windows,
        })
        .with_commands(args.commands)
        .with_maximize_on_connect(args.maximize);
    if let Some(id) = id {
        profile = profile.with_id(id);
    }
    if let Some(name) = &args.password_env {
        profile = profile.with_password(read_env_secret(name)?);
    }
    if let Some(key) = args.key {
        profile = profile.with_public_key(key);
        if let Some(name) = &args.passphrase_env {
            profile = profile.with_key_passphrase(read_env_secret(name)?);
        }
    }
    let policy = match args.sudo {
        SudoArg::None => SudoPolicy::Disabled,
        SudoArg::Own => SudoPolicy::OwnPassword,
        SudoArg::Reuse => SudoPolicy::UserPasswordReused,
    };
    let sudo_password = args
        .sudo_password_env
        .as_deref()
        .map(read_env_secret)
        .transpose()?;
    Ok(profile.with_sudo(policy, sudo_password))
}

fn read_env_secret(name: &str) -> PilotResult<SecretString> {
    std::env::var(name).map(SecretString::from).map_err(|err| {
        ApiError::new(ErrorCode::InvalidArgument, format!("Environment variable {name} is not set"))
            .with_details(err.to_string())
            .into()
    })
}

fn io_error(err: std::io::Error) -> PilotError {
    ApiError::new(ErrorCode::IoError, "Terminal I/O failed")
        .with_details(err.to_string())
        .into()
}

fn exit_not_found(id: &str) -> ! {
    eprintln!("Connection not found: {id}");
    eprintln!("Use `sshpilot list` to see stored connections.");
    std::process::exit(2);
}
