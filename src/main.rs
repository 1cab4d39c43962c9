//! Binary entry point for the drydock CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cli::{Cli, CreateCommand, ExecCommand};
use drydock::cloud_init::{CloudInitError, resolve_boot_payload};
use drydock::config::{ConfigError, DrydockConfig};
use drydock::credentials::CredentialResolver;
use drydock::provider::{CreateRequest, RegistryError, RequestError};
use drydock::remote::{TransportConnector, TtyOptions};
use drydock::session::{
    ConsoleRegistry, FileSessionStore, ManagerSettings, Session, SessionError, SessionManager,
};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    BootPayload(#[from] CloudInitError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("provisioning task ended unexpectedly: {0}")]
    Task(String),
    #[error("remote command terminated without an exit status")]
    MissingExitCode,
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn build_manager(config: DrydockConfig) -> Result<SessionManager, CliError> {
    let connector = TransportConnector::new(
        config.ssh_settings()?,
        CredentialResolver::from_env(config.identity_file_paths()),
        config.fingerprint(),
    );
    let store = FileSessionStore::new(config.sessions_path());
    let console = ConsoleRegistry::new(config.console_include_path());
    let settings = ManagerSettings::from_config(&config);
    let registry = drydock::builtin_registry(config)?;
    Ok(SessionManager::new(
        Arc::new(registry),
        Arc::new(store),
        Arc::new(connector),
        Arc::new(console),
        settings,
    ))
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = DrydockConfig::load_without_cli_args()?;
    config.validate()?;
    let default_provider = config.default_provider.clone();
    let manager = build_manager(config)?;
    match cli {
        Cli::Create(command) => create(&manager, command, &default_provider).await,
        Cli::List => list(&manager).await,
        Cli::Status(arg) => {
            let session = manager.status(&arg.name).await?;
            write_line(&format_session(&session));
            Ok(0)
        }
        Cli::Exec(command) => exec(&manager, &command, io::stdout(), io::stderr()).await,
        Cli::Console(arg) => {
            let code = manager
                .console(&arg.name, &TtyOptions::from_terminal())
                .await?;
            code.ok_or(CliError::MissingExitCode)
        }
        Cli::Destroy(arg) => {
            let session = manager.destroy(&arg.name).await?;
            write_line(&format!("destroyed {}", session.id));
            Ok(0)
        }
        Cli::Reap => {
            for name in manager.reap_expired(Utc::now()).await? {
                write_line(&format!("reaped {name}"));
            }
            Ok(0)
        }
    }
}

async fn create(
    manager: &SessionManager,
    command: CreateCommand,
    default_provider: &str,
) -> Result<i32, CliError> {
    let payload =
        resolve_boot_payload(command.user_data.as_deref(), command.boot_script.as_deref())?;
    let request = CreateRequest::builder(command.name)
        .region(command.region)
        .hardware(command.hardware)
        .image(command.image)
        .user_data(payload)
        .build()?;
    let provider = command.provider.as_deref().unwrap_or(default_provider);
    let expires_at = command
        .ttl
        .map(|minutes| Utc::now() + ChronoDuration::minutes(i64::from(minutes)));

    let provisioning = manager.create(request, provider, expires_at).await?;
    write_line(&format!(
        "provisioning {} on {}",
        provisioning.session.id, provisioning.session.provider
    ));

    let cancel = manager.cancellation();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let joined = provisioning.handle.await;
    interrupt.abort();
    let session = joined.map_err(|err| CliError::Task(err.to_string()))??;
    write_line(&format_session(&session));
    Ok(0)
}

async fn list(manager: &SessionManager) -> Result<i32, CliError> {
    let listing = manager.list().await?;
    for failure in &listing.failures {
        writeln!(
            io::stderr(),
            "warning: could not refresh {} sessions: {}",
            failure.provider,
            failure.message
        )
        .ok();
    }
    for session in &listing.sessions {
        write_line(&format_session(session));
    }
    Ok(0)
}

/// Runs the command and relays its output, including whatever was streamed
/// before a mid-stream failure.
async fn exec(
    manager: &SessionManager,
    command: &ExecCommand,
    mut stdout: impl Write,
    mut stderr: impl Write,
) -> Result<i32, CliError> {
    validate_command_args(&command.command)?;
    let remote_command = render_remote_command(&command.command);
    let result = manager.exec(&command.name, &remote_command).await;
    let streamed = result
        .as_ref()
        .map_or_else(SessionError::partial_output, Some);
    if let Some(output) = streamed {
        stdout.write_all(&output.stdout).ok();
        stderr.write_all(&output.stderr).ok();
    }
    result?.exit_code.ok_or(CliError::MissingExitCode)
}

fn format_session(session: &Session) -> String {
    let mut line = format!(
        "{}\t{}\t{}\t{}",
        session.id,
        session.status,
        session.provider,
        if session.address.is_empty() {
            "-"
        } else {
            session.address.as_str()
        }
    );
    if let Some(expiry) = session.expires_at {
        line.push_str(&format!("\texpires {}", expiry.format("%Y-%m-%d %H:%M UTC")));
    }
    if let Some(reason) = session.failure.as_deref() {
        line.push_str(&format!("\t({reason})"));
    }
    line
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn write_line(line: &str) {
    writeln!(io::stdout(), "{line}").ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
