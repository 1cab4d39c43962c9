//! Command-line interface definitions for the `drydock` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `drydock` binary.
#[derive(Debug, Parser)]
#[command(
    name = "drydock",
    about = "Provision disposable VMs and work on them over SSH or WebSocket",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision a VM and record it as a session.
    #[command(name = "create", about = "Provision a VM and record it as a session")]
    Create(CreateCommand),
    /// List sessions, refreshed against their providers.
    #[command(name = "list", about = "List sessions, refreshed against their providers")]
    List,
    /// Show one session, refreshed against its provider.
    #[command(name = "status", about = "Show one session, refreshed against its provider")]
    Status(SessionArg),
    /// Run a command on a session.
    #[command(name = "exec", about = "Run a command on a session")]
    Exec(ExecCommand),
    /// Open an interactive shell on a session.
    #[command(name = "console", about = "Open an interactive shell on a session")]
    Console(SessionArg),
    /// Delete a session's VM and forget the session.
    #[command(name = "destroy", about = "Delete a session's VM and forget the session")]
    Destroy(SessionArg),
    /// Destroy every session past its time-to-live.
    #[command(name = "reap", about = "Destroy every session past its time-to-live")]
    Reap,
}

/// Arguments for the `drydock create` subcommand.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    /// Session and VM name. Must be a valid hostname label.
    pub(crate) name: String,
    /// Provider to create the VM with; defaults to `default_provider`.
    #[arg(long, value_name = "PROVIDER")]
    pub(crate) provider: Option<String>,
    /// Override the provider's region or zone.
    #[arg(long, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// Override the hardware class (for example a Scaleway commercial type).
    ///
    /// Providers validate availability during provisioning and reject unknown
    /// values with a provider-specific error.
    #[arg(long, value_name = "TYPE")]
    pub(crate) hardware: Option<String>,
    /// Override the image label.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Boot payload given inline: cloud-config YAML or a script.
    ///
    /// Providers with cloud-init receive it as user-data; others run it once
    /// the VM is reachable.
    #[arg(long, value_name = "PAYLOAD", conflicts_with = "boot_script")]
    pub(crate) user_data: Option<String>,
    /// Boot payload read from a local file.
    #[arg(long, value_name = "PATH", conflicts_with = "user_data")]
    pub(crate) boot_script: Option<String>,
    /// Minutes after which `drydock reap` destroys the session.
    #[arg(long, value_name = "MINUTES")]
    pub(crate) ttl: Option<u32>,
}

/// A single session name.
#[derive(Debug, Args)]
pub(crate) struct SessionArg {
    /// Session name.
    pub(crate) name: String,
}

/// Arguments for the `drydock exec` subcommand.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    /// Session name.
    pub(crate) name: String,
    /// Command to execute on the remote host (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}
