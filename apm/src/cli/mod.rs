// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use apm::environment::{binary_exists, Format};
use apm::{response, Env};

mod dbus;
mod kernel;
mod system;
mod version;

/// Generate the CLI command structure
fn command(is_atomic: bool) -> Command {
    Command::new("apm")
        .about("Hybrid package management for classic and atomic hosts")
        .arg(
            Arg::new("format")
                .long("format")
                .global(true)
                .help("Output format")
                .value_parser(["text", "json", "dbus"])
                .default_value("text"),
        )
        .arg(
            Arg::new("transaction")
                .long("transaction")
                .global(true)
                .help("Transaction id propagated into events")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("yes")
                .short('y')
                .long("yes")
                .global(true)
                .help("Assume yes for all questions")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .help("Print additional information about what apm is doing")
                .action(ArgAction::SetTrue),
        )
        .arg_required_else_help(true)
        .subcommand(system::command(is_atomic))
        .subcommand(kernel::command())
        .subcommand(
            Command::new("distrobox")
                .about("Container-managed package operations")
                .hide(true),
        )
        .subcommand(dbus::system_command())
        .subcommand(dbus::session_command())
        .subcommand(version::command())
}

/// Process all CLI arguments
pub async fn process() -> ExitCode {
    let is_atomic = binary_exists("bootc");
    let matches = command(is_atomic).get_matches();

    let format = matches
        .get_one::<String>("format")
        .and_then(|f| Format::from_str(f).ok())
        .unwrap_or_default();
    let transaction = matches.get_one::<String>("transaction").cloned();
    let yes = matches.get_flag("yes");

    init_logger(matches.get_flag("verbose"));

    let env = match Env::new(format, transaction, yes) {
        Ok(env) => Arc::new(env),
        Err(error) => return report(format, &format!("configuration: {error}")),
    };

    // One token for the whole invocation: ^C propagates into any child
    // process the core is currently driving
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = match matches.subcommand() {
        Some(("system", args)) => system::handle(args, env.clone(), &token).await.map_err(Error::System),
        Some(("kernel", args)) => kernel::handle(args, env.clone(), &token).await.map_err(Error::Kernel),
        Some(("dbus-system", _)) => dbus::handle_system(env.clone(), token.clone()).await.map_err(Error::Dbus),
        Some(("dbus-session", _)) => dbus::handle_session(env.clone(), token.clone()).await.map_err(Error::Dbus),
        Some(("distrobox", _)) => Err(Error::Unsupported("distrobox")),
        Some(("version", _)) => {
            version::print();
            Ok(())
        }
        _ => unreachable!(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => report(format, &error.message()),
    }
}

/// Single-line failure on the selected transport, exit code 1
fn report(format: Format, message: &str) -> ExitCode {
    match format {
        Format::Text => log::error!("{message}"),
        Format::Json | Format::Dbus => println!("{}", response::failure(message).to_json()),
    }
    ExitCode::FAILURE
}

/// `RUST_LOG` wins when present; `--verbose` raises the default level
fn init_logger(verbose: bool) {
    if std::env::var(env_logger::DEFAULT_FILTER_ENV).is_ok() {
        env_logger::Builder::from_default_env().init();
        return;
    }

    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new()
        .filter_level(level)
        .format_target(false)
        .format_timestamp(None)
        .init();
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("error handling system: {0}")]
    System(#[from] system::Error),

    #[error("error handling kernel: {0}")]
    Kernel(#[from] kernel::Error),

    #[error("error handling bus service: {0}")]
    Dbus(#[from] apm::dbus::Error),

    #[error("the {0} arm is not supported by this build")]
    Unsupported(&'static str),
}

impl Error {
    /// Taxonomy-rendered message where one exists
    fn message(&self) -> String {
        match self {
            Error::System(error) => error.message(),
            Error::Kernel(error) => error.message(),
            other => other.to_string(),
        }
    }
}
