// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use apm::actions::Actions;
use apm::environment::Format;
use apm::event::Emitter;
use apm::kernel::{KernelInfo, Manager};
use apm::response::{
    CleanResponse, CurrentKernelResponse, Envelope, KernelModulesResponse, ListKernelsResponse,
};
use apm::Env;

pub fn command() -> Command {
    Command::new("kernel")
        .about("Kernel and module management")
        .subcommand_required(true)
        .subcommand(
            Command::new("list")
                .about("List kernels known to the package universe")
                .arg(flavour_arg())
                .arg(
                    Arg::new("installed-only")
                        .long("installed-only")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("current").about("The running kernel"))
        .subcommand(
            Command::new("install")
                .about("Install the latest kernel of a flavour")
                .arg(Arg::new("flavour").required(true))
                .arg(module_arg())
                .arg(headers_arg())
                .arg(dry_run_arg()),
        )
        .subcommand(
            Command::new("update")
                .about("Upgrade to the newest kernel, inheriting installed modules")
                .arg(flavour_arg())
                .arg(module_arg())
                .arg(headers_arg())
                .arg(dry_run_arg()),
        )
        .subcommand(
            Command::new("modules")
                .about("Kernel module packages")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("Modules available for the running kernel").arg(flavour_arg()))
                .subcommand(
                    Command::new("install")
                        .about("Install modules for the running kernel")
                        .arg(Arg::new("modules").num_args(1..).required(true))
                        .arg(dry_run_arg()),
                )
                .subcommand(
                    Command::new("remove")
                        .about("Remove modules of the running kernel")
                        .arg(Arg::new("modules").num_args(1..).required(true))
                        .arg(dry_run_arg()),
                ),
        )
        .subcommand(
            Command::new("clean")
                .about("Remove old kernels, keeping the running, newest and backup ones")
                .arg(
                    Arg::new("no-backup")
                        .long("no-backup")
                        .help("Do not retain a backup kernel")
                        .action(ArgAction::SetTrue),
                )
                .arg(dry_run_arg()),
        )
}

fn flavour_arg() -> Arg {
    Arg::new("flavour").long("flavour").action(ArgAction::Set)
}

fn module_arg() -> Arg {
    Arg::new("module")
        .long("module")
        .short('m')
        .help("Module to include, repeatable")
        .action(ArgAction::Append)
}

fn headers_arg() -> Arg {
    Arg::new("include-headers")
        .long("include-headers")
        .action(ArgAction::SetTrue)
}

fn dry_run_arg() -> Arg {
    Arg::new("dry-run")
        .long("dry-run")
        .help("Plan only, change nothing")
        .action(ArgAction::SetTrue)
}

pub async fn handle(args: &ArgMatches, env: Arc<Env>, token: &CancellationToken) -> Result<(), Error> {
    let events = Emitter::new(&env, None);
    let actions = Arc::new(Actions::new(env.clone(), events).await?);
    let manager = Manager::new(actions);

    match args.subcommand() {
        Some(("list", args)) => {
            let flavour = args.get_one::<String>("flavour").cloned();
            let installed_only = args.get_flag("installed-only");

            let mut kernels = manager.list(flavour.as_deref(), token).await?;
            if installed_only {
                kernels.retain(|k| k.is_installed);
            }

            emit(&env, ListKernelsResponse { kernels }, |r| {
                for kernel in &r.kernels {
                    print_kernel(kernel);
                }
            });
        }
        Some(("current", _)) => {
            let kernel = manager.current(token).await?;
            emit(&env, CurrentKernelResponse { kernel }, |r| print_kernel(&r.kernel));
        }
        Some(("install", args)) => {
            let flavour = args.get_one::<String>("flavour").cloned().unwrap_or_default();
            let kernel = manager.find_latest(Some(&flavour), token).await?;
            let modules = modules(args);
            let include_headers = args.get_flag("include-headers");
            let dry_run = args.get_flag("dry-run");

            let response = manager.install(&kernel, &modules, include_headers, dry_run, token).await?;
            emit(&env, response, |r| println!("{}", r.message));
        }
        Some(("update", args)) => {
            // Default to the running flavour and carry its modules over
            let current = manager.current(token).await?;
            let flavour = args
                .get_one::<String>("flavour")
                .cloned()
                .unwrap_or_else(|| current.flavour.clone());

            let target = manager.find_latest(Some(&flavour), token).await?;
            let mut selected = modules(args);
            for module in manager.inherit_modules_from_kernel(&target, &current, token).await? {
                if !selected.contains(&module) {
                    selected.push(module);
                }
            }

            let include_headers = args.get_flag("include-headers");
            let dry_run = args.get_flag("dry-run");

            let response = manager.install(&target, &selected, include_headers, dry_run, token).await?;
            emit(&env, response, |r| println!("{}", r.message));
        }
        Some(("modules", args)) => handle_modules(args, &env, &manager, token).await?,
        Some(("clean", args)) => {
            let no_backup = args.get_flag("no-backup");
            let dry_run = args.get_flag("dry-run");

            let report = manager.clean_old(no_backup, dry_run, token).await?;
            let response = CleanResponse {
                message: if report.dry_run {
                    "dry run, nothing removed".to_owned()
                } else {
                    format!("{} kernels removed", report.removed.len())
                },
                report,
            };
            emit(&env, response, |r| {
                for kept in &r.report.kept {
                    println!("keep   {} ({})", kept.full_version, kept.reason);
                }
                for removed in &r.report.removed {
                    println!("remove {removed}");
                }
                println!("{}", r.message);
            });
        }
        _ => unreachable!(),
    }

    Ok(())
}

async fn handle_modules(
    args: &ArgMatches,
    env: &Env,
    manager: &Manager,
    token: &CancellationToken,
) -> Result<(), Error> {
    match args.subcommand() {
        Some(("list", args)) => {
            let kernel = match args.get_one::<String>("flavour") {
                Some(flavour) => manager.find_latest(Some(flavour), token).await?,
                None => manager.current(token).await?,
            };
            let available = manager.find_available_modules(&kernel).await?;
            emit(
                env,
                KernelModulesResponse {
                    kernel: kernel.full_version.clone(),
                    modules: available,
                },
                |r| {
                    for module in &r.modules {
                        println!("{module}");
                    }
                },
            );
        }
        Some(("install", args)) => {
            let kernel = manager.current(token).await?;
            let selected = modules_of(args);
            let dry_run = args.get_flag("dry-run");
            let response = manager.install(&kernel, &selected, false, dry_run, token).await?;
            emit(env, response, |r| println!("{}", r.message));
        }
        Some(("remove", args)) => {
            let kernel = manager.current(token).await?;
            let selected = modules_of(args);
            let dry_run = args.get_flag("dry-run");
            let response = manager.remove(&kernel, &selected, false, dry_run, token).await?;
            emit(env, response, |r| println!("{}", r.message));
        }
        _ => unreachable!(),
    }

    Ok(())
}

fn modules(args: &ArgMatches) -> Vec<String> {
    args.get_many::<String>("module")
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn modules_of(args: &ArgMatches) -> Vec<String> {
    args.get_many::<String>("modules")
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn emit<T: serde::Serialize>(env: &Env, data: T, text: impl FnOnce(&T)) {
    match env.format {
        Format::Text => text(&data),
        Format::Json | Format::Dbus => println!("{}", Envelope::ok(data).to_json()),
    }
}

fn print_kernel(kernel: &KernelInfo) {
    let mut markers = vec![];
    if kernel.is_running {
        markers.push("running");
    }
    if kernel.is_default {
        markers.push("default");
    }
    if kernel.is_installed {
        markers.push("installed");
    }
    let suffix = if markers.is_empty() {
        String::new()
    } else {
        format!(" [{}]", markers.join(", "))
    };

    println!("{}{suffix}", kernel.full_version);
    if !kernel.modules.is_empty() {
        println!("    modules: {}", kernel.modules.join(", "));
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Actions(#[from] apm::actions::Error),

    #[error("{0}")]
    Kernel(#[from] apm::kernel::Error),
}

impl Error {
    pub fn message(&self) -> String {
        match self {
            Error::Actions(error) => error.as_matched().message(),
            Error::Kernel(error) => error.as_matched().message(),
        }
    }
}
