// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use apm::actions::Actions;
use apm::db::packages::{Order, Query};
use apm::db::history;
use apm::environment::Format;
use apm::event::Emitter;
use apm::image;
use apm::package::Package;
use apm::response::{
    Envelope, HistoryRow, ImageApplyResponse, ImageHistoryResponse, ImageStatusResponse,
    ImageUpdateResponse,
};
use apm::Env;

pub fn command(is_atomic: bool) -> Command {
    let apply = Arg::new("apply")
        .long("apply")
        .help("Apply the change to the host image as well")
        .action(ArgAction::SetTrue)
        .hide(!is_atomic);

    Command::new("system")
        .about("Host package operations")
        .subcommand_required(true)
        .subcommand(
            Command::new("install")
                .about("Install packages")
                .long_about("Install packages; a trailing `-` marks a name for removal in the same transaction")
                .arg(Arg::new("packages").num_args(1..).required(true))
                .arg(apply.clone()),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove packages")
                .arg(Arg::new("packages").num_args(1..).required(true))
                .arg(apply),
        )
        .subcommand(Command::new("update").about("Refresh package indexes and the local mirror"))
        .subcommand(Command::new("upgrade").about("Upgrade every installed package"))
        .subcommand(
            Command::new("info")
                .about("Details of one package")
                .arg(Arg::new("package").required(true))
                .arg(full_flag()),
        )
        .subcommand(
            Command::new("search")
                .about("Search packages by name")
                .arg(Arg::new("query").required(true))
                .arg(
                    Arg::new("installed")
                        .long("installed")
                        .help("Only installed packages")
                        .action(ArgAction::SetTrue),
                )
                .arg(full_flag()),
        )
        .subcommand(
            Command::new("list")
                .about("List packages from the mirror")
                .arg(Arg::new("sort").long("sort").action(ArgAction::Set))
                .arg(
                    Arg::new("order")
                        .long("order")
                        .value_parser(["ASC", "DESC", "asc", "desc"])
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(clap::value_parser!(i64))
                        .default_value("10"),
                )
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .value_parser(clap::value_parser!(i64))
                        .default_value("0"),
                )
                .arg(
                    Arg::new("filter")
                        .long("filter")
                        .help("field=value, repeatable")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("force-update")
                        .long("force-update")
                        .help("Refresh the mirror before listing")
                        .action(ArgAction::SetTrue),
                )
                .arg(full_flag()),
        )
        .subcommand(
            Command::new("image")
                .about("Host image lifecycle")
                .subcommand_required(true)
                .hide(!is_atomic)
                .subcommand(Command::new("apply").about("Build the configured image and switch to it"))
                .subcommand(Command::new("status").about("Booted and configured image state"))
                .subcommand(Command::new("update").about("Fetch or rebuild against the newest base image"))
                .subcommand(
                    Command::new("history")
                        .about("Applied configuration history")
                        .arg(Arg::new("image").long("image").help("Filter by image name").action(ArgAction::Set))
                        .arg(
                            Arg::new("limit")
                                .long("limit")
                                .value_parser(clap::value_parser!(i64))
                                .default_value("10"),
                        )
                        .arg(
                            Arg::new("offset")
                                .long("offset")
                                .value_parser(clap::value_parser!(i64))
                                .default_value("0"),
                        ),
                ),
        )
}

fn full_flag() -> Arg {
    Arg::new("full")
        .long("full")
        .help("Every known field")
        .action(ArgAction::SetTrue)
}

pub async fn handle(args: &ArgMatches, env: Arc<Env>, token: &CancellationToken) -> Result<(), Error> {
    let events = Emitter::new(&env, None);
    let actions = Actions::new(env.clone(), events).await?;

    match args.subcommand() {
        Some(("install", args)) => {
            let packages = names(args);
            let apply = args.get_flag("apply");
            let response = actions.install(&packages, apply, token).await?;
            emit(&env, response, |r| println!("{}", r.message));
        }
        Some(("remove", args)) => {
            let packages = names(args);
            let apply = args.get_flag("apply");
            let response = actions.remove(&packages, apply, token).await?;
            emit(&env, response, |r| println!("{}", r.message));
        }
        Some(("update", _)) => {
            let response = actions.update(token).await?;
            emit(&env, response, |r| println!("{}", r.message));
        }
        Some(("upgrade", _)) => {
            let response = actions.upgrade(token).await?;
            emit(&env, response, |r| println!("{}", r.message));
        }
        Some(("info", args)) => {
            let name = args.get_one::<String>("package").cloned().unwrap_or_default();
            let full = args.get_flag("full");
            let response = actions.info(&name, token).await?;
            emit(&env, response, |r| print_package(&r.package, full));
        }
        Some(("search", args)) => {
            let query = args.get_one::<String>("query").cloned().unwrap_or_default();
            let installed = args.get_flag("installed");
            let full = args.get_flag("full");
            let response = actions.search(&query, installed, token).await?;
            emit(&env, response, |r| {
                for package in &r.packages {
                    print_package(package, full);
                }
            });
        }
        Some(("list", args)) => {
            let params = Query {
                filters: parse_filters(args)?,
                sort: args.get_one::<String>("sort").cloned(),
                order: args
                    .get_one::<String>("order")
                    .map(|o| Order::parse(o))
                    .unwrap_or_default(),
                limit: args.get_one::<i64>("limit").copied(),
                offset: args.get_one::<i64>("offset").copied().unwrap_or_default(),
            };
            let force_update = args.get_flag("force-update");
            let full = args.get_flag("full");

            let response = actions.list(&params, force_update, token).await?;
            emit(&env, response, |r| {
                for package in &r.packages {
                    print_package(package, full);
                }
                println!("{} of {} packages", r.packages.len(), r.total_count);
            });
        }
        Some(("image", args)) => handle_image(args, &env, &actions, token).await?,
        _ => unreachable!(),
    }

    Ok(())
}

async fn handle_image(
    args: &ArgMatches,
    env: &Env,
    actions: &Actions,
    token: &CancellationToken,
) -> Result<(), Error> {
    let engine = actions.image();

    match args.subcommand() {
        Some(("apply", _)) => {
            let report = engine.build_and_switch(token, false, true, None).await?;
            let response = ImageApplyResponse {
                message: "the image has been updated".to_owned(),
                image_id: report.image_id,
                journaled: report.journaled,
            };
            emit(env, response, |r| println!("{} ({})", r.message, r.image_id));
        }
        Some(("status", _)) => {
            let response = ImageStatusResponse {
                host: engine.status(token).await?,
                config: engine.load_config(token).await?,
            };
            emit(env, response, |r| {
                if let Some(booted) = r.host.booted_image() {
                    println!("booted    : {} ({})", booted.image, booted.transport);
                }
                println!("configured: {}", r.config.image);
                println!("install   : {}", r.config.packages.install.join(" "));
                println!("remove    : {}", r.config.packages.remove.join(" "));
                println!("staged    : {}", r.host.status.staged.is_some());
            });
        }
        Some(("update", _)) => {
            let outcome = engine.check_update(token, None).await?;
            let response = ImageUpdateResponse::from_outcome(outcome);
            emit(env, response, |r| println!("{}", r.message));
        }
        Some(("history", args)) => {
            let filter = args.get_one::<String>("image").cloned();
            let limit = args.get_one::<i64>("limit").copied().unwrap_or(10);
            let offset = args.get_one::<i64>("offset").copied().unwrap_or_default();

            let history = engine.history();
            let entries = history.list(filter.as_deref(), limit, offset).await?;
            let total_count = history.count(filter.as_deref()).await?;

            let response = ImageHistoryResponse {
                history: entries
                    .into_iter()
                    .map(|entry| HistoryRow {
                        image_name: entry.image_name,
                        config: entry.config,
                        date: entry.date,
                    })
                    .collect(),
                total_count,
            };
            emit(env, response, |r| {
                for row in &r.history {
                    println!(
                        "{}  {}  +{} -{}",
                        row.date.format("%Y-%m-%d %H:%M:%S"),
                        row.image_name,
                        row.config.packages.install.len(),
                        row.config.packages.remove.len(),
                    );
                }
                println!("{} of {} entries", r.history.len(), r.total_count);
            });
        }
        _ => unreachable!(),
    }

    Ok(())
}

fn names(args: &ArgMatches) -> Vec<String> {
    args.get_many::<String>("packages")
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn parse_filters(args: &ArgMatches) -> Result<HashMap<String, String>, Error> {
    let mut filters = HashMap::new();
    for raw in args.get_many::<String>("filter").into_iter().flatten() {
        let (field, value) = raw
            .split_once('=')
            .ok_or_else(|| Error::InvalidFilter(raw.clone()))?;
        filters.insert(field.to_owned(), value.to_owned());
    }
    Ok(filters)
}

/// Route a payload to the terminal or the envelope, per session format
fn emit<T: Serialize>(env: &Env, data: T, text: impl FnOnce(&T)) {
    match env.format {
        Format::Text => text(&data),
        Format::Json | Format::Dbus => println!("{}", Envelope::ok(data).to_json()),
    }
}

fn print_package(package: &Package, full: bool) {
    if !full {
        let marker = if package.installed { "*" } else { " " };
        println!("{marker} {} {} - {}", package.name, package.version, first_line(&package.description));
        return;
    }

    println!("Name       : {}", package.name);
    println!("Section    : {}", package.section);
    println!("Version    : {}", package.version);
    if package.installed {
        println!("Installed  : {}", package.version_installed);
    }
    println!("Maintainer : {}", package.maintainer);
    println!("Size       : {}", package.size);
    println!("Depends    : {}", package.depends.join(", "));
    if !package.provides.is_empty() {
        println!("Provides   : {}", package.provides.join(", "));
    }
    println!("Description: {}", package.description);
    println!();
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid filter {0}, expected field=value")]
    InvalidFilter(String),

    #[error("{0}")]
    Actions(#[from] apm::actions::Error),

    #[error("{0}")]
    Image(#[from] image::Error),

    #[error("history: {0}")]
    History(#[from] history::Error),
}

impl Error {
    pub fn message(&self) -> String {
        match self {
            Error::Actions(error) => error.as_matched().message(),
            Error::Image(error) => error.as_matched().message(),
            other => other.to_string(),
        }
    }
}
