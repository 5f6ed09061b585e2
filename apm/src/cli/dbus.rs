// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use clap::Command;
use tokio_util::sync::CancellationToken;

use apm::dbus;
use apm::Env;

pub fn system_command() -> Command {
    Command::new("dbus-system").about("Serve the privileged API on the system bus")
}

pub fn session_command() -> Command {
    Command::new("dbus-session").about("Serve the user API on the session bus")
}

pub async fn handle_system(env: Arc<Env>, token: CancellationToken) -> Result<(), dbus::Error> {
    dbus::serve_system(env, token).await
}

pub async fn handle_session(env: Arc<Env>, token: CancellationToken) -> Result<(), dbus::Error> {
    dbus::serve_session(env, token).await
}
