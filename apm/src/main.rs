// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::process::ExitCode;

mod cli;

/// Main entry point
#[tokio::main]
async fn main() -> ExitCode {
    cli::process().await
}
