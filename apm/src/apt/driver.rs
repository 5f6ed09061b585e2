// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Child process plumbing shared by every engine invocation
//!
//! Arguments are always passed as argv vectors; nothing here goes near a
//! shell. Cancelling the caller's token interrupts the child.

use std::{io, process::Stdio, sync::Arc};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;

use crate::Env;

/// Receives every captured output line, whole lines only
pub type LogHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// A finished child process: exit status plus captured output lines
#[derive(Debug)]
pub struct Output {
    pub status: std::process::ExitStatus,
    pub lines: Vec<String>,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct Driver {
    env: Arc<Env>,
}

impl Driver {
    pub fn new(env: Arc<Env>) -> Self {
        Self { env }
    }

    /// Command builder honouring the configured privilege prefix
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = match self.env.command_prefix.as_deref() {
            Some(prefix) if !prefix.trim().is_empty() => {
                let mut parts = prefix.split_whitespace();
                let mut cmd = Command::new(parts.next().unwrap_or(prefix));
                cmd.args(parts);
                cmd.arg(program);
                cmd
            }
            _ => Command::new(program),
        };
        // Deterministic output for the parsers
        cmd.env("LC_ALL", "C");
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run to completion, capturing stdout and stderr line-wise
    pub async fn run(
        &self,
        program: &str,
        args: &[&str],
        token: &CancellationToken,
        log: Option<&LogHandler>,
    ) -> Result<Output, Error> {
        let mut sink = |line: &str| {
            if let Some(log) = log {
                log(line);
            }
        };
        self.run_streaming(program, args, token, &mut sink).await
    }

    /// Run to completion, handing every line to `on_line` as it arrives
    /// (in addition to capturing it)
    pub async fn run_streaming(
        &self,
        program: &str,
        args: &[&str],
        token: &CancellationToken,
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Output, Error> {
        let mut cmd = self.command(program);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        log::trace!("spawn: {program} {}", args.join(" "));

        let mut child = cmd.spawn().map_err(|e| Error::Spawn(program.to_owned(), e))?;
        let mut stdout = BufReader::new(child.stdout.take().expect("stdout piped")).lines();
        let mut stderr = BufReader::new(child.stderr.take().expect("stderr piped")).lines();

        let mut lines = Vec::new();
        let mut out_done = false;
        let mut err_done = false;

        while !(out_done && err_done) {
            tokio::select! {
                _ = token.cancelled() => return cancel(child).await,
                line = stdout.next_line(), if !out_done => match line? {
                    Some(line) => {
                        on_line(&line);
                        lines.push(line);
                    }
                    None => out_done = true,
                },
                line = stderr.next_line(), if !err_done => match line? {
                    Some(line) => {
                        on_line(&line);
                        lines.push(line);
                    }
                    None => err_done = true,
                },
            }
        }

        let status = tokio::select! {
            _ = token.cancelled() => return cancel(child).await,
            status = child.wait() => status?,
        };

        Ok(Output { status, lines })
    }
}

async fn cancel<T>(mut child: tokio::process::Child) -> Result<T, Error> {
    let _ = child.start_kill();
    let _ = child.wait().await;
    Err(Error::Cancelled)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, #[source] io::Error),

    #[error("io")]
    Io(#[from] io::Error),

    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::environment::Format;

    fn env() -> Arc<Env> {
        Arc::new(Env::with_config_path(PathBuf::from("/nonexistent"), Format::Text, None, false).unwrap())
    }

    #[tokio::test]
    async fn captures_lines() {
        let driver = Driver::new(env());
        let token = CancellationToken::new();
        let output = driver
            .run("sh", &["-c", "echo one; echo two >&2"], &token, None)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.lines.len(), 2);
        assert!(output.lines.contains(&"one".to_owned()));
        assert!(output.lines.contains(&"two".to_owned()));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let driver = Driver::new(env());
        let token = CancellationToken::new();
        token.cancel();
        let result = driver.run("sleep", &["30"], &token, None).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn log_handler_sees_everything() {
        let driver = Driver::new(env());
        let token = CancellationToken::new();
        let seen = Arc::new(std::sync::Mutex::new(vec![]));
        let sink = seen.clone();
        let log: LogHandler = Arc::new(move |line: &str| sink.lock().unwrap().push(line.to_owned()));
        driver.run("echo", &["hello"], &token, Some(&log)).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["hello".to_owned()]);
    }
}
