// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Serialized, cancellable façade over the native package engine
//!
//! The engine is driven as a child process: `apt-get` for planning and
//! execution, `apt-cache` for read-only metadata, `rpm` for the
//! installed set. One process-global write lock serializes every
//! mutating call; read-only snapshots run concurrently.

use std::{collections::HashMap, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

pub use self::driver::{Driver, LogHandler, Output};
pub use self::error::{ErrorKind, MatchedError};
pub use self::progress::{PlannedQueue, ProgressEvent, ProgressKind, StatusParser};

/// Progress events leave the binding through a channel; the transport
/// adapter on the other end renders or forwards them
pub type ProgressSender = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

use crate::environment::LOCK_TIMEOUT_SECS;
use crate::package::{Package, PackageChanges};
use crate::Env;

pub mod driver;
pub mod error;
pub mod progress;
pub mod simulate;

/// Outcome of a planner run: the plan plus any non-critical notices
/// (`PackageIsAlreadyNewest`, `PackageNotInstalled`) found in the output
#[derive(Debug, Clone, Default)]
pub struct Simulation {
    pub changes: PackageChanges,
    pub notices: Vec<MatchedError>,
}

/// Outcome of a mutating run. `changes` is the executed plan; parity
/// with the preceding simulation holds by construction, both sides read
/// the same planner transcript.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub changes: PackageChanges,
    pub notices: Vec<MatchedError>,
}

/// Stages of a mutating call, for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum Phase {
    LockAcquired,
    Planned,
    Executing,
    Done,
    Failed,
}

fn enter(phase: Phase) {
    log::trace!("apt phase: {phase}");
}

#[derive(Debug, Clone)]
pub struct Apt {
    driver: Driver,
    write_lock: Arc<Mutex<()>>,
}

impl Apt {
    pub fn new(env: Arc<Env>) -> Self {
        Self {
            driver: Driver::new(env),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Acquire the process-global write lock, bounded by the default deadline
    async fn lock(&self) -> Result<MutexGuard<'_, ()>, Error> {
        self.lock_with(Duration::from_secs(LOCK_TIMEOUT_SECS)).await
    }

    async fn lock_with(&self, timeout: Duration) -> Result<MutexGuard<'_, ()>, Error> {
        tokio::time::timeout(timeout, self.write_lock.lock())
            .await
            .map_err(|_| Error::Matched(MatchedError::new(ErrorKind::LockTimeout)))
    }

    /// Refresh the source indexes
    pub async fn update(&self, token: &CancellationToken, log: Option<&LogHandler>) -> Result<(), Error> {
        let _guard = self.lock().await?;
        enter(Phase::LockAcquired);

        let output = self.driver.run("apt-get", &["update"], token, log).await?;
        if !output.success() {
            enter(Phase::Failed);
            return Err(self.classify(&output, false).await);
        }
        enter(Phase::Done);
        Ok(())
    }

    /// Read-only search over the available universe
    pub async fn search(&self, pattern: &str, token: &CancellationToken) -> Result<Vec<Package>, Error> {
        let output = self.driver.run("apt-cache", &["search", pattern], token, None).await?;
        if !output.success() {
            return Err(self.classify(&output, false).await);
        }

        Ok(output
            .lines
            .iter()
            .filter_map(|line| {
                let (name, description) = line.split_once(" - ")?;
                Some(Package {
                    name: name.trim().to_owned(),
                    description: description.trim().to_owned(),
                    ..Default::default()
                })
            })
            .collect())
    }

    /// Full metadata for one package
    pub async fn get_info(&self, name: &str, token: &CancellationToken) -> Result<Package, Error> {
        let output = self.driver.run("apt-cache", &["show", name], token, None).await?;
        if !output.success() {
            return Err(self.classify(&output, false).await);
        }

        parse_packages(&output.text())
            .into_iter()
            .next()
            .ok_or_else(|| Error::PackageNotFound(name.to_owned()))
    }

    /// Bulk dump of every available package
    pub async fn dump_available(&self, token: &CancellationToken) -> Result<Vec<Package>, Error> {
        let output = self.driver.run("apt-cache", &["dumpavail"], token, None).await?;
        if !output.success() {
            return Err(self.classify(&output, false).await);
        }
        Ok(parse_packages(&output.text()))
    }

    /// Installed set as `name -> version` from the rpm database
    pub async fn installed_map(&self, token: &CancellationToken) -> Result<HashMap<String, String>, Error> {
        let output = self
            .driver
            .run(
                "rpm",
                &["-qa", "--queryformat", "%{NAME}\t%{VERSION}-%{RELEASE}\n"],
                token,
                None,
            )
            .await?;
        if !output.success() {
            return Err(self.classify(&output, false).await);
        }

        Ok(output
            .lines
            .iter()
            .filter_map(|line| {
                let (name, version) = line.split_once('\t')?;
                Some((name.to_owned(), version.to_owned()))
            })
            .collect())
    }

    pub async fn simulate_install(
        &self,
        names: &[String],
        token: &CancellationToken,
    ) -> Result<Simulation, Error> {
        self.simulate(&["install"], names, token).await
    }

    pub async fn simulate_remove(
        &self,
        names: &[String],
        purge: bool,
        auto_remove: bool,
        token: &CancellationToken,
    ) -> Result<Simulation, Error> {
        let mut op = vec!["remove"];
        if purge {
            op = vec!["remove", "--purge"];
        }
        if auto_remove {
            op.push("--auto-remove");
        }
        self.simulate(&op, names, token).await
    }

    pub async fn simulate_reinstall(
        &self,
        names: &[String],
        token: &CancellationToken,
    ) -> Result<Simulation, Error> {
        self.simulate(&["install", "--reinstall"], names, token).await
    }

    pub async fn simulate_dist_upgrade(&self, token: &CancellationToken) -> Result<Simulation, Error> {
        self.simulate(&["dist-upgrade"], &[], token).await
    }

    pub async fn simulate_auto_remove(&self, token: &CancellationToken) -> Result<Simulation, Error> {
        self.simulate(&["autoremove"], &[], token).await
    }

    /// Combined planner: installs and removals in one resolver pass,
    /// using the engine's `name+` / `name-` modifier syntax
    pub async fn simulate_change(
        &self,
        install: &[String],
        remove: &[String],
        purge: bool,
        auto_remove: bool,
        token: &CancellationToken,
    ) -> Result<Simulation, Error> {
        if install.is_empty() {
            return self.simulate_remove(remove, purge, auto_remove, token).await;
        }
        let names = modifier_set(install, remove);
        self.simulate(&["install"], &names, token).await
    }

    async fn simulate(
        &self,
        op: &[&str],
        names: &[String],
        token: &CancellationToken,
    ) -> Result<Simulation, Error> {
        let mut args: Vec<&str> = vec!["-q", "-s"];
        args.extend(op);
        args.extend(names.iter().map(String::as_str));

        let output = self.driver.run("apt-get", &args, token, None).await?;
        let notices = self.check_output(&output, false).await?;
        enter(Phase::Planned);

        Ok(Simulation {
            changes: simulate::parse_simulation(&output.text(), names),
            notices,
        })
    }

    pub async fn install_packages(
        &self,
        names: &[String],
        token: &CancellationToken,
        progress: Option<&ProgressSender>,
        log: Option<&LogHandler>,
    ) -> Result<ExecutionReport, Error> {
        self.execute(&["install"], names, token, progress, log).await
    }

    pub async fn remove_packages(
        &self,
        names: &[String],
        purge: bool,
        auto_remove: bool,
        token: &CancellationToken,
        progress: Option<&ProgressSender>,
        log: Option<&LogHandler>,
    ) -> Result<ExecutionReport, Error> {
        let mut op = vec!["remove"];
        if purge {
            op = vec!["remove", "--purge"];
        }
        if auto_remove {
            op.push("--auto-remove");
        }
        self.execute(&op, names, token, progress, log).await
    }

    pub async fn dist_upgrade(
        &self,
        token: &CancellationToken,
        progress: Option<&ProgressSender>,
        log: Option<&LogHandler>,
    ) -> Result<ExecutionReport, Error> {
        self.execute(&["dist-upgrade"], &[], token, progress, log).await
    }

    /// The mutating path: plan, lock, drive the engine with status
    /// records enabled, classify on failure
    async fn execute(
        &self,
        op: &[&str],
        names: &[String],
        token: &CancellationToken,
        progress: Option<&ProgressSender>,
        log: Option<&LogHandler>,
    ) -> Result<ExecutionReport, Error> {
        // Plan outside the child process so progress events can be
        // attributed in plan order
        let simulation = self.simulate(op, names, token).await?;

        let _guard = self.lock().await?;
        enter(Phase::LockAcquired);

        let mut args: Vec<&str> = vec!["-y", "-q", "-o", "APT::Status-Fd=1"];
        args.extend(op);
        args.extend(names.iter().map(String::as_str));

        enter(Phase::Executing);
        if let Some(sender) = progress {
            let _ = sender.send(ProgressEvent::new("", ProgressKind::TransStart, 0));
        }
        let mut parser = StatusParser::new(PlannedQueue::from_changes(&simulation.changes));
        let mut on_line = |line: &str| {
            if line.starts_with("pmstatus:") || line.starts_with("dlstatus:") || line.starts_with("pmerror:")
            {
                for event in parser.feed(line) {
                    if let Some(sender) = progress {
                        let _ = sender.send(event);
                    }
                }
            } else if let Some(log) = log {
                log(line);
            }
        };

        let output = self.driver.run_streaming("apt-get", &args, token, &mut on_line).await?;

        for event in parser.finish() {
            if let Some(sender) = progress {
                let _ = sender.send(event);
            }
        }
        if let Some(sender) = progress {
            let _ = sender.send(ProgressEvent::new("", ProgressKind::TransStop, 100));
        }

        if !output.success() {
            enter(Phase::Failed);
            return Err(self.classify(&output, true).await);
        }
        enter(Phase::Done);

        Ok(ExecutionReport {
            changes: simulation.changes,
            notices: simulation.notices,
        })
    }

    /// Split the classified output of a successful-exit run into
    /// non-critical notices, failing on any critical hit
    async fn check_output(&self, output: &Output, refresh: bool) -> Result<Vec<MatchedError>, Error> {
        let matched = error::analyse_all(&output.lines);
        let (critical, notices): (Vec<_>, Vec<_>) = matched.into_iter().partition(MatchedError::is_critical);

        if let Some(first) = critical.into_iter().next() {
            if first.needs_refresh() {
                return Err(self.refresh_and_retry(first, refresh).await);
            }
            return Err(Error::Matched(first));
        }
        if !output.success() {
            return Err(Error::Matched(MatchedError::with_params(
                ErrorKind::Unknown,
                vec![output.lines.last().cloned().unwrap_or_default()],
            )));
        }

        Ok(notices)
    }

    /// Classification for an already-failed run
    async fn classify(&self, output: &Output, refresh: bool) -> Error {
        match self.check_output(output, refresh).await {
            Err(error) => error,
            Ok(_) => Error::Matched(MatchedError::with_params(
                ErrorKind::OperationFailed,
                vec![output.lines.last().cloned().unwrap_or_default()],
            )),
        }
    }

    /// A fetch-class failure is cured by one implicit index refresh; the
    /// caller receives a retryable error and decides whether to repeat
    async fn refresh_and_retry(&self, matched: MatchedError, allow: bool) -> Error {
        if allow {
            let token = CancellationToken::new();
            if let Err(error) = Box::pin(self.update(&token, None)).await {
                log::warn!("implicit refresh failed: {error}");
            }
        }
        Error::RetryAfterRefresh(matched)
    }
}

/// Join install and remove names into one modifier-suffixed argv set
pub fn modifier_set(install: &[String], remove: &[String]) -> Vec<String> {
    install
        .iter()
        .map(|name| format!("{}+", name.trim_end_matches('+')))
        .chain(remove.iter().map(|name| format!("{}-", name.trim_end_matches('-'))))
        .collect()
}

/// Parse RFC822-style `apt-cache show` / `dumpavail` blocks
pub fn parse_packages(text: &str) -> Vec<Package> {
    let mut packages = vec![];
    let mut current: Option<Package> = None;
    let mut in_description = false;

    for line in text.lines() {
        if line.trim().is_empty() {
            if let Some(package) = current.take() {
                if !package.name.is_empty() {
                    packages.push(package);
                }
            }
            in_description = false;
            continue;
        }

        if line.starts_with(' ') {
            if in_description {
                if let Some(package) = current.as_mut() {
                    if !package.description.is_empty() {
                        package.description.push('\n');
                    }
                    package.description.push_str(line.trim());
                }
            }
            continue;
        }

        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let package = current.get_or_insert_with(Package::default);
        in_description = false;

        match field {
            "Package" => package.name = value.to_owned(),
            "Section" => package.section = value.to_owned(),
            "Installed-Size" => package.installed_size = value.parse().unwrap_or_default(),
            "Maintainer" => package.maintainer = value.to_owned(),
            "Version" => package.version = value.to_owned(),
            "Depends" | "Pre-Depends" => package.depends.extend(parse_relations(value)),
            "Provides" => package.provides.extend(parse_relations(value)),
            "Size" => package.size = value.parse().unwrap_or_default(),
            "Filename" => package.filename = value.to_owned(),
            "Description" => {
                package.description = value.to_owned();
                in_description = true;
            }
            _ => {}
        }
    }

    if let Some(package) = current.take() {
        if !package.name.is_empty() {
            packages.push(package);
        }
    }

    packages
}

/// `a (>= 1.2), b | c` -> `[a, b, c]`, version constraints dropped
fn parse_relations(value: &str) -> Vec<String> {
    value
        .split(',')
        .flat_map(|group| group.split('|'))
        .filter_map(|entry| {
            let name = entry.trim().split_whitespace().next()?;
            (!name.is_empty()).then(|| name.to_owned())
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Matched(MatchedError),

    #[error("refreshed indexes, please retry: {0}")]
    RetryAfterRefresh(MatchedError),

    #[error("package {0} not found")]
    PackageNotFound(String),

    #[error("driver: {0}")]
    Driver(driver::Error),

    #[error("cancelled")]
    Cancelled,
}

impl From<driver::Error> for Error {
    fn from(error: driver::Error) -> Self {
        match error {
            driver::Error::Cancelled => Error::Cancelled,
            other => Error::Driver(other),
        }
    }
}

impl Error {
    /// The matched taxonomy entry, when classification produced one
    pub fn matched(&self) -> Option<&MatchedError> {
        match self {
            Error::Matched(m) | Error::RetryAfterRefresh(m) => Some(m),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Matched(m) | Error::RetryAfterRefresh(m) => m.kind,
            Error::PackageNotFound(_) => ErrorKind::PackageNotFound,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Driver(_) => ErrorKind::OperationFailed,
        }
    }
}

#[cfg(test)]
mod test {
    use indoc::indoc;

    use super::*;
    use crate::environment::Format;

    fn apt() -> Apt {
        Apt::new(Arc::new(
            Env::with_config_path("/nonexistent", Format::Text, None, false).unwrap(),
        ))
    }

    #[test]
    fn modifiers() {
        let names = modifier_set(&["zip".to_owned()], &["unzip".to_owned()]);
        assert_eq!(names, vec!["zip+", "unzip-"]);
        // Already-suffixed input is not doubled
        let names = modifier_set(&["zip+".to_owned()], &[]);
        assert_eq!(names, vec!["zip+"]);
    }

    #[test]
    fn show_blocks() {
        let text = indoc! {"
            Package: zip
            Section: Archiving/Compression
            Installed-Size: 624
            Maintainer: Archive Team <archive@example.org>
            Version: 3.0-alt2
            Depends: libc (>= 2.17), zlib | zlib-ng
            Provides: zip-tools
            Size: 261244
            Filename: zip-3.0-alt2.x86_64.rpm
            Description: file compression utility
             Long description first line.
             Second line.

            Package: unzip
            Version: 6.0-alt1
            Description: extraction utility
        "};

        let packages = parse_packages(text);
        assert_eq!(packages.len(), 2);

        let zip = &packages[0];
        assert_eq!(zip.name, "zip");
        assert_eq!(zip.section, "Archiving/Compression");
        assert_eq!(zip.installed_size, 624);
        assert_eq!(zip.version, "3.0-alt2");
        assert_eq!(zip.depends, vec!["libc", "zlib", "zlib-ng"]);
        assert_eq!(zip.provides, vec!["zip-tools"]);
        assert_eq!(zip.size, 261_244);
        assert!(zip.description.starts_with("file compression utility"));
        assert!(zip.description.contains("Second line."));

        assert_eq!(packages[1].name, "unzip");
    }

    /// Stand-in engine: whatever the subcommand, print one fixed plan.
    /// Routing it through the command prefix exercises the real driver,
    /// planner and executor paths without touching the host.
    fn fake_engine(dir: &std::path::Path) -> Apt {
        let script = dir.join("engine.sh");
        std::fs::write(
            &script,
            indoc! {"
                #!/bin/sh
                cat <<'EOF'
                Reading package lists...
                Inst zip (3.0-alt2 Sisyphus:main [x86_64])
                Inst zlib [1.2-alt1] (1.3-alt1 Sisyphus:main [x86_64])
                Remv unzip [6.0-alt1]
                1 upgraded, 1 newly installed, 1 to remove and 0 not upgraded.
                EOF
                printf 'pmstatus:zip:50.0:Unpacking zip\\n'
                printf 'pmstatus:zlib:90.0:Configuring zlib\\n'
            "},
        )
        .unwrap();

        let mut env = Env::with_config_path("/nonexistent", Format::Text, None, false).unwrap();
        env.command_prefix = Some(format!("sh {}", script.display()));
        Apt::new(Arc::new(env))
    }

    #[tokio::test]
    async fn simulation_parity() {
        let dir = tempfile::tempdir().unwrap();
        let apt = fake_engine(dir.path());
        let token = CancellationToken::new();

        let simulation = apt
            .simulate_change(&["zip".to_owned()], &["unzip".to_owned()], false, false, &token)
            .await
            .unwrap();

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let report = apt
            .install_packages(&["zip+".to_owned(), "unzip-".to_owned()], &token, Some(&sender), None)
            .await
            .unwrap();
        drop(sender);

        // Planner and executor agree on the package-level mutations
        assert_eq!(simulation.changes.new_installed_packages, report.changes.new_installed_packages);
        assert_eq!(simulation.changes.upgraded_packages, report.changes.upgraded_packages);
        assert_eq!(simulation.changes.removed_packages, report.changes.removed_packages);
        assert_eq!(report.changes.new_installed_packages, vec!["zip"]);
        assert_eq!(report.changes.removed_packages, vec!["unzip"]);

        // The status records surfaced as ordered progress, bracketed by
        // the transaction pair
        let mut events = vec![];
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        assert_eq!(events.first().map(|e| e.kind), Some(ProgressKind::TransStart));
        assert_eq!(events.last().map(|e| e.kind), Some(ProgressKind::TransStop));
        let zip_start = events.iter().position(|e| e.kind == ProgressKind::InstStart && e.package == "zip");
        let zip_stop = events.iter().position(|e| e.kind == ProgressKind::InstStop && e.package == "zip");
        assert!(zip_start.unwrap() < zip_stop.unwrap());
    }

    #[tokio::test]
    async fn lock_times_out() {
        let apt = apt();
        let _held = apt.write_lock.clone().lock_owned().await;
        let result = apt.lock_with(Duration::from_millis(10)).await;
        assert!(matches!(
            result,
            Err(Error::Matched(m)) if m.kind == ErrorKind::LockTimeout
        ));
    }
}
