// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The transactional orchestrator: validate, plan, confirm, execute,
//! reconcile, and branch into the image engine on atomic hosts

use std::sync::Arc;

use dialoguer::{theme::ColorfulTheme, Confirm};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use crate::response::{InstallResponse, RemoveResponse};

use crate::apt::{self, modifier_set, Apt, ErrorKind, LogHandler, MatchedError, ProgressEvent};
use crate::db::{history, packages};
use crate::environment::Format;
use crate::event::{Emitter, Event, State};
use crate::image::{self, Engine};
use crate::package::PackageChanges;
use crate::response::{
    InfoResponse, ListResponse, SearchResponse, UpdateResponse, UpgradeResponse,
};
use crate::Env;

/// Suffix appended to atomic-mode messages once the image was rebuilt
const IMAGE_UPDATED: &str = "the image has been updated";

#[derive(Debug, Clone)]
pub struct Actions {
    env: Arc<Env>,
    apt: Apt,
    db: packages::Database,
    image: Engine,
    events: Emitter,
}

/// Split raw CLI names on their trailing modifiers: `zip+ unzip-` means
/// install zip, remove unzip. Unsuffixed names follow `default_install`.
fn split_modifiers(names: &[String], default_install: bool) -> (Vec<String>, Vec<String>) {
    let mut install = vec![];
    let mut remove = vec![];

    for name in names {
        if let Some(bare) = name.strip_suffix('+') {
            install.push(bare.to_owned());
        } else if let Some(bare) = name.strip_suffix('-') {
            remove.push(bare.to_owned());
        } else if default_install {
            install.push(name.clone());
        } else {
            remove.push(name.clone());
        }
    }

    (install, remove)
}

impl Actions {
    pub async fn new(env: Arc<Env>, events: Emitter) -> Result<Self, Error> {
        let apt = Apt::new(env.clone());
        let db = packages::Database::new(env.db_path()).await?;
        let history = history::Database::new(env.db_path()).await?;
        let image = Engine::new(env.clone(), apt.driver().clone(), history);

        Ok(Self {
            env,
            apt,
            db,
            image,
            events,
        })
    }

    pub fn env(&self) -> &Arc<Env> {
        &self.env
    }

    pub fn apt(&self) -> &Apt {
        &self.apt
    }

    pub fn db(&self) -> &packages::Database {
        &self.db
    }

    pub fn image(&self) -> &Engine {
        &self.image
    }

    pub fn events(&self) -> &Emitter {
        &self.events
    }

    /// Refresh indexes and rebuild the mirror
    pub async fn update(&self, token: &CancellationToken) -> Result<UpdateResponse, Error> {
        self.require_root()?;
        self.events.before("update").await;

        self.apt.update(token, Some(&self.log_handler())).await?;
        let count = self.refresh_mirror(token).await?;

        self.events.after("update").await;
        Ok(UpdateResponse {
            message: format!("package list updated, {count} packages available"),
            count,
        })
    }

    /// Transactional install, with optional image application on atomic
    /// hosts
    pub async fn install(
        &self,
        names: &[String],
        apply: bool,
        token: &CancellationToken,
    ) -> Result<InstallResponse, Error> {
        self.require_root()?;
        if self.env.is_atomic {
            self.image.ensure_usr_overlay(token).await?;
        }
        self.validate_db(token).await?;
        self.events.before("install").await;

        let (mut install, remove) = split_modifiers(names, true);
        self.resolve_names(&mut install, token).await?;

        let simulation = self.apt.simulate_change(&install, &remove, false, false, token).await?;

        // Nothing to execute: on an atomic host the already-satisfied
        // intent is still recorded in the image config
        if simulation.changes.is_empty() {
            if apply && self.env.is_atomic && only_reconcilable(&simulation.notices) {
                let response = self.reconcile_image(&install, &remove, token).await?;
                self.events.after("install").await;
                return Ok(response);
            }
            self.events.after("install").await;
            return Ok(InstallResponse {
                message: "nothing to do, packages are already at the requested state".to_owned(),
                changes: simulation.changes,
                image_updated: false,
            });
        }

        let title = if !install.is_empty() && !remove.is_empty() {
            "Multi-install"
        } else {
            "Install"
        };
        self.confirm(title, &simulation.changes)?;

        let combined = modifier_set(&install, &remove);
        let report = self
            .execute_with_progress("install", |progress, log| {
                let apt = self.apt.clone();
                let combined = combined.clone();
                async move { apt.install_packages(&combined, token, Some(&progress), Some(&log)).await }
            })
            .await?;

        self.reconcile_db(token).await?;

        let (message, image_updated) = if apply && self.env.is_atomic {
            self.persist_and_build(&install, &remove, token).await?;
            (format!("packages installed, {IMAGE_UPDATED}"), true)
        } else {
            ("packages installed, image not modified".to_owned(), false)
        };

        self.events.after("install").await;
        Ok(InstallResponse {
            message,
            changes: report.changes,
            image_updated,
        })
    }

    /// Transactional removal, symmetric to install
    pub async fn remove(
        &self,
        names: &[String],
        apply: bool,
        token: &CancellationToken,
    ) -> Result<RemoveResponse, Error> {
        self.require_root()?;
        if self.env.is_atomic {
            self.image.ensure_usr_overlay(token).await?;
        }
        self.validate_db(token).await?;
        self.events.before("remove").await;

        let (install, remove) = split_modifiers(names, false);

        let simulation = self.apt.simulate_change(&install, &remove, false, false, token).await?;

        if simulation.changes.is_empty() {
            // Not installed here, but a later rebuild should omit them
            if apply && self.env.is_atomic && only_not_installed(&simulation.notices) {
                let response = self.reconcile_image(&install, &remove, token).await?;
                self.events.after("remove").await;
                return Ok(RemoveResponse {
                    message: response.message,
                    changes: response.changes,
                    image_updated: response.image_updated,
                });
            }
            self.events.after("remove").await;
            return Ok(RemoveResponse {
                message: "nothing to do, no matching installed packages".to_owned(),
                changes: simulation.changes,
                image_updated: false,
            });
        }

        self.confirm("Remove", &simulation.changes)?;

        let report = self
            .execute_with_progress("remove", |progress, log| {
                let apt = self.apt.clone();
                let install = install.clone();
                let remove = remove.clone();
                async move {
                    if install.is_empty() {
                        apt.remove_packages(&remove, false, false, token, Some(&progress), Some(&log)).await
                    } else {
                        let combined = modifier_set(&install, &remove);
                        apt.install_packages(&combined, token, Some(&progress), Some(&log)).await
                    }
                }
            })
            .await?;

        self.reconcile_db(token).await?;

        let (message, image_updated) = if apply && self.env.is_atomic {
            self.persist_and_build(&install, &remove, token).await?;
            (format!("packages removed, {IMAGE_UPDATED}"), true)
        } else {
            ("packages removed, image not modified".to_owned(), false)
        };

        self.events.after("remove").await;
        Ok(RemoveResponse {
            message,
            changes: report.changes,
            image_updated,
        })
    }

    /// Full distribution upgrade: refresh, plan, confirm, execute,
    /// reconcile
    pub async fn upgrade(&self, token: &CancellationToken) -> Result<UpgradeResponse, Error> {
        self.require_root()?;
        self.events.before("upgrade").await;

        self.apt.update(token, Some(&self.log_handler())).await?;
        self.refresh_mirror(token).await?;

        let simulation = self.apt.simulate_dist_upgrade(token).await?;
        if simulation.changes.is_empty() {
            self.events.after("upgrade").await;
            return Ok(UpgradeResponse {
                message: "system is up to date".to_owned(),
                changes: simulation.changes,
            });
        }

        self.confirm("Upgrade", &simulation.changes)?;

        let report = self
            .execute_with_progress("upgrade", |progress, log| {
                let apt = self.apt.clone();
                async move { apt.dist_upgrade(token, Some(&progress), Some(&log)).await }
            })
            .await?;

        self.reconcile_db(token).await?;

        self.events.after("upgrade").await;
        Ok(UpgradeResponse {
            message: format!("{} packages upgraded", report.changes.upgraded_count),
            changes: report.changes,
        })
    }

    /// Package details from the mirror, with a provides fallback
    pub async fn info(&self, name: &str, token: &CancellationToken) -> Result<InfoResponse, Error> {
        self.validate_db(token).await?;

        let package = match self.db.get_by_name(name).await {
            Ok(package) => package,
            Err(packages::Error::NotFound(_)) => self
                .db
                .find_by_provides(name)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| Error::NotFound {
                    name: name.to_owned(),
                    hint: vec![],
                })?,
            Err(error) => return Err(error.into()),
        };

        Ok(InfoResponse { package })
    }

    pub async fn search(
        &self,
        query: &str,
        installed_only: bool,
        token: &CancellationToken,
    ) -> Result<SearchResponse, Error> {
        self.validate_db(token).await?;
        let packages = self.db.search(query, installed_only).await?;

        Ok(SearchResponse {
            count: packages.len() as i64,
            packages,
        })
    }

    pub async fn list(
        &self,
        params: &packages::Query,
        force_update: bool,
        token: &CancellationToken,
    ) -> Result<ListResponse, Error> {
        if force_update {
            self.update(token).await?;
        } else {
            self.validate_db(token).await?;
        }

        let (packages, total_count) =
            futures::try_join!(self.db.query(params), self.db.count(&params.filters))?;

        Ok(ListResponse { packages, total_count })
    }

    /// Rebuild the mirror's installed flags from the rpm database
    pub async fn reconcile_db(&self, token: &CancellationToken) -> Result<(), Error> {
        log::trace!("apt phase: reconciling");
        let installed = self.apt.installed_map(token).await?;
        self.db.sync_installation_info(&installed).await?;
        Ok(())
    }

    async fn refresh_mirror(&self, token: &CancellationToken) -> Result<i64, Error> {
        let available = self.apt.dump_available(token).await?;
        let count = available.len() as i64;
        self.db.save(&available).await?;
        self.reconcile_db(token).await?;
        Ok(count)
    }

    /// An empty mirror is populated once before any read
    async fn validate_db(&self, token: &CancellationToken) -> Result<(), Error> {
        if !self.db.exists().await? {
            self.update(token).await?;
        }
        Ok(())
    }

    /// Resolve each input against the mirror. Unknown names either go
    /// through the side-build tool (building a local artifact whose path
    /// replaces the name) or fail with provider hints.
    async fn resolve_names(&self, names: &mut [String], token: &CancellationToken) -> Result<(), Error> {
        for name in names.iter_mut() {
            match self.db.get_by_name(name).await {
                Ok(_) => {}
                Err(packages::Error::NotFound(_)) => {
                    if self.env.exist_stplr {
                        *name = self.side_build(name, token).await?;
                        continue;
                    }
                    let hint = self
                        .db
                        .find_by_provides(name)
                        .await?
                        .into_iter()
                        .map(|p| p.name)
                        .collect();
                    return Err(Error::NotFound {
                        name: name.clone(),
                        hint,
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Build a third-party package to a local artifact; the tool prints
    /// the artifact path on its last line
    async fn side_build(&self, name: &str, token: &CancellationToken) -> Result<String, Error> {
        self.events.before("side-build").await;
        let output = self
            .apt
            .driver()
            .run("stplr", &["pre-install", name], token, Some(&self.log_handler()))
            .await
            .map_err(apt::Error::from)?;
        self.events.after("side-build").await;

        if !output.success() {
            return Err(Error::SideBuild(name.to_owned()));
        }
        output
            .lines
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| l.ends_with(".rpm"))
            .map(str::to_owned)
            .ok_or_else(|| Error::SideBuild(name.to_owned()))
    }

    /// Atomic branch for requests that changed nothing locally: record
    /// the intent in the image config and rebuild
    async fn reconcile_image(
        &self,
        install: &[String],
        remove: &[String],
        token: &CancellationToken,
    ) -> Result<InstallResponse, Error> {
        self.persist_and_build(install, remove, token).await?;

        Ok(InstallResponse {
            message: format!("no local changes were necessary, {IMAGE_UPDATED}"),
            changes: PackageChanges::default(),
            image_updated: true,
        })
    }

    async fn persist_and_build(
        &self,
        install: &[String],
        remove: &[String],
        token: &CancellationToken,
    ) -> Result<(), Error> {
        self.image
            .mutate_config(token, |config| {
                for name in install {
                    config.add_install(name);
                }
                for name in remove {
                    config.add_remove(name);
                }
            })
            .await?;

        self.image.build_and_switch(token, false, false, Some(&self.log_handler())).await?;
        Ok(())
    }

    /// Progress leaves the engine through a channel; a forwarder task
    /// turns it into bus events while the execution runs
    async fn execute_with_progress<F, Fut>(&self, name: &str, run: F) -> Result<apt::ExecutionReport, Error>
    where
        F: FnOnce(apt::ProgressSender, LogHandler) -> Fut,
        Fut: std::future::Future<Output = Result<apt::ExecutionReport, apt::Error>>,
    {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();

        let events = self.events.clone();
        let event_name = format!("{name}.progress");
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = receiver.recv().await {
                let event = Event::new(event_name.clone(), State::After)
                    .with_progress(progress.percent(), Some(format!("{} {}", progress.kind, progress.package)));
                events.emit(State::After, event).await;
            }
        });

        let result = run(sender, self.log_handler()).await;

        let _ = forwarder.await;

        Ok(result?)
    }

    /// The engine output stream, forwarded to the session log
    fn log_handler(&self) -> LogHandler {
        Arc::new(|line: &str| log::debug!("engine: {line}"))
    }

    /// Interactive gate before any execution. Non-interactive formats
    /// and `--yes` auto-accept; the transport on the other side of the
    /// bus runs its own dialog.
    fn confirm(&self, title: &str, changes: &PackageChanges) -> Result<(), Error> {
        if self.env.assume_yes || self.env.format != Format::Text {
            return Ok(());
        }

        let summary = format!(
            "{title}: {} new, {} upgraded, {} removed. Continue?",
            changes.new_installed_count, changes.upgraded_count, changes.removed_count
        );
        let accepted = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(summary)
            .default(false)
            .interact()?;

        if !accepted {
            return Err(Error::DialogCancelled);
        }
        Ok(())
    }

    fn require_root(&self) -> Result<(), Error> {
        if !self.env.is_root() {
            return Err(Error::RootRequired);
        }
        Ok(())
    }
}

/// Notices that allow the atomic reconciliation branch
fn only_reconcilable(notices: &[MatchedError]) -> bool {
    !notices.is_empty()
        && notices.iter().all(|n| {
            matches!(
                n.kind,
                ErrorKind::PackageIsAlreadyNewest | ErrorKind::PackageNotInstalled
            )
        })
}

/// The remove-side branch requires every notice to be "not installed"
fn only_not_installed(notices: &[MatchedError]) -> bool {
    !notices.is_empty() && notices.iter().all(|n| n.kind == ErrorKind::PackageNotInstalled)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("this operation requires root privileges")]
    RootRequired,

    #[error("cancelled by dialog")]
    DialogCancelled,

    #[error("package {name} not found{}", hint_text(.hint))]
    NotFound { name: String, hint: Vec<String> },

    #[error("side build of {0} failed")]
    SideBuild(String),

    #[error("{0}")]
    Apt(#[from] apt::Error),

    #[error("db: {0}")]
    Db(#[from] packages::Error),

    #[error("history: {0}")]
    History(#[from] history::Error),

    #[error("image: {0}")]
    Image(#[from] image::Error),

    #[error("dialog: {0}")]
    Dialog(#[from] dialoguer::Error),

    #[error("io")]
    Io(#[from] std::io::Error),
}

fn hint_text(hint: &[String]) -> String {
    if hint.is_empty() {
        String::new()
    } else {
        format!(", provided by: {}", hint.join(", "))
    }
}

impl Error {
    /// Taxonomy mapping for the response envelope
    pub fn as_matched(&self) -> MatchedError {
        match self {
            Error::RootRequired => MatchedError::new(ErrorKind::RootRequired),
            Error::DialogCancelled => MatchedError::new(ErrorKind::DialogCancelled),
            Error::NotFound { name, .. } => {
                MatchedError::with_params(ErrorKind::PackageNotFound, vec![name.clone()])
            }
            Error::Apt(apt) => apt.matched().cloned().unwrap_or_else(|| match apt {
                apt::Error::Cancelled => MatchedError::new(ErrorKind::Cancelled),
                apt::Error::PackageNotFound(name) => {
                    MatchedError::with_params(ErrorKind::PackageNotFound, vec![name.clone()])
                }
                other => MatchedError::with_params(ErrorKind::OperationFailed, vec![other.to_string()]),
            }),
            Error::Image(image) => image.as_matched(),
            other => MatchedError::with_params(ErrorKind::OperationFailed, vec![other.to_string()]),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modifier_splitting() {
        let names = vec!["zip+".to_owned(), "unzip-".to_owned(), "nano".to_owned()];

        let (install, remove) = split_modifiers(&names, true);
        assert_eq!(install, vec!["zip", "nano"]);
        assert_eq!(remove, vec!["unzip"]);

        // In remove context, unsuffixed names are removals
        let (install, remove) = split_modifiers(&names, false);
        assert_eq!(install, vec!["zip"]);
        assert_eq!(remove, vec!["unzip", "nano"]);
    }

    #[test]
    fn reconcilable_notices() {
        let newest = MatchedError::with_params(ErrorKind::PackageIsAlreadyNewest, vec!["zip".into()]);
        let missing = MatchedError::with_params(ErrorKind::PackageNotInstalled, vec!["zip".into()]);
        let broken = MatchedError::new(ErrorKind::BrokenPackages);

        assert!(only_reconcilable(&[newest.clone(), missing.clone()]));
        assert!(!only_reconcilable(&[]));
        assert!(!only_reconcilable(&[newest.clone(), broken]));

        assert!(only_not_installed(&[missing]));
        assert!(!only_not_installed(&[newest]));
    }

    #[test]
    fn not_found_hint() {
        let error = Error::NotFound {
            name: "zzz".to_owned(),
            hint: vec!["zip".to_owned(), "unzip".to_owned()],
        };
        assert!(error.to_string().contains("provided by: zip, unzip"));
        assert_eq!(error.as_matched().kind, ErrorKind::PackageNotFound);
    }
}
