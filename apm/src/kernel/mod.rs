// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Flavour-aware kernel and kernel-module lifecycle
//!
//! Kernel packages follow `kernel-image-<flavour>` with package version
//! `<version>-<release>`; module packages follow
//! `kernel-modules-<module>-<flavour>` versioned after the kernel they
//! were built for.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::actions::{self, Actions};
use crate::apt::{self, ErrorKind, MatchedError};
use crate::db::packages;
use crate::package::PackageChanges;

const IMAGE_PREFIX: &str = "kernel-image-";
const MODULES_PREFIX: &str = "kernel-modules-";
const HEADERS_PREFIX: &str = "kernel-headers-";
/// How many journald boots the backup-kernel scan inspects
const BOOT_SCAN_LIMIT: usize = 10;

/// One kernel build as the manager sees it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelInfo {
    pub package_name: String,
    pub flavour: String,
    pub version: String,
    pub release: String,
    pub full_version: String,
    pub is_installed: bool,
    pub is_running: bool,
    pub is_default: bool,
    pub age_in_days: Option<i64>,
    pub build_time: Option<DateTime<Utc>>,
    pub modules: Vec<String>,
}

impl KernelInfo {
    fn new(flavour: &str, version: &str, release: &str) -> Self {
        Self {
            package_name: format!("{IMAGE_PREFIX}{flavour}"),
            flavour: flavour.to_owned(),
            version: version.to_owned(),
            release: release.to_owned(),
            full_version: format!("{version}-{flavour}-{release}"),
            ..Default::default()
        }
    }

    /// From a running-kernel identifier like `6.1.52-std-def-alt1`
    pub fn from_release_string(identifier: &str) -> Result<Self, Error> {
        let (version, flavour, release) =
            parse_release(identifier).ok_or_else(|| Error::Parse(identifier.to_owned()))?;
        Ok(Self::new(&flavour, &version, &release))
    }

    fn set_build_time(&mut self, time: Option<DateTime<Utc>>) {
        self.build_time = time;
        self.age_in_days = time.map(|t| Utc::now().signed_duration_since(t).num_days());
    }
}

/// Why the cleanup policy retained a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum KeepReason {
    Running,
    Newest,
    Backup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeptKernel {
    pub package: String,
    pub full_version: String,
    pub reason: KeepReason,
}

/// Outcome of [`Manager::clean_old`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanReport {
    pub removed: Vec<String>,
    pub kept: Vec<KeptKernel>,
    pub dry_run: bool,
    pub changes: PackageChanges,
}

/// Outcome of [`Manager::simulate_upgrade`]
#[derive(Debug, Clone)]
pub struct UpgradePreview {
    pub changes: PackageChanges,
    pub missing_modules: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Manager {
    actions: Arc<Actions>,
}

impl Manager {
    pub fn new(actions: Arc<Actions>) -> Self {
        Self { actions }
    }

    fn apt(&self) -> &apt::Apt {
        self.actions.apt()
    }

    fn db(&self) -> &packages::Database {
        self.actions.db()
    }

    /// The running kernel, from the OS release identifier
    pub async fn current(&self, token: &CancellationToken) -> Result<KernelInfo, Error> {
        let identifier = fs_err::read_to_string("/proc/sys/kernel/osrelease")?;
        let mut kernel = KernelInfo::from_release_string(identifier.trim())?;
        kernel.is_running = true;
        kernel.is_installed = true;

        let installed = self.apt().installed_map(token).await?;
        kernel.modules = installed_modules(&installed, &kernel);

        if let Some(default) = self.default_kernel().ok().flatten() {
            kernel.is_default = default.full_version == kernel.full_version;
        }

        Ok(kernel)
    }

    /// The kernel the `/boot` default symlink points at
    pub fn default_kernel(&self) -> Result<Option<KernelInfo>, Error> {
        let target = match std::fs::read_link("/boot/vmlinuz") {
            Ok(target) => target,
            Err(_) => return Ok(None),
        };
        let name = target.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let identifier = name.trim_start_matches("vmlinuz-");

        let mut kernel = KernelInfo::from_release_string(identifier)?;
        kernel.is_default = true;
        Ok(Some(kernel))
    }

    /// Every kernel the package universe offers for `flavour` (all
    /// flavours when omitted), newest first
    pub async fn list(
        &self,
        flavour: Option<&str>,
        token: &CancellationToken,
    ) -> Result<Vec<KernelInfo>, Error> {
        let prefix = match flavour {
            Some(flavour) => format!("{IMAGE_PREFIX}{flavour}"),
            None => IMAGE_PREFIX.to_owned(),
        };

        let candidates = self.db().search(IMAGE_PREFIX, false).await?;
        let installed = self.apt().installed_map(token).await?;
        let build_times = self.build_times(token).await.unwrap_or_default();

        let running = fs_err::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|s| s.trim().to_owned());
        let default = self.default_kernel().ok().flatten();

        let mut kernels: Vec<KernelInfo> = candidates
            .iter()
            .filter(|p| p.name.starts_with(&prefix) && !p.name.contains("debuginfo"))
            .filter_map(|p| {
                let flavour = p.name.strip_prefix(IMAGE_PREFIX)?;
                let (version, release) = parse_package_version(&p.version)?;
                let mut kernel = KernelInfo::new(flavour, &version, &release);

                kernel.is_installed = installed
                    .get(&p.name)
                    .is_some_and(|v| v == &p.version);
                if kernel.is_installed {
                    kernel.modules = installed_modules(&installed, &kernel);
                }
                kernel.is_running = running.as_deref() == Some(kernel.full_version.as_str());
                kernel.is_default = default
                    .as_ref()
                    .is_some_and(|d| d.full_version == kernel.full_version);
                kernel.set_build_time(build_times.get(&p.name).copied());

                Some(kernel)
            })
            .collect();

        kernels.sort_by(|a, b| version_key(&b.version).cmp(&version_key(&a.version)));

        Ok(kernels)
    }

    pub async fn find_latest(
        &self,
        flavour: Option<&str>,
        token: &CancellationToken,
    ) -> Result<KernelInfo, Error> {
        self.list(flavour, token)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoKernelsForFlavour(flavour.unwrap_or("any").to_owned()))
    }

    /// Module names the universe offers for exactly this kernel build
    pub async fn find_available_modules(&self, kernel: &KernelInfo) -> Result<Vec<String>, Error> {
        let suffix = format!("-{}", kernel.flavour);
        let wanted_version = format!("{}-{}", kernel.version, kernel.release);

        let candidates = self.db().search(MODULES_PREFIX, false).await?;

        Ok(candidates
            .iter()
            .filter(|p| p.version == wanted_version)
            .filter_map(|p| module_name(&p.name, &suffix))
            .sorted()
            .dedup()
            .collect())
    }

    /// Modules installed for `source` that `target` can also provide
    pub async fn inherit_modules_from_kernel(
        &self,
        target: &KernelInfo,
        source: &KernelInfo,
        token: &CancellationToken,
    ) -> Result<Vec<String>, Error> {
        let installed = self.apt().installed_map(token).await?;
        let current = installed_modules(&installed, source);
        let available = self.find_available_modules(target).await?;

        Ok(current.into_iter().filter(|m| available.contains(m)).collect())
    }

    /// Plan the installation of a kernel plus selected modules, and
    /// report which requested modules the universe cannot provide
    pub async fn simulate_upgrade(
        &self,
        kernel: &KernelInfo,
        modules: &[String],
        include_headers: bool,
        token: &CancellationToken,
    ) -> Result<UpgradePreview, Error> {
        let names = package_set(kernel, modules, include_headers);
        let simulation = self.apt().simulate_install(&names, token).await?;

        let available = self.find_available_modules(kernel).await?;
        let missing_modules = modules
            .iter()
            .filter(|m| !available.contains(m))
            .cloned()
            .collect();

        Ok(UpgradePreview {
            changes: simulation.changes,
            missing_modules,
        })
    }

    /// Install a kernel with its modules through the package pipeline
    pub async fn install(
        &self,
        kernel: &KernelInfo,
        modules: &[String],
        include_headers: bool,
        dry_run: bool,
        token: &CancellationToken,
    ) -> Result<actions::InstallResponse, Error> {
        self.refuse_on_atomic()?;

        let names = package_set(kernel, modules, include_headers);
        if dry_run {
            let preview = self.simulate_upgrade(kernel, modules, include_headers, token).await?;
            return Ok(actions::InstallResponse {
                message: format!("dry run, nothing installed ({} planned)", names.join(" ")),
                changes: preview.changes,
                image_updated: false,
            });
        }

        Ok(self.actions.install(&names, false, token).await?)
    }

    pub async fn remove(
        &self,
        kernel: &KernelInfo,
        modules: &[String],
        include_headers: bool,
        dry_run: bool,
        token: &CancellationToken,
    ) -> Result<actions::RemoveResponse, Error> {
        self.refuse_on_atomic()?;

        let names = package_set(kernel, modules, include_headers);
        if dry_run {
            let simulation = self.apt().simulate_remove(&names, false, false, token).await?;
            return Ok(actions::RemoveResponse {
                message: "dry run, nothing removed".to_owned(),
                changes: simulation.changes,
                image_updated: false,
            });
        }

        Ok(self.actions.remove(&names, false, token).await?)
    }

    /// Apply the retention policy over the installed kernels.
    ///
    /// Per flavour group the newest kernel of the booted flavour, the
    /// running kernel, and the backup kernel (unless `no_backup`)
    /// survive; everything else is removed in one engine call.
    pub async fn clean_old(
        &self,
        no_backup: bool,
        dry_run: bool,
        token: &CancellationToken,
    ) -> Result<CleanReport, Error> {
        self.refuse_on_atomic()?;

        let installed = self.apt().installed_map(token).await?;
        let running_id = fs_err::read_to_string("/proc/sys/kernel/osrelease")?;
        let running = KernelInfo::from_release_string(running_id.trim())?;

        // Installed kernels from the rpm set, with their NVR intact
        let kernels: Vec<(String, KernelInfo)> = installed
            .iter()
            .filter(|(name, _)| name.starts_with(IMAGE_PREFIX) && !name.contains("debuginfo"))
            .filter_map(|(name, version)| {
                let flavour = name.strip_prefix(IMAGE_PREFIX)?;
                let (version, release) = parse_package_version(version)?;
                let mut kernel = KernelInfo::new(flavour, &version, &release);
                kernel.is_installed = true;
                kernel.is_running = kernel.full_version == running.full_version;
                Some((format!("{name}-{version}-{release}"), kernel))
            })
            .collect();

        let backup = if no_backup {
            None
        } else {
            self.backup_kernel(&kernels, &running, token).await
        };

        let (kept, removed) = apply_retention(&kernels, &running, backup.as_deref());

        if removed.is_empty() {
            return Ok(CleanReport {
                removed,
                kept,
                dry_run,
                changes: PackageChanges::default(),
            });
        }

        let changes = if dry_run {
            self.apt().simulate_remove(&removed, false, false, token).await?.changes
        } else {
            let report = self.apt().remove_packages(&removed, false, false, token, None, None).await?;
            self.actions.reconcile_db(token).await?;
            report.changes
        };

        Ok(CleanReport {
            removed,
            kept,
            dry_run,
            changes,
        })
    }

    /// Among installed, non-running kernels: the one last successfully
    /// booted at least a day ago, per journald boot records
    async fn backup_kernel(
        &self,
        kernels: &[(String, KernelInfo)],
        running: &KernelInfo,
        token: &CancellationToken,
    ) -> Option<String> {
        let records = self.boot_records(token).await.ok()?;
        let day_ago = Utc::now() - chrono::Duration::days(1);

        kernels
            .iter()
            .filter(|(_, kernel)| kernel.full_version != running.full_version)
            .filter_map(|(_, kernel)| {
                let booted = records.get(&kernel.full_version)?;
                (*booted <= day_ago).then(|| (*booted, kernel.full_version.clone()))
            })
            .max_by_key(|(booted, _)| *booted)
            .map(|(_, full_version)| full_version)
    }

    /// `full_version -> last boot time` from journald
    async fn boot_records(
        &self,
        token: &CancellationToken,
    ) -> Result<HashMap<String, DateTime<Utc>>, Error> {
        let driver = self.apt().driver();
        let output = driver
            .run("journalctl", &["--list-boots", "--output=json"], token, None)
            .await?;
        if !output.success() {
            return Ok(HashMap::new());
        }

        let boots: Vec<BootRecord> = serde_json::from_str(&output.text()).unwrap_or_default();
        let mut records = HashMap::new();

        for boot in boots.iter().rev().take(BOOT_SCAN_LIMIT) {
            let output = driver
                .run(
                    "journalctl",
                    &["-b", &boot.boot_id, "-k", "-g", "Linux version", "-o", "cat", "-n", "1"],
                    token,
                    None,
                )
                .await?;

            let Some(release) = output.lines.iter().find_map(|l| parse_boot_banner(l)) else {
                continue;
            };
            let time = Utc
                .timestamp_micros(boot.first_entry)
                .single()
                .unwrap_or_else(Utc::now);

            let entry = records.entry(release).or_insert(time);
            if *entry < time {
                *entry = time;
            }
        }

        Ok(records)
    }

    /// `package name -> build time` for the installed kernel images
    async fn build_times(
        &self,
        token: &CancellationToken,
    ) -> Result<HashMap<String, DateTime<Utc>>, Error> {
        let output = self
            .apt()
            .driver()
            .run(
                "rpm",
                &["-qa", "kernel-image-*", "--queryformat", "%{NAME}\t%{BUILDTIME}\n"],
                token,
                None,
            )
            .await?;
        if !output.success() {
            return Ok(HashMap::new());
        }

        Ok(output
            .lines
            .iter()
            .filter_map(|line| {
                let (name, time) = line.split_once('\t')?;
                let time = Utc.timestamp_opt(time.trim().parse().ok()?, 0).single()?;
                Some((name.to_owned(), time))
            })
            .collect())
    }

    fn refuse_on_atomic(&self) -> Result<(), Error> {
        if self.actions.env().is_atomic {
            return Err(Error::AtomicRestriction);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
struct BootRecord {
    #[serde(default)]
    boot_id: String,
    /// Microseconds since the epoch
    #[serde(default)]
    first_entry: i64,
}

/// `Linux version 6.1.52-std-def-alt1 (gcc ...)` -> the release token
fn parse_boot_banner(line: &str) -> Option<String> {
    line.trim()
        .strip_prefix("Linux version ")?
        .split_whitespace()
        .next()
        .map(str::to_owned)
}

/// `6.1.52-std-def-alt1` -> (`6.1.52`, `std-def`, `alt1`)
pub fn parse_release(identifier: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = identifier.split('-').collect();
    if parts.len() < 3 {
        return None;
    }
    let version = parts[0];
    let release = parts[parts.len() - 1];
    let flavour = parts[1..parts.len() - 1].join("-");
    if version.is_empty() || flavour.is_empty() || release.is_empty() {
        return None;
    }
    Some((version.to_owned(), flavour, release.to_owned()))
}

/// Package version `6.1.52-alt1` -> (`6.1.52`, `alt1`)
pub fn parse_package_version(version: &str) -> Option<(String, String)> {
    let (version, release) = version.split_once('-')?;
    (!version.is_empty() && !release.is_empty()).then(|| (version.to_owned(), release.to_owned()))
}

/// Numeric tuple for version ordering; missing components count as zero
pub fn version_key(version: &str) -> Vec<u64> {
    let mut key: Vec<u64> = version
        .split('.')
        .map(|part| {
            part.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect();
    while key.len() < 3 {
        key.push(0);
    }
    key
}

/// `kernel-modules-drm-std-def` with suffix `-std-def` -> `drm`
fn module_name(package: &str, flavour_suffix: &str) -> Option<String> {
    let middle = package.strip_prefix(MODULES_PREFIX)?.strip_suffix(flavour_suffix)?;
    (!middle.is_empty()).then(|| middle.to_owned())
}

/// Module names installed for exactly this kernel build
fn installed_modules(installed: &HashMap<String, String>, kernel: &KernelInfo) -> Vec<String> {
    let suffix = format!("-{}", kernel.flavour);
    let wanted = format!("{}-{}", kernel.version, kernel.release);

    installed
        .iter()
        .filter(|(_, version)| **version == wanted)
        .filter_map(|(name, _)| module_name(name, &suffix))
        .sorted()
        .collect()
}

/// The retention partition: per flavour group, the newest kernel of the
/// running flavour, the running kernel, and the backup kernel survive;
/// everything else is marked for removal
fn apply_retention(
    kernels: &[(String, KernelInfo)],
    running: &KernelInfo,
    backup: Option<&str>,
) -> (Vec<KeptKernel>, Vec<String>) {
    let mut kept: Vec<KeptKernel> = vec![];
    let mut removed: Vec<String> = vec![];

    let groups = kernels
        .iter()
        .into_group_map_by(|(_, kernel)| kernel.flavour.clone());

    for (flavour, mut members) in groups {
        members.sort_by(|(_, a), (_, b)| version_key(&b.version).cmp(&version_key(&a.version)));

        for (i, (nvr, kernel)) in members.iter().enumerate() {
            let reason = if kernel.is_running {
                Some(KeepReason::Running)
            } else if i == 0 && flavour == running.flavour {
                Some(KeepReason::Newest)
            } else if backup == Some(kernel.full_version.as_str()) {
                Some(KeepReason::Backup)
            } else {
                None
            };

            match reason {
                Some(reason) => kept.push(KeptKernel {
                    package: nvr.clone(),
                    full_version: kernel.full_version.clone(),
                    reason,
                }),
                None => removed.push(nvr.clone()),
            }
        }
    }

    removed.sort();

    (kept, removed)
}

/// The full package list an upgrade of `kernel` touches
fn package_set(kernel: &KernelInfo, modules: &[String], include_headers: bool) -> Vec<String> {
    let mut names = vec![kernel.package_name.clone()];
    names.extend(
        modules
            .iter()
            .map(|module| format!("{MODULES_PREFIX}{module}-{}", kernel.flavour)),
    );
    if include_headers {
        names.push(format!("{HEADERS_PREFIX}{}", kernel.flavour));
        names.push(format!("{HEADERS_PREFIX}modules-{}", kernel.flavour));
    }
    names
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unparseable kernel identifier: {0}")]
    Parse(String),

    #[error("no kernels for flavour {0}")]
    NoKernelsForFlavour(String),

    #[error("kernel changes on an atomic host must go through the image")]
    AtomicRestriction,

    #[error("apt: {0}")]
    Apt(#[from] apt::Error),

    #[error("apt driver: {0}")]
    Driver(#[from] apt::driver::Error),

    #[error("db: {0}")]
    Db(#[from] packages::Error),

    #[error("actions: {0}")]
    Actions(#[from] actions::Error),

    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn as_matched(&self) -> MatchedError {
        match self {
            Error::AtomicRestriction => MatchedError::new(ErrorKind::AtomicRestriction),
            Error::NoKernelsForFlavour(flavour) => {
                MatchedError::with_params(ErrorKind::PackageNotFound, vec![flavour.clone()])
            }
            Error::Apt(apt) => apt
                .matched()
                .cloned()
                .unwrap_or_else(|| MatchedError::with_params(ErrorKind::OperationFailed, vec![apt.to_string()])),
            other => MatchedError::with_params(ErrorKind::OperationFailed, vec![other.to_string()]),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn release_parsing() {
        let (version, flavour, release) = parse_release("6.1.52-std-def-alt1").unwrap();
        assert_eq!(version, "6.1.52");
        assert_eq!(flavour, "std-def");
        assert_eq!(release, "alt1");

        // A single-segment flavour is fine too
        let (_, flavour, _) = parse_release("6.1.52-lts-alt2").unwrap();
        assert_eq!(flavour, "lts");

        assert!(parse_release("6.1.52").is_none());
    }

    #[test]
    fn full_version_shape() {
        let kernel = KernelInfo::from_release_string("6.1.52-un-def-alt1").unwrap();
        assert_eq!(kernel.package_name, "kernel-image-un-def");
        assert_eq!(kernel.full_version, "6.1.52-un-def-alt1");
    }

    #[test]
    fn version_ordering() {
        assert!(version_key("6.10.2") > version_key("6.9.12"));
        assert!(version_key("6.1") < version_key("6.1.1"));
        // Missing components compare as zero
        assert_eq!(version_key("6.1"), version_key("6.1.0"));
    }

    #[test]
    fn module_names() {
        assert_eq!(module_name("kernel-modules-drm-std-def", "-std-def").as_deref(), Some("drm"));
        assert_eq!(
            module_name("kernel-modules-virtualbox-addition-un-def", "-un-def").as_deref(),
            Some("virtualbox-addition")
        );
        assert!(module_name("kernel-modules-drm-std-def", "-un-def").is_none());
        assert!(module_name("unrelated", "-std-def").is_none());
    }

    #[test]
    fn installed_module_selection() {
        let kernel = KernelInfo::new("std-def", "6.1.52", "alt1");
        let mut installed = HashMap::new();
        installed.insert("kernel-modules-drm-std-def".to_owned(), "6.1.52-alt1".to_owned());
        installed.insert("kernel-modules-kvm-std-def".to_owned(), "6.1.40-alt1".to_owned());
        installed.insert("kernel-modules-drm-un-def".to_owned(), "6.1.52-alt1".to_owned());

        assert_eq!(installed_modules(&installed, &kernel), vec!["drm"]);
    }

    #[test]
    fn package_set_shape() {
        let kernel = KernelInfo::new("std-def", "6.1.52", "alt1");
        let names = package_set(&kernel, &["drm".to_owned()], true);
        assert_eq!(
            names,
            vec![
                "kernel-image-std-def",
                "kernel-modules-drm-std-def",
                "kernel-headers-std-def",
                "kernel-headers-modules-std-def",
            ]
        );
    }

    #[test]
    fn retention_policy() {
        // Three installed kernels over two flavours, running the older
        // std-def build
        let running = KernelInfo::new("std-def", "5.15.0", "alt1");
        let make = |flavour: &str, version: &str, is_running: bool| {
            let mut kernel = KernelInfo::new(flavour, version, "alt1");
            kernel.is_installed = true;
            kernel.is_running = is_running;
            (format!("kernel-image-{flavour}-{version}-alt1"), kernel)
        };
        let kernels = vec![
            make("std-def", "5.15.0", true),
            make("std-def", "6.1.52", false),
            make("un-def", "6.6.2", false),
        ];

        let (kept, removed) = apply_retention(&kernels, &running, Some("6.6.2-un-def-alt1"));

        // Running and newest-of-running-flavour survive, the un-def
        // build only through its backup status
        assert!(kept.iter().any(|k| k.reason == KeepReason::Running && k.full_version == "5.15.0-std-def-alt1"));
        assert!(kept.iter().any(|k| k.reason == KeepReason::Newest && k.full_version == "6.1.52-std-def-alt1"));
        assert!(kept.iter().any(|k| k.reason == KeepReason::Backup && k.full_version == "6.6.2-un-def-alt1"));
        assert!(removed.is_empty());

        // Without a backup, the foreign flavour is removed
        let (kept, removed) = apply_retention(&kernels, &running, None);
        assert_eq!(kept.len(), 2);
        assert_eq!(removed, vec!["kernel-image-un-def-6.6.2-alt1"]);
    }

    #[test]
    fn boot_banner() {
        assert_eq!(
            parse_boot_banner("Linux version 6.1.52-std-def-alt1 (gcc version 12)").as_deref(),
            Some("6.1.52-std-def-alt1")
        );
        assert!(parse_boot_banner("something else").is_none());
    }
}
