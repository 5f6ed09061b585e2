// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Classification of free-form engine output into a closed error set
//!
//! Classification happens once, at the binding boundary. Everything
//! downstream works with [`MatchedError`] and never re-parses strings.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The closed set of error kinds the engine can surface
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    BrokenPackages,
    PermissionDenied,
    LockFailed,
    LockTimeout,
    DownloadFailed,
    FetchArchivesFailed,
    FetchIndexFailed,
    PackageNotFound,
    PackageNotInstalled,
    PackageIsAlreadyNewest,
    VirtualNoProviders,
    VirtualMultipleProviders,
    DependencyUnsatisfied,
    NoInstallationCandidate,
    ResolverBroken,
    NotEnoughSpace,
    InvalidParameters,
    InvalidConfig,
    ImageUnchanged,
    CacheOpenFailed,
    CacheRefreshFailed,
    OperationFailed,
    OperationIncomplete,
    DialogCancelled,
    RootRequired,
    AtomicRestriction,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    /// Non-critical kinds feed the atomic-mode config reconciliation
    /// instead of failing the call. The whitelist is closed.
    pub fn is_critical(self) -> bool {
        !matches!(self, ErrorKind::PackageNotInstalled | ErrorKind::PackageIsAlreadyNewest)
    }

    /// Kinds cured by refreshing the source indexes once
    pub fn needs_refresh(self) -> bool {
        matches!(
            self,
            ErrorKind::FetchArchivesFailed | ErrorKind::FetchIndexFailed | ErrorKind::DownloadFailed
        )
    }
}

/// A classified engine line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedError {
    pub kind: ErrorKind,
    pub params: Vec<String>,
}

impl MatchedError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, params: vec![] }
    }

    pub fn with_params(kind: ErrorKind, params: Vec<String>) -> Self {
        Self { kind, params }
    }

    pub fn is_critical(&self) -> bool {
        self.kind.is_critical()
    }

    pub fn needs_refresh(&self) -> bool {
        self.kind.needs_refresh()
    }

    /// Human readable rendition with positional params substituted
    pub fn message(&self) -> String {
        let mut out = String::new();
        let mut params = self.params.iter();
        let template = template(self.kind);
        let mut rest = template;
        while let Some(idx) = rest.find("%s") {
            out.push_str(&rest[..idx]);
            out.push_str(params.next().map(String::as_str).unwrap_or("?"));
            rest = &rest[idx + 2..];
        }
        out.push_str(rest);
        out
    }
}

impl std::fmt::Display for MatchedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

/// Source patterns, matched anchored against whole lines. `%s` captures
/// one positional parameter.
const PATTERNS: &[(ErrorKind, &str)] = &[
    (ErrorKind::BrokenPackages, "E: Broken packages"),
    (ErrorKind::BrokenPackages, "E: Unmet dependencies. Try 'apt-get -f install' with no packages (or specify a solution)."),
    (ErrorKind::BrokenPackages, "E: Unable to correct problems, you have held broken packages."),
    (ErrorKind::PermissionDenied, "E: Could not open lock file %s - open (13: Permission denied)"),
    (ErrorKind::PermissionDenied, "W: Not using locking for read only lock file %s"),
    (ErrorKind::LockFailed, "E: Could not get lock %s"),
    (ErrorKind::LockFailed, "E: Unable to lock the administration directory (%s), is another process using it?"),
    (ErrorKind::LockFailed, "E: Unable to lock directory %s"),
    (ErrorKind::LockFailed, "E: Unable to lock the download directory"),
    (ErrorKind::DownloadFailed, "Failed to fetch %s"),
    (ErrorKind::DownloadFailed, "E: Failed to fetch %s"),
    (ErrorKind::FetchArchivesFailed, "E: Unable to fetch some archives, maybe run apt-get update or try with --fix-missing?"),
    (ErrorKind::FetchIndexFailed, "E: Some index files failed to download. They have been ignored, or old ones used instead."),
    (ErrorKind::FetchIndexFailed, "W: Some index files failed to download. They have been ignored, or old ones used instead."),
    (ErrorKind::PackageNotFound, "E: Unable to locate package %s"),
    (ErrorKind::PackageNotFound, "E: Couldn't find package %s"),
    (ErrorKind::PackageNotInstalled, "E: Package %s is not installed, so not removed"),
    (ErrorKind::PackageNotInstalled, "Package %s is not installed, so not removed"),
    (ErrorKind::PackageIsAlreadyNewest, "%s is already the newest version."),
    (ErrorKind::PackageIsAlreadyNewest, "%s is already the newest version (%s)."),
    (ErrorKind::PackageIsAlreadyNewest, "%s is already the newest version %s"),
    (ErrorKind::VirtualNoProviders, "E: Package %s is a virtual package with no good providers."),
    (ErrorKind::VirtualNoProviders, "Package %s is not available, but is referred to by another package."),
    (ErrorKind::VirtualMultipleProviders, "Package %s is a virtual package provided by:"),
    (ErrorKind::VirtualMultipleProviders, "E: Package %s is a virtual package with multiple good providers."),
    (ErrorKind::DependencyUnsatisfied, "%s : Depends: %s but it is not going to be installed"),
    (ErrorKind::DependencyUnsatisfied, "%s : Depends: %s but it is not installable"),
    (ErrorKind::DependencyUnsatisfied, "%s Depends on %s but %s is to be installed"),
    (ErrorKind::NoInstallationCandidate, "E: Package %s has no installation candidate"),
    (ErrorKind::NoInstallationCandidate, "E: Package '%s' has no installation candidate"),
    (ErrorKind::ResolverBroken, "E: Error, pkgProblemResolver::Resolve generated breaks, this may be caused by held packages."),
    (ErrorKind::NotEnoughSpace, "E: You don't have enough free space in %s."),
    (ErrorKind::NotEnoughSpace, "E: You don't have enough free space in %s to download the needed archives."),
    (ErrorKind::InvalidParameters, "E: Invalid operation %s"),
    (ErrorKind::CacheOpenFailed, "E: The package lists or status file could not be parsed or opened."),
    (ErrorKind::CacheOpenFailed, "E: The package cache file is corrupted"),
    (ErrorKind::CacheOpenFailed, "E: The package cache file is an incompatible version"),
    (ErrorKind::CacheRefreshFailed, "E: The list of sources could not be read."),
    (ErrorKind::CacheRefreshFailed, "E: Malformed entry %s in list file %s"),
    (ErrorKind::OperationIncomplete, "E: Sub-process %s returned an error code (%s)"),
    (ErrorKind::OperationIncomplete, "E: Sub-process %s exited unexpectedly"),
    (ErrorKind::OperationFailed, "E: Internal Error, %s"),
    (ErrorKind::OperationFailed, "dpkg was interrupted, you must manually run 'dpkg --configure -a' to correct the problem."),
    (ErrorKind::OperationFailed, "E: There are problems and -y was used without --force-yes"),
    (ErrorKind::NotEnoughSpace, "E: Write error - write (28: No space left on device)"),
    (ErrorKind::LockFailed, "E: Unable to acquire the dpkg frontend lock (%s)"),
    (ErrorKind::DownloadFailed, "W: Failed to fetch %s"),
    (ErrorKind::FetchIndexFailed, "E: The repository '%s' does not have a Release file."),
    (ErrorKind::FetchIndexFailed, "E: The repository '%s' is not signed."),
    (ErrorKind::RootRequired, "E: Unable to acquire the dpkg frontend lock (%s), are you root?"),
];

struct Compiled {
    kind: ErrorKind,
    regex: Regex,
    /// Length of the literal (non-placeholder) text, for longest-match-wins
    weight: usize,
}

static COMPILED: LazyLock<Vec<Compiled>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .map(|(kind, source)| {
            let mut regex = String::from("^");
            let mut weight = 0;
            let mut rest = *source;
            while let Some(idx) = rest.find("%s") {
                regex.push_str(&regex::escape(&rest[..idx]));
                regex.push_str("(.+?)");
                weight += idx;
                rest = &rest[idx + 2..];
            }
            regex.push_str(&regex::escape(rest));
            regex.push('$');
            weight += rest.len();

            Compiled {
                kind: *kind,
                regex: Regex::new(&regex).expect("static pattern"),
                weight,
            }
        })
        .collect()
});

/// Classify a single line. Longest literal match wins.
pub fn check_error(line: &str) -> Option<MatchedError> {
    let line = line.trim_end();
    COMPILED
        .iter()
        .filter_map(|c| {
            let captures = c.regex.captures(line.trim_start())?;
            let params = captures
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str().trim().to_owned())
                .collect();
            Some((c.weight, MatchedError::with_params(c.kind, params)))
        })
        .max_by_key(|(weight, _)| *weight)
        .map(|(_, matched)| matched)
}

/// Every classified line, in input order
pub fn analyse_all(lines: &[String]) -> Vec<MatchedError> {
    lines.iter().filter_map(|l| check_error(l)).collect()
}

/// The first classified line
pub fn analyse_first(lines: &[String]) -> Option<MatchedError> {
    lines.iter().find_map(|l| check_error(l))
}

fn template(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::BrokenPackages => "broken packages detected",
        ErrorKind::PermissionDenied => "permission denied: %s",
        ErrorKind::LockFailed => "could not acquire the package manager lock",
        ErrorKind::LockTimeout => "timed out waiting for the package manager lock",
        ErrorKind::DownloadFailed => "failed to fetch %s",
        ErrorKind::FetchArchivesFailed => "unable to fetch some archives, refresh the indexes and retry",
        ErrorKind::FetchIndexFailed => "some index files failed to download, refresh the indexes and retry",
        ErrorKind::PackageNotFound => "package %s not found",
        ErrorKind::PackageNotInstalled => "package %s is not installed",
        ErrorKind::PackageIsAlreadyNewest => "%s is already the newest version",
        ErrorKind::VirtualNoProviders => "%s is a virtual package with no providers",
        ErrorKind::VirtualMultipleProviders => "%s is a virtual package with multiple providers",
        ErrorKind::DependencyUnsatisfied => "%s depends on %s which is not going to be installed",
        ErrorKind::NoInstallationCandidate => "package %s has no installation candidate",
        ErrorKind::ResolverBroken => "the problem resolver generated breaks, possibly caused by held packages",
        ErrorKind::NotEnoughSpace => "not enough free space in %s",
        ErrorKind::InvalidParameters => "invalid parameters: %s",
        ErrorKind::InvalidConfig => "invalid image configuration: %s",
        ErrorKind::ImageUnchanged => "image configuration unchanged since the last build",
        ErrorKind::CacheOpenFailed => "the package cache could not be opened",
        ErrorKind::CacheRefreshFailed => "the package cache could not be refreshed",
        ErrorKind::OperationFailed => "operation failed: %s",
        ErrorKind::OperationIncomplete => "operation did not complete: %s",
        ErrorKind::DialogCancelled => "cancelled by dialog",
        ErrorKind::RootRequired => "this operation requires root privileges",
        ErrorKind::AtomicRestriction => "refused on an atomic host, apply the change through the image instead",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::Unknown => "unknown error: %s",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn not_installed_line() {
        let matched = check_error("E: Package zzz is not installed, so not removed").unwrap();
        assert_eq!(matched.kind, ErrorKind::PackageNotInstalled);
        assert_eq!(matched.params, vec!["zzz".to_owned()]);
        assert!(!matched.is_critical());
        assert!(!matched.needs_refresh());
    }

    #[test]
    fn longest_match_wins() {
        // Both the bare and the `E: `-prefixed variant match here; the
        // prefixed one carries more literal text and must win.
        let matched = check_error("E: Package vim is not installed, so not removed").unwrap();
        assert_eq!(matched.params, vec!["vim".to_owned()]);

        // Same shape: the are-you-root variant outweighs the bare lock
        // pattern and classifies as a privilege problem
        let matched =
            check_error("E: Unable to acquire the dpkg frontend lock (/var/lib/dpkg/lock-frontend), are you root?")
                .unwrap();
        assert_eq!(matched.kind, ErrorKind::RootRequired);
    }

    #[test]
    fn already_newest() {
        let matched = check_error("zip is already the newest version (3.0-alt2).").unwrap();
        assert_eq!(matched.kind, ErrorKind::PackageIsAlreadyNewest);
        assert_eq!(matched.params[0], "zip");
        assert!(!matched.is_critical());
    }

    #[test]
    fn refresh_classes() {
        let matched = check_error(
            "E: Unable to fetch some archives, maybe run apt-get update or try with --fix-missing?",
        )
        .unwrap();
        assert_eq!(matched.kind, ErrorKind::FetchArchivesFailed);
        assert!(matched.needs_refresh());
        assert!(matched.is_critical());

        assert!(check_error("Failed to fetch http://mirror/x.rpm  404")
            .unwrap()
            .needs_refresh());
    }

    #[test]
    fn dependency_params() {
        let matched =
            check_error(" libfoo : Depends: libbar (>= 1.2) but it is not going to be installed").unwrap();
        assert_eq!(matched.kind, ErrorKind::DependencyUnsatisfied);
        assert_eq!(matched.params, vec!["libfoo".to_owned(), "libbar (>= 1.2)".to_owned()]);
    }

    #[test]
    fn unmatched_line() {
        assert!(check_error("Reading package lists...").is_none());
    }

    #[test]
    fn analyse_ordering() {
        let lines = vec![
            "Reading package lists...".to_owned(),
            "E: Unable to locate package foo".to_owned(),
            "E: Broken packages".to_owned(),
        ];
        let all = analyse_all(&lines);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, ErrorKind::PackageNotFound);
        assert_eq!(all[1].kind, ErrorKind::BrokenPackages);
        assert_eq!(analyse_first(&lines).unwrap().kind, ErrorKind::PackageNotFound);
    }

    #[test]
    fn message_rendering() {
        let matched = MatchedError::with_params(ErrorKind::PackageNotFound, vec!["nano".into()]);
        assert_eq!(matched.message(), "package nano not found");
    }
}
