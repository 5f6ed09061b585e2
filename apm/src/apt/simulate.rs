// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Parse the engine's dry-run plan into [`PackageChanges`]
//!
//! The same parser backs both the planners and the executors, which is
//! what keeps a plan and its later execution in agreement for identical
//! inputs.

use std::sync::LazyLock;

use regex::Regex;

use crate::package::PackageChanges;

/// `Inst zlib [1.2-alt1] (1.3-alt1 repo [x86_64])` — the bracketed old
/// version is present only for upgrades
static INST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Inst (\S+)( \[[^\]]+\])? \(").expect("static pattern"));
static REMV: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Remv (\S+)").expect("static pattern"));
static SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+) upgraded, (\d+) newly installed, (\d+) to remove and (\d+) not upgraded\.")
        .expect("static pattern")
});
static DOWNLOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Need to get ([\d.,]+ ?[kMG]?B)(?:/[\d.,]+ ?[kMG]?B)? of archives\.").expect("static pattern")
});
static DISK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^After this operation, ([\d.,]+ ?[kMG]?B) (?:of additional disk space will be used|disk space will be freed)\.")
        .expect("static pattern")
});

/// Build a [`PackageChanges`] from a dry-run transcript.
///
/// `requested` is the caller's input set; planned installs beyond it are
/// reported as `extra_installed`.
pub fn parse_simulation(output: &str, requested: &[String]) -> PackageChanges {
    let mut changes = PackageChanges::default();

    for line in output.lines() {
        if let Some(captures) = INST.captures(line) {
            let name = captures[1].to_owned();
            if captures.get(2).is_some() {
                changes.upgraded_packages.push(name);
            } else {
                changes.new_installed_packages.push(name);
            }
        } else if let Some(captures) = REMV.captures(line) {
            changes.removed_packages.push(captures[1].to_owned());
        } else if let Some(captures) = SUMMARY.captures(line) {
            changes.upgraded_count = captures[1].parse().unwrap_or_default();
            changes.new_installed_count = captures[2].parse().unwrap_or_default();
            changes.removed_count = captures[3].parse().unwrap_or_default();
            changes.not_upgraded_count = captures[4].parse().unwrap_or_default();
        } else if let Some(captures) = DOWNLOAD.captures(line) {
            changes.download_size = parse_size(&captures[1]).unwrap_or_default();
        } else if let Some(captures) = DISK.captures(line) {
            let bytes = parse_size(&captures[1]).unwrap_or_default() as i64;
            changes.install_size = if line.contains("freed") { -bytes } else { bytes };
        }
    }

    // The summary can be absent on empty plans
    if changes.upgraded_count == 0 {
        changes.upgraded_count = changes.upgraded_packages.len() as i64;
    }
    if changes.new_installed_count == 0 {
        changes.new_installed_count = changes.new_installed_packages.len() as i64;
    }
    if changes.removed_count == 0 {
        changes.removed_count = changes.removed_packages.len() as i64;
    }

    changes.extra_installed = changes
        .new_installed_packages
        .iter()
        .filter(|name| !requested.iter().any(|r| r.trim_end_matches(['+', '-']) == **name))
        .cloned()
        .collect();

    changes
}

/// SI sizes as the engine prints them: `1024 kB`, `12.3 MB`, `999 B`
fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim().replace(',', ".");
    let split = text.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let factor = match unit.trim() {
        "B" => 1.0,
        "kB" => 1000.0,
        "MB" => 1_000_000.0,
        "GB" => 1_000_000_000.0,
        _ => return None,
    };
    Some((value * factor) as u64)
}

#[cfg(test)]
mod test {
    use indoc::indoc;

    use super::*;

    const TRANSCRIPT: &str = indoc! {"
        Reading package lists...
        Building dependency tree...
        The following extra packages will be installed:
          libzzip
        The following packages will be REMOVED:
          unzip
        The following NEW packages will be installed:
          zip libzzip
        The following packages will be upgraded:
          zlib
        1 upgraded, 2 newly installed, 1 to remove and 3 not upgraded.
        Need to get 1024 kB of archives.
        After this operation, 4096 kB of additional disk space will be used.
        Inst zlib [1.2-alt1] (1.3-alt1 Sisyphus:main [x86_64])
        Inst zip (3.0-alt2 Sisyphus:main [x86_64])
        Inst libzzip (0.13-alt1 Sisyphus:main [x86_64])
        Remv unzip [6.0-alt1]
        Conf zlib (1.3-alt1 Sisyphus:main [x86_64])
    "};

    #[test]
    fn full_plan() {
        let changes = parse_simulation(TRANSCRIPT, &["zip".to_owned(), "unzip-".to_owned()]);

        assert_eq!(changes.new_installed_packages, vec!["zip", "libzzip"]);
        assert_eq!(changes.upgraded_packages, vec!["zlib"]);
        assert_eq!(changes.removed_packages, vec!["unzip"]);
        assert_eq!(changes.extra_installed, vec!["libzzip"]);

        assert_eq!(changes.upgraded_count, 1);
        assert_eq!(changes.new_installed_count, 2);
        assert_eq!(changes.removed_count, 1);
        assert_eq!(changes.not_upgraded_count, 3);

        assert_eq!(changes.download_size, 1_024_000);
        assert_eq!(changes.install_size, 4_096_000);
    }

    #[test]
    fn empty_plan() {
        let changes = parse_simulation("Reading package lists...\n", &[]);
        assert!(changes.is_empty());
        assert_eq!(changes.new_installed_count, 0);
    }

    #[test]
    fn freed_space_is_negative() {
        let output = indoc! {"
            Remv unzip [6.0-alt1]
            0 upgraded, 0 newly installed, 1 to remove and 0 not upgraded.
            After this operation, 500 kB disk space will be freed.
        "};
        let changes = parse_simulation(output, &["unzip".to_owned()]);
        assert_eq!(changes.install_size, -500_000);
        assert_eq!(changes.removed_packages, vec!["unzip"]);
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("999 B"), Some(999));
        assert_eq!(parse_size("12.3 MB"), Some(12_300_000));
        assert_eq!(parse_size("1 GB"), Some(1_000_000_000));
        assert_eq!(parse_size("bogus"), None);
    }
}
