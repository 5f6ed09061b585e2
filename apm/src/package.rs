// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

/// Origin of a package
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum TypePackage {
    /// Repository package handled by the native engine
    #[default]
    Native,
    /// Built on the fly to a local artifact before installation
    SideBuilt,
}

/// A single row of the package mirror
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub name: String,
    pub section: String,
    pub installed_size: i64,
    pub maintainer: String,
    /// Available version
    pub version: String,
    /// Empty when not installed
    pub version_installed: String,
    pub depends: Vec<String>,
    pub provides: Vec<String>,
    pub size: i64,
    pub filename: String,
    pub description: String,
    pub changelog: String,
    pub installed: bool,
    pub type_package: TypePackage,
}

impl Package {
    /// Keep `installed` and `version_installed` coupled
    pub fn set_installed(&mut self, version: Option<&str>) {
        match version {
            Some(v) => {
                self.installed = true;
                self.version_installed = v.to_owned();
            }
            None => {
                self.installed = false;
                self.version_installed = String::new();
            }
        }
    }
}

/// Result of a dependency pre-simulation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageChanges {
    /// Pulled in beyond the requested set
    pub extra_installed: Vec<String>,
    pub upgraded_packages: Vec<String>,
    pub new_installed_packages: Vec<String>,
    pub removed_packages: Vec<String>,
    pub upgraded_count: i64,
    pub new_installed_count: i64,
    pub removed_count: i64,
    pub not_upgraded_count: i64,
    /// Bytes to download
    pub download_size: u64,
    /// Disk delta after the operation, negative when space is freed
    pub install_size: i64,
}

impl PackageChanges {
    /// Nothing would change on execution
    pub fn is_empty(&self) -> bool {
        self.upgraded_packages.is_empty()
            && self.new_installed_packages.is_empty()
            && self.removed_packages.is_empty()
    }

    /// Every package touched by the plan, installs before removals
    pub fn touched(&self) -> impl Iterator<Item = &String> {
        self.new_installed_packages
            .iter()
            .chain(self.upgraded_packages.iter())
            .chain(self.removed_packages.iter())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn installed_invariant() {
        let mut p = Package {
            name: "zip".into(),
            ..Default::default()
        };
        p.set_installed(Some("3.0-alt1"));
        assert!(p.installed && p.version_installed == "3.0-alt1");
        p.set_installed(None);
        assert!(!p.installed && p.version_installed.is_empty());
    }

    #[test]
    fn changes_empty() {
        let mut c = PackageChanges::default();
        assert!(c.is_empty());
        c.upgraded_packages.push("zlib".into());
        assert!(!c.is_empty());
    }
}
